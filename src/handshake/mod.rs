//! Handshake codec.
//!
//! Every logical flow starts with a fixed 56-byte header proving knowledge
//! of the shared secret for a given step:
//!
//! ```text
//! 0        8                        24                                56
//! +--------+------------------------+----------------------------------+
//! | step   | nonce                  | token                            |
//! | u64 BE | 16 random bytes        | HMAC-SHA256(secret,              |
//! |        |                        |   step ‖ nonce ‖ identity)       |
//! +--------+------------------------+----------------------------------+
//! ```
//!
//! For stream transport the header is written once at connection start.
//! For datagram transport it is prefixed onto the first datagram of a flow.
//! A failed check is never answered: the connection is closed silently.

mod admission;
mod header;
mod token;

pub use admission::Admission;
pub use header::{HandshakeHeader, HEADER_LEN};
pub use token::{compute_token, issue, verify};
