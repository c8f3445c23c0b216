//! Port derivation.
//!
//! Client and server never negotiate a port. Both sides map the current
//! time step through a keyed one-time-password function into the configured
//! port range and land on the same number independently.
//!
//! ```text
//!   unix time ──÷ step_seconds──▶ step ──HMAC-SHA1(secret)──▶ truncate ──mod range──▶ port
//! ```
//!
//! A [`PortWindow`] widens one step to `{step-1, step, step+1}` so that one
//! step of clock skew in either direction still lands on an open port.

mod port;
mod step;
mod window;

pub use port::{dynamic_truncate, port_for_step, PortRange};
pub use step::{current_step, step_index, unix_now, until_step_ends, within_skew};
pub use window::{Candidate, PortWindow};
