//! Byte relays between an admitted flow and its destination.
//!
//! Both sides of the tunnel use these: the server relays admitted peers to
//! the configured target, the client relays local applications to the hop
//! port it dialed.

pub mod datagram;
pub mod stream;

pub use datagram::{resolve, DatagramSession, SessionTable};
pub use stream::{connect_target, pipe};
