//! Cryptographic primitives for the hopping tunnel.
//!
//! This module provides:
//! - The decoded shared secret, zeroized on drop and never printed
//! - Secure random number generation for nonces and new secrets
//! - The HMAC flavours used by port derivation and the handshake token
//!
//! There is no payload encryption: the tunnel authenticates the first bytes
//! of a flow and relays the rest as-is.

mod random;
mod secret;

pub use random::SecureRandom;
pub use secret::SharedSecret;

use hmac::Hmac;

/// Size of the per-handshake nonce in bytes
pub const NONCE_SIZE: usize = 16;

/// Size of the handshake token (HMAC-SHA256 output) in bytes
pub const TOKEN_SIZE: usize = 32;

/// Length of a freshly generated secret (RFC 4226 recommends 160 bits)
pub const GENERATED_SECRET_SIZE: usize = 20;

/// HMAC over SHA-1, used for one-time-password style port derivation.
pub(crate) type HmacSha1 = Hmac<sha1::Sha1>;

/// HMAC over SHA-256, used for handshake tokens.
pub(crate) type HmacSha256 = Hmac<sha2::Sha256>;
