//! Randomness for nonces and generated secrets.

use rand::RngCore;
use rand_core::OsRng;

use crate::crypto::{GENERATED_SECRET_SIZE, NONCE_SIZE};

/// OS entropy source.
pub struct SecureRandom;

impl SecureRandom {
    /// Fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Single-use handshake nonce.
    pub fn nonce() -> [u8; NONCE_SIZE] {
        Self::bytes()
    }

    /// Raw material for a new shared secret.
    pub fn secret_bytes() -> Vec<u8> {
        Self::bytes::<GENERATED_SECRET_SIZE>().to_vec()
    }
}
