//! Shared secret handling.
//!
//! Secrets are distributed as unpadded RFC 4648 base32, the same encoding
//! authenticator apps use, and decoded once at startup.

use std::fmt;

use data_encoding::BASE32_NOPAD;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};

/// Secret shared by one client/server pair.
///
/// Immutable after decoding and zeroized when dropped. The `Debug`
/// implementation never prints the key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    /// Decode a base32 secret. Input is case-insensitive and must not be padded.
    pub fn from_base32(encoded: &str) -> Result<Self> {
        let mut upper = encoded.to_ascii_uppercase();
        let decoded = BASE32_NOPAD.decode(upper.as_bytes());
        upper.zeroize();

        let bytes = decoded.map_err(|e| Error::secret(e.to_string()))?;
        Self::from_bytes(bytes)
    }

    /// Wrap raw key material.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::secret("secret is empty"));
        }
        Ok(Self(bytes))
    }

    /// Generate a new random secret.
    pub fn generate() -> Self {
        Self(SecureRandom::secret_bytes())
    }

    /// Encode as unpadded base32 for distribution to the other side.
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes redacted>)", self.0.len())
    }
}
