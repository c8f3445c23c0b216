//! Step to port mapping.

use hmac::Mac;
use serde::{Deserialize, Serialize};

use crate::crypto::{HmacSha1, SharedSecret};
use crate::error::{Error, Result};

/// Inclusive port range hop ports are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    /// Lowest port, inclusive
    pub min: u16,
    /// Highest port, inclusive
    pub max: u16,
}

impl PortRange {
    /// Create a validated range.
    pub fn new(min: u16, max: u16) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    /// Check `1 <= min <= max`.
    pub fn validate(&self) -> Result<()> {
        if self.min == 0 || self.min > self.max {
            return Err(Error::config(format!(
                "invalid port_range {}-{}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// Number of ports in the range.
    pub fn span(&self) -> u32 {
        u32::from(self.max.saturating_sub(self.min)) + 1
    }

    /// Check whether a port falls inside the range.
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Check whether two ranges share at least one port.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        !(self.max < other.min || other.max < self.min)
    }
}

/// RFC 4226 dynamic truncation of `HMAC-SHA1(secret, be64(step))`.
///
/// Returns the 31-bit code before any decimal or modulo reduction.
pub fn dynamic_truncate(secret: &[u8], step: i64) -> u32 {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(&(step as u64).to_be_bytes());
    let hash = mac.finalize().into_bytes();

    let offset = usize::from(hash[hash.len() - 1] & 0x0f);
    let word = [
        hash[offset],
        hash[offset + 1],
        hash[offset + 2],
        hash[offset + 3],
    ];
    u32::from_be_bytes(word) & 0x7fff_ffff
}

/// Port both sides listen on / dial for `step`.
pub fn port_for_step(secret: &SharedSecret, step: i64, range: PortRange) -> u16 {
    let code = dynamic_truncate(secret.as_bytes(), step);
    // span <= 65536 and min + (span - 1) == max, so the sum fits in u16
    let offset = code % range.span();
    range.min.saturating_add(offset as u16)
}
