//! Allowed-origin filtering.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// One `address/prefix` block. A bare address is a full-length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    network: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    /// Check whether `ip` falls inside this block.
    ///
    /// IPv4-mapped IPv6 peers are matched against IPv4 blocks.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };

        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for CidrBlock {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let network: IpAddr = addr
            .parse()
            .map_err(|_| Error::config(format!("invalid allowed_client_ips entry {:?}", s)))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| Error::config(format!("invalid prefix length in {:?}", s)))?,
            None => max,
        };

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Set of origins allowed to attempt a handshake. Empty allows everyone.
#[derive(Debug, Clone, Default)]
pub struct OriginFilter {
    blocks: Vec<CidrBlock>,
}

impl OriginFilter {
    /// Filter that admits every origin.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse a list of CIDR blocks or bare addresses.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let blocks = entries
            .iter()
            .map(|e| e.as_ref().parse())
            .collect::<Result<Vec<CidrBlock>>>()?;
        Ok(Self { blocks })
    }

    /// Check whether `ip` may connect.
    pub fn allows(&self, ip: IpAddr) -> bool {
        self.blocks.is_empty() || self.blocks.iter().any(|b| b.contains(ip))
    }

    /// Check whether the filter is unrestricted.
    pub fn is_open(&self) -> bool {
        self.blocks.is_empty()
    }
}
