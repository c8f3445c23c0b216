//! Configuration file plumbing shared by server routes and client endpoints.
//!
//! Files are JSON unless the extension says `.toml`. A file holds either a
//! single route/endpoint object or a list of them.

use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transport a route tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream transport; header sent once per connection
    Tcp,
    /// Datagram transport; header prefixed onto the first datagram of a flow
    Udp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::config(format!("invalid protocol {:?}", other))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Serialization format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// `serde_json`
    Json,
    /// `toml`
    Toml,
}

impl FileFormat {
    /// Pick the format from a file extension; anything but `.toml` is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("toml") => FileFormat::Toml,
            _ => FileFormat::Json,
        }
    }

    /// Deserialize `content` in this format.
    pub fn parse<T: DeserializeOwned>(self, content: &str) -> Result<T> {
        match self {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| Error::config(format!("invalid JSON: {}", e))),
            FileFormat::Toml => {
                toml::from_str(content).map_err(|e| Error::config(format!("invalid TOML: {}", e)))
            }
        }
    }
}

/// Read and deserialize a configuration file.
pub fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
    FileFormat::from_path(path).parse(&content)
}

/// TLS section accepted for compatibility. It is never applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Whether the file asks for TLS
    #[serde(default)]
    pub enabled: bool,
    /// Server certificate path
    #[serde(default)]
    pub cert_file: Option<String>,
    /// Server key path
    #[serde(default)]
    pub key_file: Option<String>,
    /// Client-side verification switch
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    pub(crate) fn warn_if_enabled(&self, name: &str) {
        if self.enabled {
            tracing::warn!(route = %name, "tls options are not supported and will be ignored");
        }
    }
}
