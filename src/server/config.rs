//! Server route configuration.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{self, Protocol, TlsOptions};
use crate::crypto::SharedSecret;
use crate::error::{Error, Result};
use crate::hopping::PortRange;
use crate::server::OriginFilter;
use crate::{DEFAULT_CLIENT_ID, DEFAULT_HANDSHAKE_TIMEOUT_SECS};

/// Runtime configuration of one server route.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Route name used in logs
    pub name: String,
    /// Address hop ports bind on
    pub listen_ip: IpAddr,
    /// Range hop ports are drawn from
    pub port_range: PortRange,
    /// Transport
    pub protocol: Protocol,
    /// Decoded shared secret
    pub secret: Arc<SharedSecret>,
    /// Step duration in seconds
    pub step_seconds: u64,
    /// Allowed distance between declared and current step
    pub skew_steps: u32,
    /// Destination admitted flows are relayed to (`host:port`)
    pub target: String,
    /// Origins allowed to attempt a handshake
    pub allowed_origins: OriginFilter,
    /// Identity tokens are verified against
    pub client_id: String,
    /// Deadline for receiving the full header
    pub handshake_timeout: Duration,
    /// Handshakes processed concurrently before accept loops wait
    pub max_concurrent_handshakes: usize,
    /// Failed handshakes per origin before it is throttled
    pub max_failures_per_origin: u32,
    /// Window the failure budget is counted over
    pub failure_window: Duration,
    /// Idle time after which a datagram session is dropped
    pub udp_session_idle: Duration,
}

impl ServerConfig {
    /// Create a configuration with defaults for everything but the essentials.
    pub fn new(
        name: impl Into<String>,
        secret: SharedSecret,
        port_range: PortRange,
        protocol: Protocol,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            port_range,
            protocol,
            secret: Arc::new(secret),
            step_seconds: 30,
            skew_steps: 1,
            target: target.into(),
            allowed_origins: OriginFilter::allow_all(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            max_concurrent_handshakes: 1024,
            max_failures_per_origin: 20,
            failure_window: Duration::from_secs(60),
            udp_session_idle: Duration::from_secs(120),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.port_range.validate()?;
        if self.step_seconds == 0 {
            return Err(Error::config("step_seconds must be positive"));
        }
        if self.target.is_empty() {
            return Err(Error::config("target cannot be empty"));
        }
        if self.client_id.is_empty() {
            return Err(Error::config("client_id cannot be empty"));
        }
        if self.max_concurrent_handshakes == 0 {
            return Err(Error::config("max_concurrent_handshakes must be positive"));
        }
        Ok(())
    }
}

fn default_listen_ip() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_skew_steps() -> u32 {
    1
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

fn default_max_concurrent_handshakes() -> usize {
    1024
}

fn default_max_failures_per_origin() -> u32 {
    20
}

fn default_failure_window_secs() -> u64 {
    60
}

fn default_udp_session_idle_secs() -> u64 {
    120
}

/// One route as written in a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRouteFile {
    /// Route name used in logs
    #[serde(default)]
    pub name: String,
    /// Address hop ports bind on
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,
    /// Range hop ports are drawn from
    pub port_range: PortRange,
    /// `tcp` or `udp`
    pub protocol: Protocol,
    /// Base32 shared secret
    pub totp_secret: String,
    /// Step duration in seconds
    pub step_seconds: u64,
    /// Allowed distance between declared and current step
    #[serde(default = "default_skew_steps")]
    pub skew_steps: u32,
    /// Destination host
    pub target_addr: String,
    /// Destination port
    pub target_port: u16,
    /// CIDR blocks or addresses allowed to connect; empty allows all
    #[serde(default)]
    pub allowed_client_ips: Vec<String>,
    /// Identity tokens are verified against
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Accepted for compatibility; never applied
    #[serde(default)]
    pub tls: Option<TlsOptions>,
    /// Deadline for receiving the full header
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Concurrent handshake limit
    #[serde(default = "default_max_concurrent_handshakes")]
    pub max_concurrent_handshakes: usize,
    /// Failed handshakes per origin before throttling
    #[serde(default = "default_max_failures_per_origin")]
    pub max_failures_per_origin: u32,
    /// Failure counting window in seconds
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// Datagram session idle timeout in seconds
    #[serde(default = "default_udp_session_idle_secs")]
    pub udp_session_idle_secs: u64,
}

impl ServerRouteFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        if self.target_addr.is_empty() || self.target_port == 0 {
            return Err(Error::config("invalid target"));
        }
        if let Some(tls) = &self.tls {
            tls.warn_if_enabled(&self.name);
        }

        let secret = SharedSecret::from_base32(&self.totp_secret)?;
        let target = if self.target_addr.contains(':') && !self.target_addr.starts_with('[') {
            format!("[{}]:{}", self.target_addr, self.target_port)
        } else {
            format!("{}:{}", self.target_addr, self.target_port)
        };

        let config = ServerConfig {
            name: self.name.clone(),
            listen_ip: self.listen_ip,
            port_range: self.port_range,
            protocol: self.protocol,
            secret: Arc::new(secret),
            step_seconds: self.step_seconds,
            skew_steps: self.skew_steps,
            target,
            allowed_origins: OriginFilter::parse(&self.allowed_client_ips)?,
            client_id: self.client_id.clone(),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            max_concurrent_handshakes: self.max_concurrent_handshakes,
            max_failures_per_origin: self.max_failures_per_origin,
            failure_window: Duration::from_secs(self.failure_window_secs),
            udp_session_idle: Duration::from_secs(self.udp_session_idle_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

/// A server configuration file: one route or a `routes` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerConfigFile {
    /// Several routes served by one process
    Multi {
        /// Routes, each with its own secret and port range
        routes: Vec<ServerRouteFile>,
    },
    /// A single route
    Single(ServerRouteFile),
}

impl ServerConfigFile {
    /// Convert every route and check that port ranges do not overlap.
    pub fn to_configs(&self) -> Result<Vec<ServerConfig>> {
        let configs = match self {
            ServerConfigFile::Multi { routes } => {
                if routes.is_empty() {
                    return Err(Error::config("routes cannot be empty"));
                }
                routes
                    .iter()
                    .map(ServerRouteFile::to_config)
                    .collect::<Result<Vec<_>>>()?
            }
            ServerConfigFile::Single(route) => vec![route.to_config()?],
        };

        for (i, a) in configs.iter().enumerate() {
            for b in &configs[i + 1..] {
                if a.port_range.overlaps(&b.port_range) {
                    return Err(Error::config(format!(
                        "server routes {:?} and {:?} have overlapping port_range",
                        a.name, b.name
                    )));
                }
            }
        }

        Ok(configs)
    }
}

/// Load every route from a JSON or TOML file.
pub fn load_server_configs(path: &Path) -> Result<Vec<ServerConfig>> {
    let file: ServerConfigFile = config::read_file(path)?;
    file.to_configs()
}
