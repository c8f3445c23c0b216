//! Client endpoint configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{self, Protocol, TlsOptions};
use crate::crypto::SharedSecret;
use crate::error::{Error, Result};
use crate::hopping::PortRange;
use crate::{DEFAULT_CLIENT_ID, DEFAULT_DIAL_TIMEOUT_SECS};

/// Runtime configuration of one client endpoint.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Endpoint name used in logs
    pub name: String,
    /// Server host name or address
    pub server_host: String,
    /// Range the server draws hop ports from
    pub port_range: PortRange,
    /// Transport
    pub protocol: Protocol,
    /// Decoded shared secret
    pub secret: Arc<SharedSecret>,
    /// Step duration in seconds
    pub step_seconds: u64,
    /// Local address applications connect to
    pub bind_addr: SocketAddr,
    /// Identity tokens are issued for
    pub client_id: String,
    /// Per-candidate dial timeout
    pub dial_timeout: Duration,
    /// Idle time after which a datagram session is dropped
    pub udp_session_idle: Duration,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the essentials.
    pub fn new(
        name: impl Into<String>,
        server_host: impl Into<String>,
        secret: SharedSecret,
        port_range: PortRange,
        protocol: Protocol,
        bind_addr: SocketAddr,
    ) -> Self {
        Self {
            name: name.into(),
            server_host: server_host.into(),
            port_range,
            protocol,
            secret: Arc::new(secret),
            step_seconds: 30,
            bind_addr,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            udp_session_idle: Duration::from_secs(120),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.port_range.validate()?;
        if self.step_seconds == 0 {
            return Err(Error::config("step_seconds must be positive"));
        }
        if self.server_host.is_empty() {
            return Err(Error::config("server_host cannot be empty"));
        }
        if self.client_id.is_empty() {
            return Err(Error::config("client_id cannot be empty"));
        }
        if self.dial_timeout.is_zero() {
            return Err(Error::config("dial_timeout_secs must be positive"));
        }
        Ok(())
    }
}

fn default_bind_ip() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_skew_steps() -> u32 {
    1
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_dial_timeout_secs() -> u64 {
    DEFAULT_DIAL_TIMEOUT_SECS
}

fn default_udp_session_idle_secs() -> u64 {
    120
}

/// One endpoint as written in a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEndpointFile {
    /// Endpoint name used in logs
    #[serde(default)]
    pub name: String,
    /// Server host name or address
    pub server_host: String,
    /// Range the server draws hop ports from
    pub port_range: PortRange,
    /// `tcp` or `udp`
    pub protocol: Protocol,
    /// Base32 shared secret
    pub totp_secret: String,
    /// Step duration in seconds
    pub step_seconds: u64,
    /// Kept for files shared with the server; the client always dials the full window
    #[serde(default = "default_skew_steps")]
    pub skew_steps: u32,
    /// Local bind address
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    /// Local bind port
    pub bind_port: u16,
    /// Identity tokens are issued for
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Accepted for compatibility; never applied
    #[serde(default)]
    pub tls: Option<TlsOptions>,
    /// Per-candidate dial timeout in seconds
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Datagram session idle timeout in seconds
    #[serde(default = "default_udp_session_idle_secs")]
    pub udp_session_idle_secs: u64,
}

impl ClientEndpointFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ClientConfig> {
        if self.bind_port == 0 {
            return Err(Error::config("invalid bind_port"));
        }
        if let Some(tls) = &self.tls {
            tls.warn_if_enabled(&self.name);
        }

        let config = ClientConfig {
            name: self.name.clone(),
            server_host: self.server_host.clone(),
            port_range: self.port_range,
            protocol: self.protocol,
            secret: Arc::new(SharedSecret::from_base32(&self.totp_secret)?),
            step_seconds: self.step_seconds,
            bind_addr: SocketAddr::new(self.bind_ip, self.bind_port),
            client_id: self.client_id.clone(),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            udp_session_idle: Duration::from_secs(self.udp_session_idle_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

/// A client configuration file: one endpoint or an `endpoints` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientConfigFile {
    /// Several endpoints served by one process
    Multi {
        /// Endpoints, each with its own local bind address
        endpoints: Vec<ClientEndpointFile>,
    },
    /// A single endpoint
    Single(ClientEndpointFile),
}

impl ClientConfigFile {
    /// Convert every endpoint and check that bind addresses are unique.
    pub fn to_configs(&self) -> Result<Vec<ClientConfig>> {
        let configs = match self {
            ClientConfigFile::Multi { endpoints } => {
                if endpoints.is_empty() {
                    return Err(Error::config("endpoints cannot be empty"));
                }
                endpoints
                    .iter()
                    .map(ClientEndpointFile::to_config)
                    .collect::<Result<Vec<_>>>()?
            }
            ClientConfigFile::Single(endpoint) => vec![endpoint.to_config()?],
        };

        for (i, a) in configs.iter().enumerate() {
            if let Some(b) = configs[i + 1..]
                .iter()
                .find(|b| b.bind_addr == a.bind_addr)
            {
                return Err(Error::config(format!(
                    "client endpoints {:?} and {:?} share bind address {}",
                    a.name, b.name, a.bind_addr
                )));
            }
        }

        Ok(configs)
    }
}

/// Load every endpoint from a JSON or TOML file.
pub fn load_client_configs(path: &Path) -> Result<Vec<ClientConfig>> {
    let file: ClientConfigFile = config::read_file(path)?;
    file.to_configs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileFormat;

    const SINGLE_JSON: &str = r#"{
        "name": "ssh",
        "server_host": "tunnel.example.com",
        "port_range": { "min": 20000, "max": 20100 },
        "protocol": "tcp",
        "totp_secret": "JBSWY3DPEHPK3PXP",
        "step_seconds": 30,
        "bind_port": 2222
    }"#;

    #[test]
    fn test_single_endpoint_defaults() {
        let file: ClientConfigFile = FileFormat::Json.parse(SINGLE_JSON).unwrap();
        let configs = file.to_configs().unwrap();

        let config = &configs[0];
        assert_eq!(config.bind_addr, "127.0.0.1:2222".parse().unwrap());
        assert_eq!(config.client_id, "client");
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.server_host, "tunnel.example.com");
    }

    #[test]
    fn test_multi_endpoint_toml() {
        let content = r#"
            [[endpoints]]
            name = "ssh"
            server_host = "10.0.0.1"
            port_range = { min = 20000, max = 20100 }
            protocol = "tcp"
            totp_secret = "JBSWY3DPEHPK3PXP"
            step_seconds = 30
            bind_port = 2222

            [[endpoints]]
            name = "dns"
            server_host = "10.0.0.1"
            port_range = { min = 30000, max = 30100 }
            protocol = "udp"
            totp_secret = "MZXW6YTBOI"
            step_seconds = 60
            bind_ip = "0.0.0.0"
            bind_port = 5353
            dial_timeout_secs = 1
        "#;

        let file: ClientConfigFile = FileFormat::Toml.parse(content).unwrap();
        let configs = file.to_configs().unwrap();

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].protocol, Protocol::Udp);
        assert_eq!(configs[1].bind_addr, "0.0.0.0:5353".parse().unwrap());
        assert_eq!(configs[1].dial_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_duplicate_bind_rejected() {
        let content = format!(r#"{{ "endpoints": [{}, {}] }}"#, SINGLE_JSON, SINGLE_JSON);
        let file: ClientConfigFile = FileFormat::Json.parse(&content).unwrap();

        let err = file.to_configs().unwrap_err();
        assert!(err.to_string().contains("bind address"));
    }

    #[test]
    fn test_distinct_bind_ips_allowed() {
        let other = SINGLE_JSON.replace("\"bind_port\": 2222", "\"bind_ip\": \"127.0.0.2\", \"bind_port\": 2222");
        let content = format!(r#"{{ "endpoints": [{}, {}] }}"#, SINGLE_JSON, other);
        let file: ClientConfigFile = FileFormat::Json.parse(&content).unwrap();

        assert_eq!(file.to_configs().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_endpoints_rejected() {
        let cases = [
            SINGLE_JSON.replace("\"step_seconds\": 30", "\"step_seconds\": 0"),
            SINGLE_JSON.replace("tunnel.example.com", ""),
            SINGLE_JSON.replace("\"min\": 20000", "\"min\": 0"),
            SINGLE_JSON.replace("JBSWY3DPEHPK3PXP", "1"),
            SINGLE_JSON.replace("\"bind_port\": 2222", "\"bind_port\": 0"),
        ];

        for content in cases {
            let file: ClientConfigFile = FileFormat::Json.parse(&content).unwrap();
            assert!(file.to_configs().is_err(), "accepted: {}", content);
        }
    }
}
