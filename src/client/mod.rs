//! Client side of the tunnel.
//!
//! Applications connect to a local address; each new flow is carried to the
//! server's current hop port with a handshake header in front of it.

mod config;
mod datagram;
mod dial;

pub use config::{load_client_configs, ClientConfig, ClientConfigFile, ClientEndpointFile};
pub use dial::Dialer;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::config::Protocol;
use crate::error::{Error, Result};
use crate::relay;

/// One client endpoint.
pub struct Client {
    config: ClientConfig,
    dialer: Dialer,
}

impl Client {
    /// Create a client for a validated endpoint configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dialer: Dialer::new(&config),
            config,
        })
    }

    /// Endpoint configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Bind the local address and serve until the process exits.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.bind_addr;
        let bind_error = |source| Error::Bind {
            port: addr.port(),
            source,
        };

        match self.config.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
                tracing::info!(endpoint = %self.config.name, %addr, server = %self.config.server_host, "listening (tcp)");
                self.serve(listener).await
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(addr).await.map_err(bind_error)?;
                tracing::info!(endpoint = %self.config.name, %addr, server = %self.config.server_host, "listening (udp)");
                self.serve_datagram(socket).await;
                Ok(())
            }
        }
    }

    /// Tunnel every connection accepted on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (local, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(endpoint = %self.config.name, "accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let dialer = self.dialer.clone();
            let name = self.config.name.clone();
            tokio::spawn(async move {
                if let Err(e) = tunnel_stream(&dialer, local).await {
                    tracing::warn!(endpoint = %name, %peer, "flow abandoned: {}", e);
                }
            });
        }
    }

    /// Tunnel every datagram received on `socket`.
    pub async fn serve_datagram(&self, socket: UdpSocket) {
        datagram::serve(&self.config, &self.dialer, Arc::new(socket)).await
    }
}

async fn tunnel_stream(dialer: &Dialer, mut local: TcpStream) -> Result<()> {
    let window = dialer.window();
    let (mut remote, candidate) = dialer.connect(&window).await?;
    tracing::debug!(port = candidate.port, step = candidate.step, "connected");

    if let Err(e) = local.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {}", e);
    }

    let (up, down) = relay::pipe(&mut local, &mut remote).await?;
    tracing::debug!(up, down, "flow finished");
    Ok(())
}
