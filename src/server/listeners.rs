//! Open hop ports.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use crate::config::Protocol;
use crate::error::{Error, Result};
use crate::hopping::PortWindow;
use crate::server::{datagram, stream, HopContext};

/// Handles keyed by port. Dropping a handle closes its port.
///
/// Owned by the rotation engine; nothing else mutates it.
pub struct ListenerSet<H> {
    open: BTreeMap<u16, H>,
}

impl<H> ListenerSet<H> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            open: BTreeMap::new(),
        }
    }

    /// Ports of `window` that are not open yet, in window order.
    pub fn missing(&self, window: &PortWindow) -> Vec<u16> {
        window
            .ports()
            .filter(|port| !self.open.contains_key(port))
            .collect()
    }

    /// Track a newly opened port.
    pub fn insert(&mut self, port: u16, handle: H) {
        self.open.insert(port, handle);
    }

    /// Check whether `port` is open.
    pub fn contains(&self, port: u16) -> bool {
        self.open.contains_key(&port)
    }

    /// Close every port not in `window`; returns the closed ports.
    pub fn close_outside(&mut self, window: &PortWindow) -> Vec<u16> {
        let stale: Vec<u16> = self
            .open
            .keys()
            .copied()
            .filter(|port| !window.contains(*port))
            .collect();
        for port in &stale {
            self.open.remove(port);
        }
        stale
    }

    /// Close every port; returns the closed ports.
    pub fn close_all(&mut self) -> Vec<u16> {
        let ports = self.ports();
        self.open.clear();
        ports
    }

    /// Open ports, ascending.
    pub fn ports(&self) -> Vec<u16> {
        self.open.keys().copied().collect()
    }

    /// Get number of open ports.
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Check whether no port is open.
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

impl<H> Default for ListenerSet<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound hop port and the task serving it.
///
/// Dropping the listener aborts the task, which releases the socket.
/// Connections already handed off to their own tasks are not affected.
pub struct HopListener {
    port: u16,
    task: JoinHandle<()>,
}

impl HopListener {
    pub(crate) async fn bind(ctx: &Arc<HopContext>, port: u16) -> Result<Self> {
        let addr = SocketAddr::new(ctx.config.listen_ip, port);
        let bind_error = |source| Error::Bind { port, source };

        let task = match ctx.config.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
                tokio::spawn(stream::accept_loop(Arc::clone(ctx), listener, port))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(addr).await.map_err(bind_error)?;
                tokio::spawn(datagram::serve(Arc::clone(ctx), Arc::new(socket), port))
            }
        };

        Ok(Self { port, task })
    }

    /// Port this listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for HopListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
