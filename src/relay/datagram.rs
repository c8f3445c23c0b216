//! Datagram relay sessions.
//!
//! A session pairs a peer seen on a shared local socket with a dedicated
//! upstream socket connected to the destination. Datagrams from the peer go
//! out through the upstream socket; replies are pumped back through the
//! shared socket to the peer.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::MAX_DATAGRAM_SIZE;

/// One relayed datagram flow.
pub struct DatagramSession {
    upstream: Arc<UdpSocket>,
    last_activity: Arc<Mutex<Instant>>,
    pump: JoinHandle<()>,
}

impl DatagramSession {
    /// Resolve `remote` (`host:port`) and open a session towards it.
    ///
    /// Replies are sent to `peer` through `reply`; `on_reply` is called with
    /// the size of each reply.
    pub async fn open<F>(
        remote: &str,
        reply: Arc<UdpSocket>,
        peer: SocketAddr,
        on_reply: F,
    ) -> Result<Self>
    where
        F: Fn(usize) + Send + 'static,
    {
        let remote_addr = resolve(remote).await?;
        Self::connect(remote_addr, reply, peer, on_reply).await
    }

    /// Open a session towards an already resolved address.
    pub async fn connect<F>(
        remote_addr: SocketAddr,
        reply: Arc<UdpSocket>,
        peer: SocketAddr,
        on_reply: F,
    ) -> Result<Self>
    where
        F: Fn(usize) + Send + 'static,
    {
        let local: IpAddr = if remote_addr.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let upstream = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
        upstream.connect(remote_addr).await?;

        let upstream = Arc::new(upstream);
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let pump = tokio::spawn(pump_replies(
            Arc::clone(&upstream),
            reply,
            peer,
            Arc::clone(&last_activity),
            on_reply,
        ));

        Ok(Self {
            upstream,
            last_activity,
            pump,
        })
    }

    /// Forward one datagram from the peer.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        *self.last_activity.lock() = Instant::now();
        self.upstream.send(payload).await?;
        Ok(())
    }

    /// Time since the last datagram in either direction.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Check whether the remote side has failed.
    ///
    /// A closed session drops everything sent through it and has to be
    /// replaced.
    pub fn is_closed(&self) -> bool {
        self.pump.is_finished()
    }

    /// Address the upstream socket is connected to.
    pub fn remote_addr(&self) -> Result<SocketAddr> {
        Ok(self.upstream.peer_addr()?)
    }
}

impl Drop for DatagramSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_replies<F>(
    upstream: Arc<UdpSocket>,
    reply: Arc<UdpSocket>,
    peer: SocketAddr,
    last_activity: Arc<Mutex<Instant>>,
    on_reply: F,
) where
    F: Fn(usize),
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let n = match upstream.recv(&mut buf).await {
            Ok(n) => n,
            // Includes ICMP port unreachable, reported as ConnectionRefused.
            Err(e) => {
                tracing::debug!(%peer, "datagram session closed: {}", e);
                return;
            }
        };

        *last_activity.lock() = Instant::now();
        if let Err(e) = reply.send_to(&buf[..n], peer).await {
            tracing::debug!(%peer, "failed to return datagram: {}", e);
            continue;
        }
        on_reply(n);
    }
}

/// Resolve `host:port` to the first address returned.
pub async fn resolve(remote: &str) -> Result<SocketAddr> {
    lookup_host(remote)
        .await?
        .next()
        .ok_or_else(|| Error::config(format!("cannot resolve {}", remote)))
}

/// Sessions keyed by peer address, owned by the task reading the shared socket.
pub struct SessionTable {
    sessions: HashMap<SocketAddr, DatagramSession>,
    idle_timeout: Duration,
}

impl SessionTable {
    /// Create an empty table whose sessions expire after `idle_timeout`.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            idle_timeout,
        }
    }

    /// Session for `peer`, if any.
    pub fn get(&self, peer: &SocketAddr) -> Option<&DatagramSession> {
        self.sessions.get(peer)
    }

    /// Check whether `peer` has a session.
    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Track a new session.
    pub fn insert(&mut self, peer: SocketAddr, session: DatagramSession) {
        self.sessions.insert(peer, session);
    }

    /// Drop the session for `peer`.
    pub fn remove(&mut self, peer: &SocketAddr) -> bool {
        self.sessions.remove(peer).is_some()
    }

    /// Drop sessions idle for longer than the timeout; returns how many.
    pub fn expire_idle(&mut self) -> usize {
        let before = self.sessions.len();
        let idle_timeout = self.idle_timeout;
        self.sessions.retain(|_, s| s.idle_for() < idle_timeout);
        before - self.sessions.len()
    }

    /// Interval at which [`expire_idle`](Self::expire_idle) should run.
    pub fn sweep_interval(&self) -> Duration {
        (self.idle_timeout / 2).clamp(Duration::from_millis(10), Duration::from_secs(30))
    }

    /// Get number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
