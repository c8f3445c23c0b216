//! Port rotation.
//!
//! The engine keeps the window of the current step open. On each tick it
//! binds the next window's new ports first and only then closes ports that
//! left the window, so a port valid in both windows never blinks.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::Result;
use crate::hopping::{unix_now, until_step_ends, PortWindow};
use crate::server::{shutdown_requested, HopContext, HopListener, ListenerSet, RotationSnapshot};

/// Owns the open hop ports of one route.
pub struct RotationEngine {
    ctx: Arc<HopContext>,
    step: i64,
    listeners: ListenerSet<HopListener>,
}

impl RotationEngine {
    pub(crate) async fn start(ctx: Arc<HopContext>, step: i64) -> Result<Self> {
        let window = Self::window(&ctx, step);
        let mut listeners = ListenerSet::new();

        for port in window.ports() {
            match HopListener::bind(&ctx, port).await {
                Ok(listener) => listeners.insert(port, listener),
                Err(e) => {
                    ctx.metrics.increment_bind_failures();
                    listeners.close_all();
                    return Err(e);
                }
            }
        }

        let engine = Self {
            ctx,
            step,
            listeners,
        };
        engine.publish();

        tracing::info!(
            route = %engine.ctx.config.name,
            protocol = %engine.ctx.config.protocol,
            step,
            ports = ?engine.listeners.ports(),
            "hop window open"
        );
        Ok(engine)
    }

    fn window(ctx: &HopContext, step: i64) -> PortWindow {
        PortWindow::new(&ctx.config.secret, step, ctx.config.port_range)
    }

    /// Current step.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Open hop ports, ascending.
    pub fn open_ports(&self) -> Vec<u16> {
        self.listeners.ports()
    }

    /// Advance one step: open the new window, then close what left it.
    ///
    /// A port that fails to bind is logged and retried on the next tick.
    pub async fn tick(&mut self) {
        let next = self.step.wrapping_add(1);
        let window = Self::window(&self.ctx, next);

        let mut opened = Vec::new();
        for port in self.listeners.missing(&window) {
            match HopListener::bind(&self.ctx, port).await {
                Ok(listener) => {
                    self.listeners.insert(port, listener);
                    opened.push(port);
                }
                Err(e) => {
                    self.ctx.metrics.increment_bind_failures();
                    tracing::error!(route = %self.ctx.config.name, step = next, "{}", e);
                }
            }
        }

        self.step = next;
        self.publish();

        let closed = self.listeners.close_outside(&window);
        self.ctx.metrics.increment_rotations();

        tracing::info!(
            route = %self.ctx.config.name,
            step = next,
            ?opened,
            ?closed,
            "rotated"
        );
    }

    /// Tick on every step boundary until shutdown, then close every port.
    ///
    /// The first tick lands when the engine's own step ends, which is
    /// immediately if that boundary already passed while binding.
    pub async fn run(mut self) {
        let step_seconds = self.ctx.config.step_seconds;
        let first = Instant::now() + until_step_ends(unix_now(), self.step, step_seconds);
        let mut ticker = interval_at(first, Duration::from_secs(step_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let mut shutdown = self.ctx.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        self.close();
    }

    /// Close every hop port.
    pub fn close(&mut self) {
        let closed = self.listeners.close_all();
        self.publish();
        tracing::info!(route = %self.ctx.config.name, ?closed, "hop ports closed");
    }

    fn publish(&self) {
        self.ctx.snapshot.send_replace(RotationSnapshot {
            step: self.step,
            ports: self.listeners.ports(),
        });
    }
}

impl Drop for RotationEngine {
    fn drop(&mut self) {
        if !self.listeners.is_empty() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    use crate::config::Protocol;
    use crate::crypto::SharedSecret;
    use crate::error::Error;
    use crate::handshake::HandshakeHeader;
    use crate::hopping::PortRange;
    use crate::server::{Server, ServerConfig};

    const SECRET: &str = "JBSWY3DPEHPK3PXP";

    async fn tcp_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    fn config(range: PortRange, protocol: Protocol, target: SocketAddr) -> ServerConfig {
        let mut config = ServerConfig::new(
            "test",
            SharedSecret::from_base32(SECRET).unwrap(),
            range,
            protocol,
            target.to_string(),
        );
        config.listen_ip = "127.0.0.1".parse().unwrap();
        config.handshake_timeout = Duration::from_secs(2);
        config
    }

    fn header(step: i64) -> [u8; 56] {
        let secret = SharedSecret::from_base32(SECRET).unwrap();
        HandshakeHeader::issue(&secret, step, "client").encode()
    }

    fn port_for(range: PortRange, step: i64) -> u16 {
        let secret = SharedSecret::from_base32(SECRET).unwrap();
        crate::hopping::port_for_step(&secret, step, range)
    }

    async fn echo_through(port: u16, step: i64) -> Vec<u8> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(&header(step)).await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_stream_end_to_end() {
        let range = PortRange::new(42000, 42100).unwrap();
        let server = Server::new(config(range, Protocol::Tcp, tcp_echo().await)).unwrap();
        let step = 1_000_000;
        let mut engine = server.start_at(step).await.unwrap();

        let port = port_for(range, step);
        assert!(engine.open_ports().contains(&port));
        assert_eq!(echo_through(port, step).await, b"hello");

        // The step-T port survives the next rotation and still admits step T.
        engine.tick().await;
        assert_eq!(engine.step(), step + 1);
        let prev = port_for(range, step);
        assert!(engine.open_ports().contains(&prev));
        assert_eq!(echo_through(prev, step).await, b"hello");

        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.admitted, 2);
        assert_eq!(snapshot.rotations, 1);
    }

    #[tokio::test]
    async fn test_tampered_token_gets_silence() {
        let range = PortRange::new(42200, 42300).unwrap();
        let server = Server::new(config(range, Protocol::Tcp, tcp_echo().await)).unwrap();
        let step = 2_000_000;
        let _engine = server.start_at(step).await.unwrap();

        let mut bad = header(step);
        bad[55] ^= 0x01;

        let mut stream = TcpStream::connect(("127.0.0.1", port_for(range, step)))
            .await
            .unwrap();
        stream.write_all(&bad).await.unwrap();

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.metrics().snapshot().rejected_token, 1);
    }

    #[tokio::test]
    async fn test_skewed_step_rejected() {
        let range = PortRange::new(42400, 42500).unwrap();
        let server = Server::new(config(range, Protocol::Tcp, tcp_echo().await)).unwrap();
        let step = 3_000_000;
        let _engine = server.start_at(step).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port_for(range, step)))
            .await
            .unwrap();
        stream.write_all(&header(step - 2)).await.unwrap();

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.metrics().snapshot().rejected_skew, 1);
    }

    #[tokio::test]
    async fn test_datagram_end_to_end() {
        let range = PortRange::new(42600, 42700).unwrap();
        let server = Server::new(config(range, Protocol::Udp, udp_echo().await)).unwrap();
        let step = 4_000_000;
        let _engine = server.start_at(step).await.unwrap();

        let hop = SocketAddr::from(([127, 0, 0, 1], port_for(range, step)));
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let secret = SharedSecret::from_base32(SECRET).unwrap();

        let first = HandshakeHeader::issue(&secret, step, "client").prefix(b"one");
        peer.send_to(&first, hop).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"one");
        assert_eq!(from, hop);

        peer.send_to(b"two", hop).await.unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"two");

        // An unknown peer without a header is dropped.
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"raw", hop).await.unwrap();
        let silent =
            tokio::time::timeout(Duration::from_millis(200), stranger.recv_from(&mut buf)).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_closes_window() {
        let range = PortRange::new(42800, 42900).unwrap();
        let step = 5_000_000;
        let taken = TcpListener::bind(("127.0.0.1", port_for(range, step)))
            .await
            .unwrap();

        let server = Server::new(config(range, Protocol::Tcp, tcp_echo().await)).unwrap();
        let err = server.start_at(step).await.err().unwrap();
        assert!(matches!(err, Error::Bind { port, .. } if port == port_for(range, step)));
        assert_eq!(server.metrics().snapshot().bind_failures, 1);
        drop(taken);
    }

    #[tokio::test]
    async fn test_shutdown_releases_ports() {
        let range = PortRange::new(43000, 43100).unwrap();
        let server = Arc::new(Server::new(config(range, Protocol::Tcp, tcp_echo().await)).unwrap());
        let step = 6_000_000;
        let engine = server.start_at(step).await.unwrap();
        let ports = engine.open_ports();

        let running = tokio::spawn(engine.run());
        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        assert!(server.subscribe().borrow().ports.is_empty());
        for port in ports {
            let mut rebound = None;
            for _ in 0..50 {
                if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                    rebound = Some(listener);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert!(rebound.is_some(), "port {} still bound", port);
        }
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let range = PortRange::new(43200, 43300).unwrap();
        let mut config = config(range, Protocol::Tcp, tcp_echo().await);
        config.handshake_timeout = Duration::from_millis(300);
        let server = Server::new(config).unwrap();
        let step = 7_000_000;
        let _engine = server.start_at(step).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port_for(range, step)))
            .await
            .unwrap();
        stream.write_all(&header(step)[..20]).await.unwrap();

        let started = Instant::now();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(started.elapsed() >= Duration::from_millis(250));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.rejected_framing, 1);
        assert_eq!(snapshot.admitted, 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_handshakes_and_drains_relays() {
        let range = PortRange::new(43400, 43500).unwrap();
        let mut config = config(range, Protocol::Tcp, tcp_echo().await);
        config.handshake_timeout = Duration::from_secs(30);
        let server = Arc::new(Server::new(config).unwrap());
        let step = 8_000_000;
        let engine = server.start_at(step).await.unwrap();
        let port = port_for(range, step);

        let mut relayed = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        relayed.write_all(&header(step)).await.unwrap();
        relayed.write_all(b"before").await.unwrap();
        let mut buf = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(5), relayed.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"before");

        let mut stalled = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stalled.write_all(&header(step)[..20]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let running = tokio::spawn(engine.run());
        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        // Closed long before its 30s handshake timeout.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stalled.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The established relay keeps flowing after its hop port is gone.
        relayed.write_all(b"after").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), relayed.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"after");
        assert_eq!(server.metrics().snapshot().admitted, 1);
    }

    #[tokio::test]
    async fn test_datagram_sessions_end_with_their_hop_port() {
        let range = PortRange::new(43600, 43700).unwrap();
        let server = Server::new(config(range, Protocol::Udp, udp_echo().await)).unwrap();
        let step = 9_000_000;
        let mut engine = server.start_at(step).await.unwrap();
        let secret = SharedSecret::from_base32(SECRET).unwrap();

        let old = SocketAddr::from(([127, 0, 0, 1], port_for(range, step)));
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&HandshakeHeader::issue(&secret, step, "client").prefix(b"one"), old)
            .await
            .unwrap();
        let mut buf = [0u8; 128];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"one");

        // Rotate until the port that admitted the peer has left the window.
        for _ in 0..10 {
            engine.tick().await;
            if !engine.open_ports().contains(&old.port()) {
                break;
            }
        }
        assert!(!engine.open_ports().contains(&old.port()));

        // The session went with the socket.
        let _ = peer.send_to(b"lost", old).await;
        let silent =
            tokio::time::timeout(Duration::from_millis(200), peer.recv_from(&mut buf)).await;
        assert!(!matches!(silent, Ok(Ok(_))));

        // The same peer is admitted again on the current window.
        let now = engine.step();
        let hop = SocketAddr::from(([127, 0, 0, 1], port_for(range, now)));
        peer.send_to(&HandshakeHeader::issue(&secret, now, "client").prefix(b"two"), hop)
            .await
            .unwrap();
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(from, hop);
        assert_eq!(server.metrics().snapshot().admitted, 2);
    }
}
