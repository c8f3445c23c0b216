//! Dialing the server's current window.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::client::ClientConfig;
use crate::crypto::SharedSecret;
use crate::error::{Error, Result};
use crate::handshake::HandshakeHeader;
use crate::hopping::{current_step, Candidate, PortRange, PortWindow};
use crate::relay::DatagramSession;

/// Tries the candidates of a window in priority order.
///
/// The handshake is always issued for the step that produced the port that
/// answered, so a client dialing a neighbouring step's port still passes the
/// server's skew check.
#[derive(Clone)]
pub struct Dialer {
    host: String,
    port_range: PortRange,
    secret: Arc<SharedSecret>,
    step_seconds: u64,
    identity: String,
    attempt_timeout: Duration,
}

impl Dialer {
    /// Create a dialer for an endpoint.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            host: config.server_host.clone(),
            port_range: config.port_range,
            secret: Arc::clone(&config.secret),
            step_seconds: config.step_seconds,
            identity: config.client_id.clone(),
            attempt_timeout: config.dial_timeout,
        }
    }

    /// Window around the local clock's current step.
    pub fn window(&self) -> PortWindow {
        self.window_at(current_step(self.step_seconds))
    }

    /// Window around `step`.
    pub fn window_at(&self, step: i64) -> PortWindow {
        PortWindow::new(&self.secret, step, self.port_range)
    }

    /// Header for a candidate.
    pub fn header_for(&self, candidate: &Candidate) -> HandshakeHeader {
        HandshakeHeader::issue(&self.secret, candidate.step, &self.identity)
    }

    /// Check whether the server still listens on `candidate`'s port.
    ///
    /// A port derived for step `s` stays open until the server reaches
    /// step `s + 2`; this judges that by the local clock.
    pub fn still_open(&self, candidate: &Candidate) -> bool {
        current_step(self.step_seconds) <= candidate.step.saturating_add(1)
    }

    /// Connect to the first reachable candidate and send the header.
    pub async fn connect(&self, window: &PortWindow) -> Result<(TcpStream, Candidate)> {
        for candidate in window.candidates() {
            match self.try_candidate(candidate).await {
                Ok(stream) => return Ok((stream, *candidate)),
                Err(e) => {
                    tracing::debug!(host = %self.host, port = candidate.port, step = candidate.step, "dial failed: {}", e);
                }
            }
        }

        Err(Error::DialExhausted {
            host: self.host.clone(),
            attempts: window.len(),
        })
    }

    async fn try_candidate(&self, candidate: &Candidate) -> Result<TcpStream> {
        let addr = (self.host.as_str(), candidate.port);
        let mut stream = timeout(self.attempt_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(self.attempt_timeout.as_millis() as u64))??;
        stream.set_nodelay(true)?;

        let header = self.header_for(candidate);
        stream.write_all(&header.encode()).await?;
        Ok(stream)
    }

    /// Open a datagram session towards the first usable candidate.
    ///
    /// Datagram sockets cannot observe a closed remote port, so this only
    /// moves past a candidate when the socket itself cannot be set up.
    pub async fn open_datagram<F>(
        &self,
        window: &PortWindow,
        reply: Arc<UdpSocket>,
        peer: SocketAddr,
        on_reply: F,
    ) -> Result<(DatagramSession, Candidate)>
    where
        F: Fn(usize) + Send + Clone + 'static,
    {
        for candidate in window.candidates() {
            let remote = remote_addr(&self.host, candidate.port);
            match DatagramSession::open(&remote, Arc::clone(&reply), peer, on_reply.clone()).await {
                Ok(session) => return Ok((session, *candidate)),
                Err(e) => {
                    tracing::debug!(%remote, step = candidate.step, "datagram dial failed: {}", e);
                }
            }
        }

        Err(Error::DialExhausted {
            host: self.host.clone(),
            attempts: window.len(),
        })
    }
}

fn remote_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::handshake::Admission;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn dialer(range: PortRange) -> (Dialer, Arc<SharedSecret>) {
        let secret = SharedSecret::from_base32("JBSWY3DPEHPK3PXP").unwrap();
        let mut config = ClientConfig::new(
            "test",
            "127.0.0.1",
            secret,
            range,
            Protocol::Tcp,
            "127.0.0.1:0".parse().unwrap(),
        );
        config.dial_timeout = Duration::from_millis(500);
        let secret = Arc::clone(&config.secret);
        (Dialer::new(&config), secret)
    }

    #[test]
    fn test_remote_addr_brackets_ipv6() {
        assert_eq!(remote_addr("::1", 53), "[::1]:53");
        assert_eq!(remote_addr("[::1]", 53), "[::1]:53");
        assert_eq!(remote_addr("example.com", 80), "example.com:80");
    }

    #[test]
    fn test_still_open_tracks_server_retention() {
        let (dialer, _) = dialer(PortRange::new(44000, 44100).unwrap());
        let now = current_step(30);

        for candidate in dialer.window_at(now + 1).candidates() {
            assert!(dialer.still_open(candidate));
        }
        for candidate in dialer.window_at(now - 3).candidates() {
            assert!(!dialer.still_open(candidate));
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_reachable_candidate() {
        let range = PortRange::new(44000, 44100).unwrap();
        let (dialer, secret) = dialer(range);
        let window = dialer.window_at(7_000_000);

        // Only the last candidate is listening.
        let target = *window.candidates().last().unwrap();
        let listener = TcpListener::bind(("127.0.0.1", target.port)).await.unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            HandshakeHeader::read_from(&mut stream).await.unwrap()
        });

        let (_stream, used) = dialer.connect(&window).await.unwrap();
        assert_eq!(used, target);

        let header = accept.await.unwrap();
        assert_eq!(header.step, target.step);

        // Header step matches the answering port, so it passes at the window's step.
        let admission = Admission::new(secret, "client", 1);
        assert!(admission.check(&header, window.step()).is_ok());
    }

    #[tokio::test]
    async fn test_all_candidates_closed() {
        let range = PortRange::new(44200, 44300).unwrap();
        let (dialer, _) = dialer(range);
        let window = dialer.window_at(8_000_000);

        let err = dialer.connect(&window).await.unwrap_err();
        assert!(matches!(err, Error::DialExhausted { attempts, .. } if attempts == window.len()));
    }

    #[tokio::test]
    async fn test_datagram_uses_first_candidate() {
        let range = PortRange::new(44400, 44500).unwrap();
        let (dialer, _) = dialer(range);
        let window = dialer.window_at(9_000_000);

        let reply = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let (session, used) = dialer
            .open_datagram(&window, reply, peer, |_| {})
            .await
            .unwrap();

        assert_eq!(used, window.candidates()[0]);
        assert_eq!(session.remote_addr().unwrap().port(), used.port);
    }

    #[tokio::test]
    async fn test_header_sent_before_payload() {
        let range = PortRange::new(44600, 44700).unwrap();
        let (dialer, _) = dialer(range);
        let window = dialer.window_at(10_000_000);
        let first = window.candidates()[0];
        let listener = TcpListener::bind(("127.0.0.1", first.port)).await.unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = vec![0u8; crate::handshake::HEADER_LEN + 3];
            stream.read_exact(&mut raw).await.unwrap();
            raw
        });

        let (mut stream, _) = dialer.connect(&window).await.unwrap();
        stream.write_all(b"abc").await.unwrap();

        let raw = accept.await.unwrap();
        let header = HandshakeHeader::decode(&raw).unwrap();
        assert_eq!(header.step, first.step);
        assert_eq!(&raw[crate::handshake::HEADER_LEN..], b"abc");
    }
}
