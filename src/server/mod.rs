//! Server side of the tunnel.
//!
//! Each route runs one [`Server`]: a rotation engine keeps the hop ports of
//! the current window open, accept loops admit peers that present a valid
//! handshake header, and admitted flows are relayed to the route's target.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Server                              │
//! │  ┌──────────────────┐   snapshot (watch)   ┌──────────────┐  │
//! │  │ Rotation engine  │ ───────────────────► │ Accept loops │  │
//! │  │ owns ListenerSet │                      │ one per port │  │
//! │  └────────┬─────────┘                      └──────┬───────┘  │
//! │           │ open / close hop ports                │          │
//! │           ▼                                       ▼          │
//! │  ┌──────────────────┐   ┌───────────┐   ┌────────────────┐  │
//! │  │ Origin filter    │ ► │ Throttle  │ ► │ Admission      │  │
//! │  └──────────────────┘   └───────────┘   └───────┬────────┘  │
//! │                                                 ▼            │
//! │                                        ┌────────────────┐   │
//! │                                        │ Relay → target │   │
//! │                                        └────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod datagram;
mod listeners;
mod metrics;
mod origin;
mod rotation;
mod stream;
mod throttle;

pub use config::{load_server_configs, ServerConfig, ServerConfigFile, ServerRouteFile};
pub use listeners::{HopListener, ListenerSet};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use origin::{CidrBlock, OriginFilter};
pub use rotation::RotationEngine;
pub use throttle::FailureThrottle;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use crate::error::{Error, Result};
use crate::handshake::Admission;
use crate::hopping::current_step;

/// Step the server is on and the ports it currently listens on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationSnapshot {
    /// Current step
    pub step: i64,
    /// Open hop ports, ascending
    pub ports: Vec<u16>,
}

/// State shared by the rotation engine and every hop task of a route.
pub(crate) struct HopContext {
    pub(crate) config: ServerConfig,
    pub(crate) admission: Admission,
    pub(crate) metrics: Arc<ServerMetrics>,
    pub(crate) throttle: FailureThrottle,
    pub(crate) handshakes: Arc<Semaphore>,
    pub(crate) snapshot: watch::Sender<RotationSnapshot>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl HopContext {
    /// Step used for skew checks; published by the rotation engine.
    pub(crate) fn current_step(&self) -> i64 {
        self.snapshot.borrow().step
    }

    /// Origin checks done before any byte is read from the peer.
    pub(crate) fn screen(&self, ip: IpAddr) -> Result<()> {
        if !self.config.allowed_origins.allows(ip) {
            return Err(Error::OriginRejected(ip));
        }
        if self.throttle.is_throttled(&ip) {
            return Err(Error::Throttled(ip));
        }
        Ok(())
    }

    /// Account for a rejected peer. Nothing is sent back.
    pub(crate) fn reject(&self, peer: SocketAddr, err: &Error) {
        tracing::debug!(route = %self.config.name, %peer, "rejected: {}", err);
        self.metrics.record_rejection(err);
        match err {
            // Screened before any handshake attempt.
            Error::OriginRejected(_) | Error::Throttled(_) => {}
            _ => self.throttle.record_failure(&peer.ip()),
        }
    }

    /// Account for an admitted peer.
    pub(crate) fn admit(&self, peer: SocketAddr) {
        tracing::debug!(route = %self.config.name, %peer, "admitted");
        self.metrics.increment_admitted();
        self.throttle.reset(&peer.ip());
    }
}

/// Resolves once shutdown is requested or the controlling [`Server`] is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *rx.borrow_and_update();
        if stopping {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// One route of the tunnel server.
pub struct Server {
    ctx: Arc<HopContext>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Create a server for a validated route configuration.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (snapshot, _) = watch::channel(RotationSnapshot::default());

        let ctx = HopContext {
            admission: Admission::new(
                Arc::clone(&config.secret),
                config.client_id.clone(),
                config.skew_steps,
            ),
            metrics: Arc::new(ServerMetrics::new()),
            throttle: FailureThrottle::new(config.max_failures_per_origin, config.failure_window),
            handshakes: Arc::new(Semaphore::new(config.max_concurrent_handshakes)),
            snapshot,
            shutdown: shutdown_rx,
            config,
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            shutdown_tx,
        })
    }

    /// Open the window for the wall-clock step and rotate until shutdown.
    pub async fn run(&self) -> Result<()> {
        let step = current_step(self.ctx.config.step_seconds);
        let engine = self.start_at(step).await?;
        engine.run().await;
        Ok(())
    }

    /// Open the window for `step` without starting the rotation timer.
    ///
    /// Fails if any port of the window cannot be bound; ports opened before
    /// the failure are closed again.
    pub async fn start_at(&self, step: i64) -> Result<RotationEngine> {
        RotationEngine::start(Arc::clone(&self.ctx), step).await
    }

    /// Ask the rotation engine to close every port and stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Watch the current step and open ports.
    pub fn subscribe(&self) -> watch::Receiver<RotationSnapshot> {
        self.ctx.snapshot.subscribe()
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.ctx.metrics
    }

    /// Route configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::crypto::SharedSecret;
    use crate::hopping::PortRange;

    fn server(origins: &[&str]) -> Server {
        let mut config = ServerConfig::new(
            "test",
            SharedSecret::generate(),
            PortRange::new(41000, 41100).unwrap(),
            Protocol::Tcp,
            "127.0.0.1:9",
        );
        config.allowed_origins = OriginFilter::parse(origins).unwrap();
        config.max_failures_per_origin = 2;
        Server::new(config).unwrap()
    }

    #[test]
    fn test_screen_origin_and_throttle() {
        let server = server(&["127.0.0.0/8"]);
        let ctx = &server.ctx;
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert!(ctx.screen(local.ip()).is_ok());
        assert!(matches!(
            ctx.screen("10.0.0.1".parse().unwrap()),
            Err(Error::OriginRejected(_))
        ));

        ctx.reject(local, &Error::Authentication);
        ctx.reject(local, &Error::handshake("short"));
        assert!(matches!(ctx.screen(local.ip()), Err(Error::Throttled(_))));

        ctx.admit(local);
        assert!(ctx.screen(local.ip()).is_ok());

        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.rejected_token, 1);
        assert_eq!(snapshot.rejected_framing, 1);
        assert_eq!(snapshot.admitted, 1);
    }

    #[test]
    fn test_origin_rejection_is_not_throttled() {
        let server = server(&["127.0.0.1"]);
        let outsider: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        for _ in 0..5 {
            server
                .ctx
                .reject(outsider, &Error::OriginRejected(outsider.ip()));
        }
        assert_eq!(server.ctx.throttle.tracked_count(), 0);
        assert_eq!(server.metrics().snapshot().rejected_origin, 5);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let server = server(&[]);
        let mut rx = server.ctx.shutdown.clone();

        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        server.shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ServerConfig::new(
            "bad",
            SharedSecret::generate(),
            PortRange::new(41000, 41100).unwrap(),
            Protocol::Tcp,
            "",
        );
        assert!(Server::new(config.clone()).is_err());

        config.target = "127.0.0.1:9".into();
        config.step_seconds = 0;
        assert!(Server::new(config).is_err());
    }
}
