//! Datagram hop ports.
//!
//! The first datagram from an unknown peer must start with a valid header.
//! Admitted peers get a session towards the target; everything they send
//! afterwards is relayed raw. Sessions live in the task that owns the hop
//! socket, so closing the socket ends them.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::Result;
use crate::handshake::HandshakeHeader;
use crate::relay::{self, DatagramSession, SessionTable};
use crate::server::HopContext;
use crate::MAX_DATAGRAM_SIZE;

/// Everything the hop task owns besides the socket.
struct HopState {
    sessions: SessionTable,
    /// Resolved once so admitting a peer never waits on DNS.
    target: Option<SocketAddr>,
}

pub(crate) async fn serve(ctx: Arc<HopContext>, socket: Arc<UdpSocket>, port: u16) {
    let mut state = HopState {
        sessions: SessionTable::new(ctx.config.udp_session_idle),
        target: None,
    };
    if let Err(e) = target_addr(&ctx, &mut state.target).await {
        tracing::warn!(route = %ctx.config.name, target = %ctx.config.target, "cannot resolve target: {}", e);
    }

    let mut sweep = tokio::time::interval(state.sessions.sweep_interval());
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!(route = %ctx.config.name, port, "recv error: {}", e);
                        continue;
                    }
                };
                forward(&ctx, &socket, &mut state, &buf[..n], peer).await;
            }
            _ = sweep.tick() => {
                let expired = state.sessions.expire_idle();
                if expired > 0 {
                    tracing::debug!(route = %ctx.config.name, port, expired, "expired idle datagram sessions");
                }
            }
        }
    }
}

async fn target_addr(ctx: &HopContext, cached: &mut Option<SocketAddr>) -> Result<SocketAddr> {
    if let Some(addr) = *cached {
        return Ok(addr);
    }
    let addr = relay::resolve(&ctx.config.target).await?;
    *cached = Some(addr);
    Ok(addr)
}

async fn forward(
    ctx: &Arc<HopContext>,
    socket: &Arc<UdpSocket>,
    state: &mut HopState,
    data: &[u8],
    peer: SocketAddr,
) {
    // An admitted peer whose target session failed gets a new one without
    // a second handshake.
    let reopen = match state.sessions.get(&peer) {
        Some(session) if !session.is_closed() => match session.send(data).await {
            Ok(()) => {
                ctx.metrics.add_relayed(data.len() as u64, 0);
                return;
            }
            Err(e) => {
                tracing::debug!(route = %ctx.config.name, %peer, "datagram relay error: {}", e);
                true
            }
        },
        Some(_) => true,
        None => false,
    };

    let payload = if reopen {
        state.sessions.remove(&peer);
        data
    } else {
        ctx.metrics.increment_accepted();
        match admit_first(ctx, data, peer) {
            Ok(payload) => {
                ctx.admit(peer);
                payload
            }
            Err(e) => {
                ctx.reject(peer, &e);
                return;
            }
        }
    };

    let metrics = Arc::clone(&ctx.metrics);
    let opened = match target_addr(ctx, &mut state.target).await {
        Ok(target) => {
            DatagramSession::connect(target, Arc::clone(socket), peer, move |n| {
                metrics.add_relayed(0, n as u64)
            })
            .await
        }
        Err(e) => Err(e),
    };
    let session = match opened {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(route = %ctx.config.name, target = %ctx.config.target, "target unreachable: {}", e);
            return;
        }
    };

    if !payload.is_empty() {
        match session.send(payload).await {
            Ok(()) => ctx.metrics.add_relayed(payload.len() as u64, 0),
            Err(e) => tracing::debug!(route = %ctx.config.name, %peer, "datagram relay error: {}", e),
        }
    }
    state.sessions.insert(peer, session);
}

fn admit_first<'a>(ctx: &HopContext, data: &'a [u8], peer: SocketAddr) -> Result<&'a [u8]> {
    ctx.screen(peer.ip())?;
    let (header, payload) = HandshakeHeader::split_datagram(data)?;
    ctx.admission.check(&header, ctx.current_step())?;
    Ok(payload)
}
