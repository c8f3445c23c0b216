//! Stream hop ports: accept, admit, relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::handshake::HandshakeHeader;
use crate::relay;
use crate::server::{shutdown_requested, HopContext};

pub(crate) async fn accept_loop(ctx: Arc<HopContext>, listener: TcpListener, port: u16) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(route = %ctx.config.name, port, "accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        ctx.metrics.increment_accepted();

        if let Err(e) = ctx.screen(peer.ip()) {
            ctx.reject(peer, &e);
            continue;
        }

        // Waits here when the handshake budget is used up.
        let permit = match Arc::clone(&ctx.handshakes).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        tokio::spawn(handle_connection(Arc::clone(&ctx), stream, peer, permit));
    }
}

async fn handle_connection(
    ctx: Arc<HopContext>,
    mut stream: TcpStream,
    peer: SocketAddr,
    permit: OwnedSemaphorePermit,
) {
    let mut shutdown = ctx.shutdown.clone();
    let admitted = tokio::select! {
        res = read_and_admit(&ctx, &mut stream) => res,
        _ = shutdown_requested(&mut shutdown) => {
            tracing::debug!(route = %ctx.config.name, %peer, "handshake cancelled by shutdown");
            return;
        }
    };
    drop(permit);

    if let Err(e) = admitted {
        ctx.reject(peer, &e);
        return;
    }
    ctx.admit(peer);

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, "set_nodelay failed: {}", e);
    }

    let mut target = match relay::connect_target(&ctx.config.target).await {
        Ok(target) => target,
        Err(e) => {
            tracing::warn!(route = %ctx.config.name, target = %ctx.config.target, "target unreachable: {}", e);
            return;
        }
    };

    match relay::pipe(&mut stream, &mut target).await {
        Ok((up, down)) => {
            ctx.metrics.add_relayed(up, down);
            tracing::debug!(route = %ctx.config.name, %peer, up, down, "relay finished");
        }
        Err(e) => tracing::debug!(route = %ctx.config.name, %peer, "relay error: {}", e),
    }
}

async fn read_and_admit(ctx: &HopContext, stream: &mut TcpStream) -> Result<HandshakeHeader> {
    let deadline = ctx.config.handshake_timeout;
    let header = timeout(deadline, HandshakeHeader::read_from(stream))
        .await
        .map_err(|_| Error::Timeout(deadline.as_millis() as u64))??;

    ctx.admission.check(&header, ctx.current_step())?;
    Ok(header)
}
