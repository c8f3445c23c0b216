//! Local datagram endpoint.
//!
//! Each local peer gets its own session towards a hop port. A session is
//! replaced, with a fresh header, once its hop port has rotated out or its
//! remote side has failed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::client::{ClientConfig, Dialer};
use crate::hopping::Candidate;
use crate::relay::SessionTable;
use crate::MAX_DATAGRAM_SIZE;

/// Live sessions and the candidate each one was opened on.
struct Flows {
    sessions: SessionTable,
    dialed: HashMap<SocketAddr, Candidate>,
}

impl Flows {
    fn remove(&mut self, peer: &SocketAddr) {
        self.sessions.remove(peer);
        self.dialed.remove(peer);
    }

    fn expire_idle(&mut self) -> usize {
        let expired = self.sessions.expire_idle();
        let sessions = &self.sessions;
        self.dialed.retain(|peer, _| sessions.contains(peer));
        expired
    }
}

pub(crate) async fn serve(config: &ClientConfig, dialer: &Dialer, socket: Arc<UdpSocket>) {
    let mut flows = Flows {
        sessions: SessionTable::new(config.udp_session_idle),
        dialed: HashMap::new(),
    };
    let mut sweep = tokio::time::interval(flows.sessions.sweep_interval());
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!(endpoint = %config.name, "recv error: {}", e);
                        continue;
                    }
                };
                forward(config, dialer, &socket, &mut flows, &buf[..n], peer).await;
            }
            _ = sweep.tick() => {
                let expired = flows.expire_idle();
                if expired > 0 {
                    tracing::debug!(endpoint = %config.name, expired, "expired idle datagram sessions");
                }
            }
        }
    }
}

async fn forward(
    config: &ClientConfig,
    dialer: &Dialer,
    socket: &Arc<UdpSocket>,
    flows: &mut Flows,
    data: &[u8],
    peer: SocketAddr,
) {
    if let Some(session) = flows.sessions.get(&peer) {
        let usable = !session.is_closed()
            && flows
                .dialed
                .get(&peer)
                .is_some_and(|candidate| dialer.still_open(candidate));

        if usable {
            match session.send(data).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::debug!(endpoint = %config.name, %peer, "datagram relay error: {}", e);
                }
            }
        }

        flows.remove(&peer);
        tracing::debug!(endpoint = %config.name, %peer, "datagram session retired, dialing again");
    }

    let window = dialer.window();
    let (session, candidate) = match dialer
        .open_datagram(&window, Arc::clone(socket), peer, |_| {})
        .await
    {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!(endpoint = %config.name, %peer, "dropping datagram: {}", e);
            return;
        }
    };

    let first = dialer.header_for(&candidate).prefix(data);
    if let Err(e) = session.send(&first).await {
        tracing::debug!(endpoint = %config.name, %peer, "datagram relay error: {}", e);
        return;
    }

    tracing::debug!(endpoint = %config.name, %peer, port = candidate.port, step = candidate.step, "datagram session opened");
    flows.sessions.insert(peer, session);
    flows.dialed.insert(peer, candidate);
}
