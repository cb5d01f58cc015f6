//! Periodic ALIVE packets towards whoever monitors this node.
//!
//! A client reports to its cluster server and a cluster server to the main
//! server. A node missing from its own view (not joined yet, or evicted)
//! sends HELLO to the main server instead, so joining retries on the same
//! schedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use tandem_core::{ClientNode, ConnectionType, PacketType};
use tandem_services::{Role, SharedTopology, Topology};

use crate::outbox::{Envelope, Outbox};

pub struct Heartbeat {
    local: ClientNode,
    topology: SharedTopology,
    outbox: Arc<Outbox>,
    interval: Duration,
    cancel: CancellationToken,
}

/// The packet a node with this view should send on a heartbeat tick.
pub(crate) fn beat(topology: &Topology) -> Option<(ConnectionType, ClientNode)> {
    let local = topology.local();
    if topology.is_main_server() {
        return None;
    }
    if !topology.contains(local) {
        return Some((ConnectionType::Hello, topology.main_server().clone()));
    }
    match topology.role() {
        Role::Client => topology
            .server_of(local)
            .map(|server| (ConnectionType::Alive, server.clone())),
        Role::ClusterServer => Some((ConnectionType::Alive, topology.main_server().clone())),
        Role::MainServer => None,
    }
}

impl Heartbeat {
    pub fn new(
        local: ClientNode,
        topology: SharedTopology,
        outbox: Arc<Outbox>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local,
            topology,
            outbox,
            interval,
            cancel,
        }
    }

    /// The first tick fires immediately.
    pub async fn run(self) {
        let payload = match self.local.encode() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "cannot encode local address, heartbeat disabled");
                return;
            }
        };
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("heartbeat stopping");
                    return;
                }

                _ = interval.tick() => {
                    let Some((connection_type, dest)) = beat(&*self.topology.read().await) else {
                        continue;
                    };
                    if connection_type == ConnectionType::Hello {
                        tracing::info!(main = %dest, "not in the overlay, sending HELLO");
                    }
                    let sent = self
                        .outbox
                        .send_direct(payload.clone(), &dest, PacketType::Use, Envelope::control(connection_type))
                        .await;
                    if let Err(e) = sent {
                        tracing::warn!(peer = %dest, error = %e, "heartbeat not sent");
                    }
                }
            }
        }
    }
}
