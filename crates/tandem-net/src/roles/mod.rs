//! Role state machines.
//!
//! A node is exactly one of main server, cluster server or client at any
//! moment, derived from its topology view. Each role module holds the
//! control-packet handlers whose behaviour differs by role. Membership only
//! ever changes through ADD, REMOVE and NETWORK packets; no role touches
//! another node's view directly.

pub(crate) mod client;
pub(crate) mod cluster_server;
pub(crate) mod main_server;

use std::collections::BTreeSet;

use bytes::Bytes;

use tandem_core::{ClientNode, ClusterNetworkRecord, ConnectionType, NetworkStructure, PacketType, WireError};
use tandem_services::{Role, Topology};

use crate::node::Node;
use crate::outbox::Envelope;

/// A decoded membership or heartbeat packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Control {
    Hello(ClientNode),
    Alive(ClientNode),
    Add(ClusterNetworkRecord),
    Remove(ClusterNetworkRecord),
    Network(NetworkStructure),
    Close,
}

impl Control {
    /// `None` for connection types that carry no control payload.
    pub(crate) fn decode(connection_type: ConnectionType, payload: &[u8]) -> Result<Option<Self>, WireError> {
        let control = match connection_type {
            ConnectionType::Hello => Control::Hello(ClientNode::decode(payload)?),
            ConnectionType::Alive => Control::Alive(ClientNode::decode(payload)?),
            ConnectionType::Add => Control::Add(ClusterNetworkRecord::decode(payload)?),
            ConnectionType::Remove => Control::Remove(ClusterNetworkRecord::decode(payload)?),
            ConnectionType::Network => Control::Network(NetworkStructure::decode(payload)?),
            ConnectionType::Close => Control::Close,
            ConnectionType::Coalesced | ConnectionType::Data => return Ok(None),
        };
        Ok(Some(control))
    }
}

/// Peers a node with this view should be monitoring.
///
/// The main server watches cluster servers and its own cluster; a cluster
/// server watches its members; clients watch nobody.
pub(crate) fn monitoring_scope(topology: &Topology) -> BTreeSet<ClientNode> {
    let local = topology.local();
    match topology.role() {
        Role::MainServer => topology
            .servers()
            .iter()
            .filter(|s| *s != local)
            .cloned()
            .chain(topology.cluster_peers())
            .collect(),
        Role::ClusterServer => topology.cluster_peers().into_iter().collect(),
        Role::Client => BTreeSet::new(),
    }
}

impl Node {
    /// Handle one control packet according to the current role.
    pub(crate) async fn on_control(&mut self, control: Control) {
        match control {
            Control::Hello(sender) => match self.role {
                Role::MainServer => main_server::on_hello(self, sender).await,
                _ => tracing::warn!(peer = %sender, role = ?self.role, "HELLO is only handled by the main server, dropping"),
            },
            Control::Alive(sender) => self.on_alive(&sender),
            Control::Add(record) => match self.role {
                Role::MainServer => tracing::debug!(peer = %record.client, "main server ignores ADD"),
                Role::ClusterServer => cluster_server::on_add(self, record).await,
                Role::Client => client::on_add(self, record).await,
            },
            Control::Remove(record) => self.on_remove(record).await,
            Control::Network(structure) => match self.role {
                Role::MainServer => tracing::debug!("main server ignores NETWORK"),
                _ => client::on_network(self, structure).await,
            },
            Control::Close => match self.role {
                Role::MainServer => tracing::warn!("main server ignores CLOSE"),
                Role::ClusterServer => cluster_server::on_close(self).await,
                Role::Client => client::on_close(self).await,
            },
        }
    }

    pub(crate) async fn on_remove(&mut self, record: ClusterNetworkRecord) {
        if record.client == self.local {
            if self.role == Role::MainServer {
                tracing::warn!("main server ignores REMOVE naming itself");
                return;
            }
            tracing::warn!("removed from the overlay by a peer, rejoining");
            let main = {
                let mut topology = self.topology.write().await;
                if let Err(e) = topology.remove_client(&record) {
                    tracing::warn!(error = %e, "cannot drop self from the view");
                }
                topology.main_server().clone()
            };
            self.send_control(main, ConnectionType::Hello, self.local.encode()).await;
            self.reconcile().await;
            return;
        }

        match self.role {
            Role::MainServer => main_server::on_remove(self, record).await,
            Role::ClusterServer => cluster_server::on_remove(self, record).await,
            Role::Client => client::on_remove(self, record).await,
        }
    }

    fn on_alive(&self, sender: &ClientNode) {
        match &self.monitor {
            Some(monitor) if monitor.timer.update_timeout(sender) => {
                tracing::trace!(peer = %sender, "heartbeat");
            }
            _ => tracing::debug!(peer = %sender, "heartbeat from unmonitored peer"),
        }
    }

    /// Queue one control packet straight to `dest`. Failures are logged.
    pub(crate) async fn send_control(
        &self,
        dest: ClientNode,
        connection_type: ConnectionType,
        payload: Result<Bytes, WireError>,
    ) {
        let result = match payload {
            Ok(payload) => {
                self.outbox
                    .send_direct(payload, &dest, PacketType::Use, Envelope::control(connection_type))
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(peer = %dest, ?connection_type, error = %e, "control packet not sent");
        }
    }

    /// Send the same control packet to every recipient except this node.
    pub(crate) async fn fan_out(
        &self,
        recipients: BTreeSet<ClientNode>,
        connection_type: ConnectionType,
        payload: Result<Bytes, WireError>,
    ) {
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(?connection_type, error = %e, "cannot encode control payload");
                return;
            }
        };
        for dest in recipients.into_iter().filter(|d| *d != self.local) {
            self.send_control(dest, connection_type, Ok(payload.clone())).await;
        }
    }
}
