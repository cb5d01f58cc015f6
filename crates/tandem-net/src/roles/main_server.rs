//! Main server: the membership authority and cross-cluster relay.

use std::collections::BTreeSet;

use bytes::Bytes;

use tandem_core::{ClientNode, ClusterNetworkRecord, ConnectionType};
use tandem_services::{Removal, Topology};

use crate::node::Node;

/// Every cluster server plus the main server's own cluster members.
fn flood_targets(topology: &Topology) -> BTreeSet<ClientNode> {
    topology
        .servers()
        .iter()
        .cloned()
        .chain(topology.cluster_peers())
        .collect()
}

/// Place the sender, answer with a NETWORK snapshot and announce it.
pub(crate) async fn on_hello(node: &mut Node, sender: ClientNode) {
    let (cluster_index, structure, mut recipients) = {
        let mut topology = node.topology.write().await;
        let index = topology.add_client(sender.clone());
        (index, topology.structure(), flood_targets(&topology))
    };
    recipients.remove(&sender);
    tracing::info!(peer = %sender, cluster = cluster_index, "client joined");

    node.reconcile().await;
    if let Some(monitor) = &node.monitor {
        monitor.timer.update_timeout(&sender);
    }

    node.send_control(sender.clone(), ConnectionType::Network, structure.encode())
        .await;
    let record = ClusterNetworkRecord::new(sender, cluster_index);
    node.fan_out(recipients, ConnectionType::Add, record.encode()).await;
}

/// Remove the node and flood the REMOVE. Members of a cluster that just
/// lost its server are told directly, since nobody else will.
pub(crate) async fn on_remove(node: &mut Node, record: ClusterNetworkRecord) {
    let (removal, recipients) = {
        let mut topology = node.topology.write().await;
        let removal = match topology.remove_client(&record) {
            Ok(removal) => removal,
            Err(e) => {
                tracing::warn!(peer = %record.client, error = %e, "cannot apply REMOVE");
                return;
            }
        };
        let mut recipients = flood_targets(&topology);
        if let Removal::Removed {
            cluster_index,
            promoted: Some(_),
            ..
        } = &removal
        {
            recipients.extend(topology.clients(*cluster_index).unwrap_or_default().iter().cloned());
        }
        (removal, recipients)
    };

    let Removal::Removed {
        cluster_index,
        cluster_removed,
        promoted,
    } = removal
    else {
        tracing::debug!(peer = %record.client, "REMOVE for unknown node, ignoring");
        return;
    };
    tracing::info!(
        peer = %record.client,
        cluster = cluster_index,
        cluster_removed,
        promoted = promoted.as_ref().map(ToString::to_string),
        "client removed"
    );

    if let Some(monitor) = &node.monitor {
        monitor.timer.remove_client(&record.client);
    }
    node.transport.close_socket(&record.client);
    node.reconcile().await;

    let record = ClusterNetworkRecord::new(record.client, cluster_index);
    node.fan_out(recipients, ConnectionType::Remove, record.encode()).await;
}

/// Tell every directly known node that the overlay is shutting down.
pub(crate) async fn leave(node: &Node) {
    let recipients = flood_targets(&*node.topology.read().await);
    tracing::info!(recipients = recipients.len(), "main server closing overlay");
    node.fan_out(recipients, ConnectionType::Close, Ok(Bytes::new())).await;
}
