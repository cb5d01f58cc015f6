//! Client: applies membership updates from its server and otherwise only
//! consumes traffic addressed to it.
//!
//! NETWORK handling lives here but also serves cluster servers, which learn
//! their cluster from the same snapshot.

use tandem_core::{ClusterNetworkRecord, ConnectionType, NetworkStructure};
use tandem_services::Removal;

use crate::node::Node;

pub(crate) async fn on_network(node: &mut Node, structure: NetworkStructure) {
    {
        let mut topology = node.topology.write().await;
        if let Err(e) = topology.replace_network(structure) {
            tracing::warn!(error = %e, "NETWORK snapshot refused");
            return;
        }
        tracing::info!(
            clusters = topology.cluster_count(),
            cluster = topology.cluster_index(&node.local),
            server = topology.server_of(&node.local).map(ToString::to_string),
            "network snapshot applied"
        );
    }
    node.reconcile().await;
}

pub(crate) async fn on_add(node: &mut Node, record: ClusterNetworkRecord) {
    let changed = node.topology.write().await.update_network(&record);
    match changed {
        Ok(true) => {
            tracing::debug!(peer = %record.client, cluster = record.cluster_index, "peer added");
            node.reconcile().await;
        }
        Ok(false) => {}
        Err(e) => tracing::warn!(peer = %record.client, error = %e, "cannot apply ADD"),
    }
}

pub(crate) async fn on_remove(node: &mut Node, record: ClusterNetworkRecord) {
    let removal = node.topology.write().await.remove_client(&record);
    match removal {
        Err(e) => tracing::warn!(peer = %record.client, error = %e, "cannot apply REMOVE"),
        Ok(Removal::NotPresent) => {
            tracing::debug!(peer = %record.client, "REMOVE for unknown node, ignoring")
        }
        Ok(Removal::Removed { cluster_index, promoted, .. }) => {
            tracing::debug!(peer = %record.client, cluster = cluster_index, "peer removed");
            if promoted.as_ref() == Some(&node.local) {
                tracing::info!("promoted to cluster server");
            }
            node.transport.close_socket(&record.client);
            node.reconcile().await;
        }
    }
}

pub(crate) async fn on_close(node: &mut Node) {
    tracing::info!("overlay closed by main server");
    node.stop().await;
}

/// Tell our cluster server we are leaving.
pub(crate) async fn leave(node: &Node) {
    let (server, index) = {
        let topology = node.topology.read().await;
        (
            topology.server_of(&node.local).cloned(),
            topology.cluster_index(&node.local),
        )
    };
    if let (Some(server), Some(index)) = (server, index) {
        let record = ClusterNetworkRecord::new(node.local.clone(), index);
        node.send_control(server, ConnectionType::Remove, record.encode()).await;
    }
}
