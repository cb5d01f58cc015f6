//! Cluster server: leads one cluster, relays membership changes to it and
//! reports its own cluster's changes up to the main server.

use std::collections::BTreeSet;

use bytes::Bytes;

use tandem_core::{ClusterNetworkRecord, ConnectionType};
use tandem_services::Removal;

use crate::node::Node;

pub(crate) async fn on_add(node: &mut Node, record: ClusterNetworkRecord) {
    let (changed, mut members) = {
        let mut topology = node.topology.write().await;
        let changed = topology.update_network(&record);
        (changed, topology.cluster_peers())
    };
    match changed {
        Ok(true) => tracing::info!(peer = %record.client, cluster = record.cluster_index, "member added"),
        Ok(false) => return,
        Err(e) => {
            tracing::warn!(peer = %record.client, error = %e, "cannot apply ADD");
            return;
        }
    }

    node.reconcile().await;
    members.retain(|m| *m != record.client);
    node.fan_out(members.into_iter().collect(), ConnectionType::Add, record.encode())
        .await;
}

/// Apply a REMOVE and relay it to the cluster. Removals from this cluster
/// also go to the main server; it ignores ones it has already applied.
pub(crate) async fn on_remove(node: &mut Node, record: ClusterNetworkRecord) {
    let (removal, own_cluster, mut recipients) = {
        let mut topology = node.topology.write().await;
        let own = topology.cluster_index(&node.local);
        let own_cluster = own.is_some() && own == topology.cluster_index(&record.client);
        let removal = topology.remove_client(&record);
        let recipients: BTreeSet<_> = topology.cluster_peers().into_iter().collect();
        (removal, own_cluster, recipients)
    };

    let removal = match removal {
        Ok(removal) => removal,
        Err(e) => {
            tracing::warn!(peer = %record.client, error = %e, "cannot apply REMOVE");
            return;
        }
    };
    let Removal::Removed { cluster_index, promoted, .. } = removal else {
        tracing::debug!(peer = %record.client, "REMOVE for unknown node, ignoring");
        return;
    };
    tracing::info!(peer = %record.client, cluster = cluster_index, own_cluster, "member removed");

    if let Some(monitor) = &node.monitor {
        monitor.timer.remove_client(&record.client);
    }
    node.transport.close_socket(&record.client);
    if promoted.as_ref() == Some(&node.local) {
        tracing::info!("promoted to cluster server");
    }
    node.reconcile().await;

    if own_cluster {
        recipients.insert(node.topology.read().await.main_server().clone());
    }
    let record = ClusterNetworkRecord::new(record.client, cluster_index);
    node.fan_out(recipients, ConnectionType::Remove, record.encode()).await;
}

/// Pass CLOSE on to the cluster, then stop.
pub(crate) async fn on_close(node: &mut Node) {
    let members = node.topology.read().await.cluster_peers();
    tracing::info!(members = members.len(), "overlay closing, relaying to cluster");
    node.fan_out(members.into_iter().collect(), ConnectionType::Close, Ok(Bytes::new()))
        .await;
    node.stop().await;
}

/// Announce our own departure to the main server.
pub(crate) async fn leave(node: &Node) {
    let (main, index) = {
        let topology = node.topology.read().await;
        (topology.main_server().clone(), topology.cluster_index(&node.local))
    };
    if let Some(index) = index {
        let record = ClusterNetworkRecord::new(node.local.clone(), index);
        node.send_control(main, ConnectionType::Remove, record.encode()).await;
    }
}
