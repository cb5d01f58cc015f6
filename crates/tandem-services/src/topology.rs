//! Topology: this node's copy of the cluster membership.
//!
//! Up to [`MAX_CLUSTERS`] clusters, each led by `servers[i]`. The main server
//! is the authority: it assigns clusters on HELLO and every other node
//! converges on its view through ADD, REMOVE and NETWORK packets. Nothing
//! here talks to the network.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use tandem_core::wire::MAX_CLUSTERS;
use tandem_core::{ClientNode, ClusterNetworkRecord, NetworkStructure, PacketType, WireError};

/// What this node does in the overlay, derived from the membership view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    MainServer,
    ClusterServer,
    Client,
}

/// Result of [`Topology::remove_client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The node was not in the view; nothing changed.
    NotPresent,
    Removed {
        /// Cluster the node was found in, before any reindexing.
        cluster_index: usize,
        /// The cluster became empty and was dropped.
        cluster_removed: bool,
        /// New server when the removed node led its cluster.
        promoted: Option<ClientNode>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("cluster index {index} out of range ({clusters} clusters)")]
    ClusterOutOfRange { index: usize, clusters: usize },

    #[error("cluster limit of {MAX_CLUSTERS} reached")]
    ClusterLimit,

    #[error("cluster {index} has no server")]
    MissingServer { index: usize },

    #[error("inconsistent network snapshot: {0}")]
    InvalidSnapshot(#[from] WireError),
}

/// Shared handle used by the facade and the node's control loop.
pub type SharedTopology = Arc<RwLock<Topology>>;

#[derive(Debug, Clone)]
pub struct Topology {
    local: ClientNode,
    main_server: ClientNode,
    clusters: Vec<Vec<ClientNode>>,
    servers: Vec<ClientNode>,
    /// Next cluster to receive a client once the cluster limit is reached.
    cursor: usize,
}

impl Topology {
    /// `add_user`: a node that is its own main server seeds cluster 0 with
    /// itself; any other node starts empty and waits for a NETWORK snapshot.
    pub fn new(local: ClientNode, main_server: ClientNode) -> Self {
        let mut topology = Self {
            local,
            main_server,
            clusters: Vec::new(),
            servers: Vec::new(),
            cursor: 0,
        };
        if topology.local == topology.main_server {
            topology.clusters.push(vec![topology.local.clone()]);
            topology.servers.push(topology.local.clone());
        }
        topology
    }

    pub fn shared(self) -> SharedTopology {
        Arc::new(RwLock::new(self))
    }

    // ── Mutation ─────────────────────────────────────────────────────────────

    /// Place a new node. Opens a new cluster led by `node` while fewer than
    /// [`MAX_CLUSTERS`] exist, otherwise joins clusters round-robin.
    ///
    /// A node already in the view keeps its cluster.
    pub fn add_client(&mut self, node: ClientNode) -> usize {
        if let Some(index) = self.cluster_index(&node) {
            return index;
        }

        if self.clusters.len() < MAX_CLUSTERS {
            self.clusters.push(vec![node.clone()]);
            self.servers.push(node);
            return self.clusters.len() - 1;
        }

        let index = self.cursor % self.clusters.len();
        self.cursor = (index + 1) % self.clusters.len();
        self.clusters[index].push(node);
        index
    }

    /// Apply an ADD record. An index one past the last cluster opens a new
    /// cluster led by the record's node. Returns `false` when the node was
    /// already a member of that cluster.
    pub fn update_network(&mut self, record: &ClusterNetworkRecord) -> Result<bool, TopologyError> {
        let index = record.cluster_index;
        if index == self.clusters.len() {
            if index >= MAX_CLUSTERS {
                return Err(TopologyError::ClusterLimit);
            }
            self.clusters.push(vec![record.client.clone()]);
            self.servers.push(record.client.clone());
            return Ok(true);
        }

        let clusters = self.clusters.len();
        let cluster = self
            .clusters
            .get_mut(index)
            .ok_or(TopologyError::ClusterOutOfRange { index, clusters })?;
        if cluster.contains(&record.client) {
            return Ok(false);
        }
        cluster.push(record.client.clone());
        Ok(true)
    }

    /// Apply a REMOVE record.
    ///
    /// The record's cluster index is a hint: if the node is not there it is
    /// looked up by value. Removing a server promotes the first remaining
    /// member; removing the last member drops the cluster, shifting the
    /// indices of every later cluster down by one.
    ///
    /// A cluster without a server is reported as an error and left untouched.
    pub fn remove_client(&mut self, record: &ClusterNetworkRecord) -> Result<Removal, TopologyError> {
        let hinted = self
            .clusters
            .get(record.cluster_index)
            .filter(|c| c.contains(&record.client))
            .map(|_| record.cluster_index);
        let Some(index) = hinted.or_else(|| self.cluster_index(&record.client)) else {
            return Ok(Removal::NotPresent);
        };
        let Some(server) = self.servers.get(index) else {
            return Err(TopologyError::MissingServer { index });
        };
        let was_server = *server == record.client;

        let clusters = self.clusters.len();
        let cluster = self
            .clusters
            .get_mut(index)
            .ok_or(TopologyError::ClusterOutOfRange { index, clusters })?;
        cluster.retain(|n| n != &record.client);

        if cluster.is_empty() {
            self.clusters.remove(index);
            self.servers.remove(index);
            if self.cursor > index {
                self.cursor -= 1;
            }
            if !self.clusters.is_empty() {
                self.cursor %= self.clusters.len();
            } else {
                self.cursor = 0;
            }
            return Ok(Removal::Removed {
                cluster_index: index,
                cluster_removed: true,
                promoted: None,
            });
        }

        let promoted = match (was_server, cluster.first().cloned(), self.servers.get_mut(index)) {
            (true, Some(next), Some(slot)) => {
                *slot = next.clone();
                Some(next)
            }
            _ => None,
        };

        Ok(Removal::Removed {
            cluster_index: index,
            cluster_removed: false,
            promoted,
        })
    }

    /// Replace the whole view with a NETWORK snapshot. An inconsistent
    /// snapshot is refused and the current view kept.
    pub fn replace_network(&mut self, structure: NetworkStructure) -> Result<(), TopologyError> {
        structure.validate()?;
        self.clusters = structure.clusters;
        self.servers = structure.servers;
        self.cursor = 0;
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn local(&self) -> &ClientNode {
        &self.local
    }

    pub fn main_server(&self) -> &ClientNode {
        &self.main_server
    }

    pub fn cluster_index(&self, node: &ClientNode) -> Option<usize> {
        self.clusters.iter().position(|c| c.contains(node))
    }

    /// Server of the cluster `node` belongs to.
    pub fn server_of(&self, node: &ClientNode) -> Option<&ClientNode> {
        self.cluster_index(node).and_then(|i| self.servers.get(i))
    }

    pub fn clients(&self, index: usize) -> Option<&[ClientNode]> {
        self.clusters.get(index).map(Vec::as_slice)
    }

    /// Members of this node's own cluster, excluding itself.
    pub fn cluster_peers(&self) -> Vec<ClientNode> {
        self.cluster_index(&self.local)
            .and_then(|i| self.clients(i))
            .map(|c| c.iter().filter(|n| **n != self.local).cloned().collect())
            .unwrap_or_default()
    }

    /// Routing class from this node to `dest`.
    pub fn network_type(&self, dest: &ClientNode) -> PacketType {
        match (self.cluster_index(&self.local), self.cluster_index(dest)) {
            (Some(a), Some(b)) if a == b => PacketType::SameCluster,
            _ => PacketType::OtherCluster,
        }
    }

    pub fn servers(&self) -> &[ClientNode] {
        &self.servers
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn contains(&self, node: &ClientNode) -> bool {
        self.cluster_index(node).is_some()
    }

    pub fn is_main_server(&self) -> bool {
        self.local == self.main_server
    }

    pub fn is_cluster_server(&self) -> bool {
        self.servers.contains(&self.local)
    }

    pub fn role(&self) -> Role {
        if self.is_main_server() {
            Role::MainServer
        } else if self.is_cluster_server() {
            Role::ClusterServer
        } else {
            Role::Client
        }
    }

    pub fn structure(&self) -> NetworkStructure {
        NetworkStructure {
            clusters: self.clusters.clone(),
            servers: self.servers.clone(),
        }
    }
}
