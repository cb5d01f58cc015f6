//! Routing decisions over a topology snapshot. Pure functions; the caller
//! holds the read lock.

use tandem_core::{ClientNode, PacketType};
use tandem_services::Topology;

/// Where a locally originated packet goes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Addressed to this node.
    Local,
    Send {
        packet_type: PacketType,
        next_hop: ClientNode,
    },
    NoRoute,
}

/// What a server does with a SAMECLUSTER/OTHERCLUSTER packet it received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forward {
    Deliver,
    /// Forward to `next_hop`, rewriting the type when `retarget` is set.
    Relay {
        next_hop: ClientNode,
        retarget: Option<PacketType>,
    },
    Drop(&'static str),
}

/// Route a packet this node originates for `dest`.
pub fn plan(topology: &Topology, dest: &ClientNode) -> Plan {
    let local = topology.local();
    if dest == local {
        return Plan::Local;
    }

    let own_server = topology.server_of(local);
    let direct = topology.server_of(dest) == Some(local)
        || own_server == Some(dest)
        || (topology.is_main_server() && topology.servers().contains(dest))
        || (topology.is_cluster_server() && dest == topology.main_server());
    if direct {
        return Plan::Send {
            packet_type: PacketType::Use,
            next_hop: dest.clone(),
        };
    }

    let packet_type = topology.network_type(dest);
    let next_hop = match packet_type {
        PacketType::SameCluster => own_server.cloned(),
        _ if topology.is_main_server() => topology.server_of(dest).cloned(),
        _ if topology.is_cluster_server() => Some(topology.main_server().clone()),
        // A node that has not joined yet only knows the main server.
        _ => Some(
            own_server
                .cloned()
                .unwrap_or_else(|| topology.main_server().clone()),
        ),
    };

    match next_hop {
        Some(next_hop) if next_hop != *local => Plan::Send {
            packet_type,
            next_hop,
        },
        _ => Plan::NoRoute,
    }
}

/// Decide what a server does with a routed packet for `dest`.
pub fn forward(topology: &Topology, packet_type: PacketType, dest: &ClientNode) -> Forward {
    if dest == topology.local() {
        return Forward::Deliver;
    }

    if topology.cluster_peers().contains(dest) {
        return Forward::Relay {
            next_hop: dest.clone(),
            retarget: Some(PacketType::Use),
        };
    }

    if topology.is_main_server() {
        return match topology.server_of(dest) {
            // The receiving server must not send it back up.
            Some(server) => Forward::Relay {
                next_hop: server.clone(),
                retarget: Some(PacketType::SameCluster),
            },
            None => Forward::Drop("destination not in topology"),
        };
    }

    match packet_type {
        PacketType::OtherCluster => Forward::Relay {
            next_hop: topology.main_server().clone(),
            retarget: None,
        },
        _ => Forward::Drop("destination not in this cluster"),
    }
}
