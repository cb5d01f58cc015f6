//! Membership value types and their length-prefixed serialization.
//!
//! These records travel as payloads of HELLO/ALIVE (a bare [`ClientNode`]),
//! ADD/REMOVE ([`ClusterNetworkRecord`]) and NETWORK ([`NetworkStructure`])
//! control packets.
//!
//! Encoding (big-endian):
//!   ClientNode           = host_len:u8, host:[u8; host_len], port:u32
//!   ClusterNetworkRecord = ClientNode, cluster_index:u32
//!   NetworkStructure     = cluster_count:u32, { member_count:u32, ClientNode* }*,
//!                          server_count:u32, ClientNode*

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::wire::{WireError, MAX_CLUSTERS};

// ── ClientNode ───────────────────────────────────────────────────────────────

/// Identity of one overlay node: the address its listener is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientNode {
    pub host: String,
    pub port: u16,
}

impl ClientNode {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The node that a packet header names as its destination.
    pub fn from_socket(addr: SocketAddrV4) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// Resolve to an IPv4 socket address.
    ///
    /// IPv4 literals are parsed directly; anything else goes through the
    /// system resolver, which may block.
    pub fn socket_addr(&self) -> Result<SocketAddrV4, WireError> {
        if let Ok(ip) = self.host.parse::<Ipv4Addr>() {
            return Ok(SocketAddrV4::new(ip, self.port));
        }
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| {
                addrs.find_map(|a| match a {
                    std::net::SocketAddr::V4(v4) => Some(v4),
                    std::net::SocketAddr::V6(_) => None,
                })
            })
            .ok_or_else(|| WireError::UnresolvableHost(self.host.clone()))
    }

    /// Same node with its host replaced by the resolved IPv4 literal, so it
    /// compares equal to nodes built from packet headers.
    pub fn canonical(&self) -> Result<Self, WireError> {
        self.socket_addr().map(Self::from_socket)
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        let host = self.host.as_bytes();
        let len = u8::try_from(host.len()).map_err(|_| WireError::HostTooLong(host.len()))?;
        buf.put_u8(len);
        buf.put_slice(host);
        buf.put_u32(u32::from(self.port));
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(1 + self.host.len() + 4);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode_from(buf: &mut impl Buf) -> Result<Self, WireError> {
        need(&*buf, 1)?;
        let len = buf.get_u8() as usize;
        need(&*buf, len + 4)?;
        let mut host = vec![0u8; len];
        buf.copy_to_slice(&mut host);
        let host = String::from_utf8(host).map_err(|_| WireError::InvalidHost)?;
        let port = buf.get_u32();
        let port = u16::try_from(port).map_err(|_| WireError::InvalidPort(port))?;
        Ok(Self { host, port })
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, WireError> {
        Self::decode_from(&mut bytes)
    }
}

impl fmt::Display for ClientNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── ClusterNetworkRecord ─────────────────────────────────────────────────────

/// One membership change: `client` joins or leaves cluster `cluster_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetworkRecord {
    pub client: ClientNode,
    pub cluster_index: usize,
}

impl ClusterNetworkRecord {
    pub fn new(client: ClientNode, cluster_index: usize) -> Self {
        Self {
            client,
            cluster_index,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(1 + self.client.host.len() + 8);
        self.client.encode_into(&mut buf)?;
        buf.put_u32(self.cluster_index as u32);
        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, WireError> {
        let client = ClientNode::decode_from(&mut bytes)?;
        need(&bytes, 4)?;
        let cluster_index = bytes.get_u32() as usize;
        Ok(Self {
            client,
            cluster_index,
        })
    }
}

// ── NetworkStructure ─────────────────────────────────────────────────────────

/// Full membership snapshot. `servers[i]` leads `clusters[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStructure {
    pub clusters: Vec<Vec<ClientNode>>,
    pub servers: Vec<ClientNode>,
}

impl NetworkStructure {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        buf.put_u32(self.clusters.len() as u32);
        for cluster in &self.clusters {
            buf.put_u32(cluster.len() as u32);
            for node in cluster {
                node.encode_into(&mut buf)?;
            }
        }
        buf.put_u32(self.servers.len() as u32);
        for server in &self.servers {
            server.encode_into(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, WireError> {
        need(&bytes, 4)?;
        let cluster_count = bytes.get_u32() as usize;
        if cluster_count > MAX_CLUSTERS {
            return Err(WireError::TooManyClusters(cluster_count));
        }

        let mut clusters = Vec::with_capacity(cluster_count);
        for _ in 0..cluster_count {
            need(&bytes, 4)?;
            let members = bytes.get_u32() as usize;
            // Each member needs at least 5 bytes; reject absurd counts early.
            need(&bytes, members.saturating_mul(5))?;
            let mut cluster = Vec::with_capacity(members);
            for _ in 0..members {
                cluster.push(ClientNode::decode_from(&mut bytes)?);
            }
            clusters.push(cluster);
        }

        need(&bytes, 4)?;
        let server_count = bytes.get_u32() as usize;
        if server_count > MAX_CLUSTERS {
            return Err(WireError::TooManyClusters(server_count));
        }
        let mut servers = Vec::with_capacity(server_count);
        for _ in 0..server_count {
            servers.push(ClientNode::decode_from(&mut bytes)?);
        }

        let structure = Self { clusters, servers };
        structure.validate()?;
        Ok(structure)
    }

    /// One server per cluster, each a member of the cluster it leads.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.clusters.len() != self.servers.len() {
            return Err(WireError::ServerCountMismatch {
                clusters: self.clusters.len(),
                servers: self.servers.len(),
            });
        }
        for (index, (cluster, server)) in self.clusters.iter().zip(&self.servers).enumerate() {
            if !cluster.contains(server) {
                return Err(WireError::ServerNotMember(index));
            }
        }
        Ok(())
    }
}

fn need(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::RecordTruncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
