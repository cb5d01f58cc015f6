use std::io;
use std::net::SocketAddr;

use tandem_core::config::ConfigError;
use tandem_core::wire::READ_BUFFER_SIZE;
use tandem_core::{ClientNode, WireError};
use tandem_services::TopologyError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {peer} timed out after {timeout_ms} ms")]
    ConnectTimeout { peer: ClientNode, timeout_ms: u64 },

    #[error("connect to {peer} failed: {source}")]
    Connect {
        peer: ClientNode,
        #[source]
        source: io::Error,
    },

    #[error("write to {peer} failed: {source}")]
    Write {
        peer: ClientNode,
        #[source]
        source: io::Error,
    },

    #[error("read from {peer} failed: {source}")]
    Read {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("frame of {0} bytes exceeds the {READ_BUFFER_SIZE}-byte read buffer")]
    FrameTooLarge(usize),

    #[error("transport is closed")]
    Closed,
}

/// Errors surfaced by the [`Networking`](crate::Networking) facade.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("priority {0} is outside 0-7")]
    InvalidPriority(u8),

    #[error("no route to {0}")]
    NoRoute(ClientNode),

    #[error("networking is closed")]
    Closed,
}
