//! tandem-core: shared types, wire format, and configuration.
//! All other Tandem crates depend on this one.

pub mod config;
pub mod membership;
pub mod wire;

pub use membership::{ClientNode, ClusterNetworkRecord, NetworkStructure};
pub use wire::{ConnectionType, ModuleType, PacketInfo, PacketType, WireError};
