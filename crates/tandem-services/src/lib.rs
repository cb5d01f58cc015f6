//! tandem-services: the stateful pieces a node is assembled from.
//!
//! Nothing in this crate owns a socket. Each component is usable on its own
//! and is wired together by `tandem-net`.

pub mod chunk;
pub mod coalesce;
pub mod dispatch;
pub mod liveness;
pub mod scheduler;
pub mod topology;

pub use chunk::ChunkManager;
pub use coalesce::{CoalesceReceive, CoalesceSend, CoalescedPacket};
pub use dispatch::{MessageListener, ModuleDispatcher};
pub use liveness::LivenessTimer;
pub use scheduler::{Backlog, PriorityScheduler, ScheduledPacket};
pub use topology::{Removal, Role, SharedTopology, Topology, TopologyError};
