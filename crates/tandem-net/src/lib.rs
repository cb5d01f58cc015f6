//! tandem-net: sockets, routing and the role state machines.
//!
//! Application code only needs [`Networking`]: start a node with
//! [`Networking::add_user`], subscribe a listener per module and send.

pub mod error;
pub mod heartbeat;
mod node;
pub mod outbox;
mod roles;
pub mod router;
pub mod transport;

mod networking;

pub use error::{NetError, TransportError};
pub use networking::{Networking, NodeStatus, SendReport};
pub use outbox::{Envelope, Outbox};
pub use transport::{Inbound, TransportCommunicator};
