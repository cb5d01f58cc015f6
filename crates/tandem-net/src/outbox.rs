//! Outbound path: route, fragment, schedule, and the loop that drains the
//! scheduler into the transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use tandem_core::wire::MAX_PRIORITY;
use tandem_core::{ClientNode, ConnectionType, ModuleType, PacketInfo, PacketType};
use tandem_services::{
    ChunkManager, CoalesceReceive, CoalesceSend, CoalescedPacket, ModuleDispatcher,
    PriorityScheduler, SharedTopology,
};

use crate::error::NetError;
use crate::router::{self, Plan};
use crate::transport::TransportCommunicator;

/// Priority used for coalesced batches.
pub const COALESCED_PRIORITY: u8 = 2;

/// Priority used for membership and heartbeat packets.
pub const CONTROL_PRIORITY: u8 = 0;

/// Header fields a caller chooses for one outbound payload.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub module: ModuleType,
    pub connection_type: ConnectionType,
    pub priority: u8,
    pub broadcast: bool,
}

impl Envelope {
    pub fn data(module: ModuleType, priority: u8) -> Self {
        Self {
            module,
            connection_type: ConnectionType::Data,
            priority,
            broadcast: false,
        }
    }

    pub fn control(connection_type: ConnectionType) -> Self {
        Self {
            module: ModuleType::Networking,
            connection_type,
            priority: CONTROL_PRIORITY,
            broadcast: false,
        }
    }

    pub fn coalesced() -> Self {
        Self {
            module: ModuleType::Networking,
            connection_type: ConnectionType::Coalesced,
            priority: COALESCED_PRIORITY,
            broadcast: false,
        }
    }

    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }
}

pub struct Outbox {
    topology: SharedTopology,
    chunks: Arc<ChunkManager>,
    scheduler: Arc<PriorityScheduler>,
    dispatcher: ModuleDispatcher,
    coalesced: CoalesceReceive,
    max_payload: usize,
}

impl Outbox {
    pub fn new(
        topology: SharedTopology,
        chunks: Arc<ChunkManager>,
        scheduler: Arc<PriorityScheduler>,
        dispatcher: ModuleDispatcher,
        max_payload: usize,
    ) -> Self {
        Self {
            topology,
            chunks,
            scheduler,
            coalesced: CoalesceReceive::new(dispatcher.clone()),
            dispatcher,
            max_payload,
        }
    }

    /// Route `payload` to `dest` through the topology.
    pub async fn send(&self, payload: Bytes, dest: &ClientNode, envelope: Envelope) -> Result<(), NetError> {
        if envelope.priority > MAX_PRIORITY {
            return Err(NetError::InvalidPriority(envelope.priority));
        }

        let plan = router::plan(&*self.topology.read().await, dest);
        match plan {
            Plan::Local => {
                self.deliver_local(envelope, payload);
                Ok(())
            }
            Plan::Send {
                packet_type,
                next_hop,
            } => {
                tracing::trace!(%dest, %next_hop, ?packet_type, "routing packet");
                self.send_via(payload, dest, &next_hop, packet_type, envelope).await
            }
            Plan::NoRoute => Err(NetError::NoRoute(dest.clone())),
        }
    }

    /// Send straight to `dest` with an explicit packet type, bypassing routing.
    pub async fn send_direct(
        &self,
        payload: Bytes,
        dest: &ClientNode,
        packet_type: PacketType,
        envelope: Envelope,
    ) -> Result<(), NetError> {
        self.send_via(payload, dest, dest, packet_type, envelope).await
    }

    /// Queue an already encoded packet (a relayed fragment) for `next_hop`.
    pub async fn forward_raw(&self, raw: Bytes, next_hop: ClientNode) -> Result<(), NetError> {
        self.scheduler.add_packet(next_hop, raw).await?;
        Ok(())
    }

    /// Route one flushed batch as a single COALESCED packet.
    pub async fn send_batch(&self, batch: CoalescedPacket) -> Result<(), NetError> {
        tracing::trace!(dest = %batch.destination, bytes = batch.payload.len(), "sending coalesced batch");
        self.send(batch.payload, &batch.destination, Envelope::coalesced())
            .await
    }

    async fn send_via(
        &self,
        payload: Bytes,
        dest: &ClientNode,
        next_hop: &ClientNode,
        packet_type: PacketType,
        envelope: Envelope,
    ) -> Result<(), NetError> {
        let info = PacketInfo::new(
            packet_type,
            envelope.module,
            envelope.connection_type,
            dest.socket_addr()?,
            payload,
        )
        .with_priority(envelope.priority)
        .with_broadcast(envelope.broadcast);

        for fragment in self.chunks.chunk(&info, self.max_payload) {
            self.scheduler.add_packet(next_hop.clone(), fragment).await?;
        }
        Ok(())
    }

    fn deliver_local(&self, envelope: Envelope, payload: Bytes) {
        if envelope.module == ModuleType::Networking
            && envelope.connection_type == ConnectionType::Coalesced
        {
            self.coalesced.receive_coalesced_packet(&payload);
        } else {
            self.dispatcher.dispatch(envelope.module, payload);
        }
    }
}

/// Drains the scheduler into the per-peer writers until cancelled.
pub struct SendLoop {
    scheduler: Arc<PriorityScheduler>,
    transport: Arc<TransportCommunicator>,
    cancel: CancellationToken,
}

impl SendLoop {
    pub fn new(
        scheduler: Arc<PriorityScheduler>,
        transport: Arc<TransportCommunicator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            transport,
            cancel,
        }
    }

    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("send loop shutting down");
                    return;
                }

                item = self.scheduler.ready() => {
                    self.transport.queue_data(item.packet, item.next_hop);
                }
            }
        }
    }
}

/// Flushes coalesced batches that have waited too long.
pub struct FlushLoop {
    coalesce: Arc<CoalesceSend>,
    outbox: Arc<Outbox>,
    interval: Duration,
    cancel: CancellationToken,
}

impl FlushLoop {
    pub fn new(
        coalesce: Arc<CoalesceSend>,
        outbox: Arc<Outbox>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            coalesce,
            outbox,
            interval,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("coalesce flush loop shutting down");
                    return;
                }

                _ = interval.tick() => {
                    for batch in self.coalesce.check_timeout() {
                        let dest = batch.destination.clone();
                        if let Err(e) = self.outbox.send_batch(batch).await {
                            tracing::warn!(peer = %dest, error = %e, "coalesced batch dropped");
                        }
                    }
                }
            }
        }
    }
}
