//! Per-node control loop.
//!
//! One task owns the role state machine: it reads every inbound frame,
//! relays routed packets, reassembles fragments for this node, applies
//! membership changes and reacts to liveness timeouts. Heartbeat and
//! liveness tasks are restarted whenever the role changes.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use tandem_core::config::TandemConfig;
use tandem_core::wire::retarget;
use tandem_core::{
    ClientNode, ClusterNetworkRecord, ConnectionType, ModuleType, PacketInfo, PacketType,
};
use tandem_services::{
    ChunkManager, CoalesceReceive, CoalesceSend, LivenessTimer, ModuleDispatcher,
    PriorityScheduler, Role, SharedTopology,
};

use crate::heartbeat::Heartbeat;
use crate::outbox::Outbox;
use crate::roles::{self, client, cluster_server, main_server, Control};
use crate::router::{self, Forward};
use crate::transport::{Inbound, TransportCommunicator};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on waiting for queued packets to leave on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Requests from the facade.
pub(crate) enum Command {
    /// Leave the overlay gracefully; acknowledged once the goodbye is sent.
    Close(oneshot::Sender<()>),
}

/// A running liveness task and the timer it scans.
pub(crate) struct Monitor {
    pub(crate) timer: LivenessTimer,
    cancel: CancellationToken,
}

pub(crate) struct Node {
    pub(crate) local: ClientNode,
    pub(crate) config: Arc<TandemConfig>,
    pub(crate) topology: SharedTopology,
    pub(crate) outbox: Arc<Outbox>,
    pub(crate) transport: Arc<TransportCommunicator>,
    pub(crate) chunks: Arc<ChunkManager>,
    pub(crate) scheduler: Arc<PriorityScheduler>,
    pub(crate) dispatcher: ModuleDispatcher,
    pub(crate) coalesce_send: Arc<CoalesceSend>,
    pub(crate) coalesced: CoalesceReceive,
    pub(crate) role: Role,
    pub(crate) monitor: Option<Monitor>,
    heartbeat: Option<CancellationToken>,
    timeouts_tx: mpsc::UnboundedSender<ClientNode>,
    timeouts_rx: Option<mpsc::UnboundedReceiver<ClientNode>>,
    pub(crate) cancel: CancellationToken,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local: ClientNode,
        config: Arc<TandemConfig>,
        topology: SharedTopology,
        outbox: Arc<Outbox>,
        transport: Arc<TransportCommunicator>,
        chunks: Arc<ChunkManager>,
        scheduler: Arc<PriorityScheduler>,
        dispatcher: ModuleDispatcher,
        coalesce_send: Arc<CoalesceSend>,
        cancel: CancellationToken,
    ) -> Self {
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();
        Self {
            local,
            config,
            topology,
            outbox,
            transport,
            chunks,
            scheduler,
            coalesced: CoalesceReceive::new(dispatcher.clone()),
            dispatcher,
            coalesce_send,
            // Corrected by the first reconcile.
            role: Role::Client,
            monitor: None,
            heartbeat: None,
            timeouts_tx,
            timeouts_rx: Some(timeouts_rx),
            cancel,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let Some(mut timeouts) = self.timeouts_rx.take() else {
            tracing::error!("node loop started twice");
            return;
        };

        self.role = self.topology.read().await.role();
        self.restart_tasks();
        self.reconcile().await;
        tracing::info!(local = %self.local, role = ?self.role, "node running");

        let transport = self.transport.clone();
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                inbound = transport.receive_data() => {
                    match inbound {
                        Some(inbound) => self.on_inbound(inbound).await,
                        None => {
                            tracing::info!("transport closed, stopping node");
                            break;
                        }
                    }
                }

                Some(peer) = timeouts.recv() => self.on_timeout(peer).await,

                Some(command) = commands.recv() => match command {
                    Command::Close(ack) => {
                        self.leave().await;
                        let _ = ack.send(());
                        break;
                    }
                },

                _ = maintenance.tick() => {
                    self.chunks.evict_stale();
                }
            }
        }

        self.shutdown();
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    async fn on_inbound(&mut self, inbound: Inbound) {
        let info = match PacketInfo::decode(&inbound.data) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(
                    from = %inbound.from,
                    error = %e,
                    prefix = hex::encode(&inbound.data[..inbound.data.len().min(8)]),
                    "malformed packet, dropping"
                );
                return;
            }
        };
        tracing::trace!(
            from = %inbound.from,
            packet_type = ?info.packet_type,
            module = ?info.module,
            connection_type = ?info.connection_type,
            message_id = info.message_id,
            chunk = info.chunk_num,
            "packet received"
        );

        match (info.packet_type, self.role) {
            (PacketType::Use, _) => self.accept(inbound.from, info).await,
            (PacketType::ClusterServer, Role::MainServer | Role::ClusterServer) => {
                self.accept(inbound.from, info).await
            }
            (_, Role::Client) => {
                tracing::debug!(packet_type = ?info.packet_type, "client drops routed packet")
            }
            (PacketType::OtherCluster, _) if info.broadcast => {
                self.relay_broadcast(&inbound.data).await;
                self.accept(inbound.from, info).await;
            }
            (packet_type, _) => {
                let dest = ClientNode::from_socket(info.destination());
                let decision = router::forward(&*self.topology.read().await, packet_type, &dest);
                match decision {
                    Forward::Deliver => self.accept(inbound.from, info).await,
                    Forward::Relay { next_hop, retarget } => {
                        self.relay(inbound.data, next_hop, retarget).await
                    }
                    Forward::Drop(reason) => {
                        tracing::warn!(%dest, ?packet_type, reason, "cannot route packet, dropping")
                    }
                }
            }
        }
    }

    async fn relay(&self, raw: Bytes, next_hop: ClientNode, packet_type: Option<PacketType>) {
        let raw = match packet_type {
            Some(packet_type) => match retarget(&raw, packet_type) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot rewrite packet type, dropping");
                    return;
                }
            },
            None => raw,
        };
        tracing::debug!(%next_hop, ?packet_type, "relaying packet");
        if let Err(e) = self.outbox.forward_raw(raw, next_hop.clone()).await {
            tracing::warn!(peer = %next_hop, error = %e, "relay failed");
        }
    }

    /// Hand a broadcast fragment on to every member of this cluster.
    async fn relay_broadcast(&self, raw: &[u8]) {
        let raw = match retarget(raw, PacketType::Use) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "cannot rewrite broadcast, not relaying");
                return;
            }
        };
        let members = self.topology.read().await.cluster_peers();
        for member in members {
            if let Err(e) = self.outbox.forward_raw(raw.clone(), member.clone()).await {
                tracing::warn!(peer = %member, error = %e, "broadcast relay failed");
            }
        }
    }

    /// A packet addressed to this node: reassemble, then hand it to the
    /// subscriber or the control handlers.
    async fn accept(&mut self, from: SocketAddr, info: PacketInfo) {
        let Some(info) = self.chunks.add_packet(from, info) else {
            return;
        };

        if info.module != ModuleType::Networking {
            self.deliver(info.module, info.payload);
            return;
        }

        match info.connection_type {
            ConnectionType::Data => self.deliver(ModuleType::Networking, info.payload),
            ConnectionType::Coalesced => {
                let records = self.coalesced.receive_coalesced_packet(&info.payload);
                tracing::trace!(records, "coalesced batch unpacked");
            }
            connection_type => match Control::decode(connection_type, &info.payload) {
                Ok(Some(control)) => self.on_control(control).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(?connection_type, error = %e, "malformed control payload, dropping")
                }
            },
        }
    }

    fn deliver(&self, module: ModuleType, payload: Bytes) {
        if !self.dispatcher.dispatch(module, payload) {
            tracing::debug!(?module, "no subscriber for module, dropping");
        }
    }

    // ── Liveness ─────────────────────────────────────────────────────────────

    /// A monitored peer went silent: treat it as an explicit REMOVE.
    async fn on_timeout(&mut self, peer: ClientNode) {
        let index = {
            let topology = self.topology.read().await;
            if !roles::monitoring_scope(&topology).contains(&peer) {
                tracing::debug!(%peer, "timeout for peer no longer monitored, ignoring");
                return;
            }
            topology.cluster_index(&peer).unwrap_or(0)
        };
        tracing::warn!(%peer, role = ?self.role, "peer missed its heartbeats, removing");
        self.on_remove(ClusterNetworkRecord::new(peer, index)).await;
    }

    /// Bring role, monitor and heartbeat in line with the current view.
    pub(crate) async fn reconcile(&mut self) {
        let (role, scope) = {
            let topology = self.topology.read().await;
            (topology.role(), roles::monitoring_scope(&topology))
        };

        if role != self.role {
            tracing::info!(from = ?self.role, to = ?role, "role changed");
            self.role = role;
            self.restart_tasks();
        }

        if let Some(monitor) = &self.monitor {
            sync_monitored(&monitor.timer, &scope);
        }
    }

    fn restart_tasks(&mut self) {
        let liveness = &self.config.liveness;

        if let Some(old) = self.monitor.take() {
            old.cancel.cancel();
        }
        let timeout = match self.role {
            Role::MainServer => Some(liveness.main_timeout()),
            Role::ClusterServer => Some(liveness.cluster_timeout()),
            Role::Client => None,
        };
        if let Some(timeout) = timeout {
            let timer = LivenessTimer::new(timeout);
            let cancel = self.cancel.child_token();
            let tx = self.timeouts_tx.clone();
            tokio::spawn(timer.clone().run(
                move |peer| {
                    let _ = tx.send(peer);
                },
                cancel.clone(),
            ));
            self.monitor = Some(Monitor { timer, cancel });
        }

        if let Some(old) = self.heartbeat.take() {
            old.cancel();
        }
        let interval = match self.role {
            Role::MainServer => None,
            Role::ClusterServer => Some(liveness.server_alive_interval()),
            Role::Client => Some(liveness.client_alive_interval()),
        };
        if let Some(interval) = interval {
            let cancel = self.cancel.child_token();
            tokio::spawn(
                Heartbeat::new(
                    self.local.clone(),
                    self.topology.clone(),
                    self.outbox.clone(),
                    interval,
                    cancel.clone(),
                )
                .run(),
            );
            self.heartbeat = Some(cancel);
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Graceful leave: flush pending batches, say goodbye, let the
    /// scheduler drain.
    async fn leave(&mut self) {
        for batch in self.coalesce_send.flush_all() {
            if let Err(e) = self.outbox.send_batch(batch).await {
                tracing::warn!(error = %e, "coalesced batch dropped on leave");
            }
        }
        match self.role {
            Role::MainServer => main_server::leave(self).await,
            Role::ClusterServer => cluster_server::leave(self).await,
            Role::Client => client::leave(self).await,
        }
        self.drain().await;
    }

    /// Drain queued packets, then stop every task of this node.
    pub(crate) async fn stop(&self) {
        self.drain().await;
        self.cancel.cancel();
    }

    async fn drain(&self) {
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while !self.scheduler.is_empty().await || self.transport.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if drained.is_err() {
            let left = self.scheduler.len().await + self.transport.pending();
            tracing::warn!(left, "outbound queues not drained before shutdown");
        }
    }

    fn shutdown(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.cancel.cancel();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        self.cancel.cancel();
        self.transport.close();
        tracing::info!(local = %self.local, "node stopped");
    }
}

/// Make `timer` watch exactly `scope`. Newcomers start with a fresh
/// last-seen time.
fn sync_monitored(timer: &LivenessTimer, scope: &BTreeSet<ClientNode>) {
    for peer in timer.monitored() {
        if !scope.contains(&peer) {
            timer.remove_client(&peer);
            tracing::debug!(%peer, "stopped monitoring");
        }
    }
    for peer in scope {
        if !timer.is_monitored(peer) {
            timer.add_client(peer.clone());
            tracing::debug!(%peer, "monitoring");
        }
    }
}
