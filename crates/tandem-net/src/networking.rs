//! The `Networking` facade used by application modules.
//!
//! [`Networking::add_user`] binds the transport, seeds the topology and
//! spawns the node's tasks; the returned handle sends, broadcasts and
//! manages subscriptions until [`Networking::close_networking`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tandem_core::config::TandemConfig;
use tandem_core::wire::MAX_PRIORITY;
use tandem_core::{ClientNode, ModuleType, NetworkStructure, PacketType};
use tandem_services::{
    Backlog, ChunkManager, CoalesceSend, MessageListener, ModuleDispatcher, PriorityScheduler,
    Role, SharedTopology, Topology,
};

use crate::error::NetError;
use crate::node::{Command, Node};
use crate::outbox::{Envelope, FlushLoop, Outbox, SendLoop};
use crate::transport::TransportCommunicator;

const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-destination outcome of a multi-destination send. One failing
/// destination never stops the others.
#[derive(Debug, Default)]
pub struct SendReport {
    /// Destinations whose packets were queued or delivered locally.
    pub sent: Vec<ClientNode>,
    pub failed: Vec<(ClientNode, NetError)>,
}

impl SendReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, dest: ClientNode, result: Result<(), NetError>) {
        match result {
            Ok(()) => self.sent.push(dest),
            Err(e) => {
                tracing::warn!(peer = %dest, error = %e, "send failed");
                self.failed.push((dest, e));
            }
        }
    }
}

/// Snapshot served by the daemon's status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub local: ClientNode,
    pub role: Role,
    pub main_server: ClientNode,
    pub clusters: Vec<Vec<ClientNode>>,
    pub servers: Vec<ClientNode>,
    pub backlog: Backlog,
    pub in_flight: usize,
    pub pending_coalesced: usize,
}

pub struct Networking {
    local: ClientNode,
    local_addr: SocketAddr,
    topology: SharedTopology,
    outbox: Arc<Outbox>,
    scheduler: Arc<PriorityScheduler>,
    chunks: Arc<ChunkManager>,
    dispatcher: ModuleDispatcher,
    coalesce_send: Arc<CoalesceSend>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl Networking {
    /// Start a node listening on `device`. It is the main server when
    /// `device == main_server`; otherwise it joins by sending HELLO to
    /// `main_server` and keeps retrying until answered.
    ///
    /// Port 0 binds a free port; the node then advertises the bound port.
    pub async fn add_user(
        device: ClientNode,
        main_server: ClientNode,
        config: TandemConfig,
    ) -> Result<Self, NetError> {
        config.validate()?;
        let device = device.canonical()?;
        let main_server = main_server.canonical()?;
        let is_main = device == main_server;

        let cancel = CancellationToken::new();
        let transport = Arc::new(
            TransportCommunicator::bind(&device, config.network.connect_timeout(), cancel.child_token())
                .await?,
        );
        let local_addr = transport.local_addr();
        let local = ClientNode::new(device.host.clone(), local_addr.port());
        let main_server = if is_main { local.clone() } else { main_server };

        let config = Arc::new(config);
        let topology = Topology::new(local.clone(), main_server.clone()).shared();
        let chunks = Arc::new(ChunkManager::new(config.liveness.reassembly_ttl()));
        let scheduler = Arc::new(PriorityScheduler::new(&config.scheduler));
        let dispatcher = ModuleDispatcher::new();
        let coalesce_send = Arc::new(CoalesceSend::new(&config.coalesce));
        let outbox = Arc::new(Outbox::new(
            topology.clone(),
            chunks.clone(),
            scheduler.clone(),
            dispatcher.clone(),
            config.network.max_payload,
        ));

        tokio::spawn(SendLoop::new(scheduler.clone(), transport.clone(), cancel.child_token()).run());
        tokio::spawn(
            FlushLoop::new(
                coalesce_send.clone(),
                outbox.clone(),
                config.coalesce.check_interval(),
                cancel.child_token(),
            )
            .run(),
        );

        let (commands, commands_rx) = mpsc::channel(4);
        let node = Node::new(
            local.clone(),
            config,
            topology.clone(),
            outbox.clone(),
            transport,
            chunks.clone(),
            scheduler.clone(),
            dispatcher.clone(),
            coalesce_send.clone(),
            cancel.clone(),
        );
        tokio::spawn(supervise(tokio::spawn(node.run(commands_rx)), cancel.clone()));

        tracing::info!(%local, main = %main_server, is_main, "networking started");
        Ok(Self {
            local,
            local_addr,
            topology,
            outbox,
            scheduler,
            chunks,
            dispatcher,
            coalesce_send,
            commands,
            cancel,
        })
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Send `data` to each destination, fragmenting as needed.
    ///
    /// Fails as a whole only for an invalid priority or a closed node;
    /// per-destination failures are collected in the report.
    pub async fn send_data(
        &self,
        data: Bytes,
        destinations: &[ClientNode],
        module: ModuleType,
        priority: u8,
    ) -> Result<SendReport, NetError> {
        self.check_open(priority)?;
        let mut report = SendReport::default();
        for dest in destinations {
            let result = match dest.canonical() {
                Ok(dest) => {
                    self.outbox
                        .send(data.clone(), &dest, Envelope::data(module, priority))
                        .await
                }
                Err(e) => Err(e.into()),
            };
            report.record(dest.clone(), result);
        }
        Ok(report)
    }

    /// Send `data` to every other cluster server and every member of this
    /// node's cluster. This node does not receive its own broadcast.
    pub async fn broadcast(&self, data: Bytes, module: ModuleType, priority: u8) -> Result<SendReport, NetError> {
        self.check_open(priority)?;
        let targets = broadcast_targets(&*self.topology.read().await);
        let envelope = Envelope::data(module, priority).broadcast();

        let mut report = SendReport::default();
        for (dest, packet_type) in targets {
            let result = self.outbox.send_direct(data.clone(), &dest, packet_type, envelope).await;
            report.record(dest, result);
        }
        tracing::debug!(sent = report.sent.len(), failed = report.failed.len(), ?module, "broadcast queued");
        Ok(report)
    }

    /// Queue a small message into `dest`'s coalesced batch. The batch leaves
    /// once it is full or has waited long enough.
    pub async fn send_coalesced(&self, data: &[u8], dest: &ClientNode, module: ModuleType) -> Result<(), NetError> {
        if self.cancel.is_cancelled() {
            return Err(NetError::Closed);
        }
        let dest = dest.canonical()?;
        if let Some(batch) = self.coalesce_send.handle_packet(data, &dest, module) {
            self.outbox.send_batch(batch).await?;
        }
        Ok(())
    }

    fn check_open(&self, priority: u8) -> Result<(), NetError> {
        if self.cancel.is_cancelled() {
            return Err(NetError::Closed);
        }
        if priority > MAX_PRIORITY {
            return Err(NetError::InvalidPriority(priority));
        }
        Ok(())
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    /// Returns `false` if the module already had a listener; the first one is
    /// kept.
    pub fn subscribe(&self, module: ModuleType, listener: Arc<dyn MessageListener>) -> bool {
        self.dispatcher.subscribe(module, listener)
    }

    pub fn remove_subscription(&self, module: ModuleType) -> bool {
        self.dispatcher.remove_subscription(module)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Leave the overlay and stop every task. Safe to call more than once.
    pub async fn close_networking(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close(ack)).await.is_ok()
            && tokio::time::timeout(CLOSE_ACK_TIMEOUT, done).await.is_err()
        {
            tracing::warn!("node did not acknowledge close in time");
        }
        self.cancel.cancel();
    }

    /// Resolves once the node has stopped, by `close_networking` or by a
    /// CLOSE from the main server.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ── Introspection ────────────────────────────────────────────────────────

    /// The address this node advertises to peers.
    pub fn local(&self) -> &ClientNode {
        &self.local
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn role(&self) -> Role {
        self.topology.read().await.role()
    }

    pub async fn structure(&self) -> NetworkStructure {
        self.topology.read().await.structure()
    }

    pub async fn cluster_index(&self) -> Option<usize> {
        self.topology.read().await.cluster_index(&self.local)
    }

    pub async fn status(&self) -> NodeStatus {
        let (role, main_server, structure) = {
            let topology = self.topology.read().await;
            (topology.role(), topology.main_server().clone(), topology.structure())
        };
        NodeStatus {
            local: self.local.clone(),
            role,
            main_server,
            clusters: structure.clusters,
            servers: structure.servers,
            backlog: self.scheduler.backlog().await,
            in_flight: self.chunks.in_flight(),
            pending_coalesced: self.coalesce_send.pending(),
        }
    }
}

impl Drop for Networking {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Recipients of a broadcast from this view and the packet type each gets.
pub(crate) fn broadcast_targets(topology: &Topology) -> Vec<(ClientNode, PacketType)> {
    let local = topology.local();
    let own_server = topology.server_of(local);

    let servers = topology
        .servers()
        .iter()
        .filter(|s| *s != local && Some(*s) != own_server)
        .map(|s| (s.clone(), PacketType::OtherCluster));
    let members = topology
        .cluster_index(local)
        .and_then(|i| topology.clients(i))
        .unwrap_or_default()
        .iter()
        .filter(|m| *m != local)
        .map(|m| (m.clone(), PacketType::Use));

    servers.chain(members).collect()
}

/// Wait for the node's control task and stop everything else once it ends,
/// so a crashed node reports itself closed.
async fn supervise(task: JoinHandle<()>, cancel: CancellationToken) {
    match task.await {
        Ok(()) => {}
        Err(e) if e.is_panic() => tracing::error!(error = %e, "node control task panicked, shutting down"),
        Err(e) => tracing::warn!(error = %e, "node control task aborted"),
    }
    cancel.cancel();
}
