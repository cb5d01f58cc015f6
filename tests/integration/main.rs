//! Tandem integration test harness.
//!
//! Every test builds its own overlay of real nodes on loopback TCP inside
//! this process. Ports are OS-assigned, so tests can run in parallel.
//! Intervals and timeouts are shortened so membership changes settle in
//! well under a second; liveness scenarios take a few seconds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use tandem_core::config::TandemConfig;
use tandem_core::{ClientNode, ModuleType};
use tandem_net::Networking;
use tandem_services::MessageListener;

mod liveness;
mod malformed;
mod membership;
mod routing;
mod shutdown;

// ── Harness ──────────────────────────────────────────────────────────────────

pub const LOOPBACK: &str = "127.0.0.1";

pub const SETTLE: Duration = Duration::from_secs(3);
const POLL: Duration = Duration::from_millis(20);
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Defaults with every interval cut down for tests.
pub fn test_config() -> TandemConfig {
    let mut config = TandemConfig::default();
    config.network.connect_timeout_ms = 500;
    config.network.status_port = 0;
    config.liveness.client_alive_interval_ms = 100;
    config.liveness.server_alive_interval_ms = 200;
    config.liveness.cluster_timeout_ms = 600;
    config.liveness.main_timeout_ms = 1_000;
    config.liveness.reassembly_ttl_ms = 5_000;
    config
}

pub async fn start_main() -> Result<Networking> {
    let node = ClientNode::new(LOOPBACK, 0);
    Ok(Networking::add_user(node.clone(), node, test_config()).await?)
}

/// Start a node and wait until the main server has placed it.
pub async fn join(main: &Networking) -> Result<Networking> {
    let node = Networking::add_user(ClientNode::new(LOOPBACK, 0), main.local().clone(), test_config()).await?;
    let n = &node;
    let joined = eventually(SETTLE, move || async move { n.cluster_index().await.is_some() }).await;
    ensure!(joined, "{} never joined", node.local());
    Ok(node)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Number of nodes in `net`'s view of the overlay.
pub async fn members(net: &Networking) -> usize {
    net.structure().await.clusters.iter().map(Vec::len).sum()
}

pub async fn knows(net: &Networking, node: &ClientNode) -> bool {
    net.structure().await.clusters.iter().any(|c| c.contains(node))
}

/// A main server plus `nodes` joined in order.
///
/// The first seven joiners each open a cluster and lead it; the eighth
/// lands in cluster 0 under the main server, the ninth in cluster 1, and
/// so on round-robin.
pub struct Overlay {
    pub main: Networking,
    pub nodes: Vec<Networking>,
}

impl Overlay {
    pub async fn start(nodes: usize) -> Result<Self> {
        let main = start_main().await?;
        let mut joined = Vec::with_capacity(nodes);
        for _ in 0..nodes {
            joined.push(join(&main).await?);
        }
        let overlay = Self { main, nodes: joined };
        ensure!(overlay.converged().await, "views did not converge");
        Ok(overlay)
    }

    /// Wait until every node sees every other node.
    pub async fn converged(&self) -> bool {
        let total = self.nodes.len() + 1;
        let all: Vec<&Networking> = std::iter::once(&self.main).chain(&self.nodes).collect();
        let all = &all;
        eventually(SETTLE, move || async move {
            for net in all {
                if members(net).await != total {
                    return false;
                }
            }
            true
        })
        .await
    }

    pub async fn close(&self) {
        for node in &self.nodes {
            node.close_networking().await;
        }
        self.main.close_networking().await;
    }
}

/// Collects everything delivered to one module of one node.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Inbox {
    pub fn subscribe(net: &Networking, module: ModuleType) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn MessageListener> = Arc::new(move |data: Bytes| {
            let _ = tx.send(data);
        });
        assert!(net.subscribe(module, listener), "{module:?} already subscribed");
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv()).await.ok().flatten()
    }

    /// True if nothing arrives within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.rx.recv()).await.is_err()
    }
}
