//! Liveness timer: declares monitored peers dead after a quiet period.
//!
//! Every inbound HELLO/ALIVE refreshes the sender's last-seen time. A scan
//! runs once per timeout period; any peer silent for longer than the timeout
//! is dropped from monitoring and handed to the caller's callback exactly
//! once. The timer knows nothing about clusters.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tandem_core::ClientNode;

#[derive(Clone)]
pub struct LivenessTimer {
    last_seen: Arc<DashMap<ClientNode, Instant>>,
    timeout: Duration,
}

impl LivenessTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Start monitoring `node`, or refresh it if already monitored.
    pub fn add_client(&self, node: ClientNode) {
        tracing::debug!(peer = %node, "monitoring peer");
        self.last_seen.insert(node, Instant::now());
    }

    pub fn remove_client(&self, node: &ClientNode) -> bool {
        self.last_seen.remove(node).is_some()
    }

    /// Refresh `node`'s last-seen time. Returns `false` if it is not monitored.
    pub fn update_timeout(&self, node: &ClientNode) -> bool {
        match self.last_seen.get_mut(node) {
            Some(mut seen) => {
                *seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn is_monitored(&self, node: &ClientNode) -> bool {
        self.last_seen.contains_key(node)
    }

    pub fn monitored(&self) -> Vec<ClientNode> {
        self.last_seen.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove and return every peer silent for longer than the timeout.
    pub fn expire(&self) -> Vec<ClientNode> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.last_seen.retain(|node, seen| {
            let alive = seen.elapsed() <= timeout;
            if !alive {
                expired.push(node.clone());
            }
            alive
        });
        expired
    }

    /// Scan once per timeout period until cancelled.
    pub async fn run<F>(self, on_timeout: F, cancel: CancellationToken)
    where
        F: Fn(ClientNode) + Send + Sync + 'static,
    {
        let start = Instant::now() + self.timeout;
        let mut interval = tokio::time::interval_at(start, self.timeout);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("liveness timer stopping");
                    return;
                }

                _ = interval.tick() => {
                    for node in self.expire() {
                        tracing::info!(peer = %node, timeout_ms = self.timeout.as_millis() as u64, "peer timed out");
                        on_timeout(node);
                    }
                }
            }
        }
    }
}
