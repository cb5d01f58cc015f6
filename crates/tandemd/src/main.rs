//! tandemd: runs one Tandem overlay node.
//!
//! The node is the main server when `network.host:port` equals
//! `network.main_host:main_port`, otherwise it joins that main server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;

use tandem_core::config::TandemConfig;
use tandem_core::ModuleType;
use tandem_net::Networking;
use tandem_services::MessageListener;

mod status;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TandemConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TandemConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TandemConfig::default()
    });

    let device = config.network.local_node();
    let main_server = config.network.main_node();
    let status_port = config.network.status_port;
    tracing::info!(%device, main = %main_server, "tandemd starting");

    let networking = Arc::new(
        Networking::add_user(device, main_server, config)
            .await
            .context("failed to start networking")?,
    );

    // Log chat traffic so a bare daemon shows something arriving.
    let chat: Arc<dyn MessageListener> = Arc::new(|data: Bytes| {
        tracing::info!(bytes = data.len(), text = %String::from_utf8_lossy(&data), "chat message");
    });
    networking.subscribe(ModuleType::Chat, chat);

    // ── Shutdown ─────────────────────────────────────────────────────────────

    {
        let networking = networking.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            networking.close_networking().await;
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    if status_port != 0 {
        let state = status::StatusState {
            networking: networking.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, status_port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    let status_printer = {
        let networking = networking.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let status = networking.status().await;
                tracing::info!(
                    role = ?status.role,
                    clusters = status.clusters.len(),
                    backlog = status.backlog.highest + status.backlog.high + status.backlog.low,
                    in_flight = status.in_flight,
                    "overlay snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = networking.closed() => tracing::info!("shutting down"),
        r = status_printer      => tracing::error!("status printer exited: {:?}", r),
    }

    Ok(())
}
