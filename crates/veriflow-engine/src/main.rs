// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! veriflow server binary.
//!
//! Wires a state store backend, the embedded bus, the built-in stage set
//! and the supervisor, then runs until SIGTERM/SIGINT and drains.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use veriflow_core::bus::MemoryBus;
use veriflow_core::config::Config;
use veriflow_core::store::{MemoryStore, SqliteStore, StateStore, WorkflowStore};
use veriflow_engine::Supervisor;
use veriflow_stages::StageSet;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Arc::new(Config::from_env()?);

    let sqlite = match std::env::var("VERIFLOW_STATE_PATH") {
        Ok(path) => Some(Arc::new(SqliteStore::from_path(&path).await?)),
        Err(_) => None,
    };
    let backend: Arc<dyn StateStore> = match &sqlite {
        Some(store) => {
            info!("using sqlite state store");
            store.clone()
        }
        None => {
            info!("using in-memory state store");
            Arc::new(MemoryStore::new())
        }
    };
    let store = WorkflowStore::new(backend, cfg.workflow_ttl);
    let bus = Arc::new(MemoryBus::new(cfg.dlq_attempt_cap));
    let stages = Arc::new(StageSet::builtin(cfg.translate_languages.clone()));

    let handle = Supervisor::start(cfg, store, bus, stages).await?;
    info!("veriflow engine running");

    // periodic cleanup of expired rows in the durable backend
    if let Some(sqlite) = sqlite {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tick.tick().await;
                match sqlite.purge_expired().await {
                    Ok(purged) if purged > 0 => info!(purged, "purged expired state"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "purge failed"),
                }
            }
        });
    }

    wait_for_signal().await;
    info!("signal received, draining");
    handle.shutdown().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
