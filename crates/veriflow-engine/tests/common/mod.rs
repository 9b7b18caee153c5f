// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for veriflow-engine integration tests.
//!
//! Wires a memory store, a memory bus and the built-in stage set behind a
//! TestContext so tests drive the orchestrator the way a partition worker
//! would.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use veriflow_core::bus::{Delivery, EventBus, MemoryBus, Topic};
use veriflow_core::config::Config;
use veriflow_core::model::{ItemPayload, RawItem, Workflow, WorkflowStatus, workflow_id_for};
use veriflow_core::store::{MemoryStore, WorkflowStore};
use veriflow_engine::orchestrator::{Disposition, Orchestrator};
use veriflow_engine::review::ReviewCoordinator;
use veriflow_stages::StageSet;

/// Test wiring around one orchestrator.
pub struct TestContext {
    pub cfg: Arc<Config>,
    pub store: WorkflowStore,
    pub bus: Arc<MemoryBus>,
    pub orchestrator: Arc<Orchestrator>,
    pub coordinator: Arc<ReviewCoordinator>,
    offsets: AtomicU64,
}

impl TestContext {
    /// Context with the built-in stage set.
    pub fn new() -> Self {
        Self::with_stages(StageSet::builtin(vec!["hi".into(), "ta".into()]))
    }

    /// Context with a custom stage set (fault injection).
    pub fn with_stages(stages: StageSet) -> Self {
        Self::build(stages, fast_config())
    }

    /// Context with custom stages and configuration.
    pub fn build(stages: StageSet, cfg: Config) -> Self {
        let cfg = Arc::new(cfg);
        let store = WorkflowStore::new(Arc::new(MemoryStore::new()), cfg.workflow_ttl);
        let bus = Arc::new(MemoryBus::new(cfg.dlq_attempt_cap).with_partitions(Topic::RawItems, 1));
        let stages = Arc::new(stages);
        let orchestrator = Arc::new(Orchestrator::new(
            cfg.clone(),
            store.clone(),
            bus.clone(),
            stages,
            "test-owner".to_string(),
        ));
        let coordinator = Arc::new(ReviewCoordinator::new(
            cfg.clone(),
            store.clone(),
            bus.clone(),
        ));
        Self {
            cfg,
            store,
            bus,
            orchestrator,
            coordinator,
            offsets: AtomicU64::new(0),
        }
    }

    /// Deliver a raw item straight to the orchestrator, the way a
    /// partition worker would hand it over.
    pub async fn deliver(&self, item: &RawItem) -> Disposition {
        let delivery = self.delivery_for(item);
        self.orchestrator
            .handle_delivery(&delivery)
            .await
            .expect("delivery must not error")
    }

    /// Build the bus delivery for an item without processing it.
    pub fn delivery_for(&self, item: &RawItem) -> Delivery {
        Delivery {
            topic: Topic::RawItems,
            partition: 0,
            offset: self.offsets.fetch_add(1, Ordering::SeqCst),
            key: item.source_id.clone(),
            payload: serde_json::to_vec(item).expect("item encodes"),
            attempts: 1,
        }
    }

    /// The workflow record for a source id.
    pub async fn workflow(&self, source_id: &str) -> Workflow {
        self.store
            .load(&workflow_id_for(source_id))
            .await
            .expect("store readable")
            .expect("workflow exists")
    }

    /// Poll the store until the workflow reaches `status`.
    pub async fn await_status(&self, source_id: &str, status: WorkflowStatus) -> Workflow {
        let id = workflow_id_for(source_id);
        for _ in 0..200 {
            if let Ok(Some(wf)) = self.store.load(&id).await
                && wf.status == status
            {
                return wf;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("workflow for '{source_id}' never reached {status}");
    }

    /// A second orchestrator over the same store and bus, as another
    /// process would see them.
    pub fn sibling(&self, stages: StageSet, owner: &str) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            self.cfg.clone(),
            self.store.clone(),
            self.bus.clone(),
            Arc::new(stages),
            owner.to_string(),
        ))
    }

    /// Drain every message currently on a topic.
    pub async fn drain<T: DeserializeOwned>(&self, topic: Topic) -> Vec<T> {
        let group = format!("drain-{}", Uuid::new_v4());
        let mut out = Vec::new();
        for partition in 0..self.bus.partitions(topic) {
            let mut consumer = self
                .bus
                .consumer(topic, &group, partition)
                .await
                .expect("consumer opens");
            while let Some(delivery) = consumer
                .poll(Duration::from_millis(20))
                .await
                .expect("poll works")
            {
                out.push(serde_json::from_slice(&delivery.payload).expect("payload decodes"));
                consumer.commit(&delivery).await.expect("commit works");
            }
        }
        out
    }
}

/// Configuration with millisecond backoff and short leases, so retry and
/// recovery paths run quickly under test.
pub fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.retry_backoff.base = Duration::from_millis(2);
    cfg.retry_backoff.cap = Duration::from_millis(10);
    cfg.owner_lease_ttl = Duration::from_millis(200);
    cfg.owner_lease_renew = Duration::from_millis(60);
    cfg.shutdown_grace = Duration::from_secs(2);
    cfg
}

/// A raw item with the given text.
pub fn raw_item(source_id: &str, text: &str) -> RawItem {
    RawItem {
        source_id: source_id.to_string(),
        source: "test-feed".to_string(),
        payload: ItemPayload {
            title: None,
            text: Some(text.to_string()),
            url: None,
            language_hint: None,
            media: Vec::new(),
        },
        ingested_at: Utc::now(),
    }
}

/// Text that extracts no claims and scores low risk.
pub const CALM_TEXT: &str = "calm";

/// Text that extracts claims and scores past the default review threshold.
pub const HIGH_RISK_TEXT: &str =
    "Hundreds dead after the dam collapsed. 40 people trapped under rubble.";

/// Text that extracts exactly one claim.
pub const ONE_CLAIM_TEXT: &str = "Three hundred homes flooded across the district.";
