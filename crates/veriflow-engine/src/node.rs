// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node runtime: uniform timeout, retry and error classification around a
//! single stage invocation.
//!
//! Stages are pure, so the runtime may invoke them again freely; the
//! orchestrator writes their fragment behind CAS afterwards. Transient
//! failures are collected and handed back so the orchestrator can append
//! them to the workflow's error log in the same CAS write as the result.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use veriflow_core::config::Config;
use veriflow_core::error::StageError;
use veriflow_core::model::{ErrorEntry, Node};
use veriflow_core::store::WorkflowStore;
use veriflow_stages::{StageContext, StageSet};

/// Successful node completion.
#[derive(Debug)]
pub struct NodeSuccess {
    /// The stage's result fragment.
    pub value: serde_json::Value,
    /// Attempts consumed, 1-based.
    pub attempts: u32,
    /// Transient failures absorbed along the way.
    pub transient: Vec<ErrorEntry>,
}

/// Terminal node failure.
#[derive(Debug)]
pub struct NodeFailure {
    /// The failure that ended the node.
    pub error: ErrorEntry,
    /// Transient failures absorbed before the terminal one.
    pub transient: Vec<ErrorEntry>,
}

/// Cancellation probe checked between attempts and at node boundaries.
#[derive(Clone)]
pub struct CancelProbe {
    store: WorkflowStore,
    workflow_id: Uuid,
}

impl CancelProbe {
    /// Probe for one workflow.
    pub fn new(store: WorkflowStore, workflow_id: Uuid) -> Self {
        Self { store, workflow_id }
    }

    /// Whether a cancellation tombstone exists. Store errors read as
    /// not-cancelled; the next CAS write will surface them.
    pub async fn cancelled(&self) -> bool {
        match self.store.cancel_requested(&self.workflow_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(workflow_id = %self.workflow_id, error = %e, "cancel probe failed");
                false
            }
        }
    }
}

/// Executes one stage with the uniform node contract.
#[derive(Clone)]
pub struct NodeRuntime {
    cfg: Arc<Config>,
}

impl NodeRuntime {
    /// Runtime with the given configuration.
    pub fn new(cfg: Arc<Config>) -> Self {
        Self { cfg }
    }

    /// Run `node` against `ctx`, retrying retryable failures with jittered
    /// exponential backoff up to the attempt cap.
    pub async fn execute(
        &self,
        stages: &StageSet,
        node: Node,
        ctx: &StageContext,
        probe: &CancelProbe,
    ) -> Result<NodeSuccess, NodeFailure> {
        let Some(stage) = stages.stage(node) else {
            return Err(NodeFailure {
                error: entry(
                    node,
                    &StageError::validation(format!("no stage registered for {node}")),
                    1,
                ),
                transient: Vec::new(),
            });
        };

        let deadline = self.cfg.node_timeouts.for_node(node);
        let max_attempts = self.cfg.retry_max_attempts.max(1);
        let mut transient = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;

            if probe.cancelled().await {
                return Err(NodeFailure {
                    error: entry(node, &StageError::cancelled(), attempt),
                    transient,
                });
            }

            let outcome = match deadline {
                Some(limit) => match tokio::time::timeout(limit, stage.apply(ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(StageError::timeout(format!(
                        "{node} exceeded {}ms",
                        limit.as_millis()
                    ))),
                },
                None => stage.apply(ctx).await,
            };

            match outcome {
                Ok(value) => {
                    debug!(%node, attempt, "node completed");
                    return Ok(NodeSuccess {
                        value,
                        attempts: attempt,
                        transient,
                    });
                }
                Err(err) if err.kind.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        %node,
                        attempt,
                        kind = err.kind.code(),
                        delay_ms = delay.as_millis() as u64,
                        "node failed, retrying"
                    );
                    transient.push(entry(node, &err, attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(%node, attempt, kind = err.kind.code(), "node failed terminally");
                    return Err(NodeFailure {
                        error: entry(node, &err, attempt),
                        transient,
                    });
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shape = &self.cfg.retry_backoff;
        let exp = shape.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = shape.base.as_secs_f64() * exp;
        let capped = raw.min(shape.cap.as_secs_f64());
        let jitter = rand::rng().random_range(1.0 - shape.jitter..=1.0 + shape.jitter);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

fn entry(node: Node, err: &StageError, attempt: u32) -> ErrorEntry {
    ErrorEntry {
        node,
        kind: err.kind,
        detail: err.detail.clone(),
        attempt,
        at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};
    use veriflow_core::error::ErrorKind;
    use veriflow_core::model::{ItemPayload, RawItem, workflow_id_for};
    use veriflow_core::store::MemoryStore;
    use veriflow_stages::Stage;

    use super::*;

    fn fast_cfg() -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.retry_backoff.base = Duration::from_millis(2);
        cfg.retry_backoff.cap = Duration::from_millis(10);
        Arc::new(cfg)
    }

    fn ctx() -> StageContext {
        let item = RawItem {
            source_id: "s".into(),
            source: "test".into(),
            payload: ItemPayload {
                text: Some("text".into()),
                ..ItemPayload::default()
            },
            ingested_at: Utc::now(),
        };
        StageContext {
            workflow_id: workflow_id_for(&item.source_id),
            item,
            results: BTreeMap::new(),
            claim: None,
        }
    }

    fn probe() -> CancelProbe {
        let store = WorkflowStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        CancelProbe::new(store, Uuid::nil())
    }

    struct FlakyStage {
        failures: AtomicU32,
    }

    #[async_trait]
    impl Stage for FlakyStage {
        async fn apply(&self, _ctx: &StageContext) -> Result<Value, StageError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                Err(StageError::retryable("upstream hiccup"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    struct AlwaysInvalid;

    #[async_trait]
    impl Stage for AlwaysInvalid {
        async fn apply(&self, _ctx: &StageContext) -> Result<Value, StageError> {
            Err(StageError::validation("bad input"))
        }
    }

    struct SlowStage;

    #[async_trait]
    impl Stage for SlowStage {
        async fn apply(&self, _ctx: &StageContext) -> Result<Value, StageError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_and_records_them() {
        let stages = StageSet::builtin(vec![]).with_stage(
            Node::EvidenceRetrieve,
            Arc::new(FlakyStage {
                failures: AtomicU32::new(2),
            }),
        );
        let runtime = NodeRuntime::new(fast_cfg());
        let success = runtime
            .execute(&stages, Node::EvidenceRetrieve, &ctx(), &probe())
            .await
            .unwrap();
        assert_eq!(success.attempts, 3);
        assert_eq!(success.transient.len(), 2);
        assert_eq!(success.transient[0].attempt, 1);
        assert_eq!(success.transient[1].attempt, 2);
        assert!(
            success
                .transient
                .iter()
                .all(|e| e.kind == ErrorKind::Retryable)
        );
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_node() {
        let stages = StageSet::builtin(vec![]).with_stage(
            Node::EvidenceRetrieve,
            Arc::new(FlakyStage {
                failures: AtomicU32::new(10),
            }),
        );
        let runtime = NodeRuntime::new(fast_cfg());
        let failure = runtime
            .execute(&stages, Node::EvidenceRetrieve, &ctx(), &probe())
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind, ErrorKind::Retryable);
        assert_eq!(failure.error.attempt, 3);
        assert_eq!(failure.transient.len(), 2);
    }

    #[tokio::test]
    async fn validation_errors_fail_immediately() {
        let stages =
            StageSet::builtin(vec![]).with_stage(Node::Normalize, Arc::new(AlwaysInvalid));
        let runtime = NodeRuntime::new(fast_cfg());
        let failure = runtime
            .execute(&stages, Node::Normalize, &ctx(), &probe())
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind, ErrorKind::Validation);
        assert_eq!(failure.error.attempt, 1);
        assert!(failure.transient.is_empty());
    }

    #[tokio::test]
    async fn deadline_produces_timeout_kind() {
        let mut cfg = Config::default();
        cfg.node_timeouts.risk = Duration::from_millis(10);
        cfg.retry_max_attempts = 1;
        let stages = StageSet::builtin(vec![]).with_stage(Node::RiskScore, Arc::new(SlowStage));
        let runtime = NodeRuntime::new(Arc::new(cfg));
        let failure = runtime
            .execute(&stages, Node::RiskScore, &ctx(), &probe())
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_an_attempt() {
        let store = WorkflowStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let id = Uuid::new_v4();
        store.request_cancel(&id).await.unwrap();
        let probe = CancelProbe::new(store, id);

        let stages = StageSet::builtin(vec![]);
        let runtime = NodeRuntime::new(fast_cfg());
        let failure = runtime
            .execute(&stages, Node::Normalize, &ctx(), &probe)
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind, ErrorKind::Cancelled);
    }
}
