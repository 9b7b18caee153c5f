// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry, terminal-failure and dead-letter behavior.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use veriflow_core::bus::{
    AlertMessage, Delivery, DlqEnvelope, EventBus, LastError, NackOutcome, Topic,
};
use veriflow_core::error::{ErrorKind, StageError};
use veriflow_core::model::{Node, WorkflowStatus};
use veriflow_engine::orchestrator::Disposition;
use veriflow_stages::{Stage, StageContext, StageSet};

use common::{HIGH_RISK_TEXT, ONE_CLAIM_TEXT, TestContext, raw_item};

/// Fails a fixed number of times with `Retryable`, then succeeds.
struct FlakyEvidence {
    failures: AtomicU32,
}

impl FlakyEvidence {
    fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(times),
        })
    }
}

#[async_trait]
impl Stage for FlakyEvidence {
    async fn apply(&self, _ctx: &StageContext) -> Result<Value, StageError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            })
            .is_ok();
        if failing {
            return Err(StageError::retryable("index timeout"));
        }
        Ok(json!({"evidence": [{
            "url": "https://archive.invalid/1",
            "snippet": "officials confirm the flooding",
            "source_reliability": 0.8,
            "support_score": 0.7,
        }]}))
    }
}

struct InvalidEntity;

#[async_trait]
impl Stage for InvalidEntity {
    async fn apply(&self, _ctx: &StageContext) -> Result<Value, StageError> {
        Err(StageError::validation("entity model rejected payload"))
    }
}

struct BrokenEvidence;

#[async_trait]
impl Stage for BrokenEvidence {
    async fn apply(&self, _ctx: &StageContext) -> Result<Value, StageError> {
        Err(StageError::upstream("evidence index is gone"))
    }
}

#[tokio::test]
async fn transient_failures_are_retried_and_recorded() {
    let stages = StageSet::builtin(vec!["hi".into()])
        .with_stage(Node::EvidenceRetrieve, FlakyEvidence::failing(2));
    let ctx = TestContext::with_stages(stages);

    let disposition = ctx.deliver(&raw_item("flaky", ONE_CLAIM_TEXT)).await;
    assert!(matches!(disposition, Disposition::Processed));

    let wf = ctx.workflow("flaky").await;
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.retry_counts.get("evidence"), Some(&2));

    let transient: Vec<_> = wf
        .errors
        .iter()
        .filter(|e| e.node == Node::EvidenceRetrieve)
        .collect();
    assert_eq!(transient.len(), 2);
    assert!(transient.iter().all(|e| e.kind == ErrorKind::Retryable));
    assert_eq!(transient[0].attempt, 1);
    assert_eq!(transient[1].attempt, 2);
}

#[tokio::test]
async fn validation_failure_is_terminal_without_dlq() {
    let stages =
        StageSet::builtin(vec!["hi".into()]).with_stage(Node::EntityExtract, Arc::new(InvalidEntity));
    let ctx = TestContext::with_stages(stages);

    let disposition = ctx.deliver(&raw_item("poison-content", "Two dead in the flood.")).await;
    // the message itself was fine; the offset commits normally
    assert!(matches!(disposition, Disposition::Processed));

    let wf = ctx.workflow("poison-content").await;
    assert_eq!(wf.status, WorkflowStatus::Failed);
    let terminal = wf.errors.last().expect("failure recorded");
    assert_eq!(terminal.kind, ErrorKind::Validation);
    assert_eq!(terminal.node, Node::EntityExtract);
    assert_eq!(terminal.attempt, 1);

    let dlq: Vec<DlqEnvelope> = ctx.drain(Topic::Dlq).await;
    assert!(dlq.is_empty(), "content failure is not a poison message");

    let alerts: Vec<AlertMessage> = ctx.drain(Topic::Alerts).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, "workflow_failed");
}

#[tokio::test]
async fn all_claims_failed_fails_the_workflow() {
    let stages = StageSet::builtin(vec!["hi".into()])
        .with_stage(Node::EvidenceRetrieve, Arc::new(BrokenEvidence));
    let ctx = TestContext::with_stages(stages);

    ctx.deliver(&raw_item("all-fail", HIGH_RISK_TEXT)).await;

    let wf = ctx.workflow("all-fail").await;
    assert_eq!(wf.status, WorkflowStatus::Failed);
    let terminal = wf.errors.last().expect("failure recorded");
    assert_eq!(terminal.kind, ErrorKind::AllClaimsFailed);
    // per-claim failures are recorded too
    assert!(
        wf.errors
            .iter()
            .any(|e| e.kind == ErrorKind::PermanentUpstreamFailure)
    );
}

#[tokio::test]
async fn one_surviving_claim_keeps_the_workflow_alive() {
    /// Fails only the first claim of every workflow.
    struct HalfBroken;

    #[async_trait]
    impl Stage for HalfBroken {
        async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
            let work = ctx.require_claim()?;
            if work.claim.claim_id.ends_with(":0") {
                return Err(StageError::upstream("source unreachable"));
            }
            Ok(json!({"evidence": []}))
        }
    }

    let stages = StageSet::builtin(vec!["hi".into()])
        .with_stage(Node::EvidenceRetrieve, Arc::new(HalfBroken));
    let ctx = TestContext::with_stages(stages);

    ctx.deliver(&raw_item("half", HIGH_RISK_TEXT)).await;

    let wf = ctx.workflow("half").await;
    // still reaches the risk gate (and parks, given the text)
    assert_eq!(wf.status, WorkflowStatus::AwaitingReview);

    let merge: veriflow_stages::MergeFragment =
        serde_json::from_value(wf.result(Node::ClaimMerge).expect("merge written").clone())
            .expect("merge decodes");
    assert_eq!(merge.verdicts.len(), 2);
    assert!(merge.verdicts[0].error.is_some());
    assert!(merge.verdicts[1].error.is_none());
}

#[tokio::test]
async fn undecodable_payload_is_dead_lettered() {
    let ctx = TestContext::new();
    let delivery = Delivery {
        topic: Topic::RawItems,
        partition: 0,
        offset: 0,
        key: "garbage".into(),
        payload: b"not json at all".to_vec(),
        attempts: 1,
    };
    let disposition = ctx
        .orchestrator
        .handle_delivery(&delivery)
        .await
        .expect("handled");
    match disposition {
        Disposition::DeadLetter(last_error) => {
            assert_eq!(last_error.kind, ErrorKind::Validation);
        }
        other => panic!("unexpected disposition: {other:?}"),
    }
}

#[tokio::test]
async fn dead_lettered_message_fails_its_workflow() {
    use chrono::Utc;
    use veriflow_core::model::Workflow;

    let ctx = TestContext::new();
    let item = raw_item("dlq-bound", HIGH_RISK_TEXT);

    // a workflow whose processing keeps failing sits in Running while its
    // message burns through the bus attempt budget
    let wf = Workflow::new(item.clone(), Utc::now() + chrono::TimeDelta::minutes(30));
    let mut wf = ctx.store.create(&wf).await.expect("create works");
    wf.status = WorkflowStatus::Running;
    ctx.store.update(&wf).await.expect("update works");

    ctx.bus
        .publish(
            Topic::RawItems,
            &item.source_id,
            &serde_json::to_vec(&item).expect("encodes"),
        )
        .await
        .expect("publish works");
    let mut consumer = ctx
        .bus
        .consumer(Topic::RawItems, "dlq-test", 0)
        .await
        .expect("consumer opens");
    let last_error = LastError {
        kind: ErrorKind::Retryable,
        detail: "processing kept failing".into(),
    };
    let dead = loop {
        let delivery = consumer
            .poll(Duration::from_millis(50))
            .await
            .expect("poll works")
            .expect("message available");
        match consumer.nack(&delivery, &last_error).await.expect("nack works") {
            NackOutcome::Redeliver => continue,
            NackOutcome::DeadLettered => break delivery,
        }
    };
    assert_eq!(dead.attempts, ctx.cfg.dlq_attempt_cap);

    let dlq: Vec<DlqEnvelope> = ctx.drain(Topic::Dlq).await;
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].attempts, ctx.cfg.dlq_attempt_cap);
    assert_eq!(dlq[0].original_topic, "raw-items");

    ctx.orchestrator
        .fail_dead_lettered(&dead.payload, &last_error)
        .await
        .expect("failure recorded");
    let wf = ctx.workflow("dlq-bound").await;
    assert_eq!(wf.status, WorkflowStatus::Failed);
    assert!(
        wf.errors
            .last()
            .expect("failure recorded")
            .detail
            .contains("dead-lettered")
    );
}
