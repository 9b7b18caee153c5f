// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The orchestrator: owns the DAG, the status machine, checkpoint
//! placement, dedup, fan-out and terminal disposition.
//!
//! Every mutation of workflow state happens here, CAS-guarded on the
//! record version. The write order on each node boundary is fixed: CAS the
//! record, write the checkpoint, then announce (events, alerts,
//! notifications); the supervisor commits the inbound offset only after
//! the orchestrator returns.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use veriflow_core::bus::{
    AlertMessage, Delivery, EventBus, LastError, NotificationMessage, Severity, Topic,
};
use veriflow_core::config::Config;
use veriflow_core::error::{ErrorKind, StoreError};
use veriflow_core::model::{
    Checkpoint, Claim, ClaimVerdict, ErrorEntry, Evidence, Node, NotificationEvent,
    NotificationKind, RawItem, StageFailure, Workflow, WorkflowStatus, workflow_id_for,
};
use veriflow_core::store::{DedupClaim, WorkflowStore};
use veriflow_stages::digestion::VERACITY_PRIOR;
use veriflow_stages::{ClaimWork, ClaimsFragment, MergeFragment, RiskFragment, StageContext, StageSet};

use crate::dag::{self, Route};
use crate::error::EngineError;
use crate::node::{CancelProbe, NodeFailure, NodeRuntime, NodeSuccess};

/// How a delivery was handled; the supervisor turns this into an offset
/// commit or a DLQ route.
#[derive(Debug)]
pub enum Disposition {
    /// The workflow reached a terminal state (or was already terminal).
    Processed,
    /// The workflow parked in review; state is durable, commit the offset.
    Parked,
    /// Duplicate delivery acknowledged without side effects.
    Duplicate(Uuid),
    /// The payload can never be processed; route it to the DLQ.
    DeadLetter(LastError),
}

/// Dedup token lifetime. Permanence comes from the workflow record; the
/// token only covers the window before the record exists.
const DEDUP_LOCK_TTL: Duration = Duration::from_secs(300);

const CAS_ATTEMPTS: usize = 3;

enum FanOut {
    Merged {
        fragment: Value,
        retries: BTreeMap<&'static str, u32>,
        errors: Vec<ErrorEntry>,
    },
    AllFailed(Vec<ErrorEntry>),
    Cancelled(Vec<ErrorEntry>),
}

struct ClaimTaskResult {
    partial: BTreeMap<String, Value>,
    transient: Vec<ErrorEntry>,
    retries: BTreeMap<&'static str, u32>,
    failure: Option<ErrorEntry>,
}

/// Drives workflows through the fixed pipeline.
pub struct Orchestrator {
    cfg: Arc<Config>,
    store: WorkflowStore,
    bus: Arc<dyn EventBus>,
    stages: Arc<StageSet>,
    runtime: NodeRuntime,
    owner: String,
}

impl Orchestrator {
    /// Orchestrator identified as `owner` in leases.
    pub fn new(
        cfg: Arc<Config>,
        store: WorkflowStore,
        bus: Arc<dyn EventBus>,
        stages: Arc<StageSet>,
        owner: String,
    ) -> Self {
        let runtime = NodeRuntime::new(cfg.clone());
        Self {
            cfg,
            store,
            bus,
            stages,
            runtime,
            owner,
        }
    }

    /// The typed store this orchestrator writes through.
    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    /// Handle one `raw-items` delivery end to end.
    #[instrument(skip(self, delivery), fields(offset = delivery.offset, key = %delivery.key))]
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<Disposition, EngineError> {
        let item: RawItem = match serde_json::from_slice(&delivery.payload) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "undecodable raw item");
                return Ok(Disposition::DeadLetter(LastError {
                    kind: ErrorKind::Validation,
                    detail: format!("undecodable raw item: {e}"),
                }));
            }
        };
        if item.source_id.is_empty() {
            return Ok(Disposition::DeadLetter(LastError {
                kind: ErrorKind::Validation,
                detail: "source_id is required".to_string(),
            }));
        }

        let workflow_id = workflow_id_for(&item.source_id);

        if let Some(existing) = self.store.load(&workflow_id).await? {
            debug!(%workflow_id, "workflow already exists for source id");
            return self.adopt(existing).await;
        }

        match self
            .store
            .claim_dedup(&item.source_id, &workflow_id, DEDUP_LOCK_TTL)
            .await?
        {
            DedupClaim::Claimed => {}
            DedupClaim::Duplicate(existing_id) => {
                // the claimant may not have written the record yet; either
                // way this delivery is acknowledged without side effects
                return match self.store.load(&existing_id).await? {
                    Some(existing) => self.adopt(existing).await,
                    None => Ok(Disposition::Duplicate(existing_id)),
                };
            }
        }

        let deadline = Utc::now()
            + chrono::TimeDelta::from_std(self.cfg.workflow_deadline)
                .unwrap_or_else(|_| chrono::TimeDelta::minutes(30));
        let wf = Workflow::new(item, deadline);
        let mut wf = match self.store.create(&wf).await {
            Ok(created) => created,
            Err(StoreError::VersionConflict { .. }) => {
                return Ok(Disposition::Duplicate(workflow_id));
            }
            Err(e) => return Err(e.into()),
        };
        info!(%workflow_id, source = %wf.item.source, "workflow created");

        if !self
            .store
            .try_acquire_owner(&workflow_id, &self.owner, self.cfg.owner_lease_ttl)
            .await?
        {
            return Ok(Disposition::Duplicate(workflow_id));
        }

        // claim of the message by this orchestrator
        if !self
            .persist(&mut wf, |w| w.status = WorkflowStatus::Running)
            .await?
        {
            return Ok(Disposition::Processed);
        }
        self.emit_status(&wf).await;

        self.drive(wf).await
    }

    /// Resume a workflow by id (recovery pass, review decisions).
    pub async fn resume(&self, workflow_id: &Uuid) -> Result<Disposition, EngineError> {
        match self.store.load(workflow_id).await? {
            Some(wf) => self.adopt(wf).await,
            None => Ok(Disposition::Processed),
        }
    }

    /// Mark the workflow of a dead-lettered message as failed.
    pub async fn fail_dead_lettered(
        &self,
        payload: &[u8],
        last_error: &LastError,
    ) -> Result<(), EngineError> {
        let Ok(item) = serde_json::from_slice::<RawItem>(payload) else {
            return Ok(());
        };
        let workflow_id = workflow_id_for(&item.source_id);
        let Some(mut wf) = self.store.load(&workflow_id).await? else {
            return Ok(());
        };
        if wf.status.is_terminal() || wf.status == WorkflowStatus::AwaitingReview {
            return Ok(());
        }

        if wf.status == WorkflowStatus::Pending {
            if !self
                .persist(&mut wf, |w| w.status = WorkflowStatus::Running)
                .await?
            {
                return Ok(());
            }
        }
        let entry = ErrorEntry {
            node: wf.current_node.unwrap_or(Node::Normalize),
            kind: last_error.kind,
            detail: format!("message dead-lettered: {}", last_error.detail),
            attempt: 0,
            at: Utc::now(),
        };
        self.finish_failed(wf, entry).await?;
        Ok(())
    }

    /// Take over an existing workflow record if it needs driving.
    async fn adopt(&self, wf: Workflow) -> Result<Disposition, EngineError> {
        let workflow_id = wf.workflow_id;
        match wf.status {
            WorkflowStatus::Pending => {
                if !self
                    .store
                    .try_acquire_owner(&workflow_id, &self.owner, self.cfg.owner_lease_ttl)
                    .await?
                {
                    return Ok(Disposition::Duplicate(workflow_id));
                }
                let mut wf = wf;
                if !self
                    .persist(&mut wf, |w| w.status = WorkflowStatus::Running)
                    .await?
                {
                    return Ok(Disposition::Processed);
                }
                self.emit_status(&wf).await;
                self.drive(wf).await
            }
            WorkflowStatus::Running | WorkflowStatus::Resuming => {
                if !self
                    .store
                    .try_acquire_owner(&workflow_id, &self.owner, self.cfg.owner_lease_ttl)
                    .await?
                {
                    // a live owner is driving it; acknowledge
                    return Ok(Disposition::Duplicate(workflow_id));
                }
                let wf = self.rehydrate(wf).await?;
                self.drive(wf).await
            }
            _ => Ok(Disposition::Duplicate(workflow_id)),
        }
    }

    /// Restore from the latest checkpoint when it carries more progress
    /// than the live record (a torn write around a crash).
    async fn rehydrate(&self, live: Workflow) -> Result<Workflow, EngineError> {
        let Some(checkpoint) = self.store.latest_checkpoint(&live.workflow_id).await? else {
            return Ok(live);
        };
        if checkpoint.snapshot.results.len() > live.results.len() {
            info!(
                workflow_id = %live.workflow_id,
                node = %checkpoint.node,
                "rehydrating from checkpoint"
            );
            let mut restored = checkpoint.snapshot;
            restored.version = live.version;
            restored.status = live.status;
            return Ok(restored);
        }
        Ok(live)
    }

    /// The node loop. Exits on terminal states and on review parking.
    async fn drive(&self, mut wf: Workflow) -> Result<Disposition, EngineError> {
        let probe = CancelProbe::new(self.store.clone(), wf.workflow_id);

        loop {
            self.store
                .renew_owner(&wf.workflow_id, &self.owner, self.cfg.owner_lease_ttl)
                .await?;

            if wf.status.is_terminal() {
                return Ok(Disposition::Processed);
            }

            if self.store.cancel_requested(&wf.workflow_id).await? {
                return self.finish_cancelled(wf, None).await;
            }

            if wf.status == WorkflowStatus::Resuming {
                // first post-review node begins
                if !self
                    .persist(&mut wf, |w| w.status = WorkflowStatus::Running)
                    .await?
                {
                    return Ok(Disposition::Processed);
                }
                self.emit_status(&wf).await;
            }

            if Utc::now() > wf.deadline {
                let entry = ErrorEntry {
                    node: wf.current_node.unwrap_or(Node::Publish),
                    kind: ErrorKind::Timeout,
                    detail: "workflow deadline exceeded".to_string(),
                    attempt: 0,
                    at: Utc::now(),
                };
                return self.finish_failed(wf, entry).await;
            }

            let Some(node) = wf.current_node else {
                return self.finish_completed(wf).await;
            };

            match node {
                Node::AwaitReview => {
                    if wf.review.decision.is_some() {
                        // decision already recorded; continue past the gate
                        if !self
                            .persist(&mut wf, |w| w.current_node = Some(Node::DraftAdvisory))
                            .await?
                        {
                            return Ok(Disposition::Processed);
                        }
                        continue;
                    }
                    return self.park_for_review(wf).await;
                }
                Node::ClaimMerge => match self.fan_out_merge(&wf, &probe).await? {
                    FanOut::Merged {
                        fragment,
                        retries,
                        errors,
                    } => {
                        if !self
                            .complete_node(&mut wf, node, fragment, 1, retries, errors)
                            .await?
                        {
                            return Ok(Disposition::Processed);
                        }
                    }
                    FanOut::AllFailed(errors) => {
                        let entry = ErrorEntry {
                            node: Node::ClaimMerge,
                            kind: ErrorKind::AllClaimsFailed,
                            detail: "every per-claim sub-pipeline failed".to_string(),
                            attempt: 1,
                            at: Utc::now(),
                        };
                        if !self.persist(&mut wf, |w| w.errors.extend(errors.clone())).await? {
                            return Ok(Disposition::Processed);
                        }
                        return self.finish_failed(wf, entry).await;
                    }
                    FanOut::Cancelled(errors) => {
                        if !self.persist(&mut wf, |w| w.errors.extend(errors.clone())).await? {
                            return Ok(Disposition::Processed);
                        }
                        return self.finish_cancelled(wf, None).await;
                    }
                },
                node => {
                    let ctx = self.stage_context(&wf, None);
                    match self.runtime.execute(&self.stages, node, &ctx, &probe).await {
                        Ok(NodeSuccess {
                            value,
                            attempts,
                            transient,
                        }) => {
                            let mut retries = BTreeMap::new();
                            if attempts > 1 {
                                retries.insert(node.name(), attempts - 1);
                            }
                            if !self
                                .complete_node(&mut wf, node, value, attempts, retries, transient)
                                .await?
                            {
                                return Ok(Disposition::Processed);
                            }
                        }
                        Err(NodeFailure { error, transient }) => {
                            if !self
                                .persist(&mut wf, |w| {
                                    w.errors.extend(transient.clone());
                                    let retries = error.attempt.saturating_sub(1);
                                    if retries > 0 {
                                        *w.retry_counts.entry(node.name().to_string()).or_insert(0) +=
                                            retries;
                                    }
                                    // a dead risk stage still leaves a neutral score
                                    if node == Node::RiskScore && w.risk_score.is_none() {
                                        w.risk_score = Some(0.5);
                                    }
                                })
                                .await?
                            {
                                return Ok(Disposition::Processed);
                            }
                            if error.kind == ErrorKind::Cancelled {
                                return self.finish_cancelled(wf, Some(error)).await;
                            }
                            return self.finish_failed(wf, error).await;
                        }
                    }
                }
            }
        }
    }

    /// Apply a node's fragment, route to the next node, checkpoint.
    /// Returns false when the workflow turned terminal under us.
    async fn complete_node(
        &self,
        wf: &mut Workflow,
        node: Node,
        fragment: Value,
        attempts: u32,
        retries: BTreeMap<&'static str, u32>,
        transient: Vec<ErrorEntry>,
    ) -> Result<bool, EngineError> {
        let risk = if node == Node::RiskScore {
            serde_json::from_value::<RiskFragment>(fragment.clone())
                .ok()
                .map(|f| f.risk_score)
        } else {
            None
        };

        let route = dag::route_after(node, risk.or(wf.risk_score), self.cfg.review_threshold);
        let next = match route {
            Route::Next(next) => Some(next),
            Route::Review => Some(Node::AwaitReview),
            Route::Done => None,
        };

        let applied = self
            .persist(wf, |w| {
                w.results.insert(node.name().to_string(), fragment.clone());
                w.errors.extend(transient.clone());
                for (name, count) in &retries {
                    *w.retry_counts.entry((*name).to_string()).or_insert(0) += count;
                }
                if let Some(risk) = risk {
                    w.risk_score = Some(risk);
                }
                w.current_node = next;
            })
            .await?;
        if !applied {
            return Ok(false);
        }

        let checkpoint = Checkpoint {
            workflow_id: wf.workflow_id,
            node,
            attempt: attempts,
            snapshot: wf.clone(),
            at: Utc::now(),
        };
        self.store.save_checkpoint(&checkpoint).await?;
        debug!(workflow_id = %wf.workflow_id, %node, "checkpointed");

        if let Some(risk) = risk {
            self.emit_event(NotificationEvent::workflow(
                NotificationKind::RiskScored,
                wf.workflow_id,
                json!({ "risk_score": risk }),
            ))
            .await;
        }

        Ok(true)
    }

    // ------------------------------------------------------------------
    // Per-claim fan-out and merge
    // ------------------------------------------------------------------

    /// Run the per-claim sub-pipelines with bounded parallelism and merge
    /// their outputs in claim order.
    async fn fan_out_merge(
        &self,
        wf: &Workflow,
        probe: &CancelProbe,
    ) -> Result<FanOut, EngineError> {
        let claims: ClaimsFragment = match wf.result(Node::ClaimExtract) {
            Some(fragment) => serde_json::from_value(fragment.clone())?,
            None => ClaimsFragment { claims: Vec::new() },
        };

        // zero claims is not a failure; the pipeline continues to risk
        if claims.claims.is_empty() {
            let fragment = serde_json::to_value(MergeFragment {
                verdicts: Vec::new(),
            })?;
            return Ok(FanOut::Merged {
                fragment,
                retries: BTreeMap::new(),
                errors: Vec::new(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.cfg.claim_parallelism));
        let mut handles = Vec::with_capacity(claims.claims.len());

        for claim in claims.claims.iter().cloned() {
            let semaphore = semaphore.clone();
            let runtime = self.runtime.clone();
            let stages = self.stages.clone();
            let probe = probe.clone();
            let base = self.stage_context(wf, None);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_claim_pipeline(&runtime, &stages, base, claim, &probe).await
            }));
        }

        let mut slots: Vec<Option<ClaimTaskResult>> = Vec::new();
        slots.resize_with(handles.len(), || None);
        for (idx, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(result) => slots[idx] = Some(result),
                Err(join_err) => {
                    slots[idx] = Some(ClaimTaskResult {
                        partial: BTreeMap::new(),
                        transient: Vec::new(),
                        retries: BTreeMap::new(),
                        failure: Some(ErrorEntry {
                            node: Node::ClaimMerge,
                            kind: ErrorKind::Retryable,
                            detail: format!("claim task died: {join_err}"),
                            attempt: 1,
                            at: Utc::now(),
                        }),
                    });
                }
            }
        }

        let mut verdicts = Vec::with_capacity(claims.claims.len());
        let mut errors = Vec::new();
        let mut retries: BTreeMap<&'static str, u32> = BTreeMap::new();
        let mut failed = 0usize;
        let mut cancelled = false;

        for (claim, slot) in claims.claims.iter().zip(slots.into_iter()) {
            let Some(result) = slot else { continue };
            errors.extend(result.transient);
            for (name, count) in result.retries {
                *retries.entry(name).or_insert(0) += count;
            }
            if let Some(failure) = &result.failure {
                failed += 1;
                cancelled |= failure.kind == ErrorKind::Cancelled;
                errors.push(failure.clone());
            }
            verdicts.push(build_verdict(claim, &result.partial, result.failure.as_ref()));
        }

        if cancelled {
            return Ok(FanOut::Cancelled(errors));
        }
        if failed == claims.claims.len() {
            return Ok(FanOut::AllFailed(errors));
        }

        let fragment = serde_json::to_value(MergeFragment { verdicts })?;
        Ok(FanOut::Merged {
            fragment,
            retries,
            errors,
        })
    }

    // ------------------------------------------------------------------
    // Terminal and parking transitions
    // ------------------------------------------------------------------

    async fn park_for_review(&self, mut wf: Workflow) -> Result<Disposition, EngineError> {
        let requested_at = Utc::now();
        if !self
            .persist(&mut wf, |w| {
                w.status = WorkflowStatus::AwaitingReview;
                w.review.requested_at = Some(requested_at);
            })
            .await?
        {
            return Ok(Disposition::Processed);
        }
        self.store
            .review_enqueue(&wf.workflow_id, requested_at)
            .await?;
        self.store.release_owner(&wf.workflow_id).await?;

        let risk = wf.risk_score.unwrap_or_default();
        info!(workflow_id = %wf.workflow_id, risk, "parked for review");
        self.try_publish_alert(&wf, "review_requested", Severity::Warn, {
            format!("risk {risk:.2} meets review threshold")
        })
        .await;
        self.emit_status(&wf).await;
        self.emit_event(NotificationEvent::workflow(
            NotificationKind::ReviewRequested,
            wf.workflow_id,
            json!({ "risk_score": risk }),
        ))
        .await;

        Ok(Disposition::Parked)
    }

    async fn finish_completed(&self, mut wf: Workflow) -> Result<Disposition, EngineError> {
        if !self
            .persist(&mut wf, |w| {
                w.status = WorkflowStatus::Completed;
                w.current_node = None;
            })
            .await?
        {
            return Ok(Disposition::Processed);
        }
        self.store.release_owner(&wf.workflow_id).await?;
        info!(workflow_id = %wf.workflow_id, "workflow completed");

        if let Some(published) = wf.result(Node::Publish).cloned() {
            let message = NotificationMessage {
                workflow_id: wf.workflow_id,
                kind: "advisory_published".to_string(),
                recipient_scope: "advisories".to_string(),
                payload: published,
                at: Utc::now(),
            };
            self.try_publish_notification(message).await;
        }

        self.emit_status(&wf).await;
        self.emit_event(NotificationEvent::workflow(
            NotificationKind::Completed,
            wf.workflow_id,
            json!({}),
        ))
        .await;
        Ok(Disposition::Processed)
    }

    /// Terminal failure disposition for a node-level error.
    pub(crate) async fn finish_failed(
        &self,
        mut wf: Workflow,
        entry: ErrorEntry,
    ) -> Result<Disposition, EngineError> {
        let kind = entry.kind;
        let node = entry.node;
        if !self
            .persist(&mut wf, |w| {
                w.errors.push(entry.clone());
                w.status = WorkflowStatus::Failed;
                w.current_node = None;
            })
            .await?
        {
            return Ok(Disposition::Processed);
        }
        self.store.review_dequeue(&wf.workflow_id).await?;
        self.store.release_owner(&wf.workflow_id).await?;
        warn!(workflow_id = %wf.workflow_id, %node, kind = kind.code(), "workflow failed");

        let severity = if wf.risk_score.unwrap_or_default() > 0.8 {
            Severity::Critical
        } else {
            Severity::Warn
        };
        self.try_publish_alert(
            &wf,
            "workflow_failed",
            severity,
            format!("failed at {node}: {}", kind.code()),
        )
        .await;
        self.emit_status(&wf).await;
        self.emit_event(NotificationEvent::workflow(
            NotificationKind::Failed,
            wf.workflow_id,
            json!({ "kind": kind.code(), "node": node.name() }),
        ))
        .await;
        Ok(Disposition::Processed)
    }

    async fn finish_cancelled(
        &self,
        mut wf: Workflow,
        entry: Option<ErrorEntry>,
    ) -> Result<Disposition, EngineError> {
        if !self
            .persist(&mut wf, |w| {
                if let Some(entry) = &entry {
                    w.errors.push(entry.clone());
                }
                w.status = WorkflowStatus::Cancelled;
                w.current_node = None;
            })
            .await?
        {
            return Ok(Disposition::Processed);
        }
        self.store.review_dequeue(&wf.workflow_id).await?;
        self.store.release_owner(&wf.workflow_id).await?;
        info!(workflow_id = %wf.workflow_id, "workflow cancelled");
        self.emit_status(&wf).await;
        Ok(Disposition::Processed)
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn stage_context(&self, wf: &Workflow, claim: Option<ClaimWork>) -> StageContext {
        StageContext {
            workflow_id: wf.workflow_id,
            item: wf.item.clone(),
            results: wf.results.clone(),
            claim,
        }
    }

    /// CAS-write a mutation of `wf`, re-reading and re-applying on
    /// conflict. Returns false when the workflow turned terminal under us.
    async fn persist<F>(&self, wf: &mut Workflow, mutate: F) -> Result<bool, EngineError>
    where
        F: Fn(&mut Workflow),
    {
        for _ in 0..CAS_ATTEMPTS {
            let mut candidate = wf.clone();
            mutate(&mut candidate);
            if candidate.status != wf.status && !wf.status.can_transition(candidate.status) {
                return Err(EngineError::InvalidTransition {
                    workflow_id: wf.workflow_id,
                    from: wf.status,
                    to: candidate.status,
                });
            }
            match self.store.update(&candidate).await {
                Ok(saved) => {
                    *wf = saved;
                    return Ok(true);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    match self.store.load(&wf.workflow_id).await? {
                        Some(fresh) if fresh.status.is_terminal() => {
                            *wf = fresh;
                            return Ok(false);
                        }
                        Some(fresh) => *wf = fresh,
                        None => {
                            return Err(EngineError::ConsistencyLost {
                                workflow_id: wf.workflow_id,
                            });
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::ConsistencyLost {
            workflow_id: wf.workflow_id,
        })
    }

    async fn emit_status(&self, wf: &Workflow) {
        self.emit_event(NotificationEvent::workflow(
            NotificationKind::StatusChanged,
            wf.workflow_id,
            json!({
                "status": wf.status.as_str(),
                "node": wf.current_node.map(|n| n.name()),
            }),
        ))
        .await;
    }

    pub(crate) async fn emit_event(&self, event: NotificationEvent) {
        if let Err(e) = self.store.publish_event(&event).await {
            warn!(error = %e, "event publish failed");
        }
    }

    async fn try_publish_alert(
        &self,
        wf: &Workflow,
        kind: &str,
        severity: Severity,
        summary: String,
    ) {
        let message = AlertMessage {
            workflow_id: wf.workflow_id,
            kind: kind.to_string(),
            severity,
            summary,
            at: Utc::now(),
        };
        match serde_json::to_vec(&message) {
            Ok(blob) => {
                if let Err(e) = self
                    .bus
                    .publish(Topic::Alerts, &wf.workflow_id.to_string(), &blob)
                    .await
                {
                    warn!(error = %e, "alert publish failed");
                }
            }
            Err(e) => warn!(error = %e, "alert encode failed"),
        }
    }

    async fn try_publish_notification(&self, message: NotificationMessage) {
        match serde_json::to_vec(&message) {
            Ok(blob) => {
                if let Err(e) = self
                    .bus
                    .publish(Topic::Notifications, &message.recipient_scope, &blob)
                    .await
                {
                    warn!(error = %e, "notification publish failed");
                }
            }
            Err(e) => warn!(error = %e, "notification encode failed"),
        }
    }
}

/// Run topic -> evidence -> veracity for one claim.
async fn run_claim_pipeline(
    runtime: &NodeRuntime,
    stages: &StageSet,
    base: StageContext,
    claim: Claim,
    probe: &CancelProbe,
) -> ClaimTaskResult {
    let mut partial: BTreeMap<String, Value> = BTreeMap::new();
    let mut transient = Vec::new();
    let mut retries: BTreeMap<&'static str, u32> = BTreeMap::new();

    for node in dag::CLAIM_PIPELINE {
        let mut ctx = base.clone();
        ctx.claim = Some(ClaimWork {
            claim: claim.clone(),
            partial: partial.clone(),
        });
        match runtime.execute(stages, node, &ctx, probe).await {
            Ok(NodeSuccess {
                value,
                attempts,
                transient: absorbed,
            }) => {
                transient.extend(absorbed);
                if attempts > 1 {
                    *retries.entry(node.name()).or_insert(0) += attempts - 1;
                }
                partial.insert(node.name().to_string(), value);
            }
            Err(NodeFailure {
                error,
                transient: absorbed,
            }) => {
                transient.extend(absorbed);
                let retry_count = error.attempt.saturating_sub(1);
                if retry_count > 0 {
                    *retries.entry(node.name()).or_insert(0) += retry_count;
                }
                return ClaimTaskResult {
                    partial,
                    transient,
                    retries,
                    failure: Some(error),
                };
            }
        }
    }

    ClaimTaskResult {
        partial,
        transient,
        retries,
        failure: None,
    }
}

fn build_verdict(
    claim: &Claim,
    partial: &BTreeMap<String, Value>,
    failure: Option<&ErrorEntry>,
) -> ClaimVerdict {
    let topic = partial
        .get(Node::TopicAssign.name())
        .and_then(|v| v.get("topic"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let evidence: Vec<Evidence> = partial
        .get(Node::EvidenceRetrieve.name())
        .and_then(|v| v.get("evidence"))
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let veracity_likelihood = partial
        .get(Node::VeracityAssess.name())
        .and_then(|v| v.get("veracity_likelihood"))
        .and_then(Value::as_f64)
        .unwrap_or(VERACITY_PRIOR);

    ClaimVerdict {
        claim_id: claim.claim_id.clone(),
        topic,
        evidence,
        veracity_likelihood,
        risk_score: 0.0,
        error: failure.map(|e| StageFailure {
            node: e.node,
            kind: e.kind,
            detail: e.detail.clone(),
        }),
    }
}
