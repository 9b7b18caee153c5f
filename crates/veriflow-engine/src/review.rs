// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Review coordinator: the operator surface over parked workflows.
//!
//! Maintains the time-ordered pending index, hands out short operator
//! leases, ingests decisions and drives the decision transition. Decisions
//! are announced on the store's event channel so orchestrators resume
//! without polling.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use veriflow_core::bus::{AlertMessage, EventBus, Severity, Topic};
use veriflow_core::config::Config;
use veriflow_core::error::StoreError;
use veriflow_core::model::{
    Node, NotificationEvent, NotificationKind, ReviewDecision, ReviewLease, ReviewTask, Workflow,
    WorkflowStatus,
};
use veriflow_core::store::WorkflowStore;

use crate::error::{EngineError, OperatorError};

/// Listing filter for the pending queue.
#[derive(Debug, Clone, Default)]
pub struct ReviewFilter {
    /// Only tasks from this ingestion source.
    pub source: Option<String>,
    /// Only tasks at or above this risk.
    pub min_risk: Option<f64>,
}

/// Listing page.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Entries to skip.
    pub offset: usize,
    /// Maximum entries to return.
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Repeat interval for overdue reminders once the review deadline passed.
const REMINDER_INTERVAL: Duration = Duration::from_secs(3600);

const CAS_ATTEMPTS: usize = 3;

/// Coordinates human review of high-risk workflows.
pub struct ReviewCoordinator {
    cfg: Arc<Config>,
    store: WorkflowStore,
    bus: Arc<dyn EventBus>,
}

impl ReviewCoordinator {
    /// Coordinator over the given store and bus.
    pub fn new(cfg: Arc<Config>, store: WorkflowStore, bus: Arc<dyn EventBus>) -> Self {
        Self { cfg, store, bus }
    }

    /// Page through the pending review queue, oldest request first.
    pub async fn list(
        &self,
        filter: &ReviewFilter,
        page: Page,
    ) -> Result<Vec<ReviewTask>, OperatorError> {
        let index = self.store.review_pending().await?;
        let mut tasks = Vec::new();
        for (requested_at, workflow_id) in index {
            let Some(wf) = self.store.load(&workflow_id).await? else {
                continue;
            };
            if wf.status != WorkflowStatus::AwaitingReview {
                continue;
            }
            let risk = wf.risk_score.unwrap_or_default();
            if let Some(min) = filter.min_risk
                && risk < min
            {
                continue;
            }
            if let Some(source) = &filter.source
                && &wf.item.source != source
            {
                continue;
            }
            tasks.push(ReviewTask {
                workflow_id,
                source: wf.item.source.clone(),
                risk_score: risk,
                requested_at,
                summary: summary_of(&wf),
                claimed_by: live_lease(&wf).map(|lease| lease.operator.clone()),
            });
        }
        Ok(tasks
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    /// Claim a parked workflow for an operator.
    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    pub async fn claim(
        &self,
        workflow_id: &Uuid,
        operator: &str,
    ) -> Result<ReviewLease, OperatorError> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut wf) = self.store.load(workflow_id).await? else {
                return Err(OperatorError::NotFound {
                    workflow_id: *workflow_id,
                });
            };
            if wf.status != WorkflowStatus::AwaitingReview {
                return Err(OperatorError::NotAwaitingReview { status: wf.status });
            }
            if let Some(lease) = live_lease(&wf)
                && lease.operator != operator
            {
                return Err(OperatorError::AlreadyClaimed {
                    operator: lease.operator.clone(),
                });
            }

            let lease = ReviewLease {
                token: Uuid::new_v4(),
                operator: operator.to_string(),
                expires_at: Utc::now()
                    + chrono::TimeDelta::from_std(self.cfg.review_lease)
                        .unwrap_or_else(|_| chrono::TimeDelta::minutes(30)),
            };
            wf.review.lease = Some(lease.clone());
            match self.store.update(&wf).await {
                Ok(_) => {
                    info!(operator, "review claimed");
                    return Ok(lease);
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OperatorError::Internal(EngineError::ConsistencyLost {
            workflow_id: *workflow_id,
        }))
    }

    /// Ingest an operator decision.
    ///
    /// `approve` routes the workflow back into the publishing tail;
    /// `reject` completes it with a terminal annotation and publishes
    /// nothing downstream; `needs_investigation` cancels it pending human
    /// action elsewhere.
    #[instrument(skip(self, lease_token, feedback), fields(workflow_id = %workflow_id))]
    pub async fn decide(
        &self,
        workflow_id: &Uuid,
        lease_token: &Uuid,
        decision: ReviewDecision,
        feedback: Option<String>,
    ) -> Result<(), OperatorError> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(mut wf) = self.store.load(workflow_id).await? else {
                return Err(OperatorError::NotFound {
                    workflow_id: *workflow_id,
                });
            };
            if wf.status != WorkflowStatus::AwaitingReview {
                return Err(OperatorError::NotAwaitingReview { status: wf.status });
            }
            let Some(lease) = live_lease(&wf) else {
                return Err(OperatorError::LeaseInvalid);
            };
            if &lease.token != lease_token {
                return Err(OperatorError::LeaseInvalid);
            }
            let operator = lease.operator.clone();
            let decided_at = Utc::now();

            wf.review.decision = Some(decision);
            wf.review.decided_by = Some(operator.clone());
            wf.review.feedback = feedback.clone();
            wf.review.lease = None;
            wf.results.insert(
                Node::AwaitReview.name().to_string(),
                json!({
                    "decision": decision.as_str(),
                    "decided_by": operator,
                    "feedback": feedback,
                    "decided_at": decided_at.to_rfc3339(),
                }),
            );
            match decision {
                ReviewDecision::Approve => {
                    wf.status = WorkflowStatus::Resuming;
                    wf.current_node = Some(Node::DraftAdvisory);
                    // time spent parked does not count against the
                    // workflow deadline
                    if let Some(requested_at) = wf.review.requested_at {
                        wf.deadline += decided_at - requested_at;
                    }
                }
                ReviewDecision::Reject => {
                    wf.status = WorkflowStatus::Completed;
                    wf.current_node = None;
                }
                ReviewDecision::NeedsInvestigation => {
                    wf.status = WorkflowStatus::Cancelled;
                    wf.current_node = None;
                }
            }

            match self.store.update(&wf).await {
                Ok(saved) => {
                    self.store.review_dequeue(workflow_id).await?;
                    info!(
                        decision = decision.as_str(),
                        operator = %operator,
                        "review decided"
                    );
                    self.announce_decision(&saved, decision, &operator).await;
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OperatorError::Internal(EngineError::ConsistencyLost {
            workflow_id: *workflow_id,
        }))
    }

    /// Request cancellation of a workflow.
    ///
    /// A parked workflow is cancelled immediately; a running one observes
    /// the tombstone at its next node boundary.
    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    pub async fn cancel(&self, workflow_id: &Uuid) -> Result<(), OperatorError> {
        let Some(mut wf) = self.store.load(workflow_id).await? else {
            return Err(OperatorError::NotFound {
                workflow_id: *workflow_id,
            });
        };
        if wf.status.is_terminal() {
            return Err(OperatorError::Terminal { status: wf.status });
        }

        self.store.request_cancel(workflow_id).await?;

        if wf.status == WorkflowStatus::AwaitingReview {
            wf.status = WorkflowStatus::Cancelled;
            wf.current_node = None;
            match self.store.update(&wf).await {
                Ok(saved) => {
                    self.store.review_dequeue(workflow_id).await?;
                    self.emit(NotificationEvent::workflow(
                        NotificationKind::StatusChanged,
                        saved.workflow_id,
                        json!({ "status": saved.status.as_str(), "node": null }),
                    ))
                    .await;
                }
                // someone decided concurrently; the tombstone still stands
                Err(StoreError::VersionConflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Workflow snapshot for the status surface.
    pub async fn status(&self, workflow_id: &Uuid) -> Result<Workflow, OperatorError> {
        self.store
            .load(workflow_id)
            .await?
            .ok_or(OperatorError::NotFound {
                workflow_id: *workflow_id,
            })
    }

    /// One reminder sweep over overdue reviews. Returns how many alerts
    /// were emitted.
    pub async fn remind_overdue(&self) -> Result<u32, EngineError> {
        let now = Utc::now();
        let overdue_after = chrono::TimeDelta::from_std(self.cfg.review_deadline)
            .unwrap_or_else(|_| chrono::TimeDelta::hours(24));
        let repeat_after = chrono::TimeDelta::from_std(REMINDER_INTERVAL)
            .unwrap_or_else(|_| chrono::TimeDelta::hours(1));

        let mut emitted = 0;
        for mut wf in self.store.list_awaiting_review().await? {
            let Some(requested_at) = wf.review.requested_at else {
                continue;
            };
            if now - requested_at < overdue_after {
                continue;
            }
            if let Some(last) = wf.review.last_reminder_at
                && now - last < repeat_after
            {
                continue;
            }

            wf.review.last_reminder_at = Some(now);
            match self.store.update(&wf).await {
                Ok(_) => {}
                // another process reminded first
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }

            let message = AlertMessage {
                workflow_id: wf.workflow_id,
                kind: "review_reminder".to_string(),
                severity: Severity::Warn,
                summary: format!(
                    "awaiting review since {}",
                    requested_at.to_rfc3339()
                ),
                at: now,
            };
            match serde_json::to_vec(&message) {
                Ok(blob) => {
                    if let Err(e) = self
                        .bus
                        .publish(Topic::Alerts, &wf.workflow_id.to_string(), &blob)
                        .await
                    {
                        warn!(error = %e, "reminder publish failed");
                    } else {
                        emitted += 1;
                    }
                }
                Err(e) => warn!(error = %e, "reminder encode failed"),
            }
        }
        Ok(emitted)
    }

    /// Periodic reminder worker, owned by the supervisor.
    pub async fn run_reminders(self: Arc<Self>, shutdown: Arc<Notify>) {
        let poll = Duration::from_secs(60);
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("reminder worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(poll) => {
                    if let Err(e) = self.remind_overdue().await {
                        warn!(error = %e, "reminder sweep failed");
                    }
                }
            }
        }
    }

    async fn announce_decision(
        &self,
        wf: &Workflow,
        decision: ReviewDecision,
        operator: &str,
    ) {
        self.emit(NotificationEvent::workflow(
            NotificationKind::ReviewDecided,
            wf.workflow_id,
            json!({
                "decision": decision.as_str(),
                "decided_by": operator,
            }),
        ))
        .await;
        self.emit(NotificationEvent::workflow(
            NotificationKind::StatusChanged,
            wf.workflow_id,
            json!({
                "status": wf.status.as_str(),
                "node": wf.current_node.map(|n| n.name()),
            }),
        ))
        .await;
    }

    async fn emit(&self, event: NotificationEvent) {
        if let Err(e) = self.store.publish_event(&event).await {
            warn!(error = %e, "event publish failed");
        }
    }
}

fn live_lease(wf: &Workflow) -> Option<&ReviewLease> {
    wf.review
        .lease
        .as_ref()
        .filter(|lease| lease.expires_at > Utc::now())
}

fn summary_of(wf: &Workflow) -> String {
    let payload = &wf.item.payload;
    payload
        .title
        .clone()
        .or_else(|| {
            payload
                .text
                .as_ref()
                .map(|t| t.chars().take(80).collect::<String>())
        })
        .unwrap_or_else(|| wf.source_id.clone())
}
