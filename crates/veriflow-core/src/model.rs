// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model for the verification pipeline.
//!
//! The [`Workflow`] record is the single authoritative entity. It is
//! persisted as a JSON blob in the state store with its `version` field
//! first; every status transition goes through CAS on that version.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Namespace for deriving deterministic workflow ids from `source_id`.
///
/// Two deliveries of the same raw item always map to the same workflow.
pub const WORKFLOW_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x1f, 0x0c, 0x4e, 0x9d, 0x2a, 0x4f, 0x7b, 0x8c, 0x3d, 0x5e, 0x6f, 0x70, 0x81, 0x92, 0xa3,
]);

/// Derive the workflow id for a raw item.
pub fn workflow_id_for(source_id: &str) -> Uuid {
    Uuid::new_v5(&WORKFLOW_NAMESPACE, source_id.as_bytes())
}

/// A media reference carried by a raw item. Bytes live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Where the media can be fetched from.
    pub url: String,
    /// image, video or audio.
    pub kind: String,
}

/// Opaque-ish payload of a raw item. The orchestrator never interprets it;
/// stages do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPayload {
    /// Headline, if the source had one.
    #[serde(default)]
    pub title: Option<String>,
    /// Body text.
    #[serde(default)]
    pub text: Option<String>,
    /// Canonical URL of the item.
    #[serde(default)]
    pub url: Option<String>,
    /// Language hint from the ingestion adapter, used when detection is
    /// inconclusive.
    #[serde(default)]
    pub language_hint: Option<String>,
    /// Attached media references.
    #[serde(default)]
    pub media: Vec<MediaRef>,
}

/// Externally produced input, immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Stable identity across redeliveries.
    pub source_id: String,
    /// Ingestion source (gdelt, reddit, youtube, ...).
    pub source: String,
    /// Text and media references.
    pub payload: ItemPayload,
    /// When the ingestion adapter first saw the item.
    pub ingested_at: DateTime<Utc>,
}

/// Pipeline stages, closed set. The DAG routes over these exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    /// Whitespace/language normalization of the raw payload.
    Normalize,
    /// Named entity extraction.
    EntityExtract,
    /// Claim sentence extraction; branches the pipeline into per-claim work.
    ClaimExtract,
    /// Per-claim: topic assignment.
    TopicAssign,
    /// Per-claim: evidence retrieval.
    EvidenceRetrieve,
    /// Per-claim: veracity assessment against evidence.
    VeracityAssess,
    /// Deterministic merge of per-claim results, in extraction order.
    ClaimMerge,
    /// Workflow-level risk scoring.
    RiskScore,
    /// Human-review parking spot for high-risk items.
    AwaitReview,
    /// Advisory drafting from merged verdicts.
    DraftAdvisory,
    /// Advisory translation into the configured language set.
    Translate,
    /// Final publication fragment.
    Publish,
}

impl Node {
    /// Short name used as the `results`/`retry_counts` key and in store keys.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::EntityExtract => "entity",
            Self::ClaimExtract => "claims",
            Self::TopicAssign => "topic",
            Self::EvidenceRetrieve => "evidence",
            Self::VeracityAssess => "veracity",
            Self::ClaimMerge => "merge",
            Self::RiskScore => "risk",
            Self::AwaitReview => "review",
            Self::DraftAdvisory => "draft",
            Self::Translate => "translate",
            Self::Publish => "publish",
        }
    }

    /// Whether this node runs inside the per-claim fan-out region.
    pub fn is_claim_stage(&self) -> bool {
        matches!(
            self,
            Self::TopicAssign | Self::EvidenceRetrieve | Self::VeracityAssess
        )
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not yet claimed by a worker.
    Pending,
    /// A worker is driving nodes.
    Running,
    /// Parked for a human decision.
    AwaitingReview,
    /// Decision received, first post-review node not yet started.
    Resuming,
    /// Terminal: published (or review-rejected with annotation).
    Completed,
    /// Terminal: a node failed terminally.
    Failed,
    /// Terminal: externally cancelled.
    Cancelled,
}

impl WorkflowStatus {
    /// Stable string form, also used in store blobs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingReview => "awaiting_review",
            Self::Resuming => "resuming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states reject every further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> to` is a legal edge of the status machine.
    ///
    /// `AwaitingReview -> Completed` covers review rejection (terminal
    /// annotation, no downstream publish); `AwaitingReview -> Cancelled`
    /// covers a needs-investigation decision. Any non-terminal state may be
    /// cancelled.
    pub fn can_transition(&self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (*self, to) {
            (Pending, Running)
            | (Running, Running)
            | (Running, AwaitingReview)
            | (Running, Completed)
            | (Running, Failed)
            | (AwaitingReview, Resuming)
            | (AwaitingReview, Completed)
            | (Resuming, Running)
            | (Resuming, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended error record. The list on the workflow is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Node the failure occurred in.
    pub node: Node,
    /// Classified kind.
    pub kind: ErrorKind,
    /// Non-sensitive detail.
    pub detail: String,
    /// Attempt number the failure happened on (1-based).
    pub attempt: u32,
    /// When the failure was observed.
    pub at: DateTime<Utc>,
}

/// Operator decision on a parked workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Continue through the publishing tail.
    Approve,
    /// Complete with a terminal annotation; nothing is published.
    Reject,
    /// Cancel pending human action elsewhere.
    NeedsInvestigation,
}

impl ReviewDecision {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::NeedsInvestigation => "needs_investigation",
        }
    }
}

/// Short operator lease preventing double decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewLease {
    /// Opaque token the operator must present on decide.
    pub token: Uuid,
    /// Who holds the lease.
    pub operator: String,
    /// When the lease stops being valid.
    pub expires_at: DateTime<Utc>,
}

/// Human-review bookkeeping on a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Set when the workflow parks in `AwaitingReview`.
    pub requested_at: Option<DateTime<Utc>>,
    /// The operator decision, once made.
    pub decision: Option<ReviewDecision>,
    /// Who decided.
    pub decided_by: Option<String>,
    /// Free-form operator feedback.
    pub feedback: Option<String>,
    /// Active operator lease, if claimed.
    pub lease: Option<ReviewLease>,
    /// Last overdue reminder emitted on `alerts`.
    pub last_reminder_at: Option<DateTime<Utc>>,
}

/// The central durable record tracking one raw item through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// CAS version; must stay the first field of the persisted blob.
    pub version: u64,
    /// Deterministic id derived from `source_id`.
    pub workflow_id: Uuid,
    /// Dedup key of the underlying item.
    pub source_id: String,
    /// Lifecycle status; transitions are CAS-guarded.
    pub status: WorkflowStatus,
    /// Next node to run, `None` once terminal.
    pub current_node: Option<Node>,
    /// The immutable input.
    pub item: RawItem,
    /// Per-node result fragments, written exactly once per successful run.
    pub results: BTreeMap<String, Value>,
    /// Append-only failure log.
    pub errors: Vec<ErrorEntry>,
    /// Retries consumed per node.
    pub retry_counts: BTreeMap<String, u32>,
    /// Set once the risk node completes; in `[0, 1]`.
    pub risk_score: Option<f64>,
    /// Review bookkeeping, when applicable.
    pub review: Review,
    /// Workflow-wide deadline, extended by time spent awaiting review.
    pub deadline: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Fresh pending workflow for a newly claimed item.
    pub fn new(item: RawItem, deadline: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            version: 0,
            workflow_id: workflow_id_for(&item.source_id),
            source_id: item.source_id.clone(),
            status: WorkflowStatus::Pending,
            current_node: Some(Node::Normalize),
            item,
            results: BTreeMap::new(),
            errors: Vec::new(),
            retry_counts: BTreeMap::new(),
            risk_score: None,
            review: Review::default(),
            deadline,
            created_at: now,
            updated_at: now,
        }
    }

    /// Result fragment for a node, if written.
    pub fn result(&self, node: Node) -> Option<&Value> {
        self.results.get(node.name())
    }
}

/// One claim extracted from an item, addressed by extraction order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// `{workflow_id}:{index}`; stable across retries.
    pub claim_id: String,
    /// The claim sentence.
    pub text: String,
    /// Character span in the normalized text.
    pub span: (usize, usize),
    /// How much the claim deserves checking, in `[0, 1]`.
    pub checkworthiness: f64,
    /// Potential for real-world harm, in `[0, 1]`.
    pub harm_potential: f64,
}

/// One piece of retrieved evidence for a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Where the evidence lives.
    pub url: String,
    /// Relevant snippet, if any.
    pub snippet: Option<String>,
    /// Reliability of the source, in `[0, 1]`.
    pub source_reliability: f64,
    /// `-1` refutes, `0` neutral, `1` supports.
    pub support_score: f64,
}

/// Outcome of one per-claim sub-pipeline, merged in claim order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimVerdict {
    /// The claim this verdict is for.
    pub claim_id: String,
    /// Assigned crisis topic.
    pub topic: Option<String>,
    /// Retrieved evidence.
    pub evidence: Vec<Evidence>,
    /// Blended veracity likelihood, in `[0, 1]`.
    pub veracity_likelihood: f64,
    /// Per-claim risk, in `[0, 1]`.
    pub risk_score: f64,
    /// Set when the sub-pipeline failed; the claim is recorded, not fatal.
    pub error: Option<StageFailure>,
}

/// Compact failure note embedded in a claim verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Node the sub-pipeline died in.
    pub node: Node,
    /// Classified kind.
    pub kind: ErrorKind,
    /// Detail.
    pub detail: String,
}

/// Durable record of a node's completion, sufficient to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning workflow.
    pub workflow_id: Uuid,
    /// The node that completed.
    pub node: Node,
    /// Attempt the completion happened on.
    pub attempt: u32,
    /// Full workflow snapshot taken after the node's fragment was applied.
    pub snapshot: Workflow,
    /// When the checkpoint was written.
    pub at: DateTime<Utc>,
}

/// Operator-facing view over workflows parked in `AwaitingReview`.
///
/// A projection of the workflow record; never stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewTask {
    /// The parked workflow.
    pub workflow_id: Uuid,
    /// Ingestion source of the item.
    pub source: String,
    /// Risk that triggered the park.
    pub risk_score: f64,
    /// When review was requested; the listing sort key.
    pub requested_at: DateTime<Utc>,
    /// Item headline or text head, for the queue listing.
    pub summary: String,
    /// Operator currently holding the lease, if any.
    pub claimed_by: Option<String>,
}

/// Observer-plane event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Any status-machine edge.
    StatusChanged,
    /// Risk score was set.
    RiskScored,
    /// Workflow parked for review.
    ReviewRequested,
    /// An operator decided.
    ReviewDecided,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
    /// Subscriber fell behind and events were dropped.
    Lag,
}

/// Transient broadcast event. Never authoritative; observers reconcile
/// against the state store on reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Affected workflow, absent for plane-level markers like `lag`.
    pub workflow_id: Option<Uuid>,
    /// Event-specific payload.
    pub payload: Value,
    /// When the event was produced.
    pub at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Event for a workflow with the given payload.
    pub fn workflow(kind: NotificationKind, workflow_id: Uuid, payload: Value) -> Self {
        Self {
            kind,
            workflow_id: Some(workflow_id),
            payload,
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_id_is_deterministic() {
        assert_eq!(workflow_id_for("abc"), workflow_id_for("abc"));
        assert_ne!(workflow_id_for("abc"), workflow_id_for("abd"));
    }

    #[test]
    fn status_machine_accepts_documented_edges() {
        use WorkflowStatus::*;
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Running));
        assert!(Running.can_transition(AwaitingReview));
        assert!(AwaitingReview.can_transition(Resuming));
        assert!(AwaitingReview.can_transition(Completed));
        assert!(Resuming.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(AwaitingReview.can_transition(Cancelled));
        assert!(Pending.can_transition(Cancelled));
    }

    #[test]
    fn status_machine_rejects_out_of_order_edges() {
        use WorkflowStatus::*;
        assert!(!Pending.can_transition(Completed));
        assert!(!Pending.can_transition(AwaitingReview));
        assert!(!Running.can_transition(Resuming));
        assert!(!Completed.can_transition(Running));
        assert!(!Completed.can_transition(Cancelled));
        assert!(!Failed.can_transition(Cancelled));
        assert!(!Cancelled.can_transition(Running));
        assert!(!Resuming.can_transition(AwaitingReview));
    }

    #[test]
    fn node_names_match_result_keys() {
        assert_eq!(Node::ClaimExtract.name(), "claims");
        assert_eq!(Node::EvidenceRetrieve.name(), "evidence");
        assert_eq!(Node::ClaimMerge.name(), "merge");
        assert!(Node::TopicAssign.is_claim_stage());
        assert!(!Node::RiskScore.is_claim_stage());
    }

    #[test]
    fn version_is_first_field_of_persisted_blob() {
        let item = RawItem {
            source_id: "s".into(),
            source: "test".into(),
            payload: ItemPayload::default(),
            ingested_at: Utc::now(),
        };
        let wf = Workflow::new(item, Utc::now());
        let json = serde_json::to_string(&wf).unwrap();
        assert!(json.starts_with("{\"version\":"));
    }
}
