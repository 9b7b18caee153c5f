// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Veriflow Stages - the fixed pipeline stage set
//!
//! Each stage is a pure function from workflow state to a result fragment.
//! Stages never touch the state store or the bus; durability, retry,
//! timeout and error recording belong to the node runtime in
//! `veriflow-engine`. A stage invoked twice with the same input returns the
//! same fragment, which is what makes crash-replay safe.
//!
//! External predicates (evidence search, advisory drafting, translation)
//! sit behind the single-method [`Collaborator`] contract so deployments
//! can wire real services while tests wire deterministic ones.

#![deny(missing_docs)]

/// Collaborator contract and deterministic default implementations.
pub mod collaborators;

/// Digestion stages: entities, claims, topics, evidence, veracity, risk.
pub mod digestion;

/// Normalization stage.
pub mod normalize;

/// Publishing stages: advisory drafting, translation, publication.
pub mod publishing;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use veriflow_core::error::StageError;
use veriflow_core::model::{Claim, Evidence, Node, RawItem};

pub use collaborators::Collaborator;

/// Input handed to a stage: the immutable item plus every fragment written
/// so far, and the claim under work for per-claim stages.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Owning workflow.
    pub workflow_id: Uuid,
    /// The immutable input item.
    pub item: RawItem,
    /// Fragments written by completed nodes, keyed by node name.
    pub results: BTreeMap<String, Value>,
    /// Set only inside the per-claim fan-out region.
    pub claim: Option<ClaimWork>,
}

impl StageContext {
    /// Fragment of a completed node, or a validation error if missing.
    pub fn require(&self, node: Node) -> Result<&Value, StageError> {
        self.results
            .get(node.name())
            .ok_or_else(|| StageError::validation(format!("missing {} fragment", node.name())))
    }

    /// The claim under work, or a validation error outside the fan-out.
    pub fn require_claim(&self) -> Result<&ClaimWork, StageError> {
        self.claim
            .as_ref()
            .ok_or_else(|| StageError::validation("claim stage invoked without a claim"))
    }
}

/// One claim plus the fragments its earlier sub-pipeline stages produced.
#[derive(Debug, Clone)]
pub struct ClaimWork {
    /// The claim being verified.
    pub claim: Claim,
    /// Accumulated per-claim fragments, keyed by node name.
    pub partial: BTreeMap<String, Value>,
}

/// A pipeline stage. Pure: no side effects, same input same output.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Produce this stage's result fragment.
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError>;
}

/// Fragment written by the normalize stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeFragment {
    /// Cleaned-up title.
    pub title: Option<String>,
    /// Cleaned-up body.
    pub text: Option<String>,
    /// Title and body joined for downstream stages.
    pub combined: String,
    /// Detected (or hinted) language, `unknown` when neither resolves.
    pub language: String,
}

/// Fragment written by the claim extraction stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimsFragment {
    /// Claims in extraction order; the fan-out preserves this order.
    pub claims: Vec<Claim>,
}

/// Fragment written by the per-claim evidence stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceFragment {
    /// Retrieved evidence.
    pub evidence: Vec<Evidence>,
}

/// Fragment written by the merge node: per-claim verdicts in extraction
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeFragment {
    /// One verdict per extracted claim, ordered by claim index.
    pub verdicts: Vec<veriflow_core::model::ClaimVerdict>,
}

/// Fragment written by the risk stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFragment {
    /// Workflow-level risk in `[0, 1]`.
    pub risk_score: f64,
    /// Per-claim risk contributions.
    pub claim_risks: BTreeMap<String, f64>,
}

/// The full stage set, one implementation per node.
///
/// Built once by the supervisor and shared by every worker. Tests swap
/// individual stages to inject failures.
pub struct StageSet {
    stages: BTreeMap<Node, Arc<dyn Stage>>,
}

impl StageSet {
    /// The built-in heuristic stage set with deterministic collaborators.
    pub fn builtin(translate_languages: Vec<String>) -> Self {
        let mut stages: BTreeMap<Node, Arc<dyn Stage>> = BTreeMap::new();
        stages.insert(Node::Normalize, Arc::new(normalize::NormalizeStage));
        stages.insert(Node::EntityExtract, Arc::new(digestion::EntityExtractStage));
        stages.insert(Node::ClaimExtract, Arc::new(digestion::ClaimExtractStage));
        stages.insert(Node::TopicAssign, Arc::new(digestion::TopicAssignStage));
        stages.insert(
            Node::EvidenceRetrieve,
            Arc::new(digestion::EvidenceRetrieveStage::new(Arc::new(
                collaborators::NeutralEvidenceProvider,
            ))),
        );
        stages.insert(Node::VeracityAssess, Arc::new(digestion::VeracityAssessStage));
        stages.insert(Node::RiskScore, Arc::new(digestion::RiskScoreStage));
        stages.insert(
            Node::DraftAdvisory,
            Arc::new(publishing::DraftAdvisoryStage::new(Arc::new(
                collaborators::TemplateAdvisoryWriter,
            ))),
        );
        stages.insert(
            Node::Translate,
            Arc::new(publishing::TranslateStage::new(
                Arc::new(collaborators::EchoTranslator),
                translate_languages,
            )),
        );
        stages.insert(Node::Publish, Arc::new(publishing::PublishStage));
        Self { stages }
    }

    /// Replace one stage, keeping the rest. Used by tests and deployments
    /// that wire real collaborators.
    pub fn with_stage(mut self, node: Node, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(node, stage);
        self
    }

    /// The stage for a node, if one exists. `ClaimMerge` and `AwaitReview`
    /// are orchestrator-internal and have no stage.
    pub fn stage(&self, node: Node) -> Option<&Arc<dyn Stage>> {
        self.stages.get(&node)
    }
}
