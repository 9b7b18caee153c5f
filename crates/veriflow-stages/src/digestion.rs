// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Digestion stages: entities, claims, topics, evidence, veracity, risk.
//!
//! The heuristics here are deliberately simple stand-ins for the model
//! predicates a deployment wires through collaborators; what matters for
//! the engine is that they are deterministic and side-effect free.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use veriflow_core::error::StageError;
use veriflow_core::model::{Claim, ClaimVerdict, Evidence, Node};

use crate::collaborators::CollaboratorRef;
use crate::{
    ClaimsFragment, EvidenceFragment, MergeFragment, NormalizeFragment, RiskFragment, Stage,
    StageContext,
};

/// Harm keyword weights, the same table the claim and risk stages share.
const HARM_KEYWORDS: [(&str, f64); 8] = [
    ("dead", 0.9),
    ("killed", 0.9),
    ("trapped", 0.8),
    ("injured", 0.7),
    ("collapsed", 0.7),
    ("flooded", 0.6),
    ("fire", 0.6),
    ("leak", 0.5),
];

fn harm_score(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    HARM_KEYWORDS
        .iter()
        .filter(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, weight)| *weight)
        .fold(0.0, f64::max)
}

fn normalized(ctx: &StageContext) -> Result<NormalizeFragment, StageError> {
    serde_json::from_value(ctx.require(Node::Normalize)?.clone())
        .map_err(|e| StageError::validation(format!("bad normalize fragment: {e}")))
}

// ---------------------------------------------------------------------------
// Entity extraction
// ---------------------------------------------------------------------------

/// Extracts named entities and quantities from the normalized text.
pub struct EntityExtractStage;

#[async_trait]
impl Stage for EntityExtractStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let fragment = normalized(ctx)?;
        let mut entities: Vec<Value> = Vec::new();

        let mut run: Vec<&str> = Vec::new();
        let mut first_token = true;
        for token in fragment.combined.split_whitespace() {
            let word = token.trim_matches(|c: char| !c.is_alphanumeric());
            if word.is_empty() {
                continue;
            }
            let capitalized = word.chars().next().is_some_and(char::is_uppercase)
                && word.chars().skip(1).all(char::is_lowercase)
                && word.len() > 1;
            if capitalized && !first_token {
                run.push(word);
            } else {
                flush_run(&mut run, &mut entities);
                if word.chars().all(|c| c.is_ascii_digit()) {
                    entities.push(json!({"text": word, "kind": "quantity"}));
                }
            }
            first_token = false;
        }
        flush_run(&mut run, &mut entities);

        entities.dedup();
        Ok(json!({ "entities": entities }))
    }
}

fn flush_run(run: &mut Vec<&str>, entities: &mut Vec<Value>) {
    if !run.is_empty() {
        entities.push(json!({"text": run.join(" "), "kind": "name"}));
        run.clear();
    }
}

// ---------------------------------------------------------------------------
// Claim extraction
// ---------------------------------------------------------------------------

/// Splits sentences and keeps the ones that look like checkable claims.
///
/// A sentence qualifies when it carries a harm keyword or a digit and is at
/// least ten characters long. Claim ids are `{workflow_id}:{index}` so
/// re-extraction after a crash yields identical ids.
pub struct ClaimExtractStage;

#[async_trait]
impl Stage for ClaimExtractStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let fragment = normalized(ctx)?;
        let mut claims = Vec::new();

        for (start, end) in sentence_spans(&fragment.combined) {
            let sentence: String = fragment
                .combined
                .chars()
                .skip(start)
                .take(end - start)
                .collect();
            let sentence = sentence.trim();
            if sentence.chars().count() < 10 {
                continue;
            }
            let has_digit = sentence.chars().any(|c| c.is_ascii_digit());
            let harm = harm_score(sentence);
            if !has_digit && harm == 0.0 {
                continue;
            }

            let checkworthiness = (0.4f64
                + if has_digit { 0.2 } else { 0.0 }
                + if harm > 0.0 { 0.2 } else { 0.0 })
            .min(1.0);
            let harm_potential = if harm > 0.0 { harm } else { 0.3 };

            claims.push(Claim {
                claim_id: format!("{}:{}", ctx.workflow_id, claims.len()),
                text: sentence.to_string(),
                span: (start, end),
                checkworthiness,
                harm_potential,
            });
        }

        debug!(workflow_id = %ctx.workflow_id, count = claims.len(), "claims extracted");
        Ok(serde_json::to_value(ClaimsFragment { claims })
            .map_err(|e| StageError::validation(e.to_string()))?)
    }
}

/// Character spans of sentences, split after `.`, `!` or `?` followed by
/// whitespace.
fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let chars: Vec<char> = text.chars().collect();
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?')
            && chars.get(i + 1).is_none_or(|c| c.is_whitespace())
        {
            spans.push((start, i + 1));
            i += 1;
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            start = i;
        } else {
            i += 1;
        }
    }
    if start < chars.len() {
        spans.push((start, chars.len()));
    }
    spans
}

// ---------------------------------------------------------------------------
// Topic assignment (per claim)
// ---------------------------------------------------------------------------

const TOPICS: [(&str, &[&str]); 6] = [
    ("flood", &["flood", "flooded", "rain", "river", "dam", "water"]),
    ("fire", &["fire", "blaze", "burn", "smoke"]),
    ("earthquake", &["earthquake", "quake", "tremor", "aftershock"]),
    ("disease", &["outbreak", "virus", "disease", "infection", "cholera"]),
    ("conflict", &["attack", "shooting", "explosion", "riot"]),
    ("infrastructure", &["collapsed", "bridge", "power", "outage", "leak", "building"]),
];

/// Maps a claim onto the fixed crisis topic set, `other` as fallback.
pub struct TopicAssignStage;

#[async_trait]
impl Stage for TopicAssignStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let work = ctx.require_claim()?;
        let lowered = work.claim.text.to_lowercase();
        let topic = TOPICS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
            .map(|(topic, _)| *topic)
            .unwrap_or("other");
        Ok(json!({ "topic": topic }))
    }
}

// ---------------------------------------------------------------------------
// Evidence retrieval (per claim)
// ---------------------------------------------------------------------------

/// Fetches evidence for a claim through the wired provider.
pub struct EvidenceRetrieveStage {
    provider: CollaboratorRef,
}

impl EvidenceRetrieveStage {
    /// Stage backed by the given evidence provider.
    pub fn new(provider: CollaboratorRef) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Stage for EvidenceRetrieveStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let work = ctx.require_claim()?;
        let topic = work
            .partial
            .get(Node::TopicAssign.name())
            .and_then(|v| v.get("topic"))
            .cloned()
            .unwrap_or(Value::Null);

        let response = self
            .provider
            .apply(json!({
                "claim_id": work.claim.claim_id,
                "text": work.claim.text,
                "topic": topic,
            }))
            .await?;

        let mut evidence: Vec<Evidence> = serde_json::from_value(
            response
                .get("evidence")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new())),
        )
        .map_err(|e| StageError::upstream(format!("evidence provider returned bad shape: {e}")))?;

        for item in &mut evidence {
            item.support_score = item.support_score.clamp(-1.0, 1.0);
            item.source_reliability = item.source_reliability.clamp(0.0, 1.0);
        }

        Ok(serde_json::to_value(EvidenceFragment { evidence })
            .map_err(|e| StageError::validation(e.to_string()))?)
    }
}

// ---------------------------------------------------------------------------
// Veracity assessment (per claim)
// ---------------------------------------------------------------------------

/// Prior likelihood before any evidence weighs in.
pub const VERACITY_PRIOR: f64 = 0.5;

/// Scores a claim against its evidence.
///
/// Average support in `[-1, 1]` maps to `[0, 1]` via `(avg + 1) / 2`; the
/// result is blended `0.7 * new + 0.3 * prior`. No evidence leaves the
/// prior untouched.
pub struct VeracityAssessStage;

#[async_trait]
impl Stage for VeracityAssessStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let work = ctx.require_claim()?;
        let fragment: EvidenceFragment = serde_json::from_value(
            work.partial
                .get(Node::EvidenceRetrieve.name())
                .cloned()
                .ok_or_else(|| StageError::validation("missing evidence fragment"))?,
        )
        .map_err(|e| StageError::validation(format!("bad evidence fragment: {e}")))?;

        let likelihood = if fragment.evidence.is_empty() {
            VERACITY_PRIOR
        } else {
            let avg = fragment
                .evidence
                .iter()
                .map(|e| e.support_score)
                .sum::<f64>()
                / fragment.evidence.len() as f64;
            let assessed = (avg + 1.0) / 2.0;
            0.7 * assessed + 0.3 * VERACITY_PRIOR
        };

        Ok(json!({ "veracity_likelihood": likelihood }))
    }
}

// ---------------------------------------------------------------------------
// Risk scoring (workflow level)
// ---------------------------------------------------------------------------

/// Computes per-claim and workflow-level risk.
///
/// Per claim: `harm * 0.5 + (1 - veracity) * 0.3 + checkworthiness * 0.2`.
/// The workflow score is the maximum claim risk; with no claims it falls
/// back to a text-level harm heuristic.
pub struct RiskScoreStage;

#[async_trait]
impl Stage for RiskScoreStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let claims: ClaimsFragment =
            serde_json::from_value(ctx.require(Node::ClaimExtract)?.clone())
                .map_err(|e| StageError::validation(format!("bad claims fragment: {e}")))?;
        let merge: MergeFragment = serde_json::from_value(ctx.require(Node::ClaimMerge)?.clone())
            .map_err(|e| StageError::validation(format!("bad merge fragment: {e}")))?;

        let mut fragment = RiskFragment {
            risk_score: 0.0,
            claim_risks: Default::default(),
        };

        if claims.claims.is_empty() {
            let text = normalized(ctx)?.combined;
            fragment.risk_score = (0.1 + harm_score(&text) * 0.5).min(1.0);
            return Ok(serde_json::to_value(fragment)
                .map_err(|e| StageError::validation(e.to_string()))?);
        }

        for claim in &claims.claims {
            let verdict = merge
                .verdicts
                .iter()
                .find(|v| v.claim_id == claim.claim_id);
            let risk = claim_risk(claim, verdict);
            fragment.claim_risks.insert(claim.claim_id.clone(), risk);
            fragment.risk_score = fragment.risk_score.max(risk);
        }
        debug!(workflow_id = %ctx.workflow_id, risk = fragment.risk_score, "risk scored");

        Ok(serde_json::to_value(fragment)
            .map_err(|e| StageError::validation(e.to_string()))?)
    }
}

fn claim_risk(claim: &Claim, verdict: Option<&ClaimVerdict>) -> f64 {
    let veracity = verdict
        .map(|v| v.veracity_likelihood)
        .unwrap_or(VERACITY_PRIOR);
    (claim.harm_potential * 0.5 + (1.0 - veracity) * 0.3 + claim.checkworthiness * 0.2).min(1.0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Utc;
    use veriflow_core::model::{ItemPayload, RawItem, workflow_id_for};

    use crate::ClaimWork;
    use crate::collaborators::NeutralEvidenceProvider;

    use super::*;

    fn ctx_with_text(text: &str) -> StageContext {
        let item = RawItem {
            source_id: "s1".into(),
            source: "test".into(),
            payload: ItemPayload {
                title: None,
                text: Some(text.to_string()),
                url: None,
                language_hint: None,
                media: Vec::new(),
            },
            ingested_at: Utc::now(),
        };
        let mut results = BTreeMap::new();
        results.insert(
            Node::Normalize.name().to_string(),
            serde_json::to_value(NormalizeFragment {
                title: None,
                text: Some(text.to_string()),
                combined: text.to_string(),
                language: "en".into(),
            })
            .unwrap(),
        );
        StageContext {
            workflow_id: workflow_id_for(&item.source_id),
            item,
            results,
            claim: None,
        }
    }

    fn claim(text: &str) -> Claim {
        Claim {
            claim_id: "w:0".into(),
            text: text.into(),
            span: (0, text.chars().count()),
            checkworthiness: 0.8,
            harm_potential: 0.9,
        }
    }

    #[tokio::test]
    async fn claims_require_keywords_or_digits() {
        let ctx = ctx_with_text(
            "Everything is calm here. 500 people evacuated from the valley. Two dead after the bridge collapsed near town.",
        );
        let out = ClaimExtractStage.apply(&ctx).await.unwrap();
        let fragment: ClaimsFragment = serde_json::from_value(out).unwrap();
        assert_eq!(fragment.claims.len(), 2);
        assert!(fragment.claims[0].text.starts_with("500 people"));
        assert!(fragment.claims[1].text.contains("collapsed"));
        // ids are stable by extraction order
        assert!(fragment.claims[0].claim_id.ends_with(":0"));
        assert!(fragment.claims[1].claim_id.ends_with(":1"));
    }

    #[tokio::test]
    async fn claim_extraction_is_deterministic() {
        let ctx = ctx_with_text("Three dead after the dam collapsed upstream.");
        let a = ClaimExtractStage.apply(&ctx).await.unwrap();
        let b = ClaimExtractStage.apply(&ctx).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn short_sentences_are_skipped() {
        let ctx = ctx_with_text("Fire. It is contained now, zero injured reported today.");
        let out = ClaimExtractStage.apply(&ctx).await.unwrap();
        let fragment: ClaimsFragment = serde_json::from_value(out).unwrap();
        assert_eq!(fragment.claims.len(), 1);
    }

    #[tokio::test]
    async fn entities_pick_up_names_and_quantities() {
        let ctx = ctx_with_text("Flooding hit Riverside County yesterday, 300 evacuated.");
        let out = EntityExtractStage.apply(&ctx).await.unwrap();
        let entities = out["entities"].as_array().unwrap();
        assert!(entities.iter().any(|e| e["text"] == "Riverside County"));
        assert!(
            entities
                .iter()
                .any(|e| e["text"] == "300" && e["kind"] == "quantity")
        );
    }

    #[tokio::test]
    async fn topic_assignment_matches_keywords() {
        let mut ctx = ctx_with_text("x");
        ctx.claim = Some(ClaimWork {
            claim: claim("The river flooded two villages"),
            partial: BTreeMap::new(),
        });
        let out = TopicAssignStage.apply(&ctx).await.unwrap();
        assert_eq!(out["topic"], "flood");

        ctx.claim = Some(ClaimWork {
            claim: claim("Officials met for talks on trade"),
            partial: BTreeMap::new(),
        });
        let out = TopicAssignStage.apply(&ctx).await.unwrap();
        assert_eq!(out["topic"], "other");
    }

    #[tokio::test]
    async fn evidence_stage_clamps_scores() {
        struct WildProvider;
        #[async_trait]
        impl crate::Collaborator for WildProvider {
            async fn apply(&self, _input: Value) -> Result<Value, StageError> {
                Ok(json!({"evidence": [{
                    "url": "https://x.invalid",
                    "snippet": null,
                    "source_reliability": 7.0,
                    "support_score": -3.0,
                }]}))
            }
        }
        let mut ctx = ctx_with_text("x");
        ctx.claim = Some(ClaimWork {
            claim: claim("Two dead in the flood"),
            partial: BTreeMap::new(),
        });
        let stage = EvidenceRetrieveStage::new(Arc::new(WildProvider));
        let out = stage.apply(&ctx).await.unwrap();
        let fragment: EvidenceFragment = serde_json::from_value(out).unwrap();
        assert_eq!(fragment.evidence[0].support_score, -1.0);
        assert_eq!(fragment.evidence[0].source_reliability, 1.0);
    }

    #[tokio::test]
    async fn veracity_blends_support_with_prior() {
        let mut partial = BTreeMap::new();
        partial.insert(
            Node::EvidenceRetrieve.name().to_string(),
            serde_json::to_value(EvidenceFragment {
                evidence: vec![Evidence {
                    url: "https://x.invalid".into(),
                    snippet: None,
                    source_reliability: 0.8,
                    support_score: 1.0,
                }],
            })
            .unwrap(),
        );
        let mut ctx = ctx_with_text("x");
        ctx.claim = Some(ClaimWork {
            claim: claim("c"),
            partial,
        });
        let out = VeracityAssessStage.apply(&ctx).await.unwrap();
        // (1 + 1) / 2 = 1.0, blended 0.7 * 1.0 + 0.3 * 0.5 = 0.85
        let likelihood = out["veracity_likelihood"].as_f64().unwrap();
        assert!((likelihood - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn veracity_without_evidence_keeps_prior() {
        let mut partial = BTreeMap::new();
        partial.insert(
            Node::EvidenceRetrieve.name().to_string(),
            serde_json::to_value(EvidenceFragment { evidence: vec![] }).unwrap(),
        );
        let mut ctx = ctx_with_text("x");
        ctx.claim = Some(ClaimWork {
            claim: claim("c"),
            partial,
        });
        let out = VeracityAssessStage.apply(&ctx).await.unwrap();
        assert_eq!(out["veracity_likelihood"], VERACITY_PRIOR);
    }

    #[tokio::test]
    async fn risk_uses_max_claim_risk() {
        let mut ctx = ctx_with_text("Two dead after the dam collapsed.");
        let claims = ClaimsFragment {
            claims: vec![claim("Two dead after the dam collapsed.")],
        };
        ctx.results.insert(
            Node::ClaimExtract.name().to_string(),
            serde_json::to_value(&claims).unwrap(),
        );
        ctx.results.insert(
            Node::ClaimMerge.name().to_string(),
            serde_json::to_value(MergeFragment {
                verdicts: vec![ClaimVerdict {
                    claim_id: "w:0".into(),
                    topic: Some("flood".into()),
                    evidence: vec![],
                    veracity_likelihood: 0.5,
                    risk_score: 0.0,
                    error: None,
                }],
            })
            .unwrap(),
        );
        let out = RiskScoreStage.apply(&ctx).await.unwrap();
        let fragment: RiskFragment = serde_json::from_value(out).unwrap();
        // 0.9 * 0.5 + 0.5 * 0.3 + 0.8 * 0.2 = 0.76
        assert!((fragment.risk_score - 0.76).abs() < 1e-9);
    }

    #[tokio::test]
    async fn risk_with_no_claims_uses_text_heuristic() {
        let mut ctx = ctx_with_text("calm");
        ctx.results.insert(
            Node::ClaimExtract.name().to_string(),
            serde_json::to_value(ClaimsFragment { claims: vec![] }).unwrap(),
        );
        ctx.results.insert(
            Node::ClaimMerge.name().to_string(),
            serde_json::to_value(MergeFragment { verdicts: vec![] }).unwrap(),
        );
        let out = RiskScoreStage.apply(&ctx).await.unwrap();
        let fragment: RiskFragment = serde_json::from_value(out).unwrap();
        assert!((fragment.risk_score - 0.1).abs() < 1e-9);
        assert!(fragment.claim_risks.is_empty());
    }

    #[tokio::test]
    async fn neutral_provider_flows_through_evidence_stage() {
        let mut ctx = ctx_with_text("x");
        ctx.claim = Some(ClaimWork {
            claim: claim("Two dead in the flood"),
            partial: BTreeMap::new(),
        });
        let stage = EvidenceRetrieveStage::new(Arc::new(NeutralEvidenceProvider));
        let out = stage.apply(&ctx).await.unwrap();
        let fragment: EvidenceFragment = serde_json::from_value(out).unwrap();
        assert_eq!(fragment.evidence.len(), 1);
        assert_eq!(fragment.evidence[0].support_score, 0.0);
    }
}
