// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External predicate contract and deterministic defaults.
//!
//! ML predicates, fact-check services and translation backends are all
//! collaborators with a single method. The node runtime owns timeout and
//! retry around them; implementations must be safe to invoke again with
//! the same input after a crash.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use veriflow_core::error::StageError;

/// Single-method contract for every external predicate.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Apply the predicate to a JSON input, returning a JSON output or a
    /// classified error.
    async fn apply(&self, input: Value) -> Result<Value, StageError>;
}

/// Shared handle type for collaborator wiring.
pub type CollaboratorRef = Arc<dyn Collaborator>;

/// Evidence provider that returns a single neutral finding per claim.
///
/// Stands in for the search-index lookup in deployments without one; the
/// neutral support score leaves the veracity prior untouched.
pub struct NeutralEvidenceProvider;

#[async_trait]
impl Collaborator for NeutralEvidenceProvider {
    async fn apply(&self, input: Value) -> Result<Value, StageError> {
        let claim_id = input
            .get("claim_id")
            .and_then(Value::as_str)
            .ok_or_else(|| StageError::validation("evidence input missing claim_id"))?;
        Ok(json!({
            "evidence": [{
                "url": format!("https://evidence.invalid/{claim_id}"),
                "snippet": "no corroborating reports found",
                "source_reliability": 0.8,
                "support_score": 0.0,
            }]
        }))
    }
}

/// Template-based advisory writer used when no language model is wired.
pub struct TemplateAdvisoryWriter;

#[async_trait]
impl Collaborator for TemplateAdvisoryWriter {
    async fn apply(&self, input: Value) -> Result<Value, StageError> {
        let title = input
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Crisis Event");
        let text = input.get("text").and_then(Value::as_str).unwrap_or("");
        let verified: Vec<&str> = input
            .get("verified")
            .and_then(Value::as_array)
            .map(|claims| claims.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let debunked: Vec<&str> = input
            .get("debunked")
            .and_then(Value::as_array)
            .map(|claims| claims.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let head: String = text.chars().take(120).collect();
        let verified_text = if verified.is_empty() {
            "Investigation ongoing.".to_string()
        } else {
            format!("Analysis confirms: {}", verified.join(", "))
        };
        let action = if debunked.is_empty() {
            "Monitor official channels for updates.".to_string()
        } else {
            format!(
                "Disregard circulating reports: {}. Follow official channels.",
                debunked.join(", ")
            )
        };

        Ok(json!({
            "title": format!("Crisis Advisory: {title}"),
            "summary": format!("Reports indicate {title}. {head}"),
            "what_happened": if text.is_empty() { "No details available.".to_string() } else { text.to_string() },
            "verified": verified_text,
            "action": action,
        }))
    }
}

/// Marker translator used when no translation backend is wired.
pub struct EchoTranslator;

#[async_trait]
impl Collaborator for EchoTranslator {
    async fn apply(&self, input: Value) -> Result<Value, StageError> {
        let lang = input
            .get("lang")
            .and_then(Value::as_str)
            .ok_or_else(|| StageError::validation("translation input missing lang"))?;
        let advisory = input
            .get("advisory")
            .and_then(Value::as_object)
            .ok_or_else(|| StageError::validation("translation input missing advisory"))?;

        let tag = lang.to_uppercase();
        let mut out = serde_json::Map::new();
        for (field, value) in advisory {
            let text = value.as_str().unwrap_or_default();
            out.insert(field.clone(), Value::String(format!("[{tag}] {text}")));
        }
        Ok(Value::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn neutral_evidence_is_deterministic() {
        let provider = NeutralEvidenceProvider;
        let a = provider.apply(json!({"claim_id": "c1"})).await.unwrap();
        let b = provider.apply(json!({"claim_id": "c1"})).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a["evidence"][0]["support_score"], 0.0);
    }

    #[tokio::test]
    async fn evidence_requires_claim_id() {
        let err = NeutralEvidenceProvider.apply(json!({})).await.unwrap_err();
        assert!(err.detail.contains("claim_id"));
    }

    #[tokio::test]
    async fn template_writer_sections() {
        let out = TemplateAdvisoryWriter
            .apply(json!({
                "title": "Flooding in the valley",
                "text": "Water levels rising.",
                "verified": ["bridge closed"],
                "debunked": ["dam burst"],
            }))
            .await
            .unwrap();
        assert_eq!(out["title"], "Crisis Advisory: Flooding in the valley");
        assert!(out["verified"].as_str().unwrap().contains("bridge closed"));
        assert!(out["action"].as_str().unwrap().contains("dam burst"));
    }

    #[tokio::test]
    async fn echo_translator_tags_fields() {
        let out = EchoTranslator
            .apply(json!({
                "lang": "hi",
                "advisory": {"title": "Advisory", "summary": "Summary"},
            }))
            .await
            .unwrap();
        assert_eq!(out["title"], "[HI] Advisory");
        assert_eq!(out["summary"], "[HI] Summary");
    }
}
