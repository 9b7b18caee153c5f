// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Publishing stages: advisory drafting, translation, publication.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use veriflow_core::error::StageError;
use veriflow_core::model::Node;

use crate::collaborators::CollaboratorRef;
use crate::{ClaimsFragment, MergeFragment, NormalizeFragment, Stage, StageContext};

/// Claims above this veracity are listed as verified in the advisory.
const VERIFIED_THRESHOLD: f64 = 0.8;
/// Claims below this veracity are listed as debunked.
const DEBUNKED_THRESHOLD: f64 = 0.2;

/// Drafts a sectioned advisory from the merged claim verdicts.
pub struct DraftAdvisoryStage {
    writer: CollaboratorRef,
}

impl DraftAdvisoryStage {
    /// Stage backed by the given advisory writer.
    pub fn new(writer: CollaboratorRef) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl Stage for DraftAdvisoryStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let normalize: NormalizeFragment =
            serde_json::from_value(ctx.require(Node::Normalize)?.clone())
                .map_err(|e| StageError::validation(format!("bad normalize fragment: {e}")))?;
        let claims: ClaimsFragment =
            serde_json::from_value(ctx.require(Node::ClaimExtract)?.clone())
                .map_err(|e| StageError::validation(format!("bad claims fragment: {e}")))?;
        let merge: MergeFragment = serde_json::from_value(ctx.require(Node::ClaimMerge)?.clone())
            .map_err(|e| StageError::validation(format!("bad merge fragment: {e}")))?;

        let mut verified = Vec::new();
        let mut debunked = Vec::new();
        for claim in &claims.claims {
            let Some(verdict) = merge.verdicts.iter().find(|v| v.claim_id == claim.claim_id)
            else {
                continue;
            };
            if verdict.error.is_some() {
                continue;
            }
            if verdict.veracity_likelihood > VERIFIED_THRESHOLD {
                verified.push(claim.text.clone());
            } else if verdict.veracity_likelihood < DEBUNKED_THRESHOLD {
                debunked.push(claim.text.clone());
            }
        }

        let title = normalize.title.clone().unwrap_or_else(|| {
            normalize.combined.chars().take(60).collect::<String>()
        });
        let advisory = self
            .writer
            .apply(json!({
                "title": title,
                "text": normalize.combined,
                "verified": verified,
                "debunked": debunked,
            }))
            .await?;

        Ok(json!({ "advisory": advisory }))
    }
}

/// Renders the advisory into the configured target languages.
pub struct TranslateStage {
    translator: CollaboratorRef,
    languages: Vec<String>,
}

impl TranslateStage {
    /// Stage backed by the given translator and language set.
    pub fn new(translator: CollaboratorRef, languages: Vec<String>) -> Self {
        Self {
            translator,
            languages,
        }
    }
}

#[async_trait]
impl Stage for TranslateStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let advisory = ctx
            .require(Node::DraftAdvisory)?
            .get("advisory")
            .cloned()
            .ok_or_else(|| StageError::validation("draft fragment missing advisory"))?;

        let mut translations = serde_json::Map::new();
        for lang in &self.languages {
            let rendered = self
                .translator
                .apply(json!({ "lang": lang, "advisory": advisory }))
                .await?;
            translations.insert(lang.clone(), rendered);
        }

        Ok(json!({
            "advisory": advisory,
            "translations": Value::Object(translations),
        }))
    }
}

/// Assembles the outbound publication payload.
///
/// The orchestrator publishes this fragment on `notifications` once the
/// terminal transition is durably checkpointed; the stage itself stays
/// side-effect free.
pub struct PublishStage;

#[async_trait]
impl Stage for PublishStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let translated = ctx.require(Node::Translate)?;
        let advisory = translated
            .get("advisory")
            .cloned()
            .ok_or_else(|| StageError::validation("translate fragment missing advisory"))?;
        let translations = translated
            .get("translations")
            .cloned()
            .unwrap_or_else(|| json!({}));

        Ok(json!({
            "published": true,
            "at": Utc::now().to_rfc3339(),
            "advisory": advisory,
            "translations": translations,
        }))
    }
}
