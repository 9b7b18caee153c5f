// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Normalization: whitespace cleanup and language detection.

use async_trait::async_trait;
use serde_json::Value;

use veriflow_core::error::StageError;

use crate::{NormalizeFragment, Stage, StageContext};

/// Cleans the raw payload and detects its language.
///
/// Detection is a script/stopword heuristic; when it is inconclusive the
/// ingestion adapter's `language_hint` wins, and `unknown` is the last
/// resort.
pub struct NormalizeStage;

#[async_trait]
impl Stage for NormalizeStage {
    async fn apply(&self, ctx: &StageContext) -> Result<Value, StageError> {
        let payload = &ctx.item.payload;
        let title = payload.title.as_deref().map(clean);
        let text = payload.text.as_deref().map(clean);

        let combined = match (&title, &text) {
            (Some(t), Some(b)) => format!("{t} {b}"),
            (Some(t), None) => t.clone(),
            (None, Some(b)) => b.clone(),
            (None, None) => {
                return Err(StageError::validation("item carries no title and no text"));
            }
        };

        let language = detect_language(&combined)
            .map(str::to_string)
            .or_else(|| payload.language_hint.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let fragment = NormalizeFragment {
            title,
            text,
            combined,
            language,
        };
        Ok(serde_json::to_value(fragment)
            .map_err(|e| StageError::validation(e.to_string()))?)
    }
}

fn clean(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Script ranges checked before falling back to the English heuristic.
const SCRIPTS: [(std::ops::RangeInclusive<u32>, &str); 4] = [
    (0x0900..=0x097F, "hi"), // Devanagari
    (0x0980..=0x09FF, "bn"), // Bengali
    (0x0B80..=0x0BFF, "ta"), // Tamil
    (0x0C00..=0x0C7F, "te"), // Telugu
];

const ENGLISH_STOPWORDS: [&str; 8] = ["the", "and", "is", "of", "in", "a", "to", "are"];

fn detect_language(text: &str) -> Option<&'static str> {
    let total = text.chars().filter(|c| !c.is_whitespace()).count();
    if total == 0 {
        return None;
    }

    for (range, lang) in &SCRIPTS {
        let hits = text
            .chars()
            .filter(|c| range.contains(&u32::from(*c)))
            .count();
        if hits * 4 >= total {
            return Some(lang);
        }
    }

    let lowered = text.to_lowercase();
    let has_stopword = lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| ENGLISH_STOPWORDS.contains(&word));
    let ascii_alpha = text.chars().filter(|c| c.is_ascii_alphabetic()).count();
    if has_stopword && ascii_alpha * 5 >= total * 4 {
        return Some("en");
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use veriflow_core::model::{ItemPayload, RawItem, workflow_id_for};

    use super::*;

    fn ctx(title: Option<&str>, text: Option<&str>, hint: Option<&str>) -> StageContext {
        let item = RawItem {
            source_id: "s1".into(),
            source: "test".into(),
            payload: ItemPayload {
                title: title.map(String::from),
                text: text.map(String::from),
                url: None,
                language_hint: hint.map(String::from),
                media: Vec::new(),
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

    #[tokio::test]
    async fn collapses_whitespace_and_detects_english() {
        let out = NormalizeStage
            .apply(&ctx(
                Some("Flood  warning"),
                Some("The river is  rising\nfast"),
                None,
            ))
            .await
            .unwrap();
        let fragment: NormalizeFragment = serde_json::from_value(out).unwrap();
        assert_eq!(fragment.combined, "Flood warning The river is rising fast");
        assert_eq!(fragment.language, "en");
    }

    #[tokio::test]
    async fn detects_devanagari() {
        let out = NormalizeStage
            .apply(&ctx(None, Some("नदी का जलस्तर बढ़ रहा है"), None))
            .await
            .unwrap();
        let fragment: NormalizeFragment = serde_json::from_value(out).unwrap();
        assert_eq!(fragment.language, "hi");
    }

    #[tokio::test]
    async fn hint_wins_when_detection_is_inconclusive() {
        let out = NormalizeStage
            .apply(&ctx(Some("xq zt 123"), None, Some("fr")))
            .await
            .unwrap();
        let fragment: NormalizeFragment = serde_json::from_value(out).unwrap();
        assert_eq!(fragment.language, "fr");
    }

    #[tokio::test]
    async fn empty_item_is_a_validation_error() {
        let err = NormalizeStage
            .apply(&ctx(None, None, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, veriflow_core::error::ErrorKind::Validation);
    }
}
