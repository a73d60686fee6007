use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::document::{DocumentMetadata, OcrSource, PageProcessingState};

/// Metadata as found on disk. Every field added after the first release is
/// optional here so older documents still decode.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMetadata {
    pub id: Uuid,
    pub title: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub page_count: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ocr_completed: bool,
    #[serde(default)]
    pub full_text: Option<String>,
    #[serde(default)]
    pub ocr_processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ocr_confidence: Option<f64>,
    #[serde(default)]
    pub ocr_engine_version: Option<String>,
    #[serde(default)]
    pub ocr_source: Option<OcrSource>,
    #[serde(default)]
    pub extracted_data: Option<serde_json::Value>,
    #[serde(default)]
    pub page_processing_states: Option<Vec<PageProcessingState>>,
}

impl From<StoredMetadata> for DocumentMetadata {
    fn from(stored: StoredMetadata) -> Self {
        let page_processing_states = match stored.page_processing_states {
            Some(states) => normalize_page_states(states, stored.page_count),
            None => synthesize_page_states(
                stored.page_count,
                stored.ocr_completed,
                stored.ocr_processed_at,
            ),
        };

        DocumentMetadata {
            id: stored.id,
            title: stored.title,
            created: stored.created,
            modified: stored.modified,
            page_count: stored.page_count,
            tags: stored.tags,
            ocr_completed: stored.ocr_completed,
            full_text: stored.full_text,
            ocr_processed_at: stored.ocr_processed_at,
            ocr_confidence: stored.ocr_confidence,
            ocr_engine_version: stored.ocr_engine_version,
            ocr_source: stored.ocr_source,
            extracted_data: stored.extracted_data,
            page_processing_states,
        }
    }
}

pub fn decode_metadata(bytes: &[u8]) -> Result<DocumentMetadata, serde_json::Error> {
    serde_json::from_slice::<DocumentMetadata>(bytes)
}

/// Builds per-page state for documents that predate it, from the
/// document-level OCR flag alone.
pub fn synthesize_page_states(
    page_count: u32,
    ocr_completed: bool,
    ocr_processed_at: Option<DateTime<Utc>>,
) -> Vec<PageProcessingState> {
    (1..=page_count)
        .map(|page| {
            if ocr_completed {
                PageProcessingState::processed(page, ocr_processed_at)
            } else {
                PageProcessingState::pending(page)
            }
        })
        .collect()
}

/// Forces a stored state list onto exactly `1..=page_count`. The first entry
/// wins for a duplicated page number; pages without an entry need OCR.
pub fn normalize_page_states(
    states: Vec<PageProcessingState>,
    page_count: u32,
) -> Vec<PageProcessingState> {
    let mut by_page: BTreeMap<u32, PageProcessingState> = BTreeMap::new();
    for state in states {
        if state.page_number == 0 || state.page_number > page_count {
            continue;
        }
        by_page.entry(state.page_number).or_insert(state);
    }

    (1..=page_count)
        .map(|page| {
            by_page
                .remove(&page)
                .unwrap_or_else(|| PageProcessingState::pending(page))
        })
        .collect()
}
