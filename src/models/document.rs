use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::migrations::StoredMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OcrSource {
    Embedded,
    OnDevice,
    Service,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageProcessingState {
    pub page_number: u32,
    #[serde(rename = "needsOCR")]
    pub needs_ocr: bool,
    pub needs_extraction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_extracted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl PageProcessingState {
    pub fn pending(page_number: u32) -> Self {
        Self {
            page_number,
            needs_ocr: true,
            needs_extraction: false,
            ocr_processed_at: None,
            address_extracted_at: None,
            text: None,
        }
    }

    pub fn processed(page_number: u32, at: Option<DateTime<Utc>>) -> Self {
        Self {
            page_number,
            needs_ocr: false,
            needs_extraction: false,
            ocr_processed_at: at,
            address_extracted_at: None,
            text: None,
        }
    }
}

/// Metadata stored in the `metadata.json` member (or as the legacy bare record).
///
/// Decoding always goes through [`StoredMetadata`] so that documents written
/// before per-page state existed come back with a synthesized state list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredMetadata")]
pub struct DocumentMetadata {
    pub id: Uuid,
    pub title: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub page_count: u32,
    pub tags: Vec<String>,
    pub ocr_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_engine_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_source: Option<OcrSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<serde_json::Value>,
    pub page_processing_states: Vec<PageProcessingState>,
}

impl DocumentMetadata {
    pub fn new(title: &str, page_count: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created: now,
            modified: now,
            page_count,
            tags: Vec::new(),
            ocr_completed: false,
            full_text: None,
            ocr_processed_at: None,
            ocr_confidence: None,
            ocr_engine_version: None,
            ocr_source: None,
            extracted_data: None,
            page_processing_states: (1..=page_count).map(PageProcessingState::pending).collect(),
        }
    }

    pub fn page_state(&self, page: u32) -> Option<&PageProcessingState> {
        self.page_processing_states
            .iter()
            .find(|s| s.page_number == page)
    }

    pub fn page_state_mut(&mut self, page: u32) -> Option<&mut PageProcessingState> {
        self.page_processing_states
            .iter_mut()
            .find(|s| s.page_number == page)
    }
}
