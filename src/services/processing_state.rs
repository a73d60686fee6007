use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::document::DocumentMetadata;

pub const PAGE_SEPARATOR: &str = "\n\n";

/// Page numbers still waiting for OCR, ascending.
pub fn pages_needing_ocr(metadata: &DocumentMetadata) -> Vec<u32> {
    let mut pages: Vec<u32> = metadata
        .page_processing_states
        .iter()
        .filter(|s| s.needs_ocr)
        .map(|s| s.page_number)
        .collect();
    pages.sort_unstable();
    pages
}

pub fn is_fully_processed(metadata: &DocumentMetadata) -> bool {
    metadata.page_processing_states.iter().all(|s| !s.needs_ocr)
}

/// Records a finished page. The timestamp only ever moves forward, and
/// `needsExtraction` is raised for the downstream extractor.
pub fn mark_ocr_complete(
    metadata: &mut DocumentMetadata,
    page: u32,
    at: DateTime<Utc>,
    text: Option<String>,
) -> Result<(), AppError> {
    let page_count = metadata.page_count;
    let state = metadata
        .page_state_mut(page)
        .ok_or(AppError::PageOutOfRange { page, page_count })?;

    if state.needs_ocr {
        state.needs_ocr = false;
        state.needs_extraction = true;
    }
    state.ocr_processed_at = match state.ocr_processed_at {
        Some(existing) if existing > at => Some(existing),
        _ => Some(at),
    };
    if text.is_some() {
        state.text = text;
    }
    Ok(())
}

/// Derives `ocrCompleted`, `fullText` and `ocrProcessedAt` from page state.
/// `fullText` is only rebuilt once every page is done and has its text.
pub fn recompute_document_level_flags(metadata: &mut DocumentMetadata) {
    metadata.ocr_completed = is_fully_processed(metadata);
    if !metadata.ocr_completed || metadata.page_processing_states.is_empty() {
        return;
    }

    let texts: Option<Vec<&str>> = metadata
        .page_processing_states
        .iter()
        .map(|s| s.text.as_deref())
        .collect();
    if let Some(texts) = texts {
        metadata.full_text = Some(texts.join(PAGE_SEPARATOR));
    }

    if let Some(latest) = metadata
        .page_processing_states
        .iter()
        .filter_map(|s| s.ocr_processed_at)
        .max()
    {
        metadata.ocr_processed_at = Some(latest);
    }
}
