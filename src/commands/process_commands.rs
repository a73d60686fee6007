use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::data::document::{self, Document};
use crate::error::AppError;
use crate::models::ocr_result::OcrOptions;
use crate::services::export_service::ExportFormat;
use crate::services::ocr_service::{OcrProcessor, TextRecognizer};

/// Recognizes every page of one document and returns the exported bytes.
pub fn process_file(
    path: &Path,
    recognizer: Arc<dyn TextRecognizer>,
    options: &OcrOptions,
    format: ExportFormat,
) -> Result<Vec<u8>, AppError> {
    let document = Document::load(path)?;
    let processor = OcrProcessor::new(recognizer, options.clone());
    let result = processor.process(&document)?;
    info!(
        path = %path.display(),
        pages = result.pages.len(),
        warnings = result.metadata.warnings.len(),
        "document recognized"
    );
    format.exporter().export(&result)
}

/// Writes the payload of `source` to `destination`. `false` when the
/// document has none.
pub fn extract_pdf(source: &Path, destination: &Path) -> Result<bool, AppError> {
    let written = document::extract_payload(source, destination)?;
    if written {
        info!(source = %source.display(), destination = %destination.display(), "payload extracted");
    }
    Ok(written)
}
