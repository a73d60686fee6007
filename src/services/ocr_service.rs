use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::data::document::Document;
use crate::error::AppError;
use crate::models::document::{DocumentMetadata, OcrSource};
use crate::models::ocr_result::{
    aggregate_confidence, BoundingBox, OcrOptions, OcrPage, OcrResult, ProcessingMetadata,
    TextBlock, TextLine, Word,
};
use crate::services::{extraction, processing_state};

/// External recognition capability. Opening a payload yields a session that
/// recognizes one page at a time.
pub trait TextRecognizer: Send + Sync {
    fn engine_version(&self) -> String;

    fn source(&self) -> OcrSource {
        OcrSource::OnDevice
    }

    fn open<'a>(&'a self, payload: &'a [u8]) -> Result<Box<dyn RecognitionSession + 'a>, AppError>;
}

pub trait RecognitionSession {
    fn page_count(&self) -> u32;

    fn recognize_page(&mut self, page: u32, options: &OcrOptions) -> Result<OcrPage, AppError>;
}

#[derive(Debug)]
pub struct IncrementalOutcome {
    pub metadata: DocumentMetadata,
    pub result: OcrResult,
    pub pages_processed: usize,
    pub cancelled: bool,
}

pub struct OcrProcessor {
    recognizer: Arc<dyn TextRecognizer>,
    options: OcrOptions,
}

impl OcrProcessor {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, options: OcrOptions) -> Self {
        Self { recognizer, options }
    }

    pub fn options(&self) -> &OcrOptions {
        &self.options
    }

    /// Recognizes every page regardless of stored state.
    pub fn process(&self, document: &Document) -> Result<OcrResult, AppError> {
        let started = Instant::now();
        let payload = document.payload().ok_or(AppError::PayloadUnavailable)?;
        let mut session = self.open_session(payload)?;

        let page_count = match document.metadata.page_count {
            0 => session.page_count(),
            n => n,
        };

        let mut pages = Vec::new();
        let mut warnings = Vec::new();
        for page in 1..=page_count {
            match self.recognize(session.as_mut(), page) {
                Ok(recognized) => pages.push(recognized),
                Err(e) => {
                    warn!(document = %document.metadata.id, page, error = %e, "page recognition failed");
                    warnings.push(format!("page {page}: {e}"));
                }
            }
        }

        Ok(self.build_result(&document.metadata, pages, warnings, started))
    }

    /// Recognizes only pages still marked `needsOCR`, recording each success
    /// before moving on. Stops at the next page boundary once `cancel` fires.
    pub fn process_incremental(
        &self,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<IncrementalOutcome, AppError> {
        let started = Instant::now();
        let mut metadata = document.metadata.clone();
        let pending = processing_state::pages_needing_ocr(&metadata);

        if pending.is_empty() {
            let result = self.build_result(&metadata, Vec::new(), Vec::new(), started);
            return Ok(IncrementalOutcome {
                metadata,
                result,
                pages_processed: 0,
                cancelled: false,
            });
        }

        let payload = document.payload().ok_or(AppError::PayloadUnavailable)?;
        let mut session = self.open_session(payload)?;

        let mut pages = Vec::new();
        let mut warnings = Vec::new();
        let mut cancelled = false;
        for page in pending {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match self.recognize(session.as_mut(), page) {
                Ok(recognized) => {
                    processing_state::mark_ocr_complete(
                        &mut metadata,
                        page,
                        Utc::now(),
                        Some(recognized.text.clone()),
                    )?;
                    debug!(document = %metadata.id, page, "page recognized");
                    pages.push(recognized);
                }
                Err(e) => {
                    warn!(document = %metadata.id, page, error = %e, "page recognition failed, will retry");
                    warnings.push(format!("page {page}: {e}"));
                }
            }
        }

        let result = self.build_result(&metadata, pages, warnings, started);
        let pages_processed = result.pages.len();
        if pages_processed > 0 {
            self.apply_result(&mut metadata, &result);
        }
        processing_state::recompute_document_level_flags(&mut metadata);

        info!(
            document = %metadata.id,
            pages_processed,
            warnings = result.metadata.warnings.len(),
            cancelled,
            complete = metadata.ocr_completed,
            "incremental OCR finished"
        );

        Ok(IncrementalOutcome {
            metadata,
            result,
            pages_processed,
            cancelled,
        })
    }

    fn open_session<'a>(
        &'a self,
        payload: &'a [u8],
    ) -> Result<Box<dyn RecognitionSession + 'a>, AppError> {
        self.recognizer.open(payload)
    }

    fn recognize(
        &self,
        session: &mut dyn RecognitionSession,
        page: u32,
    ) -> Result<OcrPage, AppError> {
        let mut recognized = session.recognize_page(page, &self.options)?;
        recognized.page_number = page;
        if self.options.extract_form_fields && recognized.form_fields.is_none() {
            recognized.form_fields = Some(extraction::extract_form_fields(&recognized));
        }
        Ok(recognized)
    }

    fn build_result(
        &self,
        metadata: &DocumentMetadata,
        pages: Vec<OcrPage>,
        warnings: Vec<String>,
        started: Instant,
    ) -> OcrResult {
        let demographics = if self.options.extract_demographics && !pages.is_empty() {
            let text = pages
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join(processing_state::PAGE_SEPARATOR);
            Some(extraction::extract_demographics(&text))
        } else {
            None
        };
        let languages_detected = if pages.is_empty() {
            Vec::new()
        } else {
            self.options.languages.clone()
        };

        OcrResult {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            document_id: metadata.id,
            engine_version: self.recognizer.engine_version(),
            confidence: aggregate_confidence(&pages),
            pages,
            metadata: ProcessingMetadata {
                processing_time: started.elapsed().as_secs_f64(),
                languages_detected,
                warnings,
                options: self.options.clone(),
            },
            demographics,
        }
    }

    fn apply_result(&self, metadata: &mut DocumentMetadata, result: &OcrResult) {
        metadata.ocr_confidence = Some(result.confidence);
        metadata.ocr_engine_version = Some(result.engine_version.clone());
        metadata.ocr_source = Some(self.recognizer.source());

        let Some(demographics) = result.demographics.as_ref().filter(|d| !d.is_empty()) else {
            return;
        };
        let Ok(value) = serde_json::to_value(demographics) else {
            return;
        };
        match metadata.extracted_data.as_mut().and_then(|d| d.as_object_mut()) {
            Some(object) => {
                object.insert("demographics".to_string(), value);
            }
            None => {
                metadata.extracted_data = Some(serde_json::json!({ "demographics": value }));
            }
        }
    }
}

/// Reads the text layer embedded in a PDF payload.
pub struct PdfTextRecognizer;

impl TextRecognizer for PdfTextRecognizer {
    fn engine_version(&self) -> String {
        format!("folio-textlayer/{}", env!("CARGO_PKG_VERSION"))
    }

    fn source(&self) -> OcrSource {
        OcrSource::Embedded
    }

    fn open<'a>(&'a self, payload: &'a [u8]) -> Result<Box<dyn RecognitionSession + 'a>, AppError> {
        // A payload that does not parse yet is usually still syncing.
        let pdf = lopdf::Document::load_mem(payload).map_err(|e| {
            debug!(error = %e, "payload is not a readable PDF");
            AppError::PayloadUnavailable
        })?;
        let page_count = pdf.get_pages().len() as u32;
        Ok(Box::new(PdfTextSession { pdf, page_count }))
    }
}

struct PdfTextSession {
    pdf: lopdf::Document,
    page_count: u32,
}

impl RecognitionSession for PdfTextSession {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn recognize_page(&mut self, page: u32, _options: &OcrOptions) -> Result<OcrPage, AppError> {
        if page == 0 || page > self.page_count {
            return Err(AppError::Recognition(format!(
                "payload has {} pages",
                self.page_count
            )));
        }
        let text = self
            .pdf
            .extract_text(&[page])
            .map_err(|e| AppError::Recognition(e.to_string()))?;
        let text = normalize_text(&text);
        let confidence = if text.is_empty() { 0.0 } else { 1.0 };

        Ok(OcrPage {
            page_number: page,
            text_blocks: layout_text(&text, confidence),
            text,
            confidence,
            form_fields: None,
        })
    }
}

fn normalize_text(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if line.trim().is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(if line.trim().is_empty() { "" } else { line });
    }
    while lines.last() == Some(&"") {
        lines.pop();
    }
    lines.join("\n")
}

/// Splits plain text into blocks (blank-line separated), lines and words with
/// boxes estimated from line index and character offsets.
pub fn layout_text(text: &str, confidence: f64) -> Vec<TextBlock> {
    let rows: Vec<&str> = text.lines().collect();
    if rows.iter().all(|r| r.trim().is_empty()) {
        return Vec::new();
    }
    let row_height = 1.0 / rows.len() as f64;
    let widest = rows.iter().map(|r| r.chars().count()).max().unwrap_or(1).max(1) as f64;

    let mut blocks = Vec::new();
    let mut current: Vec<TextLine> = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        if row.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(block_from_lines(std::mem::take(&mut current), confidence));
            }
            continue;
        }
        current.push(line_from_row(row, idx as f64 * row_height, row_height, widest, confidence));
    }
    if !current.is_empty() {
        blocks.push(block_from_lines(current, confidence));
    }
    blocks
}

fn line_from_row(row: &str, y: f64, height: f64, widest: f64, confidence: f64) -> TextLine {
    let mut words = Vec::new();
    let mut offset = 0usize;
    for piece in row.split(' ') {
        let len = piece.chars().count();
        if len > 0 {
            words.push(Word {
                text: piece.to_string(),
                bounding_box: BoundingBox::new(offset as f64 / widest, y, len as f64 / widest, height),
                confidence,
            });
        }
        offset += len + 1;
    }

    let x = words.first().map_or(0.0, |w| w.bounding_box.x);
    let right = words
        .last()
        .map_or(0.0, |w| w.bounding_box.x + w.bounding_box.width);
    TextLine {
        text: row.trim().to_string(),
        bounding_box: BoundingBox::new(x, y, right - x, height),
        words,
    }
}

fn block_from_lines(lines: Vec<TextLine>, confidence: f64) -> TextBlock {
    let x0 = lines.iter().map(|l| l.bounding_box.x).fold(f64::MAX, f64::min);
    let y0 = lines.iter().map(|l| l.bounding_box.y).fold(f64::MAX, f64::min);
    let x1 = lines
        .iter()
        .map(|l| l.bounding_box.x + l.bounding_box.width)
        .fold(0.0, f64::max);
    let y1 = lines
        .iter()
        .map(|l| l.bounding_box.y + l.bounding_box.height)
        .fold(0.0, f64::max);
    TextBlock {
        text: lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        bounding_box: BoundingBox::new(x0, y0, x1 - x0, y1 - y0),
        confidence,
        lines,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Recognizer returning `"text of page N"`, failing for configured pages.
    #[derive(Default)]
    pub(crate) struct ScriptedRecognizer {
        pub calls: AtomicUsize,
        pub failing: Mutex<HashSet<u32>>,
    }

    impl ScriptedRecognizer {
        pub fn failing_on(pages: &[u32]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: Mutex::new(pages.iter().copied().collect()),
            }
        }
    }

    struct ScriptedSession<'a> {
        owner: &'a ScriptedRecognizer,
    }

    impl TextRecognizer for ScriptedRecognizer {
        fn engine_version(&self) -> String {
            "scripted-1".to_string()
        }

        fn open<'a>(
            &'a self,
            _payload: &'a [u8],
        ) -> Result<Box<dyn RecognitionSession + 'a>, AppError> {
            Ok(Box::new(ScriptedSession { owner: self }))
        }
    }

    impl RecognitionSession for ScriptedSession<'_> {
        fn page_count(&self) -> u32 {
            3
        }

        fn recognize_page(&mut self, page: u32, _options: &OcrOptions) -> Result<OcrPage, AppError> {
            self.owner.calls.fetch_add(1, Ordering::SeqCst);
            if self.owner.failing.lock().unwrap().contains(&page) {
                return Err(AppError::Recognition("engine crashed".to_string()));
            }
            let text = format!("text of page {page}");
            Ok(OcrPage {
                page_number: page,
                text_blocks: layout_text(&text, 0.8),
                text,
                confidence: 0.8,
                form_fields: None,
            })
        }
    }

    fn processor(recognizer: Arc<ScriptedRecognizer>, options: OcrOptions) -> OcrProcessor {
        OcrProcessor::new(recognizer, options)
    }

    fn document(pages: u32) -> Document {
        Document::new("Doc", pages, Some(b"%PDF-1.4".to_vec()))
    }

    #[test]
    fn test_incremental_only_touches_pending_pages() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let ocr = processor(recognizer.clone(), OcrOptions::default());
        let mut doc = document(3);
        let earlier = "2024-01-01T00:00:00Z".parse().unwrap();
        processing_state::mark_ocr_complete(&mut doc.metadata, 3, earlier, None).unwrap();

        let outcome = ocr
            .process_incremental(&doc, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.pages_processed, 2);
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);
        assert!(outcome
            .metadata
            .page_processing_states
            .iter()
            .all(|s| !s.needs_ocr));
        assert_eq!(
            outcome.metadata.page_state(3).unwrap().ocr_processed_at,
            Some(earlier)
        );

        doc.metadata = outcome.metadata;
        let again = ocr
            .process_incremental(&doc, &CancellationToken::new())
            .unwrap();
        assert_eq!(again.pages_processed, 0);
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(again.metadata, doc.metadata);
    }

    #[test]
    fn test_page_failure_is_a_warning() {
        let recognizer = Arc::new(ScriptedRecognizer::failing_on(&[2]));
        let ocr = processor(recognizer.clone(), OcrOptions::default());

        let outcome = ocr
            .process_incremental(&document(3), &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome.pages_processed, 2);
        assert_eq!(outcome.result.metadata.warnings.len(), 1);
        assert!(outcome.result.metadata.warnings[0].starts_with("page 2:"));
        assert!(outcome.metadata.page_state(2).unwrap().needs_ocr);
        assert!(!outcome.metadata.ocr_completed);
        assert!(outcome.metadata.full_text.is_none());
    }

    #[test]
    fn test_retry_completes_document() {
        let recognizer = Arc::new(ScriptedRecognizer::failing_on(&[2]));
        let ocr = processor(recognizer.clone(), OcrOptions::default());
        let mut doc = document(2);

        doc.metadata = ocr
            .process_incremental(&doc, &CancellationToken::new())
            .unwrap()
            .metadata;
        recognizer.failing.lock().unwrap().clear();
        let outcome = ocr
            .process_incremental(&doc, &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome.pages_processed, 1);
        assert!(outcome.metadata.ocr_completed);
        assert_eq!(
            outcome.metadata.full_text.as_deref(),
            Some("text of page 1\n\ntext of page 2")
        );
        assert_eq!(outcome.metadata.ocr_engine_version.as_deref(), Some("scripted-1"));
    }

    #[test]
    fn test_cancelled_before_start_does_nothing() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let ocr = processor(recognizer.clone(), OcrOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ocr.process_incremental(&document(3), &cancel).unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.pages_processed, 0);
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_payload_is_retryable() {
        let ocr = processor(Arc::new(ScriptedRecognizer::default()), OcrOptions::default());
        let doc = Document::new("No payload", 1, None);

        let err = ocr
            .process_incremental(&doc, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, AppError::PayloadUnavailable));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_full_mode_ignores_stored_state() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let ocr = processor(recognizer.clone(), OcrOptions::default());
        let mut doc = document(2);
        for page in 1..=2 {
            processing_state::mark_ocr_complete(&mut doc.metadata, page, Utc::now(), None).unwrap();
        }

        let result = ocr.process(&doc).unwrap();
        assert_eq!(result.pages.len(), 2);
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.document_id, doc.metadata.id);
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_full_mode_uses_session_page_count_when_unknown() {
        let recognizer = Arc::new(ScriptedRecognizer::default());
        let ocr = processor(recognizer, OcrOptions::default());
        let result = ocr.process(&document(0)).unwrap();
        assert_eq!(result.pages.len(), 3);
    }

    #[test]
    fn test_options_enable_form_fields_and_demographics() {
        struct FormRecognizer;
        struct FormSession;
        impl TextRecognizer for FormRecognizer {
            fn engine_version(&self) -> String {
                "form".to_string()
            }
            fn open<'a>(
                &'a self,
                _payload: &'a [u8],
            ) -> Result<Box<dyn RecognitionSession + 'a>, AppError> {
                Ok(Box::new(FormSession))
            }
        }
        impl RecognitionSession for FormSession {
            fn page_count(&self) -> u32 {
                1
            }
            fn recognize_page(&mut self, page: u32, _o: &OcrOptions) -> Result<OcrPage, AppError> {
                let text = "Name: Jane Doe\nDOB: 01/02/1960".to_string();
                Ok(OcrPage {
                    page_number: page,
                    text_blocks: layout_text(&text, 0.9),
                    text,
                    confidence: 0.9,
                    form_fields: None,
                })
            }
        }

        let options = OcrOptions {
            extract_form_fields: true,
            extract_demographics: true,
            ..OcrOptions::default()
        };
        let ocr = OcrProcessor::new(Arc::new(FormRecognizer), options);
        let outcome = ocr
            .process_incremental(&document(1), &CancellationToken::new())
            .unwrap();

        let fields = outcome.result.pages[0].form_fields.as_ref().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].label, "Name");
        let demographics = outcome.result.demographics.as_ref().unwrap();
        assert_eq!(demographics.dates_of_birth, vec!["01/02/1960".to_string()]);
        assert_eq!(
            outcome.metadata.extracted_data.as_ref().unwrap()["demographics"]["datesOfBirth"][0],
            "01/02/1960"
        );
    }

    #[test]
    fn test_layout_text_structure() {
        let blocks = layout_text("Dear Dr Smith\nRe: referral\n\nKind regards", 1.0);

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].lines.len(), 2);
        assert_eq!(blocks[0].lines[0].words.len(), 3);
        assert_eq!(blocks[1].text, "Kind regards");
        for block in &blocks {
            for line in &block.lines {
                for word in &line.words {
                    let b = word.bounding_box;
                    assert!(b.x >= 0.0 && b.x + b.width <= 1.0 + 1e-9);
                    assert!(b.y >= 0.0 && b.y + b.height <= 1.0 + 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_layout_of_blank_text() {
        assert!(layout_text("", 0.0).is_empty());
        assert!(layout_text("\n\n", 0.0).is_empty());
    }

    #[test]
    fn test_normalize_text_collapses_blank_runs() {
        assert_eq!(normalize_text("a  \n\n\n\nb\n\n"), "a\n\nb");
        assert_eq!(normalize_text("\n\nstart"), "start");
    }

    #[test]
    fn test_pdf_recognizer_rejects_truncated_payload() {
        let recognizer = PdfTextRecognizer;
        assert!(matches!(
            recognizer.open(b"%PDF-1.4\n1 0 obj"),
            Err(AppError::PayloadUnavailable)
        ));
    }
}
