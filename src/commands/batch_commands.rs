use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::commands::process_commands::process_file;
use crate::data::archive;
use crate::error::AppError;
use crate::models::ocr_result::OcrOptions;
use crate::services::export_service::ExportFormat;
use crate::services::ocr_service::TextRecognizer;
use crate::services::watch_service::scan_documents;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: Vec<PathBuf>,
}

pub struct BatchRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub parallel: bool,
    pub format: ExportFormat,
    pub results_dir_name: String,
    pub options: OcrOptions,
}

fn output_path(input_root: &Path, output_root: &Path, document: &Path, extension: &str) -> PathBuf {
    let relative = document
        .strip_prefix(input_root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| document.file_name().map(PathBuf::from).unwrap_or_default());
    output_root.join(relative).with_extension(extension)
}

fn process_one(
    input_root: &Path,
    output_root: &Path,
    document: &Path,
    recognizer: Arc<dyn TextRecognizer>,
    options: &OcrOptions,
    format: ExportFormat,
) -> Result<PathBuf, AppError> {
    let bytes = process_file(document, recognizer, options, format)?;
    let destination = output_path(input_root, output_root, document, format.exporter().file_extension());
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    archive::write_file_atomically(&destination, &bytes)?;
    Ok(destination)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Recognizes every document under `input` and writes one export per document
/// to `output`. Per-document failures are logged and counted; only an
/// unusable output directory is fatal.
pub async fn run_batch(
    request: BatchRequest,
    recognizer: Arc<dyn TextRecognizer>,
) -> Result<BatchSummary, AppError> {
    std::fs::create_dir_all(&request.output).map_err(|e| {
        AppError::General(format!(
            "cannot create output directory {}: {e}",
            request.output.display()
        ))
    })?;

    let input = request.input.clone();
    let results_dir = request.results_dir_name.clone();
    let documents = tokio::task::spawn_blocking(move || scan_documents(&input, &results_dir))
        .await
        .map_err(|e| AppError::General(e.to_string()))?;
    info!(input = %request.input.display(), documents = documents.len(), "batch started");

    let width = if request.parallel {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        1
    };
    let permits = Arc::new(Semaphore::new(width));
    let request = Arc::new(request);
    let mut set = JoinSet::new();

    for document in documents {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::General(e.to_string()))?;
        let request = request.clone();
        let recognizer = recognizer.clone();
        set.spawn_blocking(move || {
            let _permit = permit;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                process_one(
                    &request.input,
                    &request.output,
                    &document,
                    recognizer,
                    &request.options,
                    request.format,
                )
            }))
            .unwrap_or_else(|payload| {
                Err(AppError::Recognition(format!(
                    "recognizer panicked: {}",
                    panic_message(payload)
                )))
            });
            (document, outcome)
        });
    }

    let mut summary = BatchSummary::default();
    while let Some(joined) = set.join_next().await {
        let (document, outcome) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                warn!(error = %e, "batch task did not complete");
                continue;
            }
        };
        match outcome {
            Ok(destination) => {
                info!(document = %document.display(), output = %destination.display(), "exported");
                summary.processed += 1;
            }
            Err(e) => {
                error!(document = %document.display(), error = %e, "batch document failed");
                summary.failed.push(document);
            }
        }
    }
    summary.failed.sort();

    info!(processed = summary.processed, failed = summary.failed.len(), "batch finished");
    Ok(summary)
}
