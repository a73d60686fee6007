use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::notify;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::data::document::Document;
use crate::data::ledger::{FileStamp, ProcessedLedger};
use crate::doc_path::{self, ResultsLayout};
use crate::error::AppError;
use crate::services::export_service::{export_to_file, ResultExporter};
use crate::services::health_service::HealthSink;
use crate::services::ocr_service::{OcrProcessor, TextRecognizer};
use crate::services::processing_state;
use crate::state::{JobTable, RequestOutcome, Trigger};

pub const STARTUP_SCAN_NOTE: &str = "startup scan";
pub const ROUTINE_SCAN_NOTE: &str = "routine scan";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The file was gone by the time the job ran.
    Missing,
    /// The file stamp matches the ledger.
    Unchanged,
    /// Every page is already recognized.
    UpToDate,
    NotADocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Processed { pages: usize, complete: bool },
    Skipped(SkipReason),
    /// The payload is not present yet; the next scan retries.
    Deferred,
    /// The file changed while it was being processed and was left untouched.
    Superseded,
}

/// Everything a job needs, shared between the watch loop, its workers and
/// batch mode.
pub struct PipelineContext {
    pub root: PathBuf,
    pub results_dir_name: String,
    pub results_layout: ResultsLayout,
    pub processor: OcrProcessor,
    pub exporter: Box<dyn ResultExporter>,
    pub ledger: ProcessedLedger,
    pub health: Arc<dyn HealthSink>,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn from_config(
        config: &Config,
        recognizer: Arc<dyn TextRecognizer>,
        health: Arc<dyn HealthSink>,
        cancel: CancellationToken,
    ) -> Self {
        let root = config
            .documents_dir
            .canonicalize()
            .unwrap_or_else(|_| config.documents_dir.clone());
        Self {
            root,
            results_dir_name: config.results_dir_name.clone(),
            results_layout: config.results_layout,
            processor: OcrProcessor::new(recognizer, config.ocr.clone()),
            exporter: config.export_format.exporter(),
            ledger: ProcessedLedger::load(config.ledger_path()),
            health,
            cancel,
        }
    }

    pub fn is_document(&self, path: &Path) -> bool {
        doc_path::is_document_path(&self.root, &self.results_dir_name, path)
    }

    pub fn results_path(&self, document: &Path) -> PathBuf {
        doc_path::results_path_for(
            &self.root,
            &self.results_dir_name,
            self.results_layout,
            document,
            self.exporter.file_extension(),
        )
    }
}

fn stamp_or_missing(path: &Path) -> Result<Option<FileStamp>, AppError> {
    match FileStamp::of(path) {
        Ok(stamp) => Ok(Some(stamp)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Runs one job for `path`: load, recognize pending pages, save, export and
/// record the new stamp. Blocking.
pub fn process_document(
    ctx: &PipelineContext,
    path: &Path,
    trigger: Trigger,
) -> Result<JobOutcome, AppError> {
    if !ctx.is_document(path) {
        return Ok(JobOutcome::Skipped(SkipReason::NotADocument));
    }

    let Some(stamp) = stamp_or_missing(path)? else {
        ctx.ledger.forget(path)?;
        return Ok(JobOutcome::Skipped(SkipReason::Missing));
    };
    if ctx
        .ledger
        .should_skip(path, &stamp, trigger == Trigger::Scan)
    {
        return Ok(JobOutcome::Skipped(SkipReason::Unchanged));
    }

    let mut document = match Document::load(path) {
        Ok(document) => document,
        Err(e) if e.is_not_found() => return Ok(JobOutcome::Skipped(SkipReason::Missing)),
        Err(e) => return Err(e),
    };

    if processing_state::is_fully_processed(&document.metadata) {
        ctx.ledger.record(path, stamp, true)?;
        return Ok(JobOutcome::Skipped(SkipReason::UpToDate));
    }

    let outcome = match ctx.processor.process_incremental(&document, &ctx.cancel) {
        Ok(outcome) => outcome,
        Err(e) if e.is_retryable() => {
            debug!(path = %path.display(), error = %e, "recognition deferred");
            ctx.ledger.record(path, stamp, false)?;
            return Ok(JobOutcome::Deferred);
        }
        Err(e) => return Err(e),
    };

    if outcome.pages_processed == 0 {
        ctx.ledger.record(path, stamp, false)?;
        return Ok(JobOutcome::Processed {
            pages: 0,
            complete: false,
        });
    }

    match stamp_or_missing(path)? {
        Some(current) if current == stamp => {}
        Some(_) => return Ok(JobOutcome::Superseded),
        None => return Ok(JobOutcome::Skipped(SkipReason::Missing)),
    }

    let complete = outcome.metadata.ocr_completed;
    document.metadata = outcome.metadata;
    document.save(path)?;

    let results_path = ctx.results_path(path);
    if let Err(e) = export_to_file(ctx.exporter.as_ref(), &outcome.result, &results_path) {
        warn!(path = %results_path.display(), error = %e, "failed to write OCR results");
    }

    match stamp_or_missing(path)? {
        Some(saved) => ctx.ledger.record(path, saved, complete)?,
        None => ctx.ledger.forget(path)?,
    }

    Ok(JobOutcome::Processed {
        pages: outcome.pages_processed,
        complete,
    })
}

/// Every document below `root`, skipping hidden, trashed and results
/// directories.
pub fn scan_documents(root: &Path, results_dir_name: &str) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && doc_path::is_ignored_dir_name(&e.file_name().to_string_lossy(), results_dir_name))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| doc_path::is_document_path(root, results_dir_name, p))
        .collect()
}

/// Watches the documents root and keeps it recognized.
#[derive(Clone)]
pub struct WatchService {
    ctx: Arc<PipelineContext>,
    jobs: Arc<JobTable>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    scan_interval: Duration,
    debounce: Duration,
}

impl WatchService {
    pub fn new(
        ctx: Arc<PipelineContext>,
        max_concurrent_jobs: usize,
        scan_interval: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            ctx,
            jobs: Arc::new(JobTable::new()),
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            tracker: TaskTracker::new(),
            scan_interval,
            debounce,
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Runs until the context's cancellation token fires, then waits for
    /// running jobs to reach a page boundary.
    pub async fn run(&self) -> Result<(), AppError> {
        let root = self.ctx.root.clone();
        if !root.is_dir() {
            return Err(AppError::Watcher(format!(
                "not a directory: {}",
                root.display()
            )));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        if matches!(
                            event.kind,
                            DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                        ) {
                            let _ = tx.send(event.path);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "watcher error"),
            }
        })
        .map_err(|e| AppError::Watcher(e.to_string()))?;
        debouncer
            .watcher()
            .watch(&root, notify::RecursiveMode::Recursive)
            .map_err(|e| AppError::Watcher(e.to_string()))?;

        info!(root = %root.display(), "watching documents");
        self.scan(STARTUP_SCAN_NOTE).await;

        let start = tokio::time::Instant::now() + self.scan_interval;
        let mut ticker = tokio::time::interval_at(start, self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                _ = ticker.tick() => self.scan(ROUTINE_SCAN_NOTE).await,
                event = rx.recv() => match event {
                    Some(path) => self.enqueue(path, Trigger::Change),
                    None => break,
                },
            }
        }

        drop(debouncer);
        info!("watcher stopping, waiting for running jobs");
        self.shutdown().await;
        Ok(())
    }

    /// Queues every document under the root, then heartbeats once.
    pub async fn scan(&self, note: &str) {
        let root = self.ctx.root.clone();
        let results_dir = self.ctx.results_dir_name.clone();
        let paths = match tokio::task::spawn_blocking(move || scan_documents(&root, &results_dir))
            .await
        {
            Ok(paths) => paths,
            Err(e) => {
                error!(error = %e, "scan task failed");
                self.ctx.health.record_error(&format!("scan failed: {e}"));
                return;
            }
        };

        info!(note, documents = paths.len(), "scan pass");
        for path in paths {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            self.enqueue(path, Trigger::Scan);
        }
        self.ctx.health.touch_heartbeat(note);
    }

    pub fn enqueue(&self, path: PathBuf, trigger: Trigger) {
        if !self.ctx.is_document(&path) {
            return;
        }
        match self.jobs.request(&path, trigger) {
            RequestOutcome::Dispatch => self.spawn_job(path),
            RequestOutcome::AlreadyQueued => debug!(path = %path.display(), "already queued"),
            RequestOutcome::Coalesced => debug!(path = %path.display(), "queued rerun"),
        }
    }

    /// Waits for every spawned job to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_job(&self, path: PathBuf) {
        let ctx = self.ctx.clone();
        let jobs = self.jobs.clone();
        let permits = self.permits.clone();

        self.tracker.spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = ctx.cancel.cancelled() => None,
                    permit = permits.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    jobs.abandon(&path);
                    return;
                };
                if ctx.cancel.is_cancelled() {
                    jobs.abandon(&path);
                    return;
                }
                let Some(trigger) = jobs.start(&path) else {
                    return;
                };

                let job_ctx = ctx.clone();
                let job_path = path.clone();
                let result = tokio::task::spawn_blocking(move || {
                    process_document(&job_ctx, &job_path, trigger)
                })
                .await
                .unwrap_or_else(|e| Err(AppError::General(format!("job panicked: {e}"))));
                drop(permit);

                report(&ctx, &path, result);

                if jobs.finish(&path).is_none() {
                    return;
                }
            }
        });
    }
}

fn report(ctx: &PipelineContext, path: &Path, result: Result<JobOutcome, AppError>) {
    match result {
        Ok(JobOutcome::Processed { pages, complete }) => {
            info!(path = %path.display(), pages, complete, "document processed")
        }
        Ok(JobOutcome::Skipped(reason)) => {
            debug!(path = %path.display(), ?reason, "document skipped")
        }
        Ok(JobOutcome::Deferred) => {
            info!(path = %path.display(), "payload not available, deferred")
        }
        Ok(JobOutcome::Superseded) => {
            info!(path = %path.display(), "document changed during processing")
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "document failed");
            ctx.health
                .record_error(&format!("{}: {e}", path.display()));
        }
    }
}
