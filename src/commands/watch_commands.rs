use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::services::health_service::{FileHealthSink, HealthSink};
use crate::services::ocr_service::TextRecognizer;
use crate::services::watch_service::{PipelineContext, WatchService};

pub fn build_service(
    config: &Config,
    recognizer: Arc<dyn TextRecognizer>,
    health: Arc<dyn HealthSink>,
    cancel: CancellationToken,
) -> WatchService {
    let ctx = PipelineContext::from_config(config, recognizer, health, cancel);
    WatchService::new(
        Arc::new(ctx),
        config.max_concurrent_jobs,
        config.scan_interval(),
        config.debounce(),
    )
}

/// Runs the watcher until Ctrl-C.
pub async fn run_watch(config: &Config, recognizer: Arc<dyn TextRecognizer>) -> Result<(), AppError> {
    let health_dir = config.health_dir();
    let health: Arc<dyn HealthSink> = Arc::new(FileHealthSink::new(health_dir.clone()));
    let cancel = CancellationToken::new();
    let service = build_service(config, recognizer, health, cancel.clone());

    info!(
        documents = %service.context().root.display(),
        health = %health_dir.display(),
        ledger = %config.ledger_path().display(),
        format = %config.export_format,
        "starting watcher"
    );

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for interrupt"),
        }
        signal_cancel.cancel();
    });

    service.run().await
}
