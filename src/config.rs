use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::doc_path::ResultsLayout;
use crate::error::AppError;
use crate::models::ocr_result::OcrOptions;
use crate::services::export_service::ExportFormat;

pub const HOME_ENV: &str = "FOLIO_HOME";
pub const CONFIG_FILE: &str = "config.toml";

/// Application support root: `$FOLIO_HOME`, else the platform data dir.
pub fn app_support_dir() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }
    directories::ProjectDirs::from("", "", "folio-ocr")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".folio-ocr"))
}

fn default_documents_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|u| u.document_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_max_concurrent_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub documents_dir: PathBuf,
    pub results_dir_name: String,
    pub results_layout: ResultsLayout,
    /// Defaults to `<app support>/health`.
    pub health_dir: Option<PathBuf>,
    /// Defaults to `<app support>/processed.json`.
    pub ledger_path: Option<PathBuf>,
    pub export_format: ExportFormat,
    pub scan_interval_secs: u64,
    pub debounce_ms: u64,
    pub max_concurrent_jobs: usize,
    pub ocr: OcrOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            documents_dir: default_documents_dir(),
            results_dir_name: ".ocr_results".to_string(),
            results_layout: ResultsLayout::Mirrored,
            health_dir: None,
            ledger_path: None,
            export_format: ExportFormat::Json,
            scan_interval_secs: 300,
            debounce_ms: 500,
            max_concurrent_jobs: default_max_concurrent_jobs(),
            ocr: OcrOptions::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            AppError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `explicit` when given, else `<app support>/config.toml` when it
    /// exists, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, AppError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let implicit = app_support_dir().join(CONFIG_FILE);
        if implicit.is_file() {
            return Self::load(&implicit);
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let mut errors: Vec<String> = Vec::new();

        if self.results_dir_name.trim().is_empty() {
            errors.push("results_dir_name must not be empty".to_string());
        }
        if self.results_dir_name.contains('/') || self.results_dir_name.contains('\\') {
            errors.push("results_dir_name must be a single directory name".to_string());
        }
        if self.scan_interval_secs == 0 {
            errors.push("scan_interval_secs must be positive".to_string());
        }
        if self.max_concurrent_jobs == 0 {
            errors.push("max_concurrent_jobs must be at least 1".to_string());
        }
        if self.ocr.languages.is_empty() {
            errors.push("ocr.languages must list at least one language".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(errors.join("; ")))
        }
    }

    pub fn health_dir(&self) -> PathBuf {
        self.health_dir
            .clone()
            .unwrap_or_else(|| app_support_dir().join("health"))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| app_support_dir().join("processed.json"))
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
