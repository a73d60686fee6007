use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AppError;

/// Size and modification time of a document file, used to tell whether the
/// file changed since it was last looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStamp {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

impl FileStamp {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            modified_at: DateTime::<Utc>::from(metadata.modified()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub stamp: FileStamp,
    /// Epoch seconds, the form the monitor script reads.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub processed_at: DateTime<Utc>,
    pub complete: bool,
}

/// `processed.json`: the last file stamp the pipeline saw for each document.
pub struct ProcessedLedger {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, LedgerEntry>>,
}

impl ProcessedLedger {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn load(path: PathBuf) -> Self {
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring corrupt ledger");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, document: &Path) -> Option<LedgerEntry> {
        self.lock().get(&key(document)).cloned()
    }

    /// True when `stamp` matches the recorded one. With `require_complete`
    /// an incomplete document is never skipped.
    pub fn should_skip(&self, document: &Path, stamp: &FileStamp, require_complete: bool) -> bool {
        match self.get(document) {
            Some(entry) => entry.stamp == *stamp && (entry.complete || !require_complete),
            None => false,
        }
    }

    pub fn record(&self, document: &Path, stamp: FileStamp, complete: bool) -> Result<(), AppError> {
        let mut entries = self.lock();
        entries.insert(
            key(document),
            LedgerEntry {
                stamp,
                processed_at: Utc::now(),
                complete,
            },
        );
        self.persist(&entries)
    }

    pub fn forget(&self, document: &Path) -> Result<(), AppError> {
        let mut entries = self.lock();
        if entries.remove(&key(document)).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn persist(&self, entries: &BTreeMap<String, LedgerEntry>) -> Result<(), AppError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let parent = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&serde_json::to_vec_pretty(entries)?)?;
        tmp.persist(path).map_err(|e| AppError::Io(e.error))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, LedgerEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn key(document: &Path) -> String {
    document.to_string_lossy().to_string()
}
