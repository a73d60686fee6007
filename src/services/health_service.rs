use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const HEARTBEAT_FILE: &str = "heartbeat.json";
pub const LAST_ERROR_FILE: &str = "last_error.json";

/// Liveness and failure reporting for external monitors.
pub trait HealthSink: Send + Sync {
    fn touch_heartbeat(&self, note: &str);
    fn record_error(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// Writes `heartbeat.json` and `last_error.json` into one directory.
pub struct FileHealthSink {
    dir: PathBuf,
}

impl FileHealthSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_record<T: Serialize>(&self, name: &str, record: &T) {
        if let Err(e) = write_atomic(&self.dir, name, record) {
            warn!(dir = %self.dir.display(), file = name, error = %e, "failed to write health record");
        }
    }
}

fn write_atomic<T: Serialize>(dir: &Path, name: &str, record: &T) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let bytes = serde_json::to_vec_pretty(record)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.persist(dir.join(name)).map_err(|e| e.error)?;
    Ok(())
}

impl HealthSink for FileHealthSink {
    fn touch_heartbeat(&self, note: &str) {
        self.write_record(
            HEARTBEAT_FILE,
            &Heartbeat {
                timestamp: Utc::now(),
                note: note.to_string(),
            },
        );
    }

    fn record_error(&self, message: &str) {
        self.write_record(
            LAST_ERROR_FILE,
            &LastError {
                timestamp: Utc::now(),
                error: message.to_string(),
            },
        );
    }
}

#[derive(Default)]
pub struct MemoryHealthSink {
    heartbeats: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl MemoryHealthSink {
    pub fn heartbeats(&self) -> Vec<String> {
        self.heartbeats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl HealthSink for MemoryHealthSink {
    fn touch_heartbeat(&self, note: &str) {
        self.heartbeats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(note.to_string());
    }

    fn record_error(&self, message: &str) {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message.to_string());
    }
}
