use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Why a document was queued. `Scan` outranks `Change` because a scan also
/// retries documents that are unchanged but still incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Trigger {
    Change,
    Scan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The caller must start a job for the path.
    Dispatch,
    /// A job is already waiting and absorbs this request.
    AlreadyQueued,
    /// A job is running; it will run once more when it finishes.
    Coalesced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Queued(Trigger),
    Processing { rerun: Option<Trigger> },
}

/// Per-document job state shared by the watcher loop and its workers.
/// A path missing from the table is idle.
#[derive(Default)]
pub struct JobTable {
    jobs: Mutex<HashMap<PathBuf, JobPhase>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, path: &Path, trigger: Trigger) -> RequestOutcome {
        let mut jobs = self.lock();
        match jobs.get_mut(path) {
            None => {
                jobs.insert(path.to_path_buf(), JobPhase::Queued(trigger));
                RequestOutcome::Dispatch
            }
            Some(JobPhase::Queued(queued)) => {
                *queued = (*queued).max(trigger);
                RequestOutcome::AlreadyQueued
            }
            Some(JobPhase::Processing { rerun }) => {
                *rerun = Some(rerun.map_or(trigger, |t| t.max(trigger)));
                RequestOutcome::Coalesced
            }
        }
    }

    /// Moves a queued job to processing and returns its trigger. `None` when
    /// the path is not queued.
    pub fn start(&self, path: &Path) -> Option<Trigger> {
        let mut jobs = self.lock();
        match jobs.get(path).copied() {
            Some(JobPhase::Queued(trigger)) => {
                jobs.insert(path.to_path_buf(), JobPhase::Processing { rerun: None });
                Some(trigger)
            }
            _ => None,
        }
    }

    /// Ends the running job. Returns the trigger to re-run with when requests
    /// arrived meanwhile; the path is then queued again.
    pub fn finish(&self, path: &Path) -> Option<Trigger> {
        let mut jobs = self.lock();
        match jobs.get(path).copied() {
            Some(JobPhase::Processing { rerun: Some(trigger) }) => {
                jobs.insert(path.to_path_buf(), JobPhase::Queued(trigger));
                Some(trigger)
            }
            Some(JobPhase::Processing { rerun: None }) => {
                jobs.remove(path);
                None
            }
            _ => None,
        }
    }

    /// Drops a job that was queued but never started.
    pub fn abandon(&self, path: &Path) {
        let mut jobs = self.lock();
        if matches!(jobs.get(path), Some(JobPhase::Queued(_))) {
            jobs.remove(path);
        }
    }

    #[cfg(test)]
    pub fn is_processing(&self, path: &Path) -> bool {
        matches!(self.lock().get(path), Some(JobPhase::Processing { .. }))
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, JobPhase>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
