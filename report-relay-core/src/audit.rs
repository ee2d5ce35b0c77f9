//! In-memory outcome log and cumulative statistics.
//!
//! The recorder is additive and bounded: it keeps counters plus the most recent audit
//! events, trimming the oldest once the cap is reached. Calls never fail the caller.
//! Snapshots are persisted as JSON and reloaded best-effort at startup so counters
//! survive restarts.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Delivered,
    FailedPermanent,
    FailedRetryable,
    Skipped,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub path: PathBuf,
    pub file_name: String,
    pub kind: OutcomeKind,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub failed_permanent: u64,
    pub failed_retryable: u64,
    pub skipped: u64,
    pub warnings: u64,
    pub delivered_by_destination: BTreeMap<String, u64>,
    pub last_queue_depth: usize,
    pub peak_queue_depth: usize,
    pub first_started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub recent: Vec<AuditEvent>,
}

impl StatsSnapshot {
    pub fn failed(&self) -> u64 {
        self.failed_permanent + self.failed_retryable
    }
}

#[derive(Debug)]
struct RecorderState {
    stats: StatsSnapshot,
    recent: VecDeque<AuditEvent>,
}

#[derive(Debug)]
pub struct AuditRecorder {
    capacity: usize,
    snapshot_path: Option<PathBuf>,
    state: Mutex<RecorderState>,
}

impl AuditRecorder {
    /// Fresh recorder with no persistence.
    pub fn new(capacity: usize) -> Self {
        Self::with_snapshot(capacity, None, StatsSnapshot::default())
    }

    /// Recorder that resumes from the snapshot at `path` (if readable) and persists there.
    pub fn load(capacity: usize, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = read_snapshot(&path);
        Self::with_snapshot(capacity, Some(path), snapshot)
    }

    fn with_snapshot(capacity: usize, snapshot_path: Option<PathBuf>, mut stats: StatsSnapshot) -> Self {
        let capacity = capacity.max(1);
        let mut recent: VecDeque<AuditEvent> = std::mem::take(&mut stats.recent).into();
        while recent.len() > capacity {
            recent.pop_front();
        }
        if stats.first_started_at.is_none() {
            stats.first_started_at = Some(Utc::now());
        }
        Self {
            capacity,
            snapshot_path,
            state: Mutex::new(RecorderState { stats, recent }),
        }
    }

    pub fn record_outcome(
        &self,
        path: &Path,
        kind: OutcomeKind,
        destination: Option<&str>,
        detail: Option<&str>,
    ) {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            at: Utc::now(),
            path: path.to_path_buf(),
            file_name: file_name_of(path),
            kind,
            destination: destination.map(str::to_string),
            detail: detail.map(str::to_string),
        };
        let mut state = self.lock();
        let stats = &mut state.stats;
        match kind {
            OutcomeKind::Delivered => {
                stats.delivered += 1;
                if let Some(dest) = destination {
                    *stats
                        .delivered_by_destination
                        .entry(dest.to_string())
                        .or_default() += 1;
                }
            }
            OutcomeKind::FailedPermanent => stats.failed_permanent += 1,
            OutcomeKind::FailedRetryable => stats.failed_retryable += 1,
            OutcomeKind::Skipped => stats.skipped += 1,
            OutcomeKind::Warning => stats.warnings += 1,
        }
        stats.updated_at = Some(event.at);
        state.recent.push_back(event);
        while state.recent.len() > self.capacity {
            state.recent.pop_front();
        }
    }

    /// Health findings are recorded against the check name instead of a file.
    pub fn record_warning(&self, check: &str, message: &str) {
        self.record_outcome(Path::new(check), OutcomeKind::Warning, None, Some(message));
    }

    pub fn record_queue_depth(&self, depth: usize) {
        let mut state = self.lock();
        state.stats.last_queue_depth = depth;
        state.stats.peak_queue_depth = state.stats.peak_queue_depth.max(depth);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.lock();
        let mut snapshot = state.stats.clone();
        snapshot.recent = state.recent.iter().cloned().collect();
        snapshot
    }

    /// Writes the snapshot next to its final location and renames it into place.
    /// Without a configured path this is a no-op.
    pub fn persist(&self) -> io::Result<()> {
        let Some(path) = self.snapshot_path.as_deref() else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                parent.to_path_buf()
            }
            None => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!(path = %path.display(), "[AUDIT] Persisted stats snapshot");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Best-effort read: a missing or corrupt snapshot yields empty statistics.
pub fn read_snapshot(path: &Path) -> StatsSnapshot {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "[AUDIT] Stats snapshot is corrupt, starting empty");
                StatsSnapshot::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => StatsSnapshot::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "[AUDIT] Could not read stats snapshot, starting empty");
            StatsSnapshot::default()
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn counts_outcomes_by_kind_and_destination() {
        let recorder = AuditRecorder::new(10);
        recorder.record_outcome(Path::new("/r/a.pdf"), OutcomeKind::Delivered, Some("Users"), None);
        recorder.record_outcome(Path::new("/r/b.pdf"), OutcomeKind::Delivered, Some("Users"), None);
        recorder.record_outcome(Path::new("/r/c.pdf"), OutcomeKind::Skipped, None, Some("no destination"));
        recorder.record_outcome(
            Path::new("/r/d.pdf"),
            OutcomeKind::FailedPermanent,
            Some("Servers"),
            Some("file missing"),
        );

        let stats = recorder.snapshot();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.delivered_by_destination.get("Users"), Some(&2));
        assert_eq!(stats.recent.len(), 4);
        assert_eq!(stats.recent[2].detail.as_deref(), Some("no destination"));
    }

    #[test]
    fn trims_oldest_events_beyond_capacity() {
        let recorder = AuditRecorder::new(3);
        for i in 0..5 {
            recorder.record_outcome(
                Path::new(&format!("/r/{i}.pdf")),
                OutcomeKind::Delivered,
                None,
                None,
            );
        }
        let stats = recorder.snapshot();
        assert_eq!(stats.delivered, 5);
        let names: Vec<_> = stats.recent.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, vec!["2.pdf", "3.pdf", "4.pdf"]);
    }

    #[test]
    fn queue_depth_tracks_peak() {
        let recorder = AuditRecorder::new(3);
        recorder.record_queue_depth(4);
        recorder.record_queue_depth(1);
        let stats = recorder.snapshot();
        assert_eq!(stats.last_queue_depth, 1);
        assert_eq!(stats.peak_queue_depth, 4);
    }

    #[test]
    fn persisted_counters_resume_after_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats").join("stats.json");

        let recorder = AuditRecorder::load(10, &path);
        recorder.record_outcome(Path::new("/r/a.pdf"), OutcomeKind::Delivered, Some("Users"), None);
        recorder.record_warning("watcher", "watcher restarted");
        recorder.persist().unwrap();

        let resumed = AuditRecorder::load(10, &path);
        let stats = resumed.snapshot();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.warnings, 1);
        assert_eq!(stats.recent.len(), 2);
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        fs::write(&path, b"{ not json").unwrap();

        let recorder = AuditRecorder::load(10, &path);
        assert_eq!(recorder.snapshot().delivered, 0);
    }
}
