//! Per-path lifecycle tracking for the intake pipeline.
//!
//! Every observed file moves through `Queued -> InFlight -> {Delivered | Failed | Skipped}`.
//! The tracker is the single place that enforces "at most one in-flight dispatch per
//! normalized path": [`FileTracker::begin`] is the only transition into `InFlight` and
//! it is taken under the map lock. Each lifecycle gets a fresh generation number so a
//! queued task that was cancelled or superseded is recognised and dropped by the worker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::ledger::normalize_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    Created,
    Modified,
    Renamed,
    Deleted,
    Scanned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Queued,
    InFlight,
    Delivered,
    Failed,
    Skipped,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Delivered | FileState::Failed | FileState::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    Delivered,
    FailedPermanent(String),
    FailedRetryable(String),
    Skipped(String),
}

impl TerminalOutcome {
    fn state(&self) -> FileState {
        match self {
            TerminalOutcome::Delivered => FileState::Delivered,
            TerminalOutcome::FailedPermanent(_) | TerminalOutcome::FailedRetryable(_) => {
                FileState::Failed
            }
            TerminalOutcome::Skipped(_) => FileState::Skipped,
        }
    }
}

/// A file under consideration.
#[derive(Debug, Clone)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub first_observed: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub last_event_kind: ObservationKind,
    pub state: FileState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub outcome: Option<TerminalOutcome>,
    pub generation: u64,
    terminal_since: Option<Instant>,
}

impl WatchedFile {
    pub fn in_progress(&self) -> bool {
        self.state == FileState::InFlight
    }
}

/// What [`FileTracker::offer`] decided for an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new lifecycle was started; build and enqueue a task with this generation.
    Enqueue { generation: u64 },
    /// Already queued, in flight, or settled; nothing to do.
    Duplicate,
}

#[derive(Debug, Default)]
struct TrackerState {
    files: HashMap<String, WatchedFile>,
    next_generation: u64,
}

#[derive(Debug)]
pub struct FileTracker {
    retention: Duration,
    state: Mutex<TrackerState>,
}

impl FileTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Records a created/modified/scanned observation.
    ///
    /// - unknown path: starts a lifecycle (`Queued`);
    /// - queued or in flight: duplicate;
    /// - terminal: a content-change event (created/modified/renamed) restarts the
    ///   lifecycle as a new generation, a scan does not.
    pub fn offer(&self, path: &Path, kind: ObservationKind, size_bytes: u64) -> Admission {
        let key = normalize_path(path);
        let now = Utc::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        state.next_generation += 1;
        let candidate = state.next_generation;

        match state.files.get_mut(&key) {
            None => {
                state.files.insert(
                    key,
                    WatchedFile {
                        path: path.to_path_buf(),
                        file_name: file_name_of(path),
                        size_bytes,
                        first_observed: now,
                        last_event_at: now,
                        last_event_kind: kind,
                        state: FileState::Queued,
                        attempts: 0,
                        last_error: None,
                        outcome: None,
                        generation: candidate,
                        terminal_since: None,
                    },
                );
                Admission::Enqueue {
                    generation: candidate,
                }
            }
            Some(file) => {
                file.last_event_at = now;
                file.last_event_kind = kind;
                let restart = file.state.is_terminal() && kind != ObservationKind::Scanned;
                if !restart {
                    return Admission::Duplicate;
                }
                file.path = path.to_path_buf();
                file.size_bytes = size_bytes;
                file.state = FileState::Queued;
                file.attempts = 0;
                file.last_error = None;
                file.outcome = None;
                file.terminal_since = None;
                file.generation = candidate;
                Admission::Enqueue {
                    generation: candidate,
                }
            }
        }
    }

    /// Records a file that was observed and settled without ever being queued
    /// (for example, no route matched). Does not touch an active lifecycle.
    pub fn settle_without_dispatch(&self, path: &Path, kind: ObservationKind, outcome: TerminalOutcome) -> bool {
        match self.offer(path, kind, 0) {
            Admission::Enqueue { generation } => self.finish(path, generation, outcome),
            Admission::Duplicate => false,
        }
    }

    /// `Queued -> InFlight` for the task's generation. Returns `false` when the task
    /// was cancelled, superseded, or the path is already in flight.
    pub fn begin(&self, path: &Path, generation: u64) -> bool {
        let mut state = self.lock();
        match state.files.get_mut(&normalize_path(path)) {
            Some(file) if file.generation == generation && file.state == FileState::Queued => {
                file.state = FileState::InFlight;
                file.attempts += 1;
                true
            }
            _ => false,
        }
    }

    /// Records the terminal outcome of a lifecycle. Ignored if the generation moved on.
    pub fn finish(&self, path: &Path, generation: u64, outcome: TerminalOutcome) -> bool {
        let mut state = self.lock();
        match state.files.get_mut(&normalize_path(path)) {
            Some(file) if file.generation == generation => {
                file.state = outcome.state();
                file.last_error = match &outcome {
                    TerminalOutcome::FailedPermanent(reason)
                    | TerminalOutcome::FailedRetryable(reason) => Some(reason.clone()),
                    _ => None,
                };
                file.outcome = Some(outcome);
                file.terminal_since = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Drops tracking for a deleted or renamed-away path. An in-flight entry is kept
    /// until its worker finishes, so the path cannot be dispatched twice concurrently.
    pub fn forget(&self, path: &Path) -> Option<FileState> {
        let key = normalize_path(path);
        let mut state = self.lock();
        let current = state.files.get(&key).map(|file| file.state)?;
        if current == FileState::InFlight {
            if let Some(file) = state.files.get_mut(&key) {
                file.last_event_kind = ObservationKind::Deleted;
                file.last_event_at = Utc::now();
            }
        } else {
            state.files.remove(&key);
        }
        Some(current)
    }

    /// Releases a queued entry whose task was dropped from the queue, so a later scan
    /// can rediscover it.
    pub fn release(&self, path: &Path, generation: u64) {
        let key = normalize_path(path);
        let mut state = self.lock();
        let matches = state
            .files
            .get(&key)
            .is_some_and(|f| f.generation == generation && f.state == FileState::Queued);
        if matches {
            state.files.remove(&key);
        }
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.lock().files.contains_key(&normalize_path(path))
    }

    pub fn get(&self, path: &Path) -> Option<WatchedFile> {
        self.lock().files.get(&normalize_path(path)).cloned()
    }

    pub fn state_of(&self, path: &Path) -> Option<FileState> {
        self.lock().files.get(&normalize_path(path)).map(|f| f.state)
    }

    pub fn count_in(&self, wanted: FileState) -> usize {
        self.lock().files.values().filter(|f| f.state == wanted).count()
    }

    pub fn in_flight_paths(&self) -> Vec<PathBuf> {
        self.lock()
            .files
            .values()
            .filter(|f| f.state == FileState::InFlight)
            .map(|f| f.path.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes terminal entries older than the retention window. Returns how many.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let retention = self.retention;
        let mut state = self.lock();
        let before = state.files.len();
        state.files.retain(|_, file| match file.terminal_since {
            Some(since) => now.saturating_duration_since(since) < retention,
            None => true,
        });
        before - state.files.len()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
