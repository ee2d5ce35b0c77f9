//! The intake pipeline: turns filesystem signals and directory scans into dispatches.
//!
//! ## Tasks
//! - **pump**: owns the native watcher, converts [`WatchSignal`]s into queue entries and
//!   recreates the watcher after an internal error;
//! - **workers** (fixed pool): drain the [`TaskQueue`], wait out the settle delay and run
//!   one [`DispatchTask`] to completion before taking the next;
//! - **scan**: full directory scan on an interval, immediately at startup and whenever
//!   the watcher overflows;
//! - **health**, **persist**, **cleanup**: periodic housekeeping.
//!
//! Intake tasks (pump, scan, workers) stop on the intake token; housekeeping stops on the
//! timers token, which is cancelled only after in-flight work has drained. Every
//! periodic operation is also callable directly ([`IntakePipeline::run_scan`],
//! [`IntakePipeline::health_check`], [`IntakePipeline::persist_stats`],
//! [`IntakePipeline::cleanup`]).

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditRecorder, OutcomeKind, StatsSnapshot};
use crate::classify::{caption_for, Classifier};
use crate::config::RelayConfig;
use crate::contract::ChannelClient;
use crate::dispatch::{
    DispatchExecutor, DispatchOutcome, DispatchTask, FailureCategory, RetryPolicy, RetryableFailure,
};
use crate::ledger::{LedgerError, SentLedger};
use crate::notifier::Notifier;
use crate::queue::TaskQueue;
use crate::rate_limit::RateLimiter;
use crate::tracker::{Admission, FileState, FileTracker, ObservationKind, TerminalOutcome};
use crate::watch::{DirectoryWatcher, FsEvent, WatchSignal, SIGNAL_CHANNEL_CAPACITY};

/// Shortest wait after a local rate-limit denial.
const MIN_ADMISSION_WAIT: Duration = Duration::from_millis(100);
/// How long shutdown waits for the final operator notice.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);
const INTERRUPTED: &str = "interrupted by shutdown";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to create watched directory {path}: {source}")]
    WatchDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// One failing health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthWarning {
    pub check: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub warnings: Vec<HealthWarning>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Result of one directory scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Files with an allowed extension found in the directory.
    pub candidates: usize,
    /// Files already in the ledger.
    pub already_sent: usize,
    /// New tasks put on the queue.
    pub queued: usize,
}

/// Shared state for every pipeline task.
struct PipelineCore {
    config: RelayConfig,
    classifier: Classifier,
    ledger: Arc<SentLedger>,
    tracker: FileTracker,
    queue: TaskQueue,
    executor: DispatchExecutor,
    recorder: Arc<AuditRecorder>,
    notifier: Notifier,
    intake_cancel: CancellationToken,
    scan_requested: Notify,
    watcher_active: AtomicBool,
    watcher_restarts: AtomicU32,
    failures_at_last_check: AtomicU64,
    last_scan: Mutex<Instant>,
}

pub struct IntakePipeline {
    core: Arc<PipelineCore>,
    signals: mpsc::Sender<WatchSignal>,
    timers_cancel: CancellationToken,
    intake_tasks: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for IntakePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntakePipeline")
            .field("directory", &self.core.config.watch.directory)
            .field("workers", &self.workers.len())
            .field("queued", &self.core.queue.len())
            .finish_non_exhaustive()
    }
}

impl IntakePipeline {
    /// Opens persistent state and spawns every pipeline task.
    ///
    /// Failing to create the watched directory or to open the ledger is fatal. A watcher
    /// that cannot be started is not: the pump retries it and scans keep running.
    pub async fn start(config: RelayConfig, client: Arc<dyn ChannelClient>) -> Result<Self, PipelineError> {
        let core = Arc::new(PipelineCore::open(config, client).await?);
        let directory = core.directory().to_path_buf();

        let (signals, signal_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let timers_cancel = CancellationToken::new();

        let intake_tasks = vec![
            tokio::spawn(pump_loop(Arc::clone(&core), signal_rx, signals.clone())),
            tokio::spawn(scan_loop(Arc::clone(&core))),
        ];
        let workers = (0..core.config.dispatch.workers.max(1))
            .map(|id| tokio::spawn(worker_loop(Arc::clone(&core), id)))
            .collect();
        let timers = vec![
            tokio::spawn(health_loop(Arc::clone(&core), timers_cancel.clone())),
            tokio::spawn(persist_loop(Arc::clone(&core), timers_cancel.clone())),
            tokio::spawn(cleanup_loop(Arc::clone(&core), timers_cancel.clone())),
        ];

        info!(
            directory = %directory.display(),
            workers = core.config.dispatch.workers.max(1),
            routes = core.classifier.routes().len(),
            sent = core.ledger.len(),
            "[INTAKE] Pipeline started"
        );
        core.notifier
            .notify(format!("report-relay started, watching {}", directory.display()));

        Ok(Self {
            core,
            signals,
            timers_cancel,
            intake_tasks,
            workers,
            timers,
        })
    }

    /// Sender feeding the pump, the same channel the native watcher writes to.
    pub fn event_sender(&self) -> mpsc::Sender<WatchSignal> {
        self.signals.clone()
    }

    pub fn ledger(&self) -> &Arc<SentLedger> {
        &self.core.ledger
    }

    pub fn recorder(&self) -> &Arc<AuditRecorder> {
        &self.core.recorder
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.recorder.snapshot()
    }

    pub fn state_of(&self, path: &Path) -> Option<FileState> {
        self.core.tracker.state_of(path)
    }

    pub fn queue_len(&self) -> usize {
        self.core.queue.len()
    }

    pub async fn run_scan(&self) -> Result<ScanSummary, PipelineError> {
        self.core.run_scan().await
    }

    pub async fn health_check(&self) -> HealthReport {
        self.core.health_check().await
    }

    pub fn persist_stats(&self) -> io::Result<()> {
        self.core.persist_stats()
    }

    pub fn cleanup(&self) -> usize {
        self.core.cleanup()
    }

    /// True when nothing is queued, settling or in flight.
    pub fn is_idle(&self) -> bool {
        self.core.queue.is_empty()
            && self.core.tracker.count_in(FileState::Queued) == 0
            && self.core.tracker.count_in(FileState::InFlight) == 0
    }

    /// Waits until the pipeline is idle. Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let poll = async {
            while !self.is_idle() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Stops intake, lets in-flight dispatches finish within the shutdown timeout,
    /// stops housekeeping and persists statistics a final time.
    pub async fn shutdown(mut self) {
        let core = Arc::clone(&self.core);
        info!("[INTAKE] Shutting down pipeline");
        core.intake_cancel.cancel();

        let workers = std::mem::take(&mut self.workers);
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let timeout = core.config.dispatch.shutdown_timeout();
        if tokio::time::timeout(timeout, join_all(workers)).await.is_err() {
            for handle in aborts {
                handle.abort();
            }
            for path in core.tracker.in_flight_paths() {
                warn!(path = %path.display(), "[DISPATCH] Dispatch interrupted by shutdown");
                core.recorder.record_outcome(
                    &path,
                    OutcomeKind::FailedRetryable,
                    None,
                    Some(INTERRUPTED),
                );
            }
        }
        join_all(std::mem::take(&mut self.intake_tasks)).await;

        self.timers_cancel.cancel();
        join_all(std::mem::take(&mut self.timers)).await;

        if let Err(e) = core.persist_stats() {
            warn!(error = %e, "[AUDIT] Failed to persist stats on shutdown");
        }
        if let Some(notice) = core.notifier.notify("report-relay stopped") {
            let _ = tokio::time::timeout(NOTICE_TIMEOUT, notice).await;
        }
        info!("[INTAKE] Pipeline stopped");
    }
}

impl Drop for IntakePipeline {
    fn drop(&mut self) {
        self.core.intake_cancel.cancel();
        self.timers_cancel.cancel();
    }
}

impl PipelineCore {
    async fn open(config: RelayConfig, client: Arc<dyn ChannelClient>) -> Result<Self, PipelineError> {
        let directory = &config.watch.directory;
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(|source| PipelineError::WatchDirectory {
                path: directory.clone(),
                source,
            })?;

        let ledger = Arc::new(SentLedger::open(&config.state.ledger_path)?);
        let recorder = Arc::new(AuditRecorder::load(
            config.state.audit_capacity,
            &config.state.stats_path,
        ));
        let limiter = Arc::new(RateLimiter::per_minute(config.dispatch.rate_limit_per_minute));
        let executor = DispatchExecutor::new(
            Arc::clone(&client),
            limiter,
            RetryPolicy::from_settings(&config.dispatch),
        );
        let notifier = Notifier::from_settings(client, &config.notifications);
        let failures_so_far = recorder.snapshot().failed();

        Ok(Self {
            classifier: Classifier::from_config(&config.routes),
            tracker: FileTracker::new(config.state.retention()),
            queue: TaskQueue::new(config.dispatch.queue_capacity),
            ledger,
            executor,
            recorder,
            notifier,
            intake_cancel: CancellationToken::new(),
            scan_requested: Notify::new(),
            watcher_active: AtomicBool::new(false),
            watcher_restarts: AtomicU32::new(0),
            failures_at_last_check: AtomicU64::new(failures_so_far),
            last_scan: Mutex::new(Instant::now()),
            config,
        })
    }

    fn directory(&self) -> &Path {
        &self.config.watch.directory
    }

    /// Decides what to do with one observation of `path` and returns a task when a new
    /// lifecycle starts.
    async fn admit(&self, path: &Path, kind: ObservationKind) -> Option<DispatchTask> {
        if !self.config.watch.accepts(path) {
            return None;
        }
        if self.ledger.contains(path) {
            debug!(path = %path.display(), "[INTAKE] Already sent, ignoring");
            return None;
        }
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.forget(path);
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "[INTAKE] Could not stat file");
                return None;
            }
        };
        let file_name = path.file_name()?.to_string_lossy().into_owned();

        let Some(classification) = self.classifier.classify(&file_name) else {
            let reason = "no destination";
            if self
                .tracker
                .settle_without_dispatch(path, kind, TerminalOutcome::Skipped(reason.to_string()))
            {
                info!(file = %file_name, "[INTAKE] No route matches file, skipping");
                self.recorder
                    .record_outcome(path, OutcomeKind::Skipped, None, Some(reason));
            }
            return None;
        };

        let Admission::Enqueue { generation } = self.tracker.offer(path, kind, size) else {
            debug!(file = %file_name, ?kind, "[INTAKE] Duplicate observation");
            return None;
        };

        let now = Instant::now();
        Some(DispatchTask {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            caption: caption_for(&classification.destination, &file_name, size),
            file_name,
            destination: classification.destination,
            priority: classification.priority,
            enqueued_at: now,
            not_before: now + self.config.watch.settle_delay(),
            observed_size: size,
            generation,
        })
    }

    fn enqueue(&self, task: DispatchTask) {
        debug!(
            file = %task.file_name,
            destination = %task.destination.label,
            priority = ?task.priority,
            "[INTAKE] Queued file"
        );
        if let Some(evicted) = self.queue.push(task) {
            self.tracker.release(&evicted.path, evicted.generation);
            warn!(file = %evicted.file_name, "[INTAKE] Queue full, dropped oldest task");
            self.recorder.record_warning(
                "queue",
                &format!("queue full, dropped {}", evicted.file_name),
            );
        }
        self.recorder.record_queue_depth(self.queue.len());
    }

    fn forget(&self, path: &Path) {
        if let Some(previous) = self.tracker.forget(path) {
            debug!(path = %path.display(), ?previous, "[INTAKE] Stopped tracking file");
        }
    }

    async fn handle_event(&self, event: FsEvent) {
        let (path, kind) = match event {
            FsEvent::Created(path) => (path, ObservationKind::Created),
            FsEvent::Modified(path) => (path, ObservationKind::Modified),
            FsEvent::Renamed { from, to } => {
                self.forget(&from);
                (to, ObservationKind::Renamed)
            }
            FsEvent::Deleted(path) => {
                self.forget(&path);
                return;
            }
        };
        if let Some(task) = self.admit(&path, kind).await {
            self.enqueue(task);
        }
    }

    async fn run_scan(&self) -> Result<ScanSummary, PipelineError> {
        let mut summary = ScanSummary::default();
        if self.intake_cancel.is_cancelled() {
            return Ok(summary);
        }
        let directory = self.directory();
        let scan_error = |source: io::Error| PipelineError::Scan {
            path: directory.to_path_buf(),
            source,
        };
        let mut entries = tokio::fs::read_dir(directory).await.map_err(scan_error)?;

        let mut batch = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(scan_error)? {
            let path = entry.path();
            if !self.config.watch.accepts(&path) {
                continue;
            }
            summary.candidates += 1;
            if self.ledger.contains(&path) {
                summary.already_sent += 1;
                continue;
            }
            if self.tracker.is_tracked(&path) {
                continue;
            }
            if let Some(task) = self.admit(&path, ObservationKind::Scanned).await {
                batch.push(task);
            }
        }

        batch.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        summary.queued = batch.len();
        for task in batch {
            self.enqueue(task);
        }

        *self.last_scan.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        info!(
            directory = %directory.display(),
            candidates = summary.candidates,
            already_sent = summary.already_sent,
            queued = summary.queued,
            "[SCAN] Directory scan finished"
        );
        Ok(summary)
    }

    async fn process(&self, task: DispatchTask) {
        if !self.wait_until_settled(&task).await {
            self.tracker.release(&task.path, task.generation);
            debug!(file = %task.file_name, "[DISPATCH] Abandoned queued task on shutdown");
            return;
        }
        if !self.tracker.begin(&task.path, task.generation) {
            debug!(file = %task.file_name, "[DISPATCH] Task cancelled or superseded, dropping");
            return;
        }
        if self.ledger.contains(&task.path) {
            self.settle(&task, TerminalOutcome::Skipped("already sent".to_string()), None);
            return;
        }

        let (outcome, cause) = loop {
            let sent = self.executor.send(&task).await;
            let cause = sent.failure_category();
            match sent {
                DispatchOutcome::FailedRetryable(RetryableFailure::RateLimited) => {
                    let wait = self
                        .executor
                        .limiter()
                        .time_until_available()
                        .max(MIN_ADMISSION_WAIT);
                    debug!(file = %task.file_name, ?wait, "[DISPATCH] Waiting for rate limit slot");
                    tokio::select! {
                        _ = self.intake_cancel.cancelled() => {
                            break (
                                TerminalOutcome::FailedRetryable(INTERRUPTED.to_string()),
                                Some(FailureCategory::Interrupted),
                            );
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                DispatchOutcome::Delivered { attempts } => {
                    debug!(file = %task.file_name, attempts, "[DISPATCH] Delivery confirmed");
                    if let Err(e) = self.ledger.add(&task.path) {
                        error!(path = %task.path.display(), error = %e, "[DISPATCH] Failed to record delivery in ledger");
                        self.notifier.notify(format!(
                            "Delivered {} but could not record it in the ledger: {e}",
                            task.file_name
                        ));
                    }
                    break (TerminalOutcome::Delivered, None);
                }
                DispatchOutcome::FailedPermanent(reason) => {
                    break (TerminalOutcome::FailedPermanent(reason), cause)
                }
                DispatchOutcome::FailedRetryable(failure) => {
                    break (TerminalOutcome::FailedRetryable(failure.to_string()), cause)
                }
            }
        };
        self.settle(&task, outcome, cause);
    }

    /// Records the terminal outcome of a task that reached `InFlight`. The full reason
    /// goes to the log and the audit record; the operator only sees `cause`.
    fn settle(&self, task: &DispatchTask, outcome: TerminalOutcome, cause: Option<FailureCategory>) {
        let destination = Some(task.destination.label.as_str());
        match &outcome {
            TerminalOutcome::Delivered => {
                self.recorder
                    .record_outcome(&task.path, OutcomeKind::Delivered, destination, None);
            }
            TerminalOutcome::Skipped(reason) => {
                info!(file = %task.file_name, reason = %reason, "[DISPATCH] Skipped file");
                self.recorder
                    .record_outcome(&task.path, OutcomeKind::Skipped, destination, Some(reason));
            }
            TerminalOutcome::FailedPermanent(reason) | TerminalOutcome::FailedRetryable(reason) => {
                let kind = if matches!(outcome, TerminalOutcome::FailedPermanent(_)) {
                    OutcomeKind::FailedPermanent
                } else {
                    OutcomeKind::FailedRetryable
                };
                error!(
                    file = %task.file_name,
                    destination = %task.destination.label,
                    reason = %reason,
                    "[DISPATCH] Failed to deliver file"
                );
                self.recorder
                    .record_outcome(&task.path, kind, destination, Some(reason));
                let cause = cause.unwrap_or(FailureCategory::Unreachable);
                self.notifier
                    .notify(format!("Failed to deliver {}: {cause}", task.file_name));
            }
        }
        self.tracker.finish(&task.path, task.generation, outcome);
        self.recorder.record_queue_depth(self.queue.len());
    }

    /// Sleeps until the task's settle deadline, then keeps waiting while the file size
    /// changes, up to the configured number of extra rounds. Returns `false` on shutdown.
    async fn wait_until_settled(&self, task: &DispatchTask) -> bool {
        if !self.sleep_or_cancel_until(task.not_before).await {
            return false;
        }
        let delay = self.config.watch.settle_delay();
        let mut last_size = task.observed_size;
        for _ in 0..self.config.watch.settle_max_rounds {
            let size = match tokio::fs::metadata(&task.path).await {
                Ok(meta) => meta.len(),
                Err(_) => return true,
            };
            if size == last_size {
                return true;
            }
            debug!(file = %task.file_name, size, "[DISPATCH] File still growing, waiting");
            last_size = size;
            if !self.sleep_or_cancel_until(Instant::now() + delay).await {
                return false;
            }
        }
        true
    }

    async fn sleep_or_cancel_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            _ = self.intake_cancel.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => true,
        }
    }

    fn start_watcher(&self, signals: &mpsc::Sender<WatchSignal>) -> Option<DirectoryWatcher> {
        match DirectoryWatcher::start(self.directory(), signals.clone()) {
            Ok(watcher) => {
                self.watcher_active.store(true, Ordering::Relaxed);
                Some(watcher)
            }
            Err(e) => {
                self.watcher_active.store(false, Ordering::Relaxed);
                let message = format!("could not start filesystem watcher: {e}");
                warn!(error = %e, "[INTAKE] Filesystem watcher unavailable, relying on scans");
                self.recorder.record_warning("watcher", &message);
                self.notifier.notify(message);
                None
            }
        }
    }

    async fn health_check(&self) -> HealthReport {
        let mut warnings = Vec::new();
        let settings = &self.config.health;

        if self.config.watch.native_events && !self.watcher_active.load(Ordering::Relaxed) {
            warnings.push(HealthWarning {
                check: "watcher",
                message: format!(
                    "filesystem watcher is not running ({} restart attempts)",
                    self.watcher_restarts.load(Ordering::Relaxed)
                ),
            });
        }

        let reachable = matches!(tokio::fs::metadata(self.directory()).await, Ok(meta) if meta.is_dir());
        if !reachable {
            warnings.push(HealthWarning {
                check: "directory",
                message: format!("watched directory {} is not reachable", self.directory().display()),
            });
        }

        let failed = self.recorder.snapshot().failed();
        let previous = self.failures_at_last_check.swap(failed, Ordering::Relaxed);
        let new_failures = failed.saturating_sub(previous);
        if new_failures > settings.max_failures_per_interval {
            warnings.push(HealthWarning {
                check: "failures",
                message: format!("{new_failures} failed deliveries since the last check"),
            });
        }

        let pending = self.tracker.count_in(FileState::Queued);
        if pending > settings.max_pending {
            warnings.push(HealthWarning {
                check: "queue",
                message: format!("{pending} files waiting for dispatch"),
            });
        }

        let since_scan = self
            .last_scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if since_scan > settings.stale_scan_after() {
            warnings.push(HealthWarning {
                check: "scan",
                message: format!("no successful scan for {} s", since_scan.as_secs()),
            });
        }

        for warning in &warnings {
            warn!(check = warning.check, message = %warning.message, "[HEALTH] Check failed");
            self.recorder.record_warning(warning.check, &warning.message);
            self.notifier
                .notify(format!("Health check failed ({}): {}", warning.check, warning.message));
        }
        if warnings.is_empty() {
            debug!("[HEALTH] All checks passed");
        }
        HealthReport { warnings }
    }

    fn persist_stats(&self) -> io::Result<()> {
        self.recorder.record_queue_depth(self.queue.len());
        self.recorder.persist()
    }

    fn cleanup(&self) -> usize {
        let evicted = self.tracker.evict_expired();
        if evicted > 0 {
            debug!(evicted, remaining = self.tracker.len(), "[INTAKE] Evicted expired entries");
        }
        evicted
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn pump_loop(
    core: Arc<PipelineCore>,
    mut signal_rx: mpsc::Receiver<WatchSignal>,
    signals: mpsc::Sender<WatchSignal>,
) {
    let native = core.config.watch.native_events;
    let rewatch_delay = core.config.watch.rewatch_delay();
    let mut watcher = if native { core.start_watcher(&signals) } else { None };
    let mut rewatch_at = (native && watcher.is_none()).then(|| Instant::now() + rewatch_delay);

    loop {
        tokio::select! {
            _ = core.intake_cancel.cancelled() => break,
            _ = sleep_until_opt(rewatch_at) => {
                let attempt = core.watcher_restarts.fetch_add(1, Ordering::Relaxed) + 1;
                info!(attempt, "[INTAKE] Recreating filesystem watcher");
                watcher = core.start_watcher(&signals);
                rewatch_at = watcher.is_none().then(|| Instant::now() + rewatch_delay);
                if watcher.is_some() {
                    core.scan_requested.notify_one();
                }
            }
            signal = signal_rx.recv() => match signal {
                None => break,
                Some(WatchSignal::Event(event)) => core.handle_event(event).await,
                Some(WatchSignal::Overflow) => {
                    warn!("[INTAKE] Watcher overflow, requesting rescan");
                    core.scan_requested.notify_one();
                }
                Some(WatchSignal::Error(message)) => {
                    error!(error = %message, "[INTAKE] Filesystem watcher failed");
                    watcher = None;
                    core.watcher_active.store(false, Ordering::Relaxed);
                    core.recorder
                        .record_warning("watcher", &format!("watcher error: {message}"));
                    if native {
                        rewatch_at = Some(Instant::now() + rewatch_delay);
                    }
                }
            },
        }
        if watcher.as_ref().is_some_and(DirectoryWatcher::take_overflow) {
            core.scan_requested.notify_one();
        }
    }
    core.watcher_active.store(false, Ordering::Relaxed);
    debug!("[INTAKE] Event pump stopped");
}

async fn scan_loop(core: Arc<PipelineCore>) {
    let mut ticker = tokio::time::interval(core.config.watch.scan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = core.intake_cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = core.scan_requested.notified() => {}
        }
        if let Err(e) = core.run_scan().await {
            warn!(error = %e, "[SCAN] Directory scan failed");
        }
    }
    debug!("[SCAN] Scan loop stopped");
}

async fn worker_loop(core: Arc<PipelineCore>, id: usize) {
    debug!(worker = id, "[DISPATCH] Worker started");
    loop {
        let task = tokio::select! {
            biased;
            _ = core.intake_cancel.cancelled() => break,
            task = core.queue.pop() => task,
        };
        core.recorder.record_queue_depth(core.queue.len());
        core.process(task).await;
    }
    debug!(worker = id, "[DISPATCH] Worker stopped");
}

/// Sleeps for `period`; `false` if `cancel` fired first.
async fn sleep_or_cancel(period: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

async fn health_loop(core: Arc<PipelineCore>, cancel: CancellationToken) {
    while sleep_or_cancel(core.config.health.interval(), &cancel).await {
        core.health_check().await;
    }
}

async fn persist_loop(core: Arc<PipelineCore>, cancel: CancellationToken) {
    let period = core.config.state.persist_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = core.persist_stats() {
                    warn!(error = %e, "[AUDIT] Failed to persist stats");
                }
            }
        }
    }
}

async fn cleanup_loop(core: Arc<PipelineCore>, cancel: CancellationToken) {
    while sleep_or_cancel(core.config.state.cleanup_interval(), &cancel).await {
        core.cleanup();
    }
}
