//! Sends a single report through the channel client with bounded retry.
//!
//! The executor never touches the ledger: it returns an explicit [`DispatchOutcome`]
//! and the intake pipeline decides what to persist. Retry policy is a plain branch on
//! the [`ApiError`] variant:
//!
//! - rate limited: exponential backoff (`base * 2^attempt`, or the server's
//!   `retry_after` if longer), retried up to the attempt cap;
//! - payload rejected: permanent, never retried;
//! - anything else: linear cooldown (`cooldown * attempt`), retried up to the cap.
//!
//! Every request to the client takes a rate-limiter slot first, and the slot stays
//! spent whether the request succeeds or not. A denied first attempt returns a
//! retryable "rate-limited" outcome; later attempts wait for a free slot.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::Priority;
use crate::config::DispatchSettings;
use crate::contract::{ApiError, ChannelClient, Destination};
use crate::rate_limit::RateLimiter;

/// Shortest pause between slot checks while a retry waits on the local limiter.
const MIN_SLOT_WAIT: Duration = Duration::from_millis(100);

/// A unit of work for the worker pool.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub id: Uuid,
    pub path: PathBuf,
    pub file_name: String,
    pub destination: Destination,
    pub caption: String,
    pub priority: Priority,
    pub enqueued_at: Instant,
    /// Earliest moment the file may be read (settle delay).
    pub not_before: Instant,
    /// Size observed when the task was created; used for the settle stability check.
    pub observed_size: u64,
    /// Lifecycle generation of the tracked path this task belongs to.
    pub generation: u64,
}

/// Coarse cause of a failed delivery, safe to show outside the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    RateLimited,
    Unreachable,
    Rejected,
    Missing,
    Unreadable,
    Interrupted,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailureCategory::RateLimited => "rate-limited",
            FailureCategory::Unreachable => "unreachable",
            FailureCategory::Rejected => "rejected",
            FailureCategory::Missing => "missing",
            FailureCategory::Unreadable => "unreadable",
            FailureCategory::Interrupted => "interrupted by shutdown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryableFailure {
    /// The local rate limiter denied admission; nothing was sent.
    RateLimited,
    /// Every attempt failed with a transient error.
    Exhausted {
        attempts: u32,
        last_error: String,
        cause: FailureCategory,
    },
}

impl std::fmt::Display for RetryableFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryableFailure::RateLimited => write!(f, "rate-limited"),
            RetryableFailure::Exhausted {
                attempts,
                last_error,
                ..
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    FailedPermanent(String),
    FailedRetryable(RetryableFailure),
}

impl DispatchOutcome {
    /// `None` for a delivery.
    pub fn failure_category(&self) -> Option<FailureCategory> {
        match self {
            DispatchOutcome::Delivered { .. } => None,
            DispatchOutcome::FailedPermanent(reason) if reason == FILE_MISSING => {
                Some(FailureCategory::Missing)
            }
            DispatchOutcome::FailedPermanent(_) => Some(FailureCategory::Rejected),
            DispatchOutcome::FailedRetryable(RetryableFailure::RateLimited) => {
                Some(FailureCategory::RateLimited)
            }
            DispatchOutcome::FailedRetryable(RetryableFailure::Exhausted { cause, .. }) => Some(*cause),
        }
    }
}

const FILE_MISSING: &str = "file missing";

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limit_base: Duration,
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            rate_limit_base: Duration::from_secs(settings.rate_limit_backoff_secs),
            cooldown: Duration::from_secs(settings.retry_cooldown_secs),
        }
    }

    /// Delay after a rate-limit response on `attempt` (1-based).
    pub fn rate_limit_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .rate_limit_base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        retry_after.map_or(exponential, |server| server.max(exponential))
    }

    /// Delay after a generic failure on `attempt` (1-based).
    pub fn cooldown_delay(&self, attempt: u32) -> Duration {
        self.cooldown.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&DispatchSettings::default())
    }
}

pub struct DispatchExecutor {
    client: Arc<dyn ChannelClient>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for DispatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchExecutor")
            .field("limiter", &self.limiter)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl DispatchExecutor {
    pub fn new(client: Arc<dyn ChannelClient>, limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self {
            client,
            limiter,
            policy,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Waits until the limiter hands out a slot.
    async fn acquire_slot(&self) {
        while !self.limiter.try_acquire() {
            let wait = self.limiter.time_until_available().max(MIN_SLOT_WAIT);
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn send(&self, task: &DispatchTask) -> DispatchOutcome {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = String::new();
        let mut cause = FailureCategory::Unreachable;

        for attempt in 1..=max_attempts {
            let is_last = attempt == max_attempts;

            match tokio::fs::File::open(&task.path).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(file = %task.file_name, "[DISPATCH] File vanished before upload");
                    return DispatchOutcome::FailedPermanent(FILE_MISSING.to_string());
                }
                Err(e) => {
                    last_error = format!("source file unreadable: {e}");
                    cause = FailureCategory::Unreadable;
                    warn!(file = %task.file_name, attempt, error = %e, "[DISPATCH] Could not open file");
                    if !is_last {
                        tokio::time::sleep(self.policy.cooldown_delay(attempt)).await;
                    }
                    continue;
                }
            }

            if attempt == 1 {
                if !self.limiter.try_acquire() {
                    debug!(file = %task.file_name, "[DISPATCH] Local rate limit reached, deferring");
                    return DispatchOutcome::FailedRetryable(RetryableFailure::RateLimited);
                }
            } else {
                self.acquire_slot().await;
            }

            debug!(
                file = %task.file_name,
                destination = %task.destination.label,
                attempt,
                "[DISPATCH] Sending document"
            );
            match self
                .client
                .send_document(&task.destination, &task.path, &task.caption)
                .await
            {
                Ok(()) => {
                    info!(
                        file = %task.file_name,
                        destination = %task.destination.label,
                        attempt,
                        "[DISPATCH] Document delivered"
                    );
                    return DispatchOutcome::Delivered { attempts: attempt };
                }
                Err(ApiError::PayloadRejected(reason)) => {
                    warn!(file = %task.file_name, reason = %reason, "[DISPATCH] Payload rejected");
                    return DispatchOutcome::FailedPermanent(format!("payload rejected: {reason}"));
                }
                Err(ApiError::RateLimited { retry_after }) => {
                    last_error = "rate limited by channel API".to_string();
                    cause = FailureCategory::RateLimited;
                    let delay = self.policy.rate_limit_delay(attempt, retry_after);
                    warn!(
                        file = %task.file_name,
                        attempt,
                        ?delay,
                        "[DISPATCH] Channel API rate limit hit"
                    );
                    if !is_last {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    cause = FailureCategory::Unreachable;
                    let delay = self.policy.cooldown_delay(attempt);
                    warn!(
                        file = %task.file_name,
                        attempt,
                        error = %e,
                        ?delay,
                        "[DISPATCH] Send failed"
                    );
                    if !is_last {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        DispatchOutcome::FailedRetryable(RetryableFailure::Exhausted {
            attempts: max_attempts,
            last_error,
            cause,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockChannelClient;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn task_for(path: PathBuf) -> DispatchTask {
        let now = Instant::now();
        DispatchTask {
            id: Uuid::new_v4(),
            file_name: path.file_name().unwrap().to_string_lossy().into_owned(),
            path,
            destination: Destination::new("User errors", Some(11)),
            caption: "User errors".to_string(),
            priority: Priority::Normal,
            enqueued_at: now,
            not_before: now,
            observed_size: 0,
            generation: 1,
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            rate_limit_base: Duration::from_secs(2),
            cooldown: Duration::from_secs(5),
        }
    }

    fn executor(client: MockChannelClient, max_attempts: u32) -> DispatchExecutor {
        DispatchExecutor::new(
            Arc::new(client),
            Arc::new(RateLimiter::per_minute(20)),
            policy(max_attempts),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_on_first_attempt_records_send() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("user_error_report.pdf");
        std::fs::write(&file, vec![1u8; 512]).unwrap();

        let mut client = MockChannelClient::new();
        client.expect_send_document().times(1).returning(|_, _, _| Ok(()));
        let executor = executor(client, 3);

        let outcome = executor.send(&task_for(file)).await;
        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 1 });
        assert_eq!(executor.limiter().in_window(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn payload_rejection_is_tried_exactly_once() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("empty_user.pdf");
        std::fs::write(&file, b"").unwrap();

        let mut client = MockChannelClient::new();
        client
            .expect_send_document()
            .times(1)
            .returning(|_, _, _| Err(ApiError::PayloadRejected("empty file".into())));
        let executor = executor(client, 5);

        let outcome = executor.send(&task_for(file)).await;
        assert!(matches!(outcome, DispatchOutcome::FailedPermanent(reason) if reason.contains("empty file")));
        assert_eq!(executor.limiter().in_window(), 1, "a rejected request still spends its slot");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_file_fails_permanently_without_sending() {
        let dir = tempdir().unwrap();
        let mut client = MockChannelClient::new();
        client.expect_send_document().never();
        let executor = executor(client, 3);

        let outcome = executor.send(&task_for(dir.path().join("gone_user.pdf"))).await;
        assert_eq!(outcome, DispatchOutcome::FailedPermanent("file missing".to_string()));
        assert_eq!(outcome.failure_category(), Some(FailureCategory::Missing));
        assert_eq!(executor.limiter().in_window(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_use_all_attempts_with_growing_delays() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("server.pdf");
        std::fs::write(&file, b"%PDF-1.4").unwrap();

        let calls: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let mut client = MockChannelClient::new();
        client.expect_send_document().times(4).returning(move |_, _, _| {
            seen.lock().unwrap().push(Instant::now());
            Err(ApiError::transient(502, "bad gateway"))
        });
        let executor = executor(client, 4);

        let outcome = executor.send(&task_for(file)).await;
        match &outcome {
            DispatchOutcome::FailedRetryable(RetryableFailure::Exhausted {
                attempts,
                last_error,
                cause,
            }) => {
                assert_eq!(*attempts, 4);
                assert!(last_error.contains("bad gateway"));
                assert_eq!(*cause, FailureCategory::Unreachable);
                assert_eq!(outcome.failure_category(), Some(FailureCategory::Unreachable));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let calls = calls.lock().unwrap();
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 3);
        assert!(gaps.windows(2).all(|w| w[1] > w[0]), "delays not increasing: {gaps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn api_rate_limit_backs_off_then_succeeds() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("warn.pdf");
        std::fs::write(&file, b"%PDF-1.4").unwrap();

        let mut seq = mockall::Sequence::new();
        let mut client = MockChannelClient::new();
        client
            .expect_send_document()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(ApiError::RateLimited { retry_after: None }));
        client
            .expect_send_document()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        let executor = executor(client, 3);

        let started = Instant::now();
        let outcome = executor.send(&task_for(file)).await;
        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 2 });
        // base 2s * 2^1
        assert!(Instant::now() - started >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn local_rate_limit_denial_skips_the_client() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("user.pdf");
        std::fs::write(&file, b"%PDF-1.4").unwrap();

        let mut client = MockChannelClient::new();
        client.expect_send_document().never();
        let limiter = Arc::new(RateLimiter::per_minute(1));
        limiter.record_send();
        let executor = DispatchExecutor::new(Arc::new(client), limiter, policy(3));

        let outcome = executor.send(&task_for(file)).await;
        assert_eq!(outcome, DispatchOutcome::FailedRetryable(RetryableFailure::RateLimited));
    }

    /// Client whose uploads take a while, so concurrent sends overlap.
    struct SlowClient {
        uploads: AtomicUsize,
        latency: Duration,
    }

    #[async_trait::async_trait]
    impl ChannelClient for SlowClient {
        async fn send_document(&self, _: &Destination, _: &Path, _: &str) -> Result<(), ApiError> {
            tokio::time::sleep(self.latency).await;
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_text(&self, _: &Destination, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sends_respect_the_cap() {
        let dir = tempdir().unwrap();
        let client = Arc::new(SlowClient {
            uploads: AtomicUsize::new(0),
            latency: Duration::from_millis(50),
        });
        let limiter = Arc::new(RateLimiter::per_minute(1));
        let executor = Arc::new(DispatchExecutor::new(
            Arc::clone(&client) as Arc<dyn ChannelClient>,
            Arc::clone(&limiter),
            policy(3),
        ));

        let sends = (0..3).map(|i| {
            let file = dir.path().join(format!("{i}_user.pdf"));
            std::fs::write(&file, b"%PDF-1.4").unwrap();
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.send(&task_for(file)).await })
        });
        let outcomes: Vec<DispatchOutcome> = futures::future::join_all(sends)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let delivered = outcomes
            .iter()
            .filter(|o| matches!(o, DispatchOutcome::Delivered { .. }))
            .count();
        let deferred = outcomes
            .iter()
            .filter(|o| **o == DispatchOutcome::FailedRetryable(RetryableFailure::RateLimited))
            .count();
        assert_eq!((delivered, deferred), (1, 2));
        assert_eq!(client.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.in_window(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_api_rate_limit_waits_for_a_local_slot() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("server.pdf");
        std::fs::write(&file, b"%PDF-1.4").unwrap();

        let mut seq = mockall::Sequence::new();
        let mut client = MockChannelClient::new();
        client
            .expect_send_document()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(ApiError::RateLimited { retry_after: None }));
        client
            .expect_send_document()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        let limiter = Arc::new(RateLimiter::per_minute(1));
        let executor = DispatchExecutor::new(Arc::new(client), Arc::clone(&limiter), policy(3));

        let started = Instant::now();
        let outcome = executor.send(&task_for(file)).await;
        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 2 });
        // The first request's slot only frees up once it leaves the window.
        assert!(Instant::now() - started >= crate::rate_limit::DEFAULT_WINDOW);
        assert_eq!(limiter.in_window(), 1);
    }

    #[test]
    fn server_retry_after_wins_when_longer() {
        let policy = policy(3);
        assert_eq!(policy.rate_limit_delay(1, None), Duration::from_secs(4));
        assert_eq!(
            policy.rate_limit_delay(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(policy.rate_limit_delay(2, Some(Duration::from_secs(1))), Duration::from_secs(8));
    }
}
