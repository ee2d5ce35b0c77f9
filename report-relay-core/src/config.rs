//! Runtime settings for the relay pipeline.
//!
//! Every section deserializes with defaults so a config file only has to name the
//! watched directory and the routes. Durations are expressed in whole seconds in the
//! file and exposed as [`Duration`] through accessor methods.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classify::Priority;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub watch: WatchSettings,
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub state: StateSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
}

impl RelayConfig {
    /// Config with every tunable at its default.
    pub fn new(directory: impl Into<PathBuf>, routes: Vec<RouteConfig>) -> Self {
        Self {
            watch: WatchSettings::new(directory),
            routes,
            dispatch: DispatchSettings::default(),
            state: StateSettings::default(),
            health: HealthSettings::default(),
            notifications: NotificationSettings::default(),
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            directory = %self.watch.directory.display(),
            routes = self.routes.len(),
            workers = self.dispatch.workers,
            "Loaded relay config"
        );
        debug!(?self, "Relay config loaded (full debug)");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    pub directory: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Subscribe to native filesystem notifications. When off, only scans feed the queue.
    #[serde(default = "default_true")]
    pub native_events: bool,
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    /// Extra settle rounds allowed while the file size keeps changing.
    #[serde(default = "default_settle_max_rounds")]
    pub settle_max_rounds: u32,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_rewatch_delay_secs")]
    pub rewatch_delay_secs: u64,
}

impl WatchSettings {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            extensions: default_extensions(),
            native_events: true,
            settle_delay_secs: default_settle_delay_secs(),
            settle_max_rounds: default_settle_max_rounds(),
            scan_interval_secs: default_scan_interval_secs(),
            rewatch_delay_secs: default_rewatch_delay_secs(),
        }
    }

    /// Whether `path` carries one of the allowed extensions (case-insensitive).
    pub fn accepts(&self, path: &std::path::Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn rewatch_delay(&self) -> Duration {
        Duration::from_secs(self.rewatch_delay_secs)
    }
}

/// Maps a filename keyword to a destination topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub keyword: String,
    pub label: String,
    #[serde(default)]
    pub topic_id: Option<i64>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl RouteConfig {
    pub fn new(keyword: impl Into<String>, label: impl Into<String>, topic_id: Option<i64>) -> Self {
        Self {
            keyword: keyword.into(),
            label: label.into(),
            topic_id,
            priority: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: usize,
    /// Base of the exponential backoff applied after a rate-limit response.
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
    /// Linear cooldown step applied after a generic failure.
    #[serde(default = "default_retry_cooldown_secs")]
    pub retry_cooldown_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            retry_cooldown_secs: default_retry_cooldown_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl DispatchSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSettings {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default = "default_stats_path")]
    pub stats_path: PathBuf,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
    /// How long terminal entries stay in the in-memory tracker.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            stats_path: default_stats_path(),
            audit_capacity: default_audit_capacity(),
            persist_interval_secs: default_persist_interval_secs(),
            retention_secs: default_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl StateSettings {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_max_failures_per_interval")]
    pub max_failures_per_interval: u64,
    #[serde(default = "default_stale_scan_secs")]
    pub stale_scan_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            max_pending: default_max_pending(),
            max_failures_per_interval: default_max_failures_per_interval(),
            stale_scan_secs: default_stale_scan_secs(),
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn stale_scan_after(&self) -> Duration {
        Duration::from_secs(self.stale_scan_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub topic_id: Option<i64>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            topic_id: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_extensions() -> Vec<String> {
    vec!["pdf".to_string()]
}
fn default_settle_delay_secs() -> u64 {
    3
}
fn default_settle_max_rounds() -> u32 {
    5
}
fn default_scan_interval_secs() -> u64 {
    30 * 60
}
fn default_rewatch_delay_secs() -> u64 {
    10
}
fn default_workers() -> usize {
    3
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_attempts() -> u32 {
    3
}
fn default_rate_limit_per_minute() -> usize {
    20
}
fn default_rate_limit_backoff_secs() -> u64 {
    2
}
fn default_retry_cooldown_secs() -> u64 {
    5
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_ledger_path() -> PathBuf {
    PathBuf::from("state/sent_files.txt")
}
fn default_stats_path() -> PathBuf {
    PathBuf::from("state/stats.json")
}
fn default_audit_capacity() -> usize {
    500
}
fn default_persist_interval_secs() -> u64 {
    300
}
fn default_retention_secs() -> u64 {
    24 * 60 * 60
}
fn default_cleanup_interval_secs() -> u64 {
    60 * 60
}
fn default_health_interval_secs() -> u64 {
    300
}
fn default_max_pending() -> usize {
    100
}
fn default_max_failures_per_interval() -> u64 {
    10
}
fn default_stale_scan_secs() -> u64 {
    2 * 60 * 60
}
