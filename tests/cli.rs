use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;
use std::path::Path;
use tempfile::TempDir;

/// Writes a config whose state lives inside `dir`; notifications are off so no
/// message is ever sent.
fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let root = dir.path().display();
    let yaml = format!(
        "watch:\n  directory: {root}/inbox\n  native_events: false\n  settle_delay_secs: 0\nroutes:\n  - keyword: user\n    label: User errors\n    topic_id: 11\nstate:\n  ledger_path: {root}/state/sent.txt\n  stats_path: {root}/state/stats.json\nnotifications:\n  enabled: false\n"
    );
    let path = dir.path().join("relay.yaml");
    write(&path, yaml).expect("Writing temp config failed");
    path
}

fn relay(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("report-relay").expect("Binary exists");
    cmd.current_dir(dir)
        .env_remove("TELEGRAM_BOT_TOKEN")
        .env_remove("TELEGRAM_CHAT_ID")
        .env_remove("TELEGRAM_API_BASE");
    cmd
}

#[test]
fn stats_prints_persisted_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    std::fs::create_dir_all(dir.path().join("state")).unwrap();
    write(
        dir.path().join("state/stats.json"),
        r#"{"delivered": 4, "skipped": 1, "delivered_by_destination": {"User errors": 4}}"#,
    )
    .unwrap();

    relay(dir.path())
        .arg("stats")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"delivered\": 4").and(predicate::str::contains("User errors")));
}

#[test]
fn stats_without_snapshot_prints_empty_counters() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    relay(dir.path())
        .args(["stats", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"delivered\": 0"));
}

#[test]
fn clear_ledger_archives_previous_entries() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    std::fs::create_dir_all(dir.path().join("state")).unwrap();
    write(dir.path().join("state/sent.txt"), "/reports/a_user.pdf\n").unwrap();

    relay(dir.path())
        .args(["clear-ledger", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("archived to"));

    let ledger = std::fs::read_to_string(dir.path().join("state/sent.txt")).unwrap();
    assert!(ledger.trim().is_empty());
    let backups = std::fs::read_dir(dir.path().join("state"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
        .count();
    assert_eq!(backups, 1);
}

#[test]
fn watch_requires_bot_token() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    relay(dir.path())
        .args(["watch", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("TELEGRAM_BOT_TOKEN"));
}

#[test]
fn scan_of_empty_folder_reports_nothing_to_do() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    relay(dir.path())
        .args(["scan", "--config"])
        .arg(&config)
        .env("TELEGRAM_BOT_TOKEN", "123:test")
        .env("TELEGRAM_CHAT_ID", "-100123")
        .env("TELEGRAM_API_BASE", "http://127.0.0.1:9")
        .assert()
        .success()
        .stdout(predicate::str::contains("Scan complete: 0 candidates"));
}

#[test]
fn invalid_config_names_offending_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.yaml");
    write(&path, "watch:\n  directory: ./inbox\nroutes: []\n").unwrap();

    relay(dir.path())
        .args(["stats", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("routes"));
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{:?}", event));
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use report_relay::cli::{run, Cli, Commands};

    let cli = Cli {
        command: Commands::Stats {
            config: std::path::PathBuf::from("dummy.yaml"),
        },
    };

    let result = run(cli).await;
    assert!(result.is_err(), "missing config file must fail");

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
