///
/// This module implements the CLI interface for report-relay: command parsing and the
/// orchestration behind each subcommand.
///
/// All pipeline logic (watching, classification, dispatch, ledger, statistics) lives in
/// the [`report-relay-core`] crate. This module is CLI glue only.
///
/// ## Commands
/// - `watch`: run the relay until Ctrl-C, then shut down gracefully.
/// - `scan`: one directory scan, dispatch everything found, print a summary.
/// - `stats`: print the persisted statistics snapshot as JSON.
/// - `clear-ledger`: archive the sent-file ledger and start empty.
///
/// For programmatic and integration use, call [`run`] with a constructed [`Cli`].
///
/// [`report-relay-core`]: ../../report_relay_core/
use crate::load_config::{load_config, CliConfig};
use crate::telegram::TelegramClient;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use report_relay_core::audit::{read_snapshot, StatsSnapshot};
use report_relay_core::intake::IntakePipeline;
use report_relay_core::ledger::SentLedger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how long a one-shot scan waits for its dispatches.
const SCAN_DRAIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// CLI for report-relay: forward new report files to Telegram topics.
#[derive(Parser)]
#[clap(
    name = "report-relay",
    version,
    about = "Watch a folder for new PDF reports and forward them to Telegram forum topics"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the configured folder and relay new reports until interrupted
    Watch {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Scan the folder once, dispatch everything new and exit
    Scan {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Print the persisted delivery statistics as JSON
    Stats {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Archive the sent-file ledger so every report becomes eligible again
    ClearLedger {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Watch { config } => {
            let config = load_config(config)?;
            tracing::info!(command = "watch", "Starting relay");
            watch(config).await
        }
        Commands::Scan { config } => {
            let config = load_config(config)?;
            tracing::info!(command = "scan", "Starting one-shot scan");
            scan_once(config).await
        }
        Commands::Stats { config } => {
            let config = load_config(config)?;
            let snapshot = read_snapshot(&config.relay.state.stats_path);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Commands::ClearLedger { config } => {
            let config = load_config(config)?;
            let ledger = SentLedger::open(&config.relay.state.ledger_path)
                .context("failed to open ledger")?;
            match ledger.clear().context("failed to clear ledger")? {
                Some(backup) => println!(
                    "Ledger cleared; previous entries archived to {}",
                    backup.display()
                ),
                None => println!("Ledger was empty; nothing archived"),
            }
            Ok(())
        }
    }
}

async fn watch(config: CliConfig) -> Result<()> {
    let client = TelegramClient::new_from_env(&config.telegram)?;
    let pipeline = IntakePipeline::start(config.relay, Arc::new(client))
        .await
        .context("failed to start relay pipeline")?;

    let interrupted = tokio::signal::ctrl_c().await;
    if let Err(e) = &interrupted {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    } else {
        tracing::info!(command = "watch", "Interrupt received, shutting down");
    }
    pipeline.shutdown().await;
    interrupted.context("failed to listen for shutdown signal")
}

async fn scan_once(mut config: CliConfig) -> Result<()> {
    config.relay.watch.native_events = false;
    let client = TelegramClient::new_from_env(&config.telegram)?;
    let pipeline = IntakePipeline::start(config.relay, Arc::new(client))
        .await
        .context("failed to start relay pipeline")?;
    let before = pipeline.stats();

    let scanned = pipeline.run_scan().await;
    if scanned.is_ok() && !pipeline.wait_idle(SCAN_DRAIN_TIMEOUT).await {
        tracing::warn!(command = "scan", "Timed out waiting for dispatches to finish");
    }
    let after = pipeline.stats();
    pipeline.shutdown().await;

    let summary = scanned.context("directory scan failed")?;
    let (delivered, failed, skipped) = run_delta(&before, &after);
    tracing::info!(command = "scan", ?summary, delivered, failed, skipped, "Scan complete");
    println!(
        "Scan complete: {} candidates, {} already sent, {} queued, {delivered} delivered, {failed} failed, {skipped} skipped",
        summary.candidates, summary.already_sent, summary.queued
    );
    Ok(())
}

fn run_delta(before: &StatsSnapshot, after: &StatsSnapshot) -> (u64, u64, u64) {
    (
        after.delivered.saturating_sub(before.delivered),
        after.failed().saturating_sub(before.failed()),
        after.skipped.saturating_sub(before.skipped),
    )
}
