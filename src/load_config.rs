/// `load_config` module: reads the static YAML config file into the relay's typed settings.
///
/// This is the only place where user-supplied YAML is parsed. The file carries no secrets:
/// the bot token and chat id come from the environment (see [`crate::telegram`]).
///
/// # Responsibilities
/// - Parse the YAML file into [`RelayConfig`] plus the non-secret Telegram section
/// - Validate the values the pipeline cannot run without, naming the offending key
///
/// # Errors
/// All errors use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::{anyhow, bail, Result};
use report_relay_core::config::RelayConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{error, info};

use crate::telegram::TelegramSection;

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub telegram: TelegramSection,
}

/// Loads and validates a static YAML config file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    if let Err(e) = validate(&config.relay) {
        error!(error = %e, config_path = ?path_ref, "Config failed validation");
        return Err(e);
    }
    config.relay.trace_loaded();
    Ok(config)
}

/// Rejects configs the pipeline cannot run with.
pub fn validate(relay: &RelayConfig) -> Result<()> {
    if relay.watch.directory.as_os_str().is_empty() {
        bail!("watch.directory must not be empty");
    }
    if relay.watch.extensions.iter().all(|e| e.trim().is_empty()) {
        bail!("watch.extensions must list at least one extension");
    }
    if relay.routes.is_empty() {
        bail!("routes must contain at least one route");
    }
    // An empty keyword never matches, which leaves that route disabled.
    if relay.routes.iter().all(|route| route.keyword.trim().is_empty()) {
        bail!("routes must contain at least one route with a non-empty keyword");
    }
    for (i, route) in relay.routes.iter().enumerate() {
        if !route.keyword.trim().is_empty() && route.label.trim().is_empty() {
            bail!("routes[{i}].label must not be empty");
        }
    }
    if relay.dispatch.workers == 0 {
        bail!("dispatch.workers must be at least 1");
    }
    if relay.dispatch.max_attempts == 0 {
        bail!("dispatch.max_attempts must be at least 1");
    }
    if relay.dispatch.rate_limit_per_minute == 0 {
        bail!("dispatch.rate_limit_per_minute must be at least 1");
    }
    if relay.dispatch.queue_capacity == 0 {
        bail!("dispatch.queue_capacity must be at least 1");
    }
    Ok(())
}
