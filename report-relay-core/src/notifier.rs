//! Fire-and-forget operator messages sent through the channel client.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::NotificationSettings;
use crate::contract::{ChannelClient, Destination};

/// Label used for operator messages in logs.
pub const OPERATOR_LABEL: &str = "operator";

#[derive(Clone)]
pub struct Notifier {
    target: Option<(Arc<dyn ChannelClient>, Destination)>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("destination", &self.target.as_ref().map(|(_, d)| d))
            .finish()
    }
}

impl Notifier {
    pub fn new(client: Arc<dyn ChannelClient>, destination: Destination) -> Self {
        Self {
            target: Some((client, destination)),
        }
    }

    pub fn disabled() -> Self {
        Self { target: None }
    }

    pub fn from_settings(client: Arc<dyn ChannelClient>, settings: &NotificationSettings) -> Self {
        if settings.enabled {
            Self::new(client, Destination::new(OPERATOR_LABEL, settings.topic_id))
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Sends `message` on a detached task. The handle is returned for callers that want
    /// to wait for delivery (shutdown, tests); failures are only logged.
    pub fn notify(&self, message: impl Into<String>) -> Option<JoinHandle<()>> {
        let (client, destination) = self.target.clone()?;
        let message = message.into();
        Some(tokio::spawn(async move {
            match client.send_text(&destination, &message).await {
                Ok(()) => debug!(message = %message, "[NOTIFY] Operator notified"),
                Err(e) => warn!(error = %e, message = %message, "[NOTIFY] Failed to notify operator"),
            }
        }))
    }
}
