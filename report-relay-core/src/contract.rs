//! # contract: interface to the outbound chat channel
//!
//! This module defines the single trait (`ChannelClient`) through which the pipeline
//! talks to the group chat that receives reports, together with the plain data types
//! that cross that boundary.
//!
//! ## Interface & Extensibility
//! - Implement [`ChannelClient`] to add a new messaging backend (the binary crate ships a
//!   Telegram Bot API client).
//! - Both methods are async and return [`ApiError`], whose variants let the dispatch
//!   executor tell a rate-limit signal, a rejected payload and a generic transient
//!   failure apart without inspecting strings.
//!
//! ## Mocking & Testing
//! - The trait is annotated for `mockall`, so tests get `MockChannelClient` with
//!   deterministic, per-call expectations.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};

/// A channel/topic inside the destination chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Human-readable label, used in captions, logs and statistics.
    pub label: String,
    /// Forum topic id; `None` posts to the chat's general thread.
    pub topic_id: Option<i64>,
}

impl Destination {
    pub fn new(label: impl Into<String>, topic_id: Option<i64>) -> Self {
        Self {
            label: label.into(),
            topic_id,
        }
    }
}

/// Error surfaced by a [`ChannelClient`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// The remote API asked us to slow down.
    #[error("rate limited by channel API (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The payload can never be accepted as-is (empty or oversized file).
    #[error("payload rejected: {0}")]
    PayloadRejected(String),

    /// Anything else: network errors, 5xx, unexpected responses.
    #[error("channel API error {code}: {message}")]
    Transient { code: i32, message: String },
}

impl ApiError {
    pub fn transient(code: i32, message: impl Into<String>) -> Self {
        ApiError::Transient {
            code,
            message: message.into(),
        }
    }
}

/// Trait for delivering documents and text messages to the destination chat.
///
/// The implementor owns transport, authentication and chat identity; the pipeline only
/// supplies the destination topic, the file and a caption.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Upload a file as a document to the given destination.
    async fn send_document(
        &self,
        destination: &Destination,
        path: &Path,
        caption: &str,
    ) -> Result<(), ApiError>;

    /// Post a plain text message (operator notifications).
    async fn send_text(&self, destination: &Destination, message: &str) -> Result<(), ApiError>;
}
