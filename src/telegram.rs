#![doc = "Telegram Bot API implementation of the core `ChannelClient` contract."]
//
//! # Telegram channel client
//!
//! Bridges [`report_relay_core::contract::ChannelClient`] to the Telegram Bot API:
//! documents go through `sendDocument` (multipart), operator messages through
//! `sendMessage` (JSON). Forum topics are addressed with `message_thread_id`.
//!
//! ## Client Usage
//! - Construct [`TelegramClient`] with [`TelegramClient::new_from_env`], which reads
//!   `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID` and optionally `TELEGRAM_API_BASE`.
//! - Files that are empty or above the upload limit are rejected locally, before any
//!   request is made.
//! - Responses are mapped onto [`ApiError`] by [`classify_response`].

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use report_relay_core::contract::{ApiError, ChannelClient, Destination};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
/// Bot API limit for documents sent by upload.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;
/// Bot API limit on caption length, in characters.
const MAX_CAPTION_CHARS: usize = 1024;

/// Non-secret Telegram settings from the YAML config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    pub api_base: Option<String>,
    pub max_upload_bytes: u64,
    pub request_timeout_secs: u64,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            api_base: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            request_timeout_secs: 60,
        }
    }
}

pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
    max_upload_bytes: u64,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base)
            .field("chat_id", &self.chat_id)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        chat_id: impl Into<String>,
        section: &TelegramSection,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.request_timeout_secs.max(1)))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
            max_upload_bytes: section.max_upload_bytes,
        })
    }

    pub fn new_from_env(section: &TelegramSection) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let token = env::var("TELEGRAM_BOT_TOKEN").map_err(|e| {
            tracing::error!(error = ?e, "TELEGRAM_BOT_TOKEN missing in environment");
            anyhow!("TELEGRAM_BOT_TOKEN must be set: {e}")
        })?;
        let chat_id = env::var("TELEGRAM_CHAT_ID").map_err(|e| {
            tracing::error!(error = ?e, "TELEGRAM_CHAT_ID missing in environment");
            anyhow!("TELEGRAM_CHAT_ID must be set: {e}")
        })?;
        if token.trim().is_empty() {
            return Err(anyhow!("TELEGRAM_BOT_TOKEN must not be empty"));
        }
        if chat_id.trim().is_empty() {
            return Err(anyhow!("TELEGRAM_CHAT_ID must not be empty"));
        }
        let api_base = env::var("TELEGRAM_API_BASE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| section.api_base.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let client = Self::new(api_base, token.trim(), chat_id.trim(), section)?;
        tracing::info!(
            api_base = %client.api_base,
            chat_id = %client.chat_id,
            "Initialized TelegramClient from environment"
        );
        Ok(client)
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Rejects files the Bot API would never accept. Returns the file size.
    pub async fn check_payload(&self, path: &Path) -> Result<u64, ApiError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            ApiError::transient(0, format!("failed to stat {}: {e}", path.display()))
        })?;
        let size = meta.len();
        if size == 0 {
            return Err(ApiError::PayloadRejected("file is empty".to_string()));
        }
        if size > self.max_upload_bytes {
            return Err(ApiError::PayloadRejected(format!(
                "file is {size} bytes, upload limit is {} bytes",
                self.max_upload_bytes
            )));
        }
        Ok(size)
    }

    async fn finish(&self, method: &str, sent: reqwest::Result<reqwest::Response>) -> Result<(), ApiError> {
        // The request URL embeds the bot token, so it never reaches an error message.
        let response = sent.map_err(|e| {
            let e = e.without_url();
            let kind = if e.is_timeout() {
                "request timed out"
            } else if e.is_connect() {
                "connection failed"
            } else {
                "request failed"
            };
            tracing::warn!(method, error = %e, "Telegram request failed");
            ApiError::transient(0, format!("{kind}: {e}"))
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<Failed to decode response body>"));
        let result = classify_response(status, &body);
        if let Err(e) = &result {
            tracing::debug!(method, status, error = %e, "Telegram API returned error");
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    #[serde(default)]
    ok: bool,
    error_code: Option<i32>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
    text: &'a str,
}

/// Maps an HTTP status and Bot API body onto the channel error taxonomy.
pub fn classify_response(status: u16, body: &str) -> Result<(), ApiError> {
    let parsed: Option<BotApiResponse> = serde_json::from_str(body).ok();
    let success = (200..300).contains(&status);
    match &parsed {
        Some(resp) if success && resp.ok => return Ok(()),
        None if success => return Ok(()),
        _ => {}
    }

    let code = parsed
        .as_ref()
        .and_then(|r| r.error_code)
        .unwrap_or(i32::from(status));
    let description = parsed
        .as_ref()
        .and_then(|r| r.description.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status == 429 || code == 429 {
        let retry_after = parsed
            .as_ref()
            .and_then(|r| r.parameters.as_ref())
            .and_then(|p| p.retry_after)
            .map(Duration::from_secs);
        return Err(ApiError::RateLimited { retry_after });
    }
    if status == 413 || code == 413 {
        return Err(ApiError::PayloadRejected(description));
    }
    let lowered = description.to_lowercase();
    if code == 400 && (lowered.contains("file is empty") || lowered.contains("too big")) {
        return Err(ApiError::PayloadRejected(description));
    }
    Err(ApiError::Transient {
        code,
        message: description,
    })
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl ChannelClient for TelegramClient {
    async fn send_document(
        &self,
        destination: &Destination,
        path: &Path,
        caption: &str,
    ) -> Result<(), ApiError> {
        let size = self.check_payload(path).await?;
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ApiError::transient(0, format!("failed to read {}: {e}", path.display()))
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report.pdf".to_string());

        tracing::info!(
            destination = %destination.label,
            topic_id = ?destination.topic_id,
            file = %file_name,
            size,
            "Uploading document to Telegram"
        );
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(path))
            .map_err(|e| ApiError::transient(0, format!("invalid mime type: {e}")))?;
        let mut form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", truncate_chars(caption, MAX_CAPTION_CHARS))
            .part("document", part);
        if let Some(topic) = destination.topic_id {
            form = form.text("message_thread_id", topic.to_string());
        }

        let sent = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await;
        self.finish("sendDocument", sent).await
    }

    async fn send_text(&self, destination: &Destination, message: &str) -> Result<(), ApiError> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            message_thread_id: destination.topic_id,
            text: message,
        };
        let sent = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await;
        self.finish("sendMessage", sent).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(max_upload_bytes: u64) -> TelegramClient {
        let section = TelegramSection {
            max_upload_bytes,
            ..TelegramSection::default()
        };
        TelegramClient::new("http://127.0.0.1:9/", "123:abc", "-100200", &section).unwrap()
    }

    #[test]
    fn ok_response_is_success() {
        assert_eq!(classify_response(200, r#"{"ok":true,"result":{}}"#), Ok(()));
    }

    #[test]
    fn too_many_requests_carries_retry_after() {
        let body = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 7","parameters":{"retry_after":7}}"#;
        assert_eq!(
            classify_response(429, body),
            Err(ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
        assert_eq!(
            classify_response(429, "rate limited"),
            Err(ApiError::RateLimited { retry_after: None })
        );
    }

    #[test]
    fn oversized_and_empty_uploads_are_rejected_permanently() {
        assert!(matches!(
            classify_response(413, "Request Entity Too Large"),
            Err(ApiError::PayloadRejected(_))
        ));
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: file is too big"}"#;
        assert!(matches!(classify_response(400, body), Err(ApiError::PayloadRejected(_))));
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: file is empty"}"#;
        assert!(matches!(classify_response(400, body), Err(ApiError::PayloadRejected(_))));
    }

    #[test]
    fn other_failures_are_transient() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: message thread not found"}"#;
        assert_eq!(
            classify_response(400, body),
            Err(ApiError::Transient {
                code: 400,
                message: "Bad Request: message thread not found".to_string()
            })
        );
        assert!(matches!(
            classify_response(502, "<html>Bad Gateway</html>"),
            Err(ApiError::Transient { code: 502, .. })
        ));
    }

    #[tokio::test]
    async fn empty_file_is_rejected_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user_empty.pdf");
        std::fs::write(&path, b"").unwrap();

        let err = client(1024)
            .send_document(&Destination::new("Users", Some(1)), &path, "caption")
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::PayloadRejected("file is empty".to_string()));
    }

    #[tokio::test]
    async fn file_above_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_huge.pdf");
        std::fs::write(&path, vec![b'x'; 2048]).unwrap();

        let err = client(1024).check_payload(&path).await.unwrap_err();
        assert!(matches!(err, ApiError::PayloadRejected(reason) if reason.contains("2048 bytes")));
        assert_eq!(client(4096).check_payload(&path).await, Ok(2048));
    }

    #[test]
    fn method_url_strips_trailing_slash() {
        assert_eq!(
            client(1).method_url("sendMessage"),
            "http://127.0.0.1:9/bot123:abc/sendMessage"
        );
    }

    #[tokio::test]
    async fn transport_errors_never_carry_the_token() {
        let client = TelegramClient::new(
            "http://127.0.0.1:9",
            "999:SECRETTOKEN",
            "-100200",
            &TelegramSection::default(),
        )
        .unwrap();

        let err = client
            .send_text(&Destination::new("operator", None), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transient { code: 0, .. }), "{err:?}");
        assert!(!err.to_string().contains("SECRETTOKEN"), "{err}");
        assert!(!format!("{err:?}").contains("SECRETTOKEN"), "{err:?}");
    }

    #[test]
    fn debug_output_hides_token() {
        assert!(!format!("{:?}", client(1)).contains("123:abc"));
    }
}
