//! HTTP client for the mailbox service.
//!
//! The service exposes two JSON endpoints:
//!
//! - `POST {base}/search` with the search intent, answering
//!   `{"attachments": [DiscoveredAttachment, ...]}`;
//! - `POST {base}/download` with `{"message_id", "attachment_id"}`, answering
//!   `{"content_base64": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tally_core::{AttachmentSource, DiscoveredAttachment, Error, Result, SearchIntent};

/// Default request timeout in seconds.
pub const DEFAULT_MAILBOX_TIMEOUT_SECS: u64 = 30;

/// Mailbox service connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl MailboxConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `MAILBOX_API_BASE_URL` | required | Mailbox service base URL |
    /// | `MAILBOX_API_KEY` | unset | Sent as `X-api-key` |
    /// | `MAILBOX_TIMEOUT_SECS` | `30` | Per-request timeout |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let base_url = get("MAILBOX_API_BASE_URL")
            .ok_or_else(|| Error::Config("MAILBOX_API_BASE_URL is not set".into()))?;
        let timeout_seconds = match get("MAILBOX_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse().map_err(|e| {
                Error::Config(format!("MAILBOX_TIMEOUT_SECS={:?}: {}", raw, e))
            })?,
            None => DEFAULT_MAILBOX_TIMEOUT_SECS,
        };
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: get("MAILBOX_API_KEY"),
            timeout_seconds,
        })
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject_contains: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_name: Option<&'a str>,
    days_back: u32,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    attachments: Vec<DiscoveredAttachment>,
}

#[derive(Serialize)]
struct DownloadRequest<'a> {
    message_id: &'a str,
    attachment_id: &'a str,
}

#[derive(Deserialize)]
struct DownloadResponse {
    content_base64: String,
}

/// [`AttachmentSource`] backed by the mailbox service.
pub struct HttpMailboxSource {
    client: reqwest::Client,
    config: MailboxConfig,
}

impl HttpMailboxSource {
    pub fn new(config: MailboxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(MailboxConfig::from_env()?)
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.config.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("mailbox {} returned {}: {}", path, status, text.trim());
            return Err(match status.as_u16() {
                429 => Error::RateLimited(message),
                404 => Error::NotFound(message),
                401 | 403 => Error::Config(message),
                s if s >= 500 => Error::Unavailable(message),
                _ => Error::Source(message),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| Error::Source(format!("mailbox {} returned malformed JSON: {}", path, e)))
    }
}

#[async_trait]
impl AttachmentSource for HttpMailboxSource {
    async fn search(&self, intent: &SearchIntent) -> Result<Vec<DiscoveredAttachment>> {
        let body = SearchRequest {
            sender_email: intent.sender_email.as_deref(),
            subject_contains: intent.subject_contains.as_deref(),
            attachment_name: intent.attachment_name_hint.as_deref(),
            days_back: intent.days_back,
        };
        let response: SearchResponse = self.post("search", &body).await?;
        debug!(
            subsystem = "mailbox",
            component = "http_source",
            op = "search",
            days_back = intent.days_back,
            found = response.attachments.len(),
            "Mailbox search complete"
        );
        Ok(response.attachments)
    }

    async fn download(&self, message_id: &str, attachment_id: &str) -> Result<Bytes> {
        let body = DownloadRequest {
            message_id,
            attachment_id,
        };
        let response: DownloadResponse = self.post("download", &body).await?;
        let content = STANDARD
            .decode(response.content_base64.trim())
            .map_err(|e| Error::Source(format!("attachment {} is not valid base64: {}", attachment_id, e)))?;
        Ok(Bytes::from(content))
    }
}
