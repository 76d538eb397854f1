//! OpenAI-compatible invoice extractor implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use tally_core::defaults::{EXTRACTION_CMD_TIMEOUT_SECS, EXTRACTION_MAX_TEXT_CHARS};
use tally_core::{AttachmentDescriptor, Error, Extractor, ExtractorOutput, Result};

use super::error::ModelRejection;
use super::types::*;
use crate::document::document_text;
use crate::prompt::{build_user_prompt, parse_invoices, truncate_text, SYSTEM_PROMPT};

/// Default OpenAI API endpoint.
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Default generation model.
pub const DEFAULT_GEN_MODEL: &str = "gpt-4o-mini";

/// Default timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Configuration for the OpenAI-compatible extractor.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    /// Base URL for the API endpoint.
    pub base_url: String,
    /// API key for authentication (optional for local endpoints).
    pub api_key: Option<String>,
    /// Model to use for extraction.
    pub gen_model: String,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
    /// Skip TLS verification (for self-signed certs in local environments).
    pub skip_tls_verify: bool,
    /// Maximum document characters sent to the model.
    pub max_text_chars: usize,
    /// Timeout for the `pdftotext` subprocess.
    pub pdftotext_timeout_secs: u64,
    /// Fall back to [`crate::PatternExtractor`] when the endpoint is down.
    pub pattern_fallback: bool,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            api_key: None,
            gen_model: DEFAULT_GEN_MODEL.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            skip_tls_verify: false,
            max_text_chars: EXTRACTION_MAX_TEXT_CHARS,
            pdftotext_timeout_secs: EXTRACTION_CMD_TIMEOUT_SECS,
            pattern_fallback: false,
        }
    }
}

impl OpenAIConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OPENAI_BASE_URL` | `https://api.openai.com/v1` |
    /// | `OPENAI_API_KEY` | (none) |
    /// | `OPENAI_GEN_MODEL` | `gpt-4o-mini` |
    /// | `OPENAI_TIMEOUT` | `300` |
    /// | `OPENAI_SKIP_TLS_VERIFY` | `false` |
    /// | `EXTRACTION_MAX_TEXT_CHARS` | `24000` |
    /// | `EXTRACTION_PATTERN_FALLBACK` | `false` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            base_url: lookup("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            api_key: lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()),
            gen_model: lookup("OPENAI_GEN_MODEL").unwrap_or(defaults.gen_model),
            timeout_seconds: lookup("OPENAI_TIMEOUT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_seconds),
            skip_tls_verify: lookup("OPENAI_SKIP_TLS_VERIFY")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
            max_text_chars: lookup("EXTRACTION_MAX_TEXT_CHARS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_text_chars),
            pdftotext_timeout_secs: defaults.pdftotext_timeout_secs,
            pattern_fallback: lookup("EXTRACTION_PATTERN_FALLBACK")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
        }
    }
}

/// Invoice extractor backed by an OpenAI-compatible chat completions API.
pub struct OpenAiExtractor {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAiExtractor {
    /// Create a new extractor with the given configuration.
    pub fn new(config: OpenAIConfig) -> Result<Self> {
        let mut client_builder =
            Client::builder().timeout(Duration::from_secs(config.timeout_seconds));

        if config.skip_tls_verify {
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        let client = client_builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "extraction",
            component = "openai",
            op = "init",
            base_url = %config.base_url,
            model = %config.gen_model,
            "Initializing OpenAI extractor"
        );

        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(OpenAIConfig::from_env())
    }

    /// Get the current configuration.
    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }

    /// Build a request with authentication if configured.
    fn build_request(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut req = self.client.post(&url);

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        req.header("Content-Type", "application/json")
    }

    /// Run one chat completion for `file_name` and return the first choice.
    pub async fn complete(&self, file_name: &str, system: &str, prompt: &str) -> Result<ModelReply> {
        debug!(
            subsystem = "extraction",
            component = "openai",
            op = "complete",
            model = %self.config.gen_model,
            file_name = %file_name,
            prompt_len = prompt.len(),
            "Requesting chat completion"
        );

        let request = ChatCompletionRequest::extraction(&self.config.gen_model, system, prompt);
        let response = self
            .build_request("/chat/completions")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body: ErrorBody = response.json().await.unwrap_or_default();
            let rejection = ModelRejection::classify(status.as_u16(), body.error.kind());
            warn!(
                subsystem = "extraction",
                component = "openai",
                op = "complete",
                file_name = %file_name,
                status = status.as_u16(),
                rejection = ?rejection,
                retryable = rejection.is_retryable(),
                error = %body.error.message,
                "Chat completion rejected"
            );
            let message = if body.error.message.is_empty() {
                format!("HTTP {}", status)
            } else {
                format!("HTTP {}: {}", status, body.error.message)
            };
            return Err(rejection.into_error(file_name, &message));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))?;

        Ok(result.into())
    }

    /// Check that the endpoint answers a model listing.
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let mut req = self.client.get(&url).timeout(Duration::from_secs(5));
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "OpenAI health check failed");
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "OpenAI health check error");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    fn method(&self) -> String {
        format!("openai:{}", self.config.gen_model)
    }

    async fn extract(
        &self,
        content: Bytes,
        descriptor: &AttachmentDescriptor,
        max_invoices: usize,
    ) -> Result<ExtractorOutput> {
        let start = Instant::now();
        let document = document_text(
            &content,
            descriptor,
            Duration::from_secs(self.config.pdftotext_timeout_secs),
        )
        .await?;

        if document.text.trim().is_empty() {
            // Usually a scanned PDF without a text layer
            return Err(Error::validation(
                "content",
                format!("'{}' has no extractable text", descriptor.file_name),
            ));
        }

        let (text, truncated) = truncate_text(&document.text, self.config.max_text_chars);
        if truncated {
            debug!(
                subsystem = "extraction",
                component = "openai",
                op = "extract",
                file_name = %descriptor.file_name,
                max_chars = self.config.max_text_chars,
                "Document text truncated for the model"
            );
        }

        let prompt = build_user_prompt(&descriptor.file_name, text, max_invoices);
        let reply = self
            .complete(&descriptor.file_name, SYSTEM_PROMPT, &prompt)
            .await?;
        if reply.truncated() {
            warn!(
                subsystem = "extraction",
                component = "openai",
                op = "extract",
                file_name = %descriptor.file_name,
                "Model reply hit the token limit"
            );
        }
        let invoices = parse_invoices(&reply.content)?;

        info!(
            subsystem = "extraction",
            component = "openai",
            op = "extract",
            file_name = %descriptor.file_name,
            invoices = invoices.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Extraction complete"
        );

        Ok(ExtractorOutput {
            invoices,
            method: self.method(),
            metadata: json!({
                "model": self.config.gen_model,
                "document": document.metadata,
                "text_truncated": truncated,
                "max_invoices": max_invoices,
                "usage": reply.usage,
                "reply_truncated": reply.truncated(),
            }),
        })
    }
}
