//! Extractor chaining: a secondary extractor answers when the primary is
//! unreachable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use tally_core::{AttachmentDescriptor, Extractor, ExtractorOutput, Result};

use crate::openai::{OpenAIConfig, OpenAiExtractor};
use crate::pattern::PatternExtractor;

/// Runs `fallback` when `primary` fails with a transient error.
///
/// Validation and extraction errors come from the document itself and are
/// returned as-is. The output's `metadata.fallback_reason` carries the
/// primary's error.
pub struct FallbackExtractor {
    primary: Arc<dyn Extractor>,
    fallback: Arc<dyn Extractor>,
}

impl FallbackExtractor {
    pub fn new(primary: Arc<dyn Extractor>, fallback: Arc<dyn Extractor>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Extractor for FallbackExtractor {
    fn method(&self) -> String {
        self.primary.method()
    }

    async fn extract(
        &self,
        content: Bytes,
        descriptor: &AttachmentDescriptor,
        max_invoices: usize,
    ) -> Result<ExtractorOutput> {
        let err = match self
            .primary
            .extract(content.clone(), descriptor, max_invoices)
            .await
        {
            Err(e) if e.is_transient() => e,
            other => return other,
        };

        warn!(
            subsystem = "extraction",
            component = "fallback",
            op = "extract",
            file_name = %descriptor.file_name,
            primary = %self.primary.method(),
            fallback = %self.fallback.method(),
            error = %err,
            "Primary extractor unavailable, using fallback"
        );

        let mut output = self
            .fallback
            .extract(content, descriptor, max_invoices)
            .await?;
        if let Some(meta) = output.metadata.as_object_mut() {
            meta.insert("fallback_reason".to_string(), err.to_string().into());
            meta.insert("primary_method".to_string(), self.primary.method().into());
        }
        Ok(output)
    }
}

/// Build the configured extractor from the environment: the OpenAI backend,
/// wrapped with the pattern fallback when `EXTRACTION_PATTERN_FALLBACK` is set.
pub fn extractor_from_env() -> Result<Arc<dyn Extractor>> {
    build_extractor(OpenAIConfig::from_env())
}

pub fn build_extractor(config: OpenAIConfig) -> Result<Arc<dyn Extractor>> {
    let cmd_timeout = Duration::from_secs(config.pdftotext_timeout_secs);
    let pattern_fallback = config.pattern_fallback;
    let primary: Arc<dyn Extractor> = Arc::new(OpenAiExtractor::new(config)?);
    if !pattern_fallback {
        return Ok(primary);
    }
    let fallback = Arc::new(PatternExtractor::new(cmd_timeout)?);
    Ok(Arc::new(FallbackExtractor::new(primary, fallback)))
}
