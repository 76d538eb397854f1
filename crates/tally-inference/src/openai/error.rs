//! Mapping of rejected chat completions onto the pipeline error taxonomy.

use tally_core::Error;

/// Why the model endpoint refused an extraction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRejection {
    /// Bad or missing API key.
    Unauthorized,
    /// 429 from the provider.
    RateLimited,
    /// The configured model does not exist on this endpoint.
    ModelMissing,
    /// The document text does not fit in the model context.
    DocumentTooLarge,
    /// The provider's content filter refused the document.
    ContentFiltered,
    /// 5xx or overloaded.
    Overloaded,
    Other,
}

impl ModelRejection {
    /// Classify from the HTTP status and the `error.type` / `error.code` field.
    pub fn classify(status: u16, error_type: &str) -> Self {
        let error_type = error_type.to_ascii_lowercase();
        match status {
            401 | 403 => Self::Unauthorized,
            429 => Self::RateLimited,
            413 => Self::DocumentTooLarge,
            500..=599 => Self::Overloaded,
            _ if error_type.contains("model_not_found") => Self::ModelMissing,
            404 => Self::ModelMissing,
            _ if error_type.contains("context_length") => Self::DocumentTooLarge,
            _ if error_type.contains("content_filter") || error_type.contains("content_policy") => {
                Self::ContentFiltered
            }
            _ => Self::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Overloaded)
    }

    /// Convert into a pipeline error. Retryable rejections become transient kinds.
    pub fn into_error(self, file_name: &str, message: &str) -> Error {
        match self {
            Self::Unauthorized => {
                Error::Config(format!("extraction endpoint refused credentials: {}", message))
            }
            Self::ModelMissing => {
                Error::Config(format!("extraction model unavailable: {}", message))
            }
            Self::RateLimited => Error::RateLimited(format!(
                "extraction of '{}' rate limited: {}",
                file_name, message
            )),
            Self::Overloaded => Error::Unavailable(format!(
                "extraction of '{}' failed upstream: {}",
                file_name, message
            )),
            Self::DocumentTooLarge => Error::validation(
                "content",
                format!("'{}' exceeds the model context: {}", file_name, message),
            ),
            Self::ContentFiltered => Error::Extraction(format!(
                "'{}' refused by the content filter: {}",
                file_name, message
            )),
            Self::Other => Error::Extraction(format!("'{}': {}", file_name, message)),
        }
    }
}
