//! Error types for the tally pipeline.
//!
//! Every error maps onto an [`ErrorKind`], which drives retry and failure
//! isolation decisions in the run controller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using tally's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tally operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attachment record not found
    #[error("Attachment record not found: {0}")]
    AttachmentRecordNotFound(uuid::Uuid),

    /// An external call exceeded its timeout
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Upstream API rejected the call due to rate limiting
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// A dependency (storage, mailbox, model server) is temporarily unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Extraction output or a record failed validation
    #[error("Validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },

    /// A write would break the audit trail (orphan, duplicate sequence, immutability)
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// The run deadline passed before the step could start
    #[error("Run deadline exceeded")]
    DeadlineExceeded,

    /// Extractor reported a non-transient failure
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Attachment source reported a non-transient failure
    #[error("Attachment source error: {0}")]
    Source(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure class used for retry and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Expected to succeed on retry (timeouts, rate limits, brief outages).
    Transient,
    /// Bad extraction output or record; retrying will not help.
    Validation,
    /// Write would orphan or duplicate audit-linked records.
    Integrity,
    /// Affects the whole run (deadline), not a single attachment.
    RunLevel,
    /// Anything else: configuration, missing data, internal bugs.
    Fatal,
}

impl ErrorKind {
    /// Stable lowercase name, used in persisted error summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Integrity => "integrity",
            ErrorKind::RunLevel => "run_level",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Shorthand for a validation failure on a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout(_)
            | Error::RateLimited(_)
            | Error::Unavailable(_)
            | Error::Request(_) => ErrorKind::Transient,
            Error::Validation { .. } | Error::Serialization(_) => ErrorKind::Validation,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::DeadlineExceeded => ErrorKind::RunLevel,
            Error::Database(e) => classify_sqlx(e),
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            Error::NotFound(_)
            | Error::AttachmentRecordNotFound(_)
            | Error::Extraction(_)
            | Error::Source(_)
            | Error::Config(_)
            | Error::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the retry policy may attempt the failed step again.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

fn classify_sqlx(e: &sqlx::Error) -> ErrorKind {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ErrorKind::Transient
        }
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() || db.is_foreign_key_violation() {
                ErrorKind::Integrity
            } else if db.is_check_violation() {
                ErrorKind::Validation
            } else {
                ErrorKind::Fatal
            }
        }
        _ => ErrorKind::Fatal,
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::Unavailable(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}
