//! Centralized default constants for the tally pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration structs in every crate fall back to these constants when the
//! corresponding environment variable is unset.

// =============================================================================
// EXTRACTION
// =============================================================================

/// Maximum invoices kept from a single attachment (`MAX_INVOICES_PER_ATTACHMENT`).
pub const MAX_INVOICES_PER_ATTACHMENT: usize = 2;

/// Maximum characters of document text sent to the extraction model.
pub const EXTRACTION_MAX_TEXT_CHARS: usize = 24_000;

/// Timeout for a single `pdftotext` invocation.
pub const EXTRACTION_CMD_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// RANKING
// =============================================================================

/// Minimum ranker score for a candidate to be processed (`CONFIDENCE_THRESHOLD`).
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

// =============================================================================
// RETRY
// =============================================================================

/// Attempts per external step, including the first (`RETRY_ATTEMPTS`).
pub const RETRY_ATTEMPTS: u32 = 3;

/// Delay before the first retry, doubled on every further attempt.
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Upper bound for a single backoff delay.
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Backoff multiplier between attempts.
pub const RETRY_MULTIPLIER: f64 = 2.0;

// =============================================================================
// RUN CONTROLLER
// =============================================================================

/// Maximum attachments processed concurrently within one run.
pub const WORKER_MAX_IN_FLIGHT: usize = 4;

/// Run-level deadline; no attachment starts after it passes.
pub const RUN_DEADLINE_SECS: u64 = 3_600;

/// Timeout for one attachment download.
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 60;

/// Timeout for one extractor call.
pub const EXTRACT_TIMEOUT_SECS: u64 = 300;

/// Timeout for one storage call.
pub const STORAGE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// SCHEDULER
// =============================================================================

/// Default search lookback window in days.
pub const SEARCH_DAYS_BACK: u32 = 1;

/// Default subject filter used by scheduled runs.
pub const SEARCH_SUBJECT_CONTAINS: &str = "invoice";

/// Default scheduled run time (UTC, `HH:MM`).
pub const SCHEDULE_AT: &str = "06:00";

/// Scheduled runs skip Saturday and Sunday by default.
pub const SCHEDULE_WEEKDAYS_ONLY: bool = true;

/// Upper bound on how far a run widens its window to reach the watermark.
pub const MAX_CATCH_UP_DAYS: u32 = 30;

/// Default watermark file location.
pub const WATERMARK_PATH: &str = "tally-watermark.json";

// =============================================================================
// STORAGE
// =============================================================================

/// Maximum pooled storage connections (separate from the worker cap).
pub const STORAGE_MAX_CONNECTIONS: u32 = 8;

/// Default SQLite database file.
pub const SQLITE_DATABASE_PATH: &str = "invoice_processing.db";

/// Default document store directory.
pub const DOCUMENT_STORE_DIR: &str = "tally-documents";

/// Default limit for recent-record queries.
pub const RECENT_LIMIT: i64 = 100;

// =============================================================================
// EVENTS / MONITORING
// =============================================================================

/// Broadcast capacity of the in-process event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Timeout for one monitoring webhook delivery.
pub const WEBHOOK_TIMEOUT_SECS: u64 = 10;
