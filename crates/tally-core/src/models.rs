//! Data model for discovery, extraction, persistence, and run reporting.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::Error;

// =============================================================================
// DISCOVERY
// =============================================================================

/// What a run is looking for in the mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIntent {
    pub sender_email: Option<String>,
    pub subject_contains: Option<String>,
    pub attachment_name_hint: Option<String>,
    pub days_back: u32,
}

impl Default for SearchIntent {
    fn default() -> Self {
        Self {
            sender_email: None,
            subject_contains: None,
            attachment_name_hint: None,
            days_back: defaults::SEARCH_DAYS_BACK,
        }
    }
}

impl SearchIntent {
    /// Intent with only a lookback window.
    pub fn new(days_back: u32) -> Self {
        Self {
            days_back,
            ..Default::default()
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender_email = Some(sender.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject_contains = Some(subject.into());
        self
    }

    pub fn with_name_hint(mut self, hint: impl Into<String>) -> Self {
        self.attachment_name_hint = Some(hint.into());
        self
    }

    pub fn with_days_back(mut self, days_back: u32) -> Self {
        self.days_back = days_back;
        self
    }
}

/// Raw attachment metadata as reported by the attachment source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredAttachment {
    pub message_id: String,
    pub attachment_id: String,
    pub attachment_name: String,
    pub sender_email: String,
    pub subject: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub received_at: DateTime<Utc>,
}

/// A discovered attachment scored against a search intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentCandidate {
    pub message_id: String,
    pub attachment_id: String,
    pub attachment_name: String,
    pub sender_email: String,
    pub subject: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub received_at: DateTime<Utc>,
    /// Human-readable reasons, one per contributing signal, in signal order.
    pub match_reasons: Vec<String>,
    /// Normalized score in `[0, 1]`.
    pub confidence_score: f64,
}

impl AttachmentCandidate {
    /// Build a candidate from discovered metadata and a computed score.
    pub fn from_discovered(
        attachment: &DiscoveredAttachment,
        confidence_score: f64,
        match_reasons: Vec<String>,
    ) -> Self {
        Self {
            message_id: attachment.message_id.clone(),
            attachment_id: attachment.attachment_id.clone(),
            attachment_name: attachment.attachment_name.clone(),
            sender_email: attachment.sender_email.clone(),
            subject: attachment.subject.clone(),
            size_bytes: attachment.size_bytes,
            content_type: attachment.content_type.clone(),
            received_at: attachment.received_at,
            match_reasons,
            confidence_score,
        }
    }

    /// Descriptor handed to the extractor alongside the raw bytes.
    pub fn descriptor(&self) -> AttachmentDescriptor {
        AttachmentDescriptor {
            file_name: self.attachment_name.clone(),
            content_type: self.content_type.clone(),
        }
    }
}

/// Which ranked candidates a run processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Only the single recommended candidate (manual lookups).
    RecommendedOnly,
    /// Every candidate at or above the confidence threshold (scheduled runs).
    #[default]
    AllAboveThreshold,
}

// =============================================================================
// EXTRACTION
// =============================================================================

/// File metadata passed to the extractor with the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub file_name: String,
    pub content_type: String,
}

/// One invoice line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LineItem {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default, alias = "total")]
    pub amount: Option<f64>,
}

/// Invoice object as returned by the extractor, before validation.
///
/// Every field is optional because the model may omit anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractedInvoice {
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub vendor_name: Option<String>,
    #[serde(default)]
    pub vendor_address: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub subtotal_amount: Option<f64>,
    #[serde(default)]
    pub tax_amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub bill_to_name: Option<String>,
    #[serde(default)]
    pub payment_terms: Option<String>,
    #[serde(default)]
    pub purchase_order_number: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
}

/// Extractor response for one attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorOutput {
    /// Invoices in the order the extractor returned them.
    pub invoices: Vec<ExtractedInvoice>,
    /// Extraction method label, e.g. `"openai:gpt-4o-mini"`.
    pub method: String,
    /// Extractor-specific metadata (page count, text length, ...).
    #[serde(default)]
    pub metadata: JsonValue,
}

// =============================================================================
// PERSISTED RECORDS
// =============================================================================

/// Lifecycle status of an attachment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(Error::validation(
                "processing_status",
                format!("unknown status '{}'", other),
            )),
        }
    }
}

/// Persisted raw-artifact metadata; the audit anchor for invoice records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: Uuid,
    pub message_id: String,
    pub attachment_id: String,
    pub attachment_name: String,
    pub sender_email: String,
    pub subject: String,
    pub content_type: String,
    pub file_size_bytes: i64,
    pub confidence_score: f64,
    pub extracted_data: Option<JsonValue>,
    pub processing_status: ProcessingStatus,
    /// Pipeline executions for this record, including reprocessing.
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AttachmentRecord {
    /// True when the record completed with the explicit no-invoice marker.
    pub fn is_no_invoice(&self) -> bool {
        self.processing_status == ProcessingStatus::Completed
            && self
                .extracted_data
                .as_ref()
                .and_then(|d| d.get(NO_INVOICE_MARKER))
                .and_then(JsonValue::as_bool)
                .unwrap_or(false)
    }

    /// True when invoices were found but none passed validation.
    pub fn is_all_rejected(&self) -> bool {
        self.processing_status == ProcessingStatus::Completed
            && self
                .extracted_data
                .as_ref()
                .and_then(|d| d.get(ALL_REJECTED_MARKER))
                .and_then(JsonValue::as_bool)
                .unwrap_or(false)
    }
}

/// Blob key marking a completed record that legitimately carries no invoice.
pub const NO_INVOICE_MARKER: &str = "no_invoice_found";

/// Blob key marking a completed record whose invoices were all rejected.
pub const ALL_REJECTED_MARKER: &str = "all_invoices_rejected";

/// Request for creating an attachment record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttachmentRecord {
    pub message_id: String,
    pub attachment_id: String,
    pub attachment_name: String,
    pub sender_email: String,
    pub subject: String,
    pub content_type: String,
    pub file_size_bytes: i64,
    pub confidence_score: f64,
}

impl From<&AttachmentCandidate> for NewAttachmentRecord {
    fn from(c: &AttachmentCandidate) -> Self {
        Self {
            message_id: c.message_id.clone(),
            attachment_id: c.attachment_id.clone(),
            attachment_name: c.attachment_name.clone(),
            sender_email: c.sender_email.clone(),
            subject: c.subject.clone(),
            content_type: c.content_type.clone(),
            file_size_bytes: i64::try_from(c.size_bytes).unwrap_or(i64::MAX),
            confidence_score: c.confidence_score,
        }
    }
}

/// A validated, sequenced invoice ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInvoiceRecord {
    pub invoice_number: Option<String>,
    pub vendor_name: Option<String>,
    pub vendor_address: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub total_amount: Option<f64>,
    pub subtotal_amount: Option<f64>,
    pub tax_amount: Option<f64>,
    pub currency: Option<String>,
    pub line_items: Vec<LineItem>,
    pub bill_to_name: Option<String>,
    pub payment_terms: Option<String>,
    pub purchase_order_number: Option<String>,
    pub confidence_score: f64,
    pub invoice_sequence: i32,
    pub extraction_method: String,
}

/// Persisted structured invoice; immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub attachment_record_id: Uuid,
    pub invoice_number: Option<String>,
    pub vendor_name: Option<String>,
    pub vendor_address: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub total_amount: Option<f64>,
    pub subtotal_amount: Option<f64>,
    pub tax_amount: Option<f64>,
    pub currency: Option<String>,
    pub line_items: Vec<LineItem>,
    pub bill_to_name: Option<String>,
    pub payment_terms: Option<String>,
    pub purchase_order_number: Option<String>,
    pub confidence_score: f64,
    pub invoice_sequence: i32,
    pub extraction_method: String,
    pub created_at: DateTime<Utc>,
}

impl InvoiceRecord {
    /// Materialize a record from a validated invoice.
    pub fn from_new(
        id: Uuid,
        attachment_record_id: Uuid,
        new: NewInvoiceRecord,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            attachment_record_id,
            invoice_number: new.invoice_number,
            vendor_name: new.vendor_name,
            vendor_address: new.vendor_address,
            invoice_date: new.invoice_date,
            due_date: new.due_date,
            total_amount: new.total_amount,
            subtotal_amount: new.subtotal_amount,
            tax_amount: new.tax_amount,
            currency: new.currency,
            line_items: new.line_items,
            bill_to_name: new.bill_to_name,
            payment_terms: new.payment_terms,
            purchase_order_number: new.purchase_order_number,
            confidence_score: new.confidence_score,
            invoice_sequence: new.invoice_sequence,
            extraction_method: new.extraction_method,
            created_at,
        }
    }
}

/// An attachment record with its linked invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentWithInvoices {
    pub attachment: AttachmentRecord,
    pub invoices: Vec<InvoiceRecord>,
}

/// Filter for recent-record queries.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentWindow {
    /// Records created at or after this instant.
    pub since: DateTime<Utc>,
    pub limit: i64,
    pub status: Option<ProcessingStatus>,
}

impl RecentWindow {
    /// Window covering the last `days` days.
    pub fn last_days(days: i64) -> Self {
        Self {
            since: Utc::now() - chrono::Duration::days(days),
            limit: defaults::RECENT_LIMIT,
            status: None,
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_status(mut self, status: ProcessingStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Storage backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    /// PostgreSQL (relational).
    Postgres,
    /// SQLite (embedded).
    Sqlite,
    /// JSON document collections.
    Document,
}

impl StorageBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackendKind::Postgres => "postgresql",
            StorageBackendKind::Sqlite => "sqlite",
            StorageBackendKind::Document => "document",
        }
    }
}

impl fmt::Display for StorageBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(StorageBackendKind::Postgres),
            "sqlite" => Ok(StorageBackendKind::Sqlite),
            "document" | "documents" | "json" => Ok(StorageBackendKind::Document),
            other => Err(Error::Config(format!(
                "Unsupported database type: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// RUN REPORTING
// =============================================================================

/// Details of one attachment that failed within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentFailure {
    pub message_id: String,
    pub attachment_name: String,
    pub attachment_record_id: Option<Uuid>,
    pub error_kind: crate::error::ErrorKind,
    pub error: String,
    pub attempts: u32,
}

/// Summary of one scheduler tick or manual invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub search_intent: SearchIntent,
    pub attachments_discovered: usize,
    pub attachments_below_threshold: usize,
    pub attachments_succeeded: usize,
    pub attachments_failed: usize,
    pub attachments_deduplicated: usize,
    pub attachments_skipped: usize,
    pub attachments_interrupted: usize,
    pub invoices_persisted: usize,
    pub deadline_exceeded: bool,
    pub failures: Vec<AttachmentFailure>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessingRun {
    /// Start a new run for the given intent.
    pub fn start(search_intent: SearchIntent) -> Self {
        Self {
            run_id: crate::uuid_utils::new_v7(),
            started_at: Utc::now(),
            search_intent,
            attachments_discovered: 0,
            attachments_below_threshold: 0,
            attachments_succeeded: 0,
            attachments_failed: 0,
            attachments_deduplicated: 0,
            attachments_skipped: 0,
            attachments_interrupted: 0,
            invoices_persisted: 0,
            deadline_exceeded: false,
            failures: Vec::new(),
            finished_at: None,
        }
    }

    /// Mark the run finished.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock duration, once finished.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Durable marker of the last fully processed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_message_id: String,
    pub last_received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
