//! Capability traits for the pipeline's external collaborators.
//!
//! Storage backends, the mailbox, the extraction model, monitoring, and the
//! watermark are all reached through these traits, so each can be swapped
//! for an in-memory fake in tests.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::events::MonitoringEvent;
use crate::models::*;

// =============================================================================
// STORAGE
// =============================================================================

/// Persistence of attachment records and their linked invoices.
///
/// Every backend gives the same semantics:
///
/// - an invoice record is only ever written together with the transition of
///   its attachment record to `completed` (one atomic unit);
/// - `invoice_sequence` within an attachment is contiguous from 1;
/// - a completed attachment record, and every invoice linked to it, is
///   immutable.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Backend family, for logging and health output.
    fn backend(&self) -> StorageBackendKind;

    /// Create a `pending` record. A second record for the same
    /// `(message_id, attachment_name)` is an integrity error.
    async fn create_attachment_record(&self, req: NewAttachmentRecord)
        -> Result<AttachmentRecord>;

    /// Move a record to `pending` or `failed`, optionally replacing its blob.
    ///
    /// Completing a record is refused; only [`create_invoice_records`]
    /// may do that. Records already completed cannot change.
    ///
    /// [`create_invoice_records`]: InvoiceStore::create_invoice_records
    async fn update_attachment_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        extracted_data: Option<JsonValue>,
    ) -> Result<AttachmentRecord>;

    /// Insert a batch of invoices and complete the attachment record, atomically.
    ///
    /// An empty batch completes the record with the `no_invoice_found` marker,
    /// or `all_invoices_rejected` when `extracted_data.rejections` is non-empty.
    async fn create_invoice_records(
        &self,
        attachment_record_id: Uuid,
        invoices: Vec<NewInvoiceRecord>,
        extracted_data: JsonValue,
    ) -> Result<Vec<InvoiceRecord>>;

    async fn get_attachment_record(&self, id: Uuid) -> Result<Option<AttachmentRecord>>;

    /// Dedup lookup by the attachment's natural key.
    async fn find_attachment_record(
        &self,
        message_id: &str,
        attachment_name: &str,
    ) -> Result<Option<AttachmentRecord>>;

    /// Invoices linked to a record, ordered by sequence.
    async fn list_invoice_records(&self, attachment_record_id: Uuid) -> Result<Vec<InvoiceRecord>>;

    /// Records created inside the window with their invoices, newest first.
    async fn query_recent(&self, window: RecentWindow) -> Result<Vec<AttachmentWithInvoices>>;

    /// Put a failed or pending record back to `pending` for another attempt.
    ///
    /// Clears the blob and increments `attempts`. Refused for completed records.
    async fn reset_for_reprocess(&self, id: Uuid) -> Result<AttachmentRecord>;

    /// Check the backend is reachable.
    async fn health_check(&self) -> Result<()>;
}

// =============================================================================
// MAILBOX
// =============================================================================

/// Email provider search and download.
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    /// Attachments matching the intent within its lookback window.
    async fn search(&self, intent: &SearchIntent) -> Result<Vec<DiscoveredAttachment>>;

    /// Raw bytes of one attachment.
    async fn download(&self, message_id: &str, attachment_id: &str) -> Result<Bytes>;
}

// =============================================================================
// EXTRACTION
// =============================================================================

/// AI extraction of invoice objects from a document.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Label recorded as `extraction_method` on every invoice it produces.
    fn method(&self) -> String;

    /// Extract at most `max_invoices` invoices. Callers still truncate.
    async fn extract(
        &self,
        content: Bytes,
        descriptor: &AttachmentDescriptor,
        max_invoices: usize,
    ) -> Result<ExtractorOutput>;
}

// =============================================================================
// MONITORING
// =============================================================================

/// Receiver of monitoring events.
#[async_trait]
pub trait MonitoringSink: Send + Sync {
    async fn publish(&self, event: &MonitoringEvent) -> Result<()>;
}

// =============================================================================
// WATERMARK
// =============================================================================

/// Durable storage of the scheduler's watermark.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self) -> Result<Option<Watermark>>;

    async fn save(&self, watermark: &Watermark) -> Result<()>;
}
