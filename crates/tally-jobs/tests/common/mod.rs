//! In-memory collaborators for pipeline tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use tally_core::{
    AttachmentDescriptor, AttachmentRecord, AttachmentSource, AttachmentWithInvoices,
    DiscoveredAttachment, Error, ExtractedInvoice, Extractor, ExtractorOutput, InvoiceRecord,
    InvoiceStore, MonitoringEvent, MonitoringSink, NewAttachmentRecord, NewInvoiceRecord,
    PipelineConfig, ProcessingStatus, RecentWindow, Result, SearchIntent, StorageBackendKind,
};
use tally_db::DocumentInvoiceStore;
use tally_jobs::{RetryPolicy, RunController};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 5, 0, 0).unwrap()
}

/// An attachment that scores well above the default threshold for [`intent`].
pub fn invoice_attachment(n: u32) -> DiscoveredAttachment {
    DiscoveredAttachment {
        message_id: format!("msg-{}", n),
        attachment_id: format!("att-{}", n),
        attachment_name: format!("invoice_{}.pdf", n),
        sender_email: "billing@acme.test".to_string(),
        subject: format!("Invoice {}", n),
        size_bytes: 48_000,
        content_type: "application/pdf".to_string(),
        received_at: base_time() - chrono::Duration::hours(i64::from(n)),
    }
}

/// An attachment that scores below the default threshold.
pub fn photo_attachment(n: u32) -> DiscoveredAttachment {
    DiscoveredAttachment {
        message_id: format!("msg-photo-{}", n),
        attachment_id: format!("att-photo-{}", n),
        attachment_name: "lunch.jpg".to_string(),
        sender_email: "friend@elsewhere.test".to_string(),
        subject: "Lunch pictures".to_string(),
        size_bytes: 3_000_000,
        content_type: "image/jpeg".to_string(),
        received_at: base_time(),
    }
}

pub fn intent() -> SearchIntent {
    SearchIntent::new(1).with_subject("invoice")
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        multiplier: 2.0,
        jitter: false,
    }
}

pub fn document_store() -> Arc<dyn InvoiceStore> {
    Arc::new(DocumentInvoiceStore::in_memory(4))
}

// =============================================================================
// SOURCE
// =============================================================================

#[derive(Default)]
pub struct FakeSource {
    attachments: Mutex<Vec<DiscoveredAttachment>>,
    search_down: bool,
    /// attachment_id -> transient failures still to return (u32::MAX: always).
    download_failures: Mutex<HashMap<String, u32>>,
    download_delay: Duration,
    pub searches: Mutex<Vec<SearchIntent>>,
    pub download_calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeSource {
    pub fn with(attachments: Vec<DiscoveredAttachment>) -> Self {
        Self {
            attachments: Mutex::new(attachments),
            ..Default::default()
        }
    }

    pub fn search_down() -> Self {
        Self {
            search_down: true,
            ..Default::default()
        }
    }

    pub fn failing_downloads(self, attachment_id: &str, times: u32) -> Self {
        self.download_failures
            .lock()
            .unwrap()
            .insert(attachment_id.to_string(), times);
        self
    }

    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = delay;
        self
    }

    pub fn push(&self, attachment: DiscoveredAttachment) {
        self.attachments.lock().unwrap().push(attachment);
    }

    pub fn downloads_of(&self, attachment_id: &str) -> u32 {
        self.download_calls
            .lock()
            .unwrap()
            .get(attachment_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl AttachmentSource for FakeSource {
    async fn search(&self, intent: &SearchIntent) -> Result<Vec<DiscoveredAttachment>> {
        self.searches.lock().unwrap().push(intent.clone());
        if self.search_down {
            return Err(Error::Source("mailbox credentials revoked".into()));
        }
        Ok(self.attachments.lock().unwrap().clone())
    }

    async fn download(&self, _message_id: &str, attachment_id: &str) -> Result<Bytes> {
        *self
            .download_calls
            .lock()
            .unwrap()
            .entry(attachment_id.to_string())
            .or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.download_delay.is_zero() {
            tokio::time::sleep(self.download_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fail = {
            let mut failures = self.download_failures.lock().unwrap();
            match failures.get_mut(attachment_id) {
                Some(remaining) if *remaining > 0 => {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(Error::Timeout(format!("download of {} timed out", attachment_id)));
        }
        Ok(Bytes::from(format!("%PDF-1.4 {}", attachment_id)))
    }
}

// =============================================================================
// EXTRACTOR
// =============================================================================

pub fn extracted(number: &str) -> ExtractedInvoice {
    ExtractedInvoice {
        invoice_number: Some(number.to_string()),
        vendor_name: Some("Acme Corp".to_string()),
        invoice_date: Some("2026-02-27".to_string()),
        total_amount: Some(420.0),
        currency: Some("usd".to_string()),
        confidence_score: Some(0.95),
        ..Default::default()
    }
}

/// Returns one invoice per attachment unless told otherwise.
#[derive(Default)]
pub struct FakeExtractor {
    replies: Mutex<HashMap<String, Vec<ExtractedInvoice>>>,
    panics_on: Mutex<Option<String>>,
    pub calls: AtomicU32,
}

impl FakeExtractor {
    pub fn panicking_on(self, file_name: &str) -> Self {
        *self.panics_on.lock().unwrap() = Some(file_name.to_string());
        self
    }

    pub fn reply(self, file_name: &str, invoices: Vec<ExtractedInvoice>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(file_name.to_string(), invoices);
        self
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    fn method(&self) -> String {
        "fake:v1".to_string()
    }

    async fn extract(
        &self,
        _content: Bytes,
        descriptor: &AttachmentDescriptor,
        _max_invoices: usize,
    ) -> Result<ExtractorOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics_on.lock().unwrap().as_deref() == Some(descriptor.file_name.as_str()) {
            panic!("extractor crashed on {}", descriptor.file_name);
        }
        let invoices = self
            .replies
            .lock()
            .unwrap()
            .get(&descriptor.file_name)
            .cloned()
            .unwrap_or_else(|| vec![extracted(&format!("INV-{}", descriptor.file_name))]);
        Ok(ExtractorOutput {
            invoices,
            method: self.method(),
            metadata: json!({"pages": 1}),
        })
    }
}

// =============================================================================
// SINK
// =============================================================================

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<MonitoringEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<MonitoringEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl MonitoringSink for RecordingSink {
    async fn publish(&self, event: &MonitoringEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// =============================================================================
// STORE WRAPPER
// =============================================================================

/// Delegates to `inner` but refuses every invoice batch as an integrity violation.
pub struct RefusingStore {
    pub inner: Arc<dyn InvoiceStore>,
}

#[async_trait]
impl InvoiceStore for RefusingStore {
    fn backend(&self) -> StorageBackendKind {
        self.inner.backend()
    }

    async fn create_attachment_record(
        &self,
        req: NewAttachmentRecord,
    ) -> Result<AttachmentRecord> {
        self.inner.create_attachment_record(req).await
    }

    async fn update_attachment_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        extracted_data: Option<JsonValue>,
    ) -> Result<AttachmentRecord> {
        self.inner
            .update_attachment_status(id, status, extracted_data)
            .await
    }

    async fn create_invoice_records(
        &self,
        attachment_record_id: Uuid,
        invoices: Vec<NewInvoiceRecord>,
        extracted_data: JsonValue,
    ) -> Result<Vec<InvoiceRecord>> {
        let _ = (attachment_record_id, invoices, extracted_data);
        Err(Error::Integrity("duplicate invoice sequence".into()))
    }

    async fn get_attachment_record(&self, id: Uuid) -> Result<Option<AttachmentRecord>> {
        self.inner.get_attachment_record(id).await
    }

    async fn find_attachment_record(
        &self,
        message_id: &str,
        attachment_name: &str,
    ) -> Result<Option<AttachmentRecord>> {
        self.inner
            .find_attachment_record(message_id, attachment_name)
            .await
    }

    async fn list_invoice_records(&self, attachment_record_id: Uuid) -> Result<Vec<InvoiceRecord>> {
        self.inner.list_invoice_records(attachment_record_id).await
    }

    async fn query_recent(&self, window: RecentWindow) -> Result<Vec<AttachmentWithInvoices>> {
        self.inner.query_recent(window).await
    }

    async fn reset_for_reprocess(&self, id: Uuid) -> Result<AttachmentRecord> {
        self.inner.reset_for_reprocess(id).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

/// Delegates to `inner`, but the first `hidden_finds` lookups miss, as if a
/// concurrent pipeline created the record between lookup and insert.
pub struct RacingStore {
    pub inner: Arc<dyn InvoiceStore>,
    pub hidden_finds: AtomicU32,
}

#[async_trait]
impl InvoiceStore for RacingStore {
    fn backend(&self) -> StorageBackendKind {
        self.inner.backend()
    }

    async fn create_attachment_record(
        &self,
        req: NewAttachmentRecord,
    ) -> Result<AttachmentRecord> {
        self.inner.create_attachment_record(req).await
    }

    async fn update_attachment_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        extracted_data: Option<JsonValue>,
    ) -> Result<AttachmentRecord> {
        self.inner
            .update_attachment_status(id, status, extracted_data)
            .await
    }

    async fn create_invoice_records(
        &self,
        attachment_record_id: Uuid,
        invoices: Vec<NewInvoiceRecord>,
        extracted_data: JsonValue,
    ) -> Result<Vec<InvoiceRecord>> {
        self.inner
            .create_invoice_records(attachment_record_id, invoices, extracted_data)
            .await
    }

    async fn get_attachment_record(&self, id: Uuid) -> Result<Option<AttachmentRecord>> {
        self.inner.get_attachment_record(id).await
    }

    async fn find_attachment_record(
        &self,
        message_id: &str,
        attachment_name: &str,
    ) -> Result<Option<AttachmentRecord>> {
        let hidden = self
            .hidden_finds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(None);
        }
        self.inner
            .find_attachment_record(message_id, attachment_name)
            .await
    }

    async fn list_invoice_records(&self, attachment_record_id: Uuid) -> Result<Vec<InvoiceRecord>> {
        self.inner.list_invoice_records(attachment_record_id).await
    }

    async fn query_recent(&self, window: RecentWindow) -> Result<Vec<AttachmentWithInvoices>> {
        self.inner.query_recent(window).await
    }

    async fn reset_for_reprocess(&self, id: Uuid) -> Result<AttachmentRecord> {
        self.inner.reset_for_reprocess(id).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

// =============================================================================
// WIRING
// =============================================================================

pub fn controller(
    source: Arc<FakeSource>,
    extractor: Arc<FakeExtractor>,
    store: Arc<dyn InvoiceStore>,
    sink: Arc<RecordingSink>,
    config: PipelineConfig,
) -> RunController {
    RunController::new(source, extractor, store, sink, config).with_retry(fast_retry())
}
