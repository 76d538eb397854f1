//! JSON document invoice store.
//!
//! Two collections (`attachment_records`, `invoice_records`) are held in memory
//! behind a write lock and, when a directory is configured, persisted as one
//! JSON snapshot replaced by atomic rename after every mutation. A mutation
//! whose snapshot cannot be written is rolled back in memory, so the file and
//! the in-memory view never diverge.
//!
//! The relational constraints (no orphans, unique natural key, unique and
//! contiguous sequences) are enforced here under the write lock. A semaphore
//! plays the role of the connection pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{RwLock, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_core::validation::{check_invoice_batch, check_new_attachment, completion_blob};
use tally_core::{
    new_v7, AttachmentRecord, AttachmentWithInvoices, Error, InvoiceRecord, InvoiceStore,
    NewAttachmentRecord, NewInvoiceRecord, ProcessingStatus, RecentWindow, Result,
    StorageBackendKind,
};

use crate::common::{check_completable, join_invoices, refused_update};
use crate::pool::PoolConfig;

/// Snapshot file name inside the store directory.
pub const SNAPSHOT_FILE: &str = "invoice_store.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Collections {
    #[serde(default)]
    attachment_records: BTreeMap<Uuid, AttachmentRecord>,
    #[serde(default)]
    invoice_records: BTreeMap<Uuid, InvoiceRecord>,
}

impl Collections {
    fn find(&self, message_id: &str, attachment_name: &str) -> Option<&AttachmentRecord> {
        self.attachment_records
            .values()
            .find(|r| r.message_id == message_id && r.attachment_name == attachment_name)
    }

    fn invoices_for(&self, attachment_record_id: Uuid) -> Vec<InvoiceRecord> {
        let mut invoices: Vec<InvoiceRecord> = self
            .invoice_records
            .values()
            .filter(|i| i.attachment_record_id == attachment_record_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.invoice_sequence);
        invoices
    }
}

/// Document-store implementation of [`InvoiceStore`].
pub struct DocumentInvoiceStore {
    dir: Option<PathBuf>,
    state: RwLock<Collections>,
    sessions: Arc<Semaphore>,
    max_sessions: u32,
}

impl DocumentInvoiceStore {
    /// Open (or create) a store persisted under `dir`.
    pub async fn open(dir: impl AsRef<Path>, pool: &PoolConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(SNAPSHOT_FILE);
        let collections = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Collections>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Collections::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            subsystem = "database",
            component = "document_store",
            op = "open",
            path = %path.display(),
            attachment_records = collections.attachment_records.len(),
            invoice_records = collections.invoice_records.len(),
            max_sessions = pool.max_connections,
            "Document store opened"
        );

        Ok(Self::build(Some(dir), collections, pool.max_connections))
    }

    /// A non-persistent store, for tests and dry runs.
    pub fn in_memory(max_sessions: u32) -> Self {
        Self::build(None, Collections::default(), max_sessions)
    }

    fn build(dir: Option<PathBuf>, collections: Collections, max_sessions: u32) -> Self {
        let max_sessions = max_sessions.max(1);
        Self {
            dir,
            state: RwLock::new(collections),
            sessions: Arc::new(Semaphore::new(max_sessions as usize)),
            max_sessions,
        }
    }

    async fn session(&self) -> Result<SemaphorePermit<'_>> {
        self.sessions
            .acquire()
            .await
            .map_err(|_| Error::Unavailable("document store is shut down".to_string()))
    }

    /// Write the snapshot: temp file, then rename over the previous one.
    async fn persist(&self, collections: &Collections) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(collections)?;
        let tmp = dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, dir.join(SNAPSHOT_FILE)).await?;
        debug!(
            subsystem = "database",
            component = "document_store",
            op = "persist",
            bytes = bytes.len(),
            "Snapshot written"
        );
        Ok(())
    }

    /// Run `apply` under the write lock and persist; roll back on failure.
    async fn mutate<T, F>(&self, op: &'static str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut Collections) -> Result<T>,
    {
        let _permit = self.session().await?;
        let mut state = self.state.write().await;
        let snapshot = self.dir.as_ref().map(|_| state.clone());

        let value = apply(&mut *state)?;

        if let Err(e) = self.persist(&*state).await {
            warn!(
                subsystem = "database",
                component = "document_store",
                op,
                error = %e,
                "Snapshot write failed, rolling back"
            );
            if let Some(previous) = snapshot {
                *state = previous;
            }
            return Err(e);
        }
        Ok(value)
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Collections) -> T,
    {
        let _permit = self.session().await?;
        let state = self.state.read().await;
        Ok(f(&*state))
    }
}

#[async_trait]
impl InvoiceStore for DocumentInvoiceStore {
    fn backend(&self) -> StorageBackendKind {
        StorageBackendKind::Document
    }

    async fn create_attachment_record(&self, req: NewAttachmentRecord) -> Result<AttachmentRecord> {
        check_new_attachment(&req)?;
        let record = self
            .mutate("create_attachment_record", move |c| {
                if c.find(&req.message_id, &req.attachment_name).is_some() {
                    return Err(Error::Integrity(format!(
                        "create_attachment_record: duplicate record for message {} attachment {}",
                        req.message_id, req.attachment_name
                    )));
                }
                let now = Utc::now();
                let record = AttachmentRecord {
                    id: new_v7(),
                    message_id: req.message_id,
                    attachment_id: req.attachment_id,
                    attachment_name: req.attachment_name,
                    sender_email: req.sender_email,
                    subject: req.subject,
                    content_type: req.content_type,
                    file_size_bytes: req.file_size_bytes,
                    confidence_score: req.confidence_score,
                    extracted_data: None,
                    processing_status: ProcessingStatus::Pending,
                    attempts: 1,
                    created_at: now,
                    updated_at: now,
                };
                c.attachment_records.insert(record.id, record.clone());
                Ok(record)
            })
            .await?;

        info!(
            subsystem = "database",
            component = "invoice_store",
            op = "create_attachment_record",
            backend = "document",
            attachment_record_id = %record.id,
            message_id = %record.message_id,
            "Attachment record created"
        );
        Ok(record)
    }

    async fn update_attachment_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        extracted_data: Option<JsonValue>,
    ) -> Result<AttachmentRecord> {
        if status == ProcessingStatus::Completed {
            return Err(Error::validation(
                "processing_status",
                "records are completed only together with their invoices",
            ));
        }

        self.mutate("update_attachment_status", move |c| {
            let record = match c.attachment_records.get_mut(&id) {
                Some(r) if r.processing_status != ProcessingStatus::Completed => r,
                other => {
                    return Err(refused_update(
                        id,
                        other.map(|r| &*r),
                        "update_attachment_status",
                    ))
                }
            };
            record.processing_status = status;
            if let Some(data) = extracted_data {
                record.extracted_data = Some(data);
            }
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
        .await
    }

    async fn create_invoice_records(
        &self,
        attachment_record_id: Uuid,
        invoices: Vec<NewInvoiceRecord>,
        extracted_data: JsonValue,
    ) -> Result<Vec<InvoiceRecord>> {
        check_invoice_batch(&invoices)?;

        let created = self
            .mutate("create_invoice_records", move |c| {
                let status = c
                    .attachment_records
                    .get(&attachment_record_id)
                    .map(|r| r.processing_status);
                check_completable(attachment_record_id, status)?;

                let existing = c
                    .invoice_records
                    .values()
                    .filter(|i| i.attachment_record_id == attachment_record_id)
                    .count();
                if existing > 0 {
                    return Err(Error::Integrity(format!(
                        "attachment record {} already has {} invoice records",
                        attachment_record_id, existing
                    )));
                }

                let now = Utc::now();
                let created: Vec<InvoiceRecord> = invoices
                    .into_iter()
                    .map(|inv| InvoiceRecord::from_new(new_v7(), attachment_record_id, inv, now))
                    .collect();
                for inv in &created {
                    c.invoice_records.insert(inv.id, inv.clone());
                }

                let blob = completion_blob(extracted_data, created.len());
                if let Some(record) = c.attachment_records.get_mut(&attachment_record_id) {
                    record.processing_status = ProcessingStatus::Completed;
                    record.extracted_data = Some(blob);
                    record.updated_at = now;
                }
                Ok(created)
            })
            .await?;

        info!(
            subsystem = "database",
            component = "invoice_store",
            op = "create_invoice_records",
            backend = "document",
            attachment_record_id = %attachment_record_id,
            invoice_count = created.len(),
            "Invoice records created and attachment completed"
        );
        Ok(created)
    }

    async fn get_attachment_record(&self, id: Uuid) -> Result<Option<AttachmentRecord>> {
        self.read(|c| c.attachment_records.get(&id).cloned()).await
    }

    async fn find_attachment_record(
        &self,
        message_id: &str,
        attachment_name: &str,
    ) -> Result<Option<AttachmentRecord>> {
        self.read(|c| c.find(message_id, attachment_name).cloned())
            .await
    }

    async fn list_invoice_records(&self, attachment_record_id: Uuid) -> Result<Vec<InvoiceRecord>> {
        self.read(|c| c.invoices_for(attachment_record_id)).await
    }

    async fn query_recent(&self, window: RecentWindow) -> Result<Vec<AttachmentWithInvoices>> {
        self.read(|c| {
            let mut records: Vec<AttachmentRecord> = c
                .attachment_records
                .values()
                .filter(|r| r.created_at >= window.since)
                .filter(|r| window.status.map_or(true, |s| r.processing_status == s))
                .cloned()
                .collect();
            records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            records.truncate(usize::try_from(window.limit.max(0)).unwrap_or(usize::MAX));

            let invoices = records
                .iter()
                .flat_map(|r| c.invoices_for(r.id))
                .collect();
            join_invoices(records, invoices)
        })
        .await
    }

    async fn reset_for_reprocess(&self, id: Uuid) -> Result<AttachmentRecord> {
        let record = self
            .mutate("reset_for_reprocess", move |c| {
                let record = match c.attachment_records.get_mut(&id) {
                    Some(r) if r.processing_status != ProcessingStatus::Completed => r,
                    other => {
                        return Err(refused_update(
                            id,
                            other.map(|r| &*r),
                            "reset_for_reprocess",
                        ))
                    }
                };
                record.processing_status = ProcessingStatus::Pending;
                record.extracted_data = None;
                record.attempts += 1;
                record.updated_at = Utc::now();
                Ok(record.clone())
            })
            .await?;

        info!(
            subsystem = "database",
            component = "invoice_store",
            op = "reset_for_reprocess",
            attachment_record_id = %id,
            attempts = record.attempts,
            "Attachment record reset for reprocessing"
        );
        Ok(record)
    }

    async fn health_check(&self) -> Result<()> {
        let _permit = self.session().await?;
        if let Some(dir) = &self.dir {
            tokio::fs::metadata(dir).await?;
        }
        crate::pool::log_pool_metrics(
            "document",
            self.max_sessions,
            self.sessions.available_permits(),
        );
        Ok(())
    }
}
