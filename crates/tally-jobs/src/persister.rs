//! Audit-linked persistence: every invoice batch hangs off an attachment
//! record created before extraction starts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use tally_core::{
    AttachmentCandidate, AttachmentRecord, Error, ErrorKind, InvoiceRecord, InvoiceStore,
    NewAttachmentRecord, PipelineConfig, ProcessingStatus, Result,
};

use crate::coordinator::ExtractionOutcome;
use crate::retry::{with_timeout, RetryPolicy};

/// How an attachment entered the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// New pending record.
    Fresh(AttachmentRecord),
    /// Earlier failed or pending record, reset in place.
    Reprocess(AttachmentRecord),
    /// Already completed; nothing to do.
    AlreadyCompleted(AttachmentRecord),
    /// Created by a concurrent pipeline that still owns it.
    InFlight(AttachmentRecord),
}

impl BeginOutcome {
    pub fn record(&self) -> &AttachmentRecord {
        match self {
            BeginOutcome::Fresh(r)
            | BeginOutcome::Reprocess(r)
            | BeginOutcome::AlreadyCompleted(r)
            | BeginOutcome::InFlight(r) => r,
        }
    }
}

/// Writes attachment and invoice records through an [`InvoiceStore`].
pub struct AuditPersister {
    store: Arc<dyn InvoiceStore>,
    retry: RetryPolicy,
    storage_timeout: Duration,
}

impl AuditPersister {
    pub fn new(store: Arc<dyn InvoiceStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::from_config(config),
            storage_timeout: config.storage_timeout,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn InvoiceStore> {
        &self.store
    }

    /// Find or create the attachment record for a candidate.
    pub async fn begin(
        &self,
        candidate: &AttachmentCandidate,
        deadline: Option<Instant>,
    ) -> Result<BeginOutcome> {
        let existing = self.find(candidate, deadline).await?;

        let outcome = match existing {
            Some(record) if record.processing_status == ProcessingStatus::Completed => {
                BeginOutcome::AlreadyCompleted(record)
            }
            Some(record) => {
                let id = record.id;
                let reset = self
                    .retry
                    .run("reset_for_reprocess", deadline, || {
                        with_timeout(
                            "reset_for_reprocess",
                            self.storage_timeout,
                            self.store.reset_for_reprocess(id),
                        )
                    })
                    .await?;
                BeginOutcome::Reprocess(reset)
            }
            None => {
                let req = NewAttachmentRecord::from(candidate);
                let created = self
                    .retry
                    .run("create_attachment_record", deadline, || {
                        with_timeout(
                            "create_attachment_record",
                            self.storage_timeout,
                            self.store.create_attachment_record(req.clone()),
                        )
                    })
                    .await;
                match created {
                    Ok(record) => BeginOutcome::Fresh(record),
                    // Another pipeline created it first
                    Err(e) if e.kind() == ErrorKind::Integrity => {
                        match self.find(candidate, deadline).await? {
                            Some(record)
                                if record.processing_status == ProcessingStatus::Completed =>
                            {
                                BeginOutcome::AlreadyCompleted(record)
                            }
                            Some(record) => BeginOutcome::InFlight(record),
                            None => return Err(e),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let (label, record) = match &outcome {
            BeginOutcome::Fresh(r) => ("fresh", r),
            BeginOutcome::Reprocess(r) => ("reprocess", r),
            BeginOutcome::AlreadyCompleted(r) => ("already_completed", r),
            BeginOutcome::InFlight(r) => ("in_flight", r),
        };
        info!(
            subsystem = "jobs",
            component = "persister",
            op = "begin",
            attachment_record_id = %record.id,
            message_id = %record.message_id,
            attachment_name = %record.attachment_name,
            attempts = record.attempts,
            outcome = label,
            "Attachment record ready"
        );
        Ok(outcome)
    }

    async fn find(
        &self,
        candidate: &AttachmentCandidate,
        deadline: Option<Instant>,
    ) -> Result<Option<AttachmentRecord>> {
        self.retry
            .run("find_attachment_record", deadline, || {
                with_timeout(
                    "find_attachment_record",
                    self.storage_timeout,
                    self.store
                        .find_attachment_record(&candidate.message_id, &candidate.attachment_name),
                )
            })
            .await
    }

    /// Persist the batch and complete the record atomically.
    ///
    /// Integrity and validation failures discard the batch and mark the
    /// record failed before the error is returned.
    pub async fn complete(
        &self,
        attachment_record_id: Uuid,
        outcome: &ExtractionOutcome,
        deadline: Option<Instant>,
    ) -> Result<Vec<InvoiceRecord>> {
        let result = self
            .retry
            .run("create_invoice_records", deadline, || {
                with_timeout(
                    "create_invoice_records",
                    self.storage_timeout,
                    self.store.create_invoice_records(
                        attachment_record_id,
                        outcome.invoices.clone(),
                        outcome.extracted_data.clone(),
                    ),
                )
            })
            .await;

        match result {
            Ok(created) => {
                info!(
                    subsystem = "jobs",
                    component = "persister",
                    op = "complete",
                    attachment_record_id = %attachment_record_id,
                    invoices = created.len(),
                    "Attachment record completed"
                );
                Ok(created)
            }
            Err(e) if matches!(e.kind(), ErrorKind::Integrity | ErrorKind::Validation) => {
                warn!(
                    subsystem = "jobs",
                    component = "persister",
                    op = "complete",
                    attachment_record_id = %attachment_record_id,
                    error = %e,
                    "Invoice batch refused, marking record failed"
                );
                if let Err(fail_err) = self.fail(attachment_record_id, &e, deadline).await {
                    warn!(
                        attachment_record_id = %attachment_record_id,
                        error = %fail_err,
                        "Could not mark record failed"
                    );
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Mark the record failed with an error summary.
    pub async fn fail(
        &self,
        attachment_record_id: Uuid,
        error: &Error,
        deadline: Option<Instant>,
    ) -> Result<AttachmentRecord> {
        let blob = json!({
            "error": error.to_string(),
            "error_kind": error.kind(),
            "failed_at": Utc::now(),
        });
        let record = self
            .retry
            .run("update_attachment_status", deadline, || {
                with_timeout(
                    "update_attachment_status",
                    self.storage_timeout,
                    self.store.update_attachment_status(
                        attachment_record_id,
                        ProcessingStatus::Failed,
                        Some(blob.clone()),
                    ),
                )
            })
            .await?;

        info!(
            subsystem = "jobs",
            component = "persister",
            op = "fail",
            attachment_record_id = %attachment_record_id,
            error_kind = %error.kind(),
            "Attachment record marked failed"
        );
        Ok(record)
    }
}
