//! SQLite invoice store.
//!
//! UUIDs are stored as 16-byte BLOBs, timestamps as RFC 3339 text, and JSON
//! columns as text.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use tally_core::validation::{check_invoice_batch, check_new_attachment, completion_blob};
use tally_core::{
    new_v7, AttachmentRecord, AttachmentWithInvoices, Error, InvoiceRecord, InvoiceStore,
    LineItem, NewAttachmentRecord, NewInvoiceRecord, ProcessingStatus, RecentWindow, Result,
    StorageBackendKind,
};

use crate::common::{check_completable, join_invoices, refused_update, write_error};
use crate::pool::log_pool_metrics;

const ATTACHMENT_COLUMNS: &str = "id, message_id, attachment_id, attachment_name, sender_email, \
     subject, content_type, file_size_bytes, confidence_score, extracted_data, \
     processing_status, attempts, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, attachment_record_id, invoice_number, vendor_name, \
     vendor_address, invoice_date, due_date, total_amount, subtotal_amount, tax_amount, \
     currency, line_items, bill_to_name, payment_terms, purchase_order_number, \
     confidence_score, invoice_sequence, extraction_method, created_at";

/// SQLite implementation of [`InvoiceStore`].
#[derive(Clone)]
pub struct SqliteInvoiceStore {
    pool: SqlitePool,
}

impl SqliteInvoiceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying pool, for tests and maintenance tasks.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_attachment(row: &SqliteRow) -> Result<AttachmentRecord> {
        let status: String = row.get("processing_status");
        Ok(AttachmentRecord {
            id: row.get("id"),
            message_id: row.get("message_id"),
            attachment_id: row.get("attachment_id"),
            attachment_name: row.get("attachment_name"),
            sender_email: row.get("sender_email"),
            subject: row.get("subject"),
            content_type: row.get("content_type"),
            file_size_bytes: row.get("file_size_bytes"),
            confidence_score: row.get("confidence_score"),
            extracted_data: row.get("extracted_data"),
            processing_status: status.parse()?,
            attempts: row.get("attempts"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_invoice(row: &SqliteRow) -> InvoiceRecord {
        let line_items: Json<Vec<LineItem>> = row.get("line_items");
        InvoiceRecord {
            id: row.get("id"),
            attachment_record_id: row.get("attachment_record_id"),
            invoice_number: row.get("invoice_number"),
            vendor_name: row.get("vendor_name"),
            vendor_address: row.get("vendor_address"),
            invoice_date: row.get("invoice_date"),
            due_date: row.get("due_date"),
            total_amount: row.get("total_amount"),
            subtotal_amount: row.get("subtotal_amount"),
            tax_amount: row.get("tax_amount"),
            currency: row.get("currency"),
            line_items: line_items.0,
            bill_to_name: row.get("bill_to_name"),
            payment_terms: row.get("payment_terms"),
            purchase_order_number: row.get("purchase_order_number"),
            confidence_score: row.get("confidence_score"),
            invoice_sequence: row.get("invoice_sequence"),
            extraction_method: row.get("extraction_method"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl InvoiceStore for SqliteInvoiceStore {
    fn backend(&self) -> StorageBackendKind {
        StorageBackendKind::Sqlite
    }

    async fn create_attachment_record(&self, req: NewAttachmentRecord) -> Result<AttachmentRecord> {
        check_new_attachment(&req)?;
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

        sqlx::query(
            "INSERT INTO attachment_record (id, message_id, attachment_id, attachment_name,
                sender_email, subject, content_type, file_size_bytes, confidence_score,
                extracted_data, processing_status, attempts, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 'pending', 1, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.message_id)
        .bind(&record.attachment_id)
        .bind(&record.attachment_name)
        .bind(&record.sender_email)
        .bind(&record.subject)
        .bind(&record.content_type)
        .bind(record.file_size_bytes)
        .bind(record.confidence_score)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "create_attachment_record"))?;

        info!(
            subsystem = "database",
            component = "invoice_store",
            op = "create_attachment_record",
            backend = "sqlite",
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

        let row = sqlx::query(&format!(
            "UPDATE attachment_record
             SET processing_status = ?,
                 extracted_data = COALESCE(?, extracted_data),
                 updated_at = ?
             WHERE id = ? AND processing_status <> 'completed'
             RETURNING {}",
            ATTACHMENT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(extracted_data)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| write_error(e, "update_attachment_status"))?;

        match row {
            Some(row) => {
                debug!(
                    subsystem = "database",
                    component = "invoice_store",
                    op = "update_attachment_status",
                    attachment_record_id = %id,
                    status = %status,
                    "Attachment status updated"
                );
                Self::parse_attachment(&row)
            }
            None => {
                let current = self.get_attachment_record(id).await?;
                Err(refused_update(id, current.as_ref(), "update_attachment_status"))
            }
        }
    }

    async fn create_invoice_records(
        &self,
        attachment_record_id: Uuid,
        invoices: Vec<NewInvoiceRecord>,
        extracted_data: JsonValue,
    ) -> Result<Vec<InvoiceRecord>> {
        check_invoice_batch(&invoices)?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let status: Option<String> = sqlx::query_scalar(
            "SELECT processing_status FROM attachment_record WHERE id = ?",
        )
        .bind(attachment_record_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let status = status.map(|s| s.parse::<ProcessingStatus>()).transpose()?;
        check_completable(attachment_record_id, status)?;

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM invoice_record WHERE attachment_record_id = ?")
                .bind(attachment_record_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(Error::Database)?;
        if existing > 0 {
            return Err(Error::Integrity(format!(
                "attachment record {} already has {} invoice records",
                attachment_record_id, existing
            )));
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(invoices.len());
        for inv in invoices {
            let id = new_v7();
            sqlx::query(
                "INSERT INTO invoice_record (id, attachment_record_id, invoice_number, vendor_name,
                    vendor_address, invoice_date, due_date, total_amount, subtotal_amount,
                    tax_amount, currency, line_items, bill_to_name, payment_terms,
                    purchase_order_number, confidence_score, invoice_sequence,
                    extraction_method, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(attachment_record_id)
            .bind(&inv.invoice_number)
            .bind(&inv.vendor_name)
            .bind(&inv.vendor_address)
            .bind(inv.invoice_date)
            .bind(inv.due_date)
            .bind(inv.total_amount)
            .bind(inv.subtotal_amount)
            .bind(inv.tax_amount)
            .bind(&inv.currency)
            .bind(Json(&inv.line_items))
            .bind(&inv.bill_to_name)
            .bind(&inv.payment_terms)
            .bind(&inv.purchase_order_number)
            .bind(inv.confidence_score)
            .bind(inv.invoice_sequence)
            .bind(&inv.extraction_method)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error(e, "create_invoice_records"))?;
            created.push(InvoiceRecord::from_new(id, attachment_record_id, inv, now));
        }

        let blob = completion_blob(extracted_data, created.len());
        sqlx::query(
            "UPDATE attachment_record
             SET processing_status = 'completed', extracted_data = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&blob)
        .bind(now)
        .bind(attachment_record_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e, "create_invoice_records"))?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "invoice_store",
            op = "create_invoice_records",
            backend = "sqlite",
            attachment_record_id = %attachment_record_id,
            invoice_count = created.len(),
            "Invoice records created and attachment completed"
        );
        Ok(created)
    }

    async fn get_attachment_record(&self, id: Uuid) -> Result<Option<AttachmentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM attachment_record WHERE id = ?",
            ATTACHMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_attachment).transpose()
    }

    async fn find_attachment_record(
        &self,
        message_id: &str,
        attachment_name: &str,
    ) -> Result<Option<AttachmentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM attachment_record WHERE message_id = ? AND attachment_name = ?",
            ATTACHMENT_COLUMNS
        ))
        .bind(message_id)
        .bind(attachment_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_attachment).transpose()
    }

    async fn list_invoice_records(&self, attachment_record_id: Uuid) -> Result<Vec<InvoiceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM invoice_record WHERE attachment_record_id = ? ORDER BY invoice_sequence",
            INVOICE_COLUMNS
        ))
        .bind(attachment_record_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(Self::parse_invoice).collect())
    }

    async fn query_recent(&self, window: RecentWindow) -> Result<Vec<AttachmentWithInvoices>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM attachment_record
             WHERE created_at >= ? AND (? IS NULL OR processing_status = ?)
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
            ATTACHMENT_COLUMNS
        ))
        .bind(window.since)
        .bind(window.status.map(|s| s.as_str()))
        .bind(window.status.map(|s| s.as_str()))
        .bind(window.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let records = rows
            .iter()
            .map(Self::parse_attachment)
            .collect::<Result<Vec<_>>>()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM invoice_record WHERE attachment_record_id IN (",
            INVOICE_COLUMNS
        ));
        let mut ids = qb.separated(", ");
        for record in &records {
            ids.push_bind(record.id);
        }
        ids.push_unseparated(") ORDER BY attachment_record_id, invoice_sequence");
        let invoice_rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let invoices = invoice_rows.iter().map(Self::parse_invoice).collect();
        Ok(join_invoices(records, invoices))
    }

    async fn reset_for_reprocess(&self, id: Uuid) -> Result<AttachmentRecord> {
        let row = sqlx::query(&format!(
            "UPDATE attachment_record
             SET processing_status = 'pending',
                 extracted_data = NULL,
                 attempts = attempts + 1,
                 updated_at = ?
             WHERE id = ? AND processing_status <> 'completed'
             RETURNING {}",
            ATTACHMENT_COLUMNS
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => {
                let record = Self::parse_attachment(&row)?;
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
            None => {
                let current = self.get_attachment_record(id).await?;
                Err(refused_update(id, current.as_ref(), "reset_for_reprocess"))
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        log_pool_metrics("sqlite", self.pool.size(), self.pool.num_idle());
        Ok(())
    }
}
