//! Helpers shared by the storage backends.

use std::collections::HashMap;

use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

use tally_core::{AttachmentRecord, AttachmentWithInvoices, Error, InvoiceRecord, ProcessingStatus};

/// Current time at the precision `TIMESTAMPTZ` keeps (microseconds), so a
/// returned record equals the same record read back.
pub(crate) fn stored_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Map a failed write to the audit error it represents.
pub(crate) fn write_error(e: sqlx::Error, what: &str) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return Error::Integrity(format!("{}: duplicate record ({})", what, db.message()));
        }
        if db.is_foreign_key_violation() {
            return Error::Integrity(format!(
                "{}: referenced attachment record does not exist ({})",
                what,
                db.message()
            ));
        }
        if db.is_check_violation() {
            return Error::validation(what, db.message());
        }
    }
    Error::Database(e)
}

/// Error for a conditional update that matched no row.
pub(crate) fn refused_update(id: Uuid, current: Option<&AttachmentRecord>, op: &str) -> Error {
    match current {
        None => Error::AttachmentRecordNotFound(id),
        Some(r) if r.processing_status == ProcessingStatus::Completed => Error::Integrity(format!(
            "{}: attachment record {} is completed and immutable",
            op, id
        )),
        Some(r) => Error::Internal(format!(
            "{}: attachment record {} in status {} was not updated",
            op, id, r.processing_status
        )),
    }
}

/// Status check ahead of an invoice batch insert.
pub(crate) fn check_completable(id: Uuid, status: Option<ProcessingStatus>) -> Result<(), Error> {
    match status {
        None => Err(Error::Integrity(format!(
            "attachment record {} does not exist; refusing orphan invoices",
            id
        ))),
        Some(ProcessingStatus::Completed) => Err(Error::Integrity(format!(
            "attachment record {} is already completed",
            id
        ))),
        Some(_) => Ok(()),
    }
}

/// Attach invoices to their records, preserving record order.
pub(crate) fn join_invoices(
    records: Vec<AttachmentRecord>,
    invoices: Vec<InvoiceRecord>,
) -> Vec<AttachmentWithInvoices> {
    let mut by_record: HashMap<Uuid, Vec<InvoiceRecord>> = HashMap::new();
    for inv in invoices {
        by_record.entry(inv.attachment_record_id).or_default().push(inv);
    }
    records
        .into_iter()
        .map(|attachment| {
            let mut invoices = by_record.remove(&attachment.id).unwrap_or_default();
            invoices.sort_by_key(|i| i.invoice_sequence);
            AttachmentWithInvoices {
                attachment,
                invoices,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_stored_now_has_microsecond_precision() {
        let now = stored_now();
        assert_eq!(now.nanosecond() % 1_000, 0);
    }
}
