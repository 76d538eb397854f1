//! Record checks shared by every storage backend.
//!
//! Backends call these before touching storage so that a bad batch fails the
//! same way everywhere, regardless of what the underlying engine enforces.

use std::collections::HashSet;

use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::models::{
    ExtractedInvoice, NewAttachmentRecord, NewInvoiceRecord, ALL_REJECTED_MARKER,
    NO_INVOICE_MARKER,
};

/// A confidence score must be finite and within `[0, 1]`. Never clamped.
pub fn check_confidence(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::validation(
            field,
            format!("confidence {} is outside [0, 1]", value),
        ))
    }
}

/// Validate a new attachment record.
pub fn check_new_attachment(req: &NewAttachmentRecord) -> Result<()> {
    if req.message_id.trim().is_empty() {
        return Err(Error::validation("message_id", "must not be empty"));
    }
    if req.attachment_name.trim().is_empty() {
        return Err(Error::validation("attachment_name", "must not be empty"));
    }
    if req.file_size_bytes < 0 {
        return Err(Error::validation("file_size_bytes", "must be non-negative"));
    }
    check_confidence("confidence_score", req.confidence_score)
}

/// Validate an invoice batch before it is written.
///
/// A repeated sequence number is an integrity violation; a gap or a batch not
/// starting at 1 is a validation failure.
pub fn check_invoice_batch(invoices: &[NewInvoiceRecord]) -> Result<()> {
    let mut seen = HashSet::with_capacity(invoices.len());
    for inv in invoices {
        if !seen.insert(inv.invoice_sequence) {
            return Err(Error::Integrity(format!(
                "duplicate invoice_sequence {}",
                inv.invoice_sequence
            )));
        }
    }

    for (idx, inv) in invoices.iter().enumerate() {
        let expected = idx as i32 + 1;
        if inv.invoice_sequence != expected {
            return Err(Error::validation(
                "invoice_sequence",
                format!(
                    "expected contiguous sequence from 1, found {} at position {}",
                    inv.invoice_sequence, expected
                ),
            ));
        }
        check_confidence("confidence_score", inv.confidence_score)?;
    }
    Ok(())
}

/// Confidence for an invoice the extractor did not score, from field coverage.
///
/// 0.2 base, up to 0.6 for the key fields (number, vendor, date, total), and
/// 0.1 each when the document shows amounts and a currency.
pub fn coverage_confidence(invoice: &ExtractedInvoice, has_amounts: bool, has_currency: bool) -> f64 {
    let present = |v: Option<&str>| v.is_some_and(|s| !s.trim().is_empty());
    let key_fields = [
        present(invoice.invoice_number.as_deref()),
        present(invoice.vendor_name.as_deref()),
        present(invoice.invoice_date.as_deref()),
        invoice.total_amount.is_some(),
    ];
    let covered = key_fields.iter().filter(|f| **f).count() as f64;

    let mut score = 0.2 + 0.6 * covered / key_fields.len() as f64;
    if has_amounts {
        score += 0.1;
    }
    if has_currency {
        score += 0.1;
    }
    // Four decimals, like ranker scores
    ((score.min(1.0)) * 10_000.0).round() / 10_000.0
}

/// Blob stored on completion.
///
/// An empty batch gets the no-invoice marker, unless the blob lists rejected
/// invoices, in which case it gets the all-rejected marker instead.
pub fn completion_blob(extracted_data: JsonValue, invoice_count: usize) -> JsonValue {
    let mut obj = match extracted_data {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    obj.insert(
        "invoice_count".to_string(),
        JsonValue::from(invoice_count as u64),
    );
    if invoice_count == 0 {
        let rejected = obj
            .get("rejections")
            .and_then(JsonValue::as_array)
            .is_some_and(|r| !r.is_empty());
        let marker = if rejected {
            ALL_REJECTED_MARKER
        } else {
            NO_INVOICE_MARKER
        };
        obj.insert(marker.to_string(), JsonValue::Bool(true));
    }
    JsonValue::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn invoice(seq: i32, confidence: f64) -> NewInvoiceRecord {
        NewInvoiceRecord {
            invoice_number: Some(format!("INV-{}", seq)),
            vendor_name: Some("Acme".into()),
            vendor_address: None,
            invoice_date: None,
            due_date: None,
            total_amount: Some(10.0),
            subtotal_amount: None,
            tax_amount: None,
            currency: Some("USD".into()),
            line_items: vec![],
            bill_to_name: None,
            payment_terms: None,
            purchase_order_number: None,
            confidence_score: confidence,
            invoice_sequence: seq,
            extraction_method: "test".into(),
        }
    }

    #[test]
    fn test_check_confidence_bounds() {
        assert!(check_confidence("c", 0.0).is_ok());
        assert!(check_confidence("c", 1.0).is_ok());
        assert!(check_confidence("c", 1.01).is_err());
        assert!(check_confidence("c", -0.1).is_err());
        assert!(check_confidence("c", f64::NAN).is_err());
    }

    #[test]
    fn test_batch_contiguous_ok() {
        assert!(check_invoice_batch(&[invoice(1, 0.9), invoice(2, 0.8)]).is_ok());
        assert!(check_invoice_batch(&[]).is_ok());
    }

    #[test]
    fn test_batch_gap_is_validation() {
        let err = check_invoice_batch(&[invoice(1, 0.9), invoice(3, 0.9)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = check_invoice_batch(&[invoice(2, 0.9)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_batch_duplicate_is_integrity() {
        let err = check_invoice_batch(&[invoice(1, 0.9), invoice(1, 0.9)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_batch_bad_confidence_is_validation() {
        let err = check_invoice_batch(&[invoice(1, 1.5)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_completion_blob_marks_empty_batch() {
        let blob = completion_blob(json!({"method": "mock"}), 0);
        assert_eq!(blob[NO_INVOICE_MARKER], true);
        assert_eq!(blob["invoice_count"], 0);
        assert_eq!(blob["method"], "mock");

        let blob = completion_blob(JsonValue::Null, 2);
        assert!(blob.get(NO_INVOICE_MARKER).is_none());
        assert_eq!(blob["invoice_count"], 2);
    }

    #[test]
    fn test_completion_blob_distinguishes_all_rejected() {
        let blob = completion_blob(
            json!({"rejections": [{"index": 0, "field": "total_amount"}]}),
            0,
        );
        assert_eq!(blob[ALL_REJECTED_MARKER], true);
        assert!(blob.get(NO_INVOICE_MARKER).is_none());

        let blob = completion_blob(json!({"rejections": []}), 0);
        assert_eq!(blob[NO_INVOICE_MARKER], true);
        assert!(blob.get(ALL_REJECTED_MARKER).is_none());
    }

    #[test]
    fn test_coverage_confidence() {
        let empty = ExtractedInvoice::default();
        assert_eq!(coverage_confidence(&empty, false, false), 0.2);

        let full = ExtractedInvoice {
            invoice_number: Some("INV-1".into()),
            vendor_name: Some("Acme".into()),
            invoice_date: Some("2024-03-01".into()),
            total_amount: Some(10.0),
            ..Default::default()
        };
        assert_eq!(coverage_confidence(&full, false, false), 0.8);
        assert_eq!(coverage_confidence(&full, true, true), 1.0);

        let half = ExtractedInvoice {
            invoice_number: Some("INV-1".into()),
            vendor_name: Some("  ".into()),
            total_amount: Some(10.0),
            ..Default::default()
        };
        assert_eq!(coverage_confidence(&half, true, false), 0.6);
    }

    #[test]
    fn test_check_new_attachment() {
        let mut req = NewAttachmentRecord {
            message_id: "m1".into(),
            attachment_id: "a1".into(),
            attachment_name: "invoice.pdf".into(),
            sender_email: "b@acme.com".into(),
            subject: "Invoice".into(),
            content_type: "application/pdf".into(),
            file_size_bytes: 100,
            confidence_score: 0.9,
        };
        assert!(check_new_attachment(&req).is_ok());
        req.confidence_score = 2.0;
        assert!(check_new_attachment(&req).is_err());
        req.confidence_score = 0.5;
        req.message_id = " ".into();
        assert!(check_new_attachment(&req).is_err());
    }
}
