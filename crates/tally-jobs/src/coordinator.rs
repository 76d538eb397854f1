//! Extraction coordinator: download, extract, then shape the extractor output
//! into a validated, sequenced invoice batch.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tally_core::validation::{check_confidence, coverage_confidence};
use tally_core::{
    AttachmentCandidate, AttachmentSource, ExtractedInvoice, Extractor, ExtractorOutput,
    NewInvoiceRecord, PipelineConfig, Result,
};

use crate::retry::{check_deadline, with_timeout, RetryPolicy};

/// An invoice dropped by validation, with the field that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    /// Position in the extractor's output (0-based).
    pub index: usize,
    pub field: String,
    pub reason: String,
}

/// Validated extraction result for one attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutcome {
    /// Accepted invoices, sequenced 1..N in returned order.
    pub invoices: Vec<NewInvoiceRecord>,
    pub rejections: Vec<Rejection>,
    /// Invoices returned beyond the per-attachment cap.
    pub overflow: usize,
    pub method: String,
    /// Blob stored on the attachment record.
    pub extracted_data: JsonValue,
}

impl ExtractionOutcome {
    pub fn is_empty(&self) -> bool {
        self.invoices.is_empty()
    }
}

/// Drives download and extraction for one candidate at a time.
pub struct ExtractionCoordinator {
    source: Arc<dyn AttachmentSource>,
    extractor: Arc<dyn Extractor>,
    retry: RetryPolicy,
    download_timeout: Duration,
    extract_timeout: Duration,
    max_invoices: usize,
}

impl ExtractionCoordinator {
    pub fn new(
        source: Arc<dyn AttachmentSource>,
        extractor: Arc<dyn Extractor>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            source,
            extractor,
            retry: RetryPolicy::from_config(config),
            download_timeout: config.download_timeout,
            extract_timeout: config.extract_timeout,
            max_invoices: config.max_invoices_per_attachment,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Download and extract, stopping at the step boundary if the deadline passed.
    pub async fn process(
        &self,
        candidate: &AttachmentCandidate,
        deadline: Option<Instant>,
    ) -> Result<ExtractionOutcome> {
        let content = self.download(candidate, deadline).await?;
        if let Some(deadline) = deadline {
            check_deadline(deadline)?;
        }
        self.extract(candidate, content, deadline).await
    }

    /// Fetch the attachment bytes.
    pub async fn download(
        &self,
        candidate: &AttachmentCandidate,
        deadline: Option<Instant>,
    ) -> Result<Bytes> {
        let content = self
            .retry
            .run("download", deadline, || {
                with_timeout(
                    "download",
                    self.download_timeout,
                    self.source
                        .download(&candidate.message_id, &candidate.attachment_id),
                )
            })
            .await?;

        debug!(
            subsystem = "jobs",
            component = "coordinator",
            op = "download",
            message_id = %candidate.message_id,
            attachment_name = %candidate.attachment_name,
            bytes = content.len(),
            "Attachment downloaded"
        );
        Ok(content)
    }

    /// Run the extractor and shape its output.
    pub async fn extract(
        &self,
        candidate: &AttachmentCandidate,
        content: Bytes,
        deadline: Option<Instant>,
    ) -> Result<ExtractionOutcome> {
        let descriptor = candidate.descriptor();
        let output = self
            .retry
            .run("extract", deadline, || {
                with_timeout(
                    "extract",
                    self.extract_timeout,
                    self.extractor
                        .extract(content.clone(), &descriptor, self.max_invoices),
                )
            })
            .await?;

        let outcome = shape_output(output, self.max_invoices)?;
        info!(
            subsystem = "jobs",
            component = "coordinator",
            op = "extract",
            message_id = %candidate.message_id,
            attachment_name = %candidate.attachment_name,
            accepted = outcome.invoices.len(),
            rejected = outcome.rejections.len(),
            overflow = outcome.overflow,
            "Extraction shaped"
        );
        Ok(outcome)
    }
}

/// Truncate, validate, and sequence extractor output.
///
/// A confidence score outside `[0, 1]` fails the whole attachment; other
/// per-invoice problems reject only that invoice.
pub fn shape_output(output: ExtractorOutput, max_invoices: usize) -> Result<ExtractionOutcome> {
    let ExtractorOutput {
        invoices: returned,
        method,
        metadata,
    } = output;

    let returned_count = returned.len();
    let overflow = returned_count.saturating_sub(max_invoices);
    if overflow > 0 {
        warn!(
            subsystem = "jobs",
            component = "coordinator",
            op = "shape_output",
            returned = returned_count,
            kept = max_invoices,
            overflow,
            "Extractor returned more invoices than allowed, keeping the first"
        );
    }

    let mut accepted = Vec::new();
    let mut rejections = Vec::new();
    let mut unparsed_dates = Vec::new();

    for (index, invoice) in returned.into_iter().take(max_invoices).enumerate() {
        if let Some(score) = invoice.confidence_score {
            check_confidence("confidence_score", score)?;
        }

        if let Err((field, reason)) = validate_invoice(&invoice) {
            warn!(
                subsystem = "jobs",
                component = "coordinator",
                op = "shape_output",
                index,
                field,
                reason = %reason,
                "Invoice rejected"
            );
            rejections.push(Rejection {
                index,
                field: field.to_string(),
                reason,
            });
            continue;
        }

        let invoice_date = parse_date(invoice.invoice_date.as_deref());
        let due_date = parse_date(invoice.due_date.as_deref());
        for (field, raw, parsed) in [
            ("invoice_date", &invoice.invoice_date, invoice_date),
            ("due_date", &invoice.due_date, due_date),
        ] {
            if let (Some(raw), None) = (non_blank(raw.as_deref()), parsed) {
                unparsed_dates.push(json!({"index": index, "field": field, "value": raw}));
            }
        }

        let confidence_score = match invoice.confidence_score {
            Some(score) => score,
            None => {
                let has_amounts = invoice.total_amount.is_some()
                    || invoice.subtotal_amount.is_some()
                    || invoice.tax_amount.is_some()
                    || invoice.line_items.iter().any(|l| l.amount.is_some());
                let has_currency = non_blank(invoice.currency.as_deref()).is_some();
                coverage_confidence(&invoice, has_amounts, has_currency)
            }
        };

        let sequence = accepted.len() as i32 + 1;
        accepted.push(NewInvoiceRecord {
            invoice_number: non_blank(invoice.invoice_number.as_deref()).map(String::from),
            vendor_name: non_blank(invoice.vendor_name.as_deref()).map(String::from),
            vendor_address: non_blank(invoice.vendor_address.as_deref()).map(String::from),
            invoice_date,
            due_date,
            total_amount: invoice.total_amount,
            subtotal_amount: invoice.subtotal_amount,
            tax_amount: invoice.tax_amount,
            currency: non_blank(invoice.currency.as_deref()).map(|c| c.to_uppercase()),
            line_items: invoice.line_items,
            bill_to_name: non_blank(invoice.bill_to_name.as_deref()).map(String::from),
            payment_terms: non_blank(invoice.payment_terms.as_deref()).map(String::from),
            purchase_order_number: non_blank(invoice.purchase_order_number.as_deref())
                .map(String::from),
            confidence_score,
            invoice_sequence: sequence,
            extraction_method: method.clone(),
        });
    }

    let extracted_data = json!({
        "extraction_method": method,
        "invoices_returned": returned_count,
        "invoices_accepted": accepted.len(),
        "overflow": overflow,
        "rejections": rejections,
        "unparsed_dates": unparsed_dates,
        "extractor_metadata": metadata,
    });

    Ok(ExtractionOutcome {
        invoices: accepted,
        rejections,
        overflow,
        method,
        extracted_data,
    })
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn validate_invoice(invoice: &ExtractedInvoice) -> std::result::Result<(), (&'static str, String)> {
    if non_blank(invoice.invoice_number.as_deref()).is_none()
        && non_blank(invoice.vendor_name.as_deref()).is_none()
    {
        return Err((
            "invoice_number",
            "neither invoice_number nor vendor_name is present".to_string(),
        ));
    }

    for (field, value) in [
        ("total_amount", invoice.total_amount),
        ("subtotal_amount", invoice.subtotal_amount),
        ("tax_amount", invoice.tax_amount),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err((field, format!("must be a non-negative number, got {}", v)));
            }
        }
    }

    for (i, line) in invoice.line_items.iter().enumerate() {
        for (field, value) in [
            ("quantity", line.quantity),
            ("unit_price", line.unit_price),
            ("amount", line.amount),
        ] {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(("line_items", format!("line {} {} is not finite", i + 1, field)));
            }
        }
    }

    Ok(())
}

// Slash dates read month first; day first only when the month would be > 12.
const DATE_FORMATS: [&str; 8] = [
    "%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%m/%d/%Y", "%d/%m/%Y", "%d %B %Y", "%B %d, %Y",
    "%b %d, %Y",
];

/// Lenient invoice date parsing; unknown formats yield `None`.
pub fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = non_blank(raw)?;
    // Tolerate full timestamps
    let head = raw.split('T').next().unwrap_or(raw);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(head, fmt).ok())
}
