//! Pattern-matching invoice extractor.
//!
//! Finds at most one invoice per document from labelled fields
//! (`Invoice #:`, `Date:`, `Total:`, `From:`). It needs no model server and
//! backs up [`crate::OpenAiExtractor`] through [`crate::FallbackExtractor`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info};

use tally_core::validation::coverage_confidence;
use tally_core::{AttachmentDescriptor, Error, ExtractedInvoice, Extractor, ExtractorOutput, Result};

use crate::document::document_text;

const INVOICE_KEYWORDS: [&str; 5] = ["invoice", "inv#", "bill", "amount due", "payment due"];

/// Field patterns, tried in order; the first capture wins.
struct Patterns {
    number: Vec<Regex>,
    invoice_date: Vec<Regex>,
    due_date: Regex,
    total: Regex,
    vendor: Regex,
    currency_code: Regex,
    digits: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        let re = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::Internal(format!("invoice pattern {:?}: {}", pattern, e)))
        };
        const DATE: &str = r"([0-9]{1,4}[/.-][0-9]{1,2}[/.-][0-9]{2,4})";
        Ok(Self {
            number: vec![
                re(r"(?i)\b(?:invoice|inv|bill)\s*(?:no\.?|number|#)\s*:?\s*([A-Z0-9][A-Z0-9_/-]*)")?,
                re(r"(?i)\binvoice\s*:?\s*([A-Z0-9_/-]*[0-9][A-Z0-9_/-]*)")?,
            ],
            invoice_date: vec![
                re(&format!(r"(?im)^\s*(?:invoice\s+)?date\s*:?\s*{}", DATE))?,
                re(&format!(r"(?i)\binvoice\s+date\s*:?\s*{}", DATE))?,
            ],
            due_date: re(&format!(r"(?i)\bdue\s+date\s*:?\s*{}", DATE))?,
            total: re(
                r"(?i)\b(?:total(?:\s+due)?|amount\s+due|balance\s+due)\s*:?\s*(?:[A-Z]{3}\s*)?[$€£¥]?\s*([0-9][0-9,]*(?:\.[0-9]{1,2})?)",
            )?,
            vendor: re(
                r"(?im)^\s*(?:from|vendor|supplier|bill\s+from)\s*:\s*([A-Za-z0-9][A-Za-z0-9 &.,'-]{1,80}?)\s*$",
            )?,
            currency_code: re(r"\b(USD|EUR|GBP|JPY|CAD|AUD|CHF)\b")?,
            digits: re(r"[0-9]")?,
        })
    }

    fn first(regexes: &[Regex], text: &str) -> Option<String> {
        regexes.iter().find_map(|re| capture(re, text))
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn symbol_currency(text: &str) -> Option<&'static str> {
    [('$', "USD"), ('€', "EUR"), ('£', "GBP"), ('¥', "JPY")]
        .into_iter()
        .find(|(symbol, _)| text.contains(*symbol))
        .map(|(_, code)| code)
}

/// Regex-based [`Extractor`] working on the document text.
pub struct PatternExtractor {
    patterns: Patterns,
    cmd_timeout: Duration,
}

impl PatternExtractor {
    pub fn new(cmd_timeout: Duration) -> Result<Self> {
        Ok(Self {
            patterns: Patterns::compile()?,
            cmd_timeout,
        })
    }

    /// Pull the labelled fields out of `text`. `None` when the text does not
    /// look like an invoice or names neither a number nor a vendor.
    pub fn scan(&self, text: &str) -> Option<ExtractedInvoice> {
        let lower = text.to_lowercase();
        if !INVOICE_KEYWORDS.iter().any(|k| lower.contains(k)) {
            return None;
        }

        let p = &self.patterns;
        let mut invoice = ExtractedInvoice {
            invoice_number: Patterns::first(&p.number, text),
            vendor_name: capture(&p.vendor, text),
            invoice_date: Patterns::first(&p.invoice_date, text),
            due_date: capture(&p.due_date, text),
            total_amount: capture(&p.total, text).and_then(|t| t.replace(',', "").parse().ok()),
            currency: capture(&p.currency_code, text)
                .or_else(|| symbol_currency(text).map(String::from)),
            ..Default::default()
        };
        if invoice.invoice_number.is_none() && invoice.vendor_name.is_none() {
            return None;
        }

        let has_amounts = p.digits.is_match(text);
        let has_currency = invoice.currency.is_some();
        invoice.confidence_score = Some(coverage_confidence(&invoice, has_amounts, has_currency));
        Some(invoice)
    }
}

#[async_trait]
impl Extractor for PatternExtractor {
    fn method(&self) -> String {
        "pattern:v1".to_string()
    }

    async fn extract(
        &self,
        content: Bytes,
        descriptor: &AttachmentDescriptor,
        max_invoices: usize,
    ) -> Result<ExtractorOutput> {
        let start = Instant::now();
        let document = document_text(&content, descriptor, self.cmd_timeout).await?;
        if document.text.trim().is_empty() {
            return Err(Error::validation(
                "content",
                format!("'{}' has no extractable text", descriptor.file_name),
            ));
        }

        let invoices: Vec<ExtractedInvoice> = self
            .scan(&document.text)
            .into_iter()
            .take(max_invoices)
            .collect();
        if invoices.is_empty() {
            debug!(
                subsystem = "extraction",
                component = "pattern",
                op = "extract",
                file_name = %descriptor.file_name,
                "No labelled invoice fields found"
            );
        }

        info!(
            subsystem = "extraction",
            component = "pattern",
            op = "extract",
            file_name = %descriptor.file_name,
            invoices = invoices.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Pattern extraction complete"
        );

        Ok(ExtractorOutput {
            invoices,
            method: self.method(),
            metadata: json!({
                "document": document.metadata,
                "characters": document.text.chars().count(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVOICE_TEXT: &str = "ACME SUPPLIES LTD\n\
        From: Acme Supplies Ltd\n\
        Invoice #: INV-2024-001\n\
        Date: 2024-03-01\n\
        Due Date: 2024-03-31\n\
        Subtotal: $1,150.00\n\
        Total: $1,250.00\n";

    fn extractor() -> PatternExtractor {
        PatternExtractor::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_scan_labelled_invoice() {
        let invoice = extractor().scan(INVOICE_TEXT).unwrap();
        assert_eq!(invoice.invoice_number.as_deref(), Some("INV-2024-001"));
        assert_eq!(invoice.vendor_name.as_deref(), Some("Acme Supplies Ltd"));
        assert_eq!(invoice.invoice_date.as_deref(), Some("2024-03-01"));
        assert_eq!(invoice.due_date.as_deref(), Some("2024-03-31"));
        assert_eq!(invoice.total_amount, Some(1250.0));
        assert_eq!(invoice.currency.as_deref(), Some("USD"));
        assert_eq!(invoice.confidence_score, Some(1.0));
    }

    #[test]
    fn test_partial_invoice_scores_lower() {
        let invoice = extractor()
            .scan("Invoice number: 7781\nplease pay soon")
            .unwrap();
        assert_eq!(invoice.invoice_number.as_deref(), Some("7781"));
        assert!(invoice.total_amount.is_none());
        // base + one key field + digits
        assert_eq!(invoice.confidence_score, Some(0.45));
    }

    #[test]
    fn test_non_invoice_text_yields_nothing() {
        assert!(extractor().scan("Team lunch on Friday at 12:30").is_none());
        assert!(extractor().scan("Your invoice will follow").is_none());
    }

    #[test]
    fn test_currency_code_preferred_over_symbol() {
        let invoice = extractor()
            .scan("Invoice #: A-1\nTotal: EUR 99.50")
            .unwrap();
        assert_eq!(invoice.currency.as_deref(), Some("EUR"));
        assert_eq!(invoice.total_amount, Some(99.5));
    }

    #[tokio::test]
    async fn test_extract_text_attachment() {
        let descriptor = AttachmentDescriptor {
            file_name: "invoice.txt".to_string(),
            content_type: "text/plain".to_string(),
        };
        let output = extractor()
            .extract(Bytes::from_static(INVOICE_TEXT.as_bytes()), &descriptor, 2)
            .await
            .unwrap();
        assert_eq!(output.method, "pattern:v1");
        assert_eq!(output.invoices.len(), 1);
    }
}
