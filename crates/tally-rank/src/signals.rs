//! Individual match signals.
//!
//! Each signal returns a value in `[0, 1]` and, when it contributes, a
//! human-readable reason. Signals never look at each other; weighting and
//! normalization happen in [`crate::ranker`].

use serde::Deserialize;

/// A signal's value and the reason it contributed, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMatch {
    pub value: f64,
    pub reason: Option<String>,
}

impl SignalMatch {
    fn none() -> Self {
        Self {
            value: 0.0,
            reason: None,
        }
    }

    fn hit(value: f64, reason: String) -> Self {
        Self {
            value,
            reason: Some(reason),
        }
    }
}

/// Filename tokens that suggest an invoice when no name hint is given.
pub const INVOICE_KEYWORDS: &[&str] = &["invoice", "inv", "bill", "receipt", "statement"];

/// Maximum raw score of the content plausibility signal (type 0.3 + size 0.2).
pub const CONTENT_MAX: f64 = 0.5;

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// Sender match: substring 1.0, local-part or domain 0.5.
pub fn sender(query: &str, sender_email: &str) -> SignalMatch {
    let query = normalize_sender(query);
    let sender = sender_email.trim().to_lowercase();
    if query.is_empty() || sender.is_empty() {
        return SignalMatch::none();
    }

    if sender.contains(&query) {
        return SignalMatch::hit(1.0, format!("Sender matches: {}", sender_email.trim()));
    }

    let (q_local, q_domain) = split_address(&query);
    let (s_local, s_domain) = split_address(&sender);

    if !q_domain.is_empty() && q_domain == s_domain {
        return SignalMatch::hit(0.5, format!("Sender domain matches: {}", s_domain));
    }
    if !q_local.is_empty() && q_local == s_local {
        return SignalMatch::hit(0.5, format!("Sender local part matches: {}", s_local));
    }
    SignalMatch::none()
}

fn normalize_sender(query: &str) -> String {
    let q = query.trim().to_lowercase();
    q.strip_prefix("from:").unwrap_or(&q).trim().to_string()
}

fn split_address(addr: &str) -> (&str, &str) {
    match addr.split_once('@') {
        Some((local, domain)) => (local, domain),
        None => ("", addr),
    }
}

/// Subject match: substring 1.0, any word longer than 2 chars 0.6.
pub fn subject(needle: &str, subject: &str) -> SignalMatch {
    let needle = needle.trim().to_lowercase();
    let haystack = subject.to_lowercase();
    if needle.is_empty() {
        return SignalMatch::none();
    }

    if haystack.contains(&needle) {
        return SignalMatch::hit(1.0, format!("Subject contains: {}", needle));
    }

    let shared: Vec<&str> = needle
        .split_whitespace()
        .filter(|w| w.chars().count() > 2 && haystack.contains(*w))
        .collect();
    if shared.is_empty() {
        SignalMatch::none()
    } else {
        SignalMatch::hit(0.6, format!("Subject shares words: {}", shared.join(", ")))
    }
}

#[derive(Deserialize)]
struct StructuredHint {
    filename: String,
}

/// Resolve a name hint that may be plain text or `{"filename": "..."}`.
pub fn parse_name_hint(hint: &str) -> String {
    let trimmed = hint.trim();
    if trimmed.starts_with('{') {
        if let Ok(structured) = serde_json::from_str::<StructuredHint>(trimmed) {
            return structured.filename.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Filename similarity against a hint: exact 1.0, substring 0.8, same extension 0.3.
pub fn filename_hint(hint: &str, attachment_name: &str) -> SignalMatch {
    let hint = parse_name_hint(hint).to_lowercase();
    let name = attachment_name.trim().to_lowercase();
    if hint.is_empty() || name.is_empty() {
        return SignalMatch::none();
    }

    if hint == name {
        return SignalMatch::hit(1.0, format!("Filename exact match: {}", attachment_name));
    }
    if name.contains(&hint) || hint.contains(&name) {
        return SignalMatch::hit(0.8, format!("Filename similar to hint: {}", hint));
    }
    match (extension(&hint), extension(&name)) {
        (Some(a), Some(b)) if a == b => {
            SignalMatch::hit(0.3, format!("Same file type as hint: .{}", a))
        }
        _ => SignalMatch::none(),
    }
}

/// Filename keyword signal used when no hint is given: 0.8 on an invoice token.
pub fn filename_keywords(attachment_name: &str) -> SignalMatch {
    let name = attachment_name.trim().to_lowercase();
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name.as_str(),
    };

    let found = stem
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .find_map(|token| {
            INVOICE_KEYWORDS
                .iter()
                .find(|kw| token == **kw || (kw.len() > 3 && token.starts_with(**kw)))
        });

    match found {
        Some(kw) => SignalMatch::hit(0.8, format!("Filename suggests invoice: {}", kw)),
        None => SignalMatch::none(),
    }
}

fn extension(name: &str) -> Option<&str> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
}

/// Content plausibility: type (PDF 0.3, office 0.2, image 0.1) plus size
/// (1 KB–10 MB 0.2, 100 B–50 MB 0.1). Raw value in `[0, CONTENT_MAX]`.
pub fn content(content_type: &str, attachment_name: &str, size_bytes: u64) -> (f64, Vec<String>) {
    let mut reasons = Vec::new();

    let effective = effective_content_type(content_type, attachment_name);
    let type_score = content_type_score(&effective);
    if type_score > 0.0 {
        reasons.push(format!("Content type plausible: {}", effective));
    }

    let size_score = if (KB..=10 * MB).contains(&size_bytes) {
        0.2
    } else if (100..=50 * MB).contains(&size_bytes) {
        0.1
    } else {
        0.0
    };
    if size_score > 0.0 {
        reasons.push(format!("File size plausible: {} bytes", size_bytes));
    }

    (type_score + size_score, reasons)
}

fn effective_content_type(content_type: &str, attachment_name: &str) -> String {
    let ct = content_type.trim().to_lowercase();
    if !ct.is_empty() && ct != "application/octet-stream" {
        return ct;
    }
    let ext = extension(attachment_name).map(str::to_lowercase);
    let inferred = match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("odt") => "application/vnd.oasis.opendocument.text",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => return ct,
    };
    inferred.to_string()
}

fn content_type_score(ct: &str) -> f64 {
    if ct.contains("pdf") {
        0.3
    } else if ["word", "excel", "spreadsheet", "document", "msword"]
        .iter()
        .any(|k| ct.contains(k))
    {
        0.2
    } else if ct.starts_with("image/") {
        0.1
    } else {
        0.0
    }
}
