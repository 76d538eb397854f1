//! Extraction prompt and model response parsing.

use serde_json::Value as JsonValue;
use tracing::warn;

use tally_core::{Error, ExtractedInvoice, Result};

/// System prompt for invoice extraction.
pub const SYSTEM_PROMPT: &str = "You extract structured invoice data from business documents. \
Respond with JSON only. Never invent values: use null for anything the document does not state.";

/// Build the user prompt for a document.
pub fn build_user_prompt(file_name: &str, text: &str, max_invoices: usize) -> String {
    format!(
        "Extract every invoice contained in the document below (at most {max}).\n\
         Return a JSON array. Each element is an object with these keys:\n\
         invoice_number, vendor_name, vendor_address, invoice_date (YYYY-MM-DD),\n\
         due_date (YYYY-MM-DD), total_amount, subtotal_amount, tax_amount, currency\n\
         (ISO 4217), bill_to_name, payment_terms, purchase_order_number,\n\
         line_items (array of {{description, quantity, unit_price, amount}}),\n\
         confidence_score (0.0 to 1.0, how certain you are about this invoice).\n\
         Amounts are plain numbers without currency symbols.\n\
         If the document contains no invoice, return [].\n\n\
         Document: {name}\n\
         ---\n\
         {text}\n\
         ---",
        max = max_invoices,
        name = file_name,
        text = text,
    )
}

/// Truncate document text to a character budget, on a char boundary.
pub fn truncate_text(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (&text[..idx], true),
        None => (text, false),
    }
}

/// Strip a surrounding Markdown code fence, if present.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening fence line
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse the model's reply into invoices.
///
/// Accepts a bare array, an object with an `invoices` array, a single invoice
/// object, or any of these wrapped in a code fence or surrounded by prose.
pub fn parse_invoices(content: &str) -> Result<Vec<ExtractedInvoice>> {
    let body = strip_code_fence(content);
    let value: JsonValue = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => serde_json::from_str(outermost_json(body).ok_or_else(|| {
            Error::Serialization(format!(
                "model response is not JSON: {}",
                preview(content)
            ))
        })?)?,
    };

    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("invoices") {
            Some(JsonValue::Array(items)) => items,
            Some(other) => {
                return Err(Error::Serialization(format!(
                    "`invoices` must be an array, got {}",
                    json_type(&other)
                )))
            }
            None => vec![JsonValue::Object(map)],
        },
        JsonValue::Null => Vec::new(),
        other => {
            return Err(Error::Serialization(format!(
                "expected a JSON array of invoices, got {}",
                json_type(&other)
            )))
        }
    };

    let mut invoices = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            warn!(
                subsystem = "extraction",
                component = "prompt",
                op = "parse_invoices",
                index = idx,
                "Skipping non-object invoice entry"
            );
            continue;
        }
        invoices.push(serde_json::from_value(normalize(item))?);
    }
    Ok(invoices)
}

/// Coerce numeric strings ("1,250.00", "$12") into numbers for amount fields.
fn normalize(mut item: JsonValue) -> JsonValue {
    const NUMERIC: [&str; 4] = [
        "total_amount",
        "subtotal_amount",
        "tax_amount",
        "confidence_score",
    ];
    if let Some(map) = item.as_object_mut() {
        for key in NUMERIC {
            coerce_number(map.get_mut(key));
        }
        if let Some(JsonValue::Array(lines)) = map.get_mut("line_items") {
            lines.retain(JsonValue::is_object);
            for line in lines.iter_mut().filter_map(JsonValue::as_object_mut) {
                for key in ["quantity", "unit_price", "amount", "total"] {
                    coerce_number(line.get_mut(key));
                }
            }
        }
        for (_, v) in map.iter_mut() {
            if v.as_str().is_some_and(|s| s.trim().is_empty()) {
                *v = JsonValue::Null;
            }
        }
        if map.get("line_items").is_some_and(|v| !v.is_array()) {
            map.remove("line_items");
        }
    }
    item
}

fn coerce_number(slot: Option<&mut JsonValue>) {
    let Some(slot) = slot else { return };
    let JsonValue::String(s) = slot else { return };
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    *slot = match cleaned.parse::<f64>() {
        Ok(n) => serde_json::Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number),
        Err(_) => JsonValue::Null,
    };
}

fn outermost_json(s: &str) -> Option<&str> {
    let start = s.find(['[', '{'])?;
    let close = if s[start..].starts_with('[') { ']' } else { '}' };
    let end = s.rfind(close)?;
    (end > start).then(|| &s[start..=end])
}

fn json_type(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn preview(s: &str) -> String {
    let (head, cut) = truncate_text(s.trim(), 120);
    if cut {
        format!("{}...", head)
    } else {
        head.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_array() {
        let invoices = parse_invoices(
            r#"[{"invoice_number":"INV-1","vendor_name":"Acme","total_amount":10.5}]"#,
        )
        .unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].invoice_number.as_deref(), Some("INV-1"));
        assert_eq!(invoices[0].total_amount, Some(10.5));
    }

    #[test]
    fn test_parse_fenced_array() {
        let content = "```json\n[{\"invoice_number\":\"INV-2\"}]\n```";
        let invoices = parse_invoices(content).unwrap();
        assert_eq!(invoices[0].invoice_number.as_deref(), Some("INV-2"));
    }

    #[test]
    fn test_parse_wrapped_object_and_prose() {
        let content = "Here you go:\n{\"invoices\": [{\"vendor_name\": \"Acme\"}, {\"vendor_name\": \"Globex\"}]}\nThanks";
        let invoices = parse_invoices(content).unwrap();
        assert_eq!(invoices.len(), 2);
        assert_eq!(invoices[1].vendor_name.as_deref(), Some("Globex"));
    }

    #[test]
    fn test_parse_single_object() {
        let invoices = parse_invoices(r#"{"invoice_number":"A-1"}"#).unwrap();
        assert_eq!(invoices.len(), 1);
    }

    #[test]
    fn test_parse_empty_array_is_no_invoice() {
        assert!(parse_invoices("[]").unwrap().is_empty());
        assert!(parse_invoices("```\n[]\n```").unwrap().is_empty());
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        let invoices = parse_invoices(
            r#"[{"invoice_number":"X","total_amount":"$1,250.00","tax_amount":"",
                "line_items":[{"description":"a","amount":"12.5"}]}]"#,
        )
        .unwrap();
        assert_eq!(invoices[0].total_amount, Some(1250.0));
        assert_eq!(invoices[0].tax_amount, None);
        assert_eq!(invoices[0].line_items[0].amount, Some(12.5));
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let err = parse_invoices("I could not find any invoice, sorry.").unwrap_err();
        assert_eq!(err.kind(), tally_core::ErrorKind::Validation);
        assert!(parse_invoices("42").is_err());
        assert!(parse_invoices(r#"{"invoices": "none"}"#).is_err());
    }

    #[test]
    fn test_truncate_text_on_char_boundary() {
        let (head, cut) = truncate_text("héllo wörld", 4);
        assert_eq!(head, "héll");
        assert!(cut);
        let (head, cut) = truncate_text("short", 100);
        assert_eq!(head, "short");
        assert!(!cut);
    }

    #[test]
    fn test_prompt_mentions_limit_and_text() {
        let prompt = build_user_prompt("inv.pdf", "TOTAL 10", 2);
        assert!(prompt.contains("at most 2"));
        assert!(prompt.contains("TOTAL 10"));
        assert!(prompt.contains("inv.pdf"));
    }
}
