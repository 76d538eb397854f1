//! Document text extraction ahead of the model call.
//!
//! PDFs go through `pdftotext` (poppler-utils); plain text, CSV and JSON
//! attachments are decoded as UTF-8. Anything else is rejected as a
//! validation failure so the attachment is marked failed without retries.

use std::io::Write;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use tally_core::{AttachmentDescriptor, Error, Result};

/// How an attachment's text is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Text,
}

impl DocumentKind {
    /// Classify by content type, falling back to the file extension.
    pub fn classify(descriptor: &AttachmentDescriptor) -> Option<Self> {
        let content_type = descriptor.content_type.to_ascii_lowercase();
        let content_type = content_type.split(';').next().unwrap_or_default().trim();
        match content_type {
            "application/pdf" => return Some(Self::Pdf),
            "text/csv" | "application/csv" | "application/json" => return Some(Self::Text),
            ct if ct.starts_with("text/") => return Some(Self::Text),
            _ => {}
        }

        let extension = descriptor
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())?;
        match extension.as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" | "csv" | "tsv" | "json" | "md" => Some(Self::Text),
            _ => None,
        }
    }
}

/// Text pulled out of an attachment.
#[derive(Debug, Clone)]
pub struct DocumentText {
    pub text: String,
    pub kind: DocumentKind,
    pub metadata: JsonValue,
}

/// Extract the text of an attachment.
pub async fn document_text(
    content: &[u8],
    descriptor: &AttachmentDescriptor,
    cmd_timeout: Duration,
) -> Result<DocumentText> {
    if content.is_empty() {
        return Err(Error::validation("content", "attachment is empty"));
    }

    let kind = DocumentKind::classify(descriptor).ok_or_else(|| {
        Error::validation(
            "content_type",
            format!(
                "unsupported attachment '{}' ({})",
                descriptor.file_name, descriptor.content_type
            ),
        )
    })?;

    let text = match kind {
        DocumentKind::Pdf => pdf_text(content, &descriptor.file_name, cmd_timeout).await?,
        DocumentKind::Text => String::from_utf8(content.to_vec())
            .map_err(|e| Error::validation("content", format!("not valid UTF-8: {}", e)))?,
    };

    let metadata = json!({
        "source": match kind {
            DocumentKind::Pdf => "pdftotext",
            DocumentKind::Text => "utf8",
        },
        "char_count": text.chars().count(),
        "line_count": text.lines().count(),
    });

    debug!(
        subsystem = "extraction",
        component = "document",
        op = "document_text",
        file_name = %descriptor.file_name,
        chars = text.len(),
        "Document text extracted"
    );

    Ok(DocumentText {
        text,
        kind,
        metadata,
    })
}

async fn pdf_text(data: &[u8], file_name: &str, cmd_timeout: Duration) -> Result<String> {
    if data.len() < 4 || &data[0..4] != b"%PDF" {
        return Err(Error::validation(
            "content",
            format!("'{}' is not a valid PDF (missing %PDF header)", file_name),
        ));
    }

    // pdftotext reads from a file path
    let mut tmpfile = NamedTempFile::new()?;
    tmpfile.write_all(data)?;
    let tmp_path = tmpfile.path().to_string_lossy().to_string();

    let output = tokio::time::timeout(
        cmd_timeout,
        Command::new("pdftotext")
            .arg("-layout")
            .arg(&tmp_path)
            .arg("-")
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| {
        Error::Timeout(format!(
            "pdftotext timed out after {}s",
            cmd_timeout.as_secs()
        ))
    })?
    .map_err(|e| Error::Extraction(format!("Failed to execute pdftotext: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Extraction(format!(
            "pdftotext failed (exit {}): {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether `pdftotext` is installed.
pub async fn pdftotext_available() -> bool {
    match Command::new("pdftotext").arg("-v").output().await {
        // -v exits with 0 or 99 depending on the poppler version
        Ok(output) => output.status.success() || output.status.code() == Some(99),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::ErrorKind;

    fn descriptor(name: &str, ct: &str) -> AttachmentDescriptor {
        AttachmentDescriptor {
            file_name: name.to_string(),
            content_type: ct.to_string(),
        }
    }

    #[test]
    fn test_classify_by_content_type() {
        assert_eq!(
            DocumentKind::classify(&descriptor("a.bin", "application/pdf")),
            Some(DocumentKind::Pdf)
        );
        assert_eq!(
            DocumentKind::classify(&descriptor("a", "text/csv; charset=utf-8")),
            Some(DocumentKind::Text)
        );
        assert_eq!(
            DocumentKind::classify(&descriptor("a", "text/plain")),
            Some(DocumentKind::Text)
        );
    }

    #[test]
    fn test_classify_falls_back_to_extension() {
        assert_eq!(
            DocumentKind::classify(&descriptor("Invoice.PDF", "application/octet-stream")),
            Some(DocumentKind::Pdf)
        );
        assert_eq!(
            DocumentKind::classify(&descriptor("export.csv", "")),
            Some(DocumentKind::Text)
        );
        assert_eq!(DocumentKind::classify(&descriptor("photo.jpg", "image/jpeg")), None);
        assert_eq!(DocumentKind::classify(&descriptor("noext", "")), None);
    }

    #[tokio::test]
    async fn test_text_attachment_decoded() {
        let doc = document_text(
            b"Invoice INV-1\nTotal: 10.00",
            &descriptor("inv.txt", "text/plain"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(doc.kind, DocumentKind::Text);
        assert!(doc.text.contains("INV-1"));
        assert_eq!(doc.metadata["line_count"], 2);
        assert_eq!(doc.metadata["source"], "utf8");
    }

    #[tokio::test]
    async fn test_rejections_are_validation() {
        let timeout = Duration::from_secs(5);

        let err = document_text(b"", &descriptor("a.txt", "text/plain"), timeout)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = document_text(&[0xff, 0xfe, 0x00], &descriptor("a.txt", "text/plain"), timeout)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = document_text(b"GIF89a", &descriptor("a.gif", "image/gif"), timeout)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = document_text(b"not a pdf", &descriptor("a.pdf", "application/pdf"), timeout)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
