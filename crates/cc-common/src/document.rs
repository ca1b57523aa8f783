use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOC: &str = "application/msword";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrStatus {
    Pending,
    Completed,
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Pending => "pending",
            OcrStatus::Completed => "completed",
            OcrStatus::Failed => "failed",
        }
    }
}

/// Extraction route for an uploaded artifact, dispatched on mime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// PDFs and images go through the OCR collaborator.
    PdfOrImage,
    /// Plain text blobs are already extracted.
    PlainText,
    /// Word documents go through the DOCX extractor collaborator.
    Word,
}

impl DocumentKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime
            .split(';')
            .next()
            .unwrap_or(mime)
            .trim()
            .to_ascii_lowercase();

        if mime == MIME_PDF || mime.starts_with("image/") {
            return Some(DocumentKind::PdfOrImage);
        }
        if mime == "text/plain" {
            return Some(DocumentKind::PlainText);
        }
        if mime == MIME_DOC || mime == MIME_DOCX {
            return Some(DocumentKind::Word);
        }
        None
    }
}

/// Blob key layout the ingress path stores documents under:
/// `clinical_documents/{chart_number}/{unix_ms}_{sanitized_basename}.{ext}`.
pub fn blob_object_key(chart_number: &str, unix_ms: i64, file_name: &str) -> String {
    let (base, ext) = match file_name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => (base, Some(ext)),
        _ => (file_name, None),
    };

    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    match ext {
        Some(ext) => format!("clinical_documents/{chart_number}/{unix_ms}_{sanitized}.{ext}"),
        None => format!("clinical_documents/{chart_number}/{unix_ms}_{sanitized}"),
    }
}

/// One uploaded file belonging to a chart.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub chart_id: i64,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub blob_key: String,
    pub blob_url: String,
    pub blob_bucket: String,
    pub ocr_status: OcrStatus,
    pub ocr_text: Option<String>,
    pub ocr_ms: Option<i32>,
    pub ai_summary: Option<String>,
    pub transaction_id: Option<String>,
    pub transaction_label: Option<String>,
    pub is_group_member: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDocument {
    pub chart_id: i64,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub blob_key: String,
    pub blob_url: String,
    pub blob_bucket: String,
    pub transaction_id: Option<String>,
    pub transaction_label: Option<String>,
    pub is_group_member: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_dispatch_covers_the_closed_set() {
        assert_eq!(
            DocumentKind::from_mime("application/pdf"),
            Some(DocumentKind::PdfOrImage)
        );
        assert_eq!(
            DocumentKind::from_mime("image/png"),
            Some(DocumentKind::PdfOrImage)
        );
        assert_eq!(
            DocumentKind::from_mime("image/tiff"),
            Some(DocumentKind::PdfOrImage)
        );
        assert_eq!(
            DocumentKind::from_mime("text/plain"),
            Some(DocumentKind::PlainText)
        );
        assert_eq!(
            DocumentKind::from_mime(MIME_DOC),
            Some(DocumentKind::Word)
        );
        assert_eq!(
            DocumentKind::from_mime(MIME_DOCX),
            Some(DocumentKind::Word)
        );
        assert_eq!(DocumentKind::from_mime("application/zip"), None);
    }

    #[test]
    fn blob_keys_sanitize_basenames() {
        let key = blob_object_key("CH-1001", 1_700_000_000_000, "progress note (final).pdf");
        assert_eq!(
            key,
            "clinical_documents/CH-1001/1700000000000_progress_note__final_.pdf"
        );

        let bare = blob_object_key("CH-1001", 1, "README");
        assert_eq!(bare, "clinical_documents/CH-1001/1_README");
    }

    #[test]
    fn mime_dispatch_ignores_parameters_and_case() {
        assert_eq!(
            DocumentKind::from_mime("Text/Plain; charset=utf-8"),
            Some(DocumentKind::PlainText)
        );
        assert_eq!(
            DocumentKind::from_mime("APPLICATION/PDF"),
            Some(DocumentKind::PdfOrImage)
        );
    }
}
