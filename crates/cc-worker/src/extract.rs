use std::env;
use std::path::PathBuf;
use std::time::Instant;

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use cc_common::document::{Document, DocumentKind};

use crate::blob::{self, DEFAULT_BLOB_TIMEOUT_SECS};

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub ocr_url: String,
    pub word_extractor_url: String,
    pub blob_timeout_secs: u64,
}

impl ExtractorConfig {
    pub fn from_env() -> Self {
        Self {
            ocr_url: env::var("OCR_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8100/ocr".into()),
            word_extractor_url: env::var("WORD_EXTRACTOR_URL")
                .unwrap_or_else(|_| "http://localhost:8100/extract-docx".into()),
            blob_timeout_secs: env::var("CC_BLOB_TIMEOUT_SECS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(DEFAULT_BLOB_TIMEOUT_SECS),
        }
    }
}

/// Successful per-document extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub document_id: i64,
    pub file_name: String,
    pub text: String,
    pub elapsed_ms: i32,
}

#[derive(Debug, Deserialize)]
struct ExtractorResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Extract the text of one document, dispatching on its mime type. Errors are
/// returned as strings so the caller can record them per document without
/// failing the whole job.
pub async fn extract_document(
    client: &Client,
    config: &ExtractorConfig,
    document: &Document,
) -> Result<Extraction, String> {
    let Some(kind) = DocumentKind::from_mime(&document.mime_type) else {
        return Err(format!("unsupported mime type: {}", document.mime_type));
    };

    let started = Instant::now();
    let bytes = blob::fetch(client, &document.blob_url, config.blob_timeout_secs).await?;

    let text = match kind {
        DocumentKind::PdfOrImage => {
            post_through_temp_file(client, &config.ocr_url, "pdf", document, bytes).await?
        }
        DocumentKind::PlainText => String::from_utf8_lossy(&bytes).into_owned(),
        DocumentKind::Word => {
            post_through_temp_file(client, &config.word_extractor_url, "file", document, bytes)
                .await?
        }
    };

    if text.trim().is_empty() {
        return Err(format!("no text extracted from {}", document.file_name));
    }

    let elapsed_ms = i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);
    debug!(
        document_id = document.id,
        file_name = %document.file_name,
        elapsed_ms,
        chars = text.len(),
        "extracted document text"
    );

    Ok(Extraction {
        document_id: document.id,
        file_name: document.file_name.clone(),
        text,
        elapsed_ms,
    })
}

/// Spool the blob to a temp file, post it as a multipart form, then delete the
/// temp file whether or not the call succeeded.
async fn post_through_temp_file(
    client: &Client,
    url: &str,
    field: &'static str,
    document: &Document,
    bytes: Vec<u8>,
) -> Result<String, String> {
    let path = temp_path(document.id);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|err| format!("failed to spool blob to temp file: {err}"))?;

    let result = post_file(client, url, field, document, &path).await;

    if let Err(err) = tokio::fs::remove_file(&path).await {
        warn!(path = %path.display(), error = %err, "failed to delete temp file");
    }

    result
}

async fn post_file(
    client: &Client,
    url: &str,
    field: &'static str,
    document: &Document,
    path: &PathBuf,
) -> Result<String, String> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|err| format!("failed to read temp file: {err}"))?;

    let part = Part::bytes(contents)
        .file_name(document.file_name.clone())
        .mime_str(&document.mime_type)
        .map_err(|err| format!("invalid mime type for upload: {err}"))?;

    let response = client
        .post(url)
        .multipart(Form::new().part(field, part))
        .send()
        .await
        .map_err(|err| format!("extractor request failed: {err}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("extractor returned status {status}: {body}"));
    }

    let parsed: ExtractorResponse = response
        .json()
        .await
        .map_err(|err| format!("invalid extractor response: {err}"))?;

    if let Some(error) = parsed.error {
        return Err(format!("extractor error: {error}"));
    }

    parsed
        .text
        .ok_or_else(|| "extractor returned no text".to_string())
}

fn temp_path(document_id: i64) -> PathBuf {
    std::env::temp_dir().join(format!("cc-extract-{document_id}-{}", Uuid::new_v4()))
}
