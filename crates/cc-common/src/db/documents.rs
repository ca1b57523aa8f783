use deadpool_postgres::PoolError;
use tokio_postgres::Error as PgError;
use tokio_postgres::Row;
use tracing::instrument;

use crate::db::PgPool;
use crate::document::{Document, NewDocument, OcrStatus};

#[derive(Debug, thiserror::Error)]
pub enum DocumentStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map document row: {0}")]
    Mapping(String),
    #[error("not found: {0}")]
    NotFound(String),
}

fn parse_ocr_status(value: &str) -> Result<OcrStatus, DocumentStorageError> {
    match value {
        "pending" => Ok(OcrStatus::Pending),
        "completed" => Ok(OcrStatus::Completed),
        "failed" => Ok(OcrStatus::Failed),
        other => Err(DocumentStorageError::Mapping(format!(
            "unknown ocr_status: {other}"
        ))),
    }
}

fn row_to_document(row: &Row) -> Result<Document, DocumentStorageError> {
    Ok(Document {
        id: row.try_get("id")?,
        chart_id: row.try_get("chart_id")?,
        file_name: row.try_get("file_name")?,
        mime_type: row.try_get("mime_type")?,
        file_size: row.try_get("file_size")?,
        blob_key: row.try_get("blob_key")?,
        blob_url: row.try_get("blob_url")?,
        blob_bucket: row.try_get("blob_bucket")?,
        ocr_status: parse_ocr_status(row.try_get::<_, String>("ocr_status")?.as_str())?,
        ocr_text: row.try_get("ocr_text")?,
        ocr_ms: row.try_get("ocr_ms")?,
        ai_summary: row.try_get("ai_summary")?,
        transaction_id: row.try_get("transaction_id")?,
        transaction_label: row.try_get("transaction_label")?,
        is_group_member: row.try_get("is_group_member")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[instrument(skip(pool, document))]
pub async fn create(
    pool: &PgPool,
    document: &NewDocument,
) -> Result<Document, DocumentStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            "INSERT INTO cc.documents (
                chart_id, file_name, mime_type, file_size, blob_key, blob_url,
                blob_bucket, transaction_id, transaction_label, is_group_member
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *",
            &[
                &document.chart_id,
                &document.file_name,
                &document.mime_type,
                &document.file_size,
                &document.blob_key,
                &document.blob_url,
                &document.blob_bucket,
                &document.transaction_id,
                &document.transaction_label,
                &document.is_group_member,
            ],
        )
        .await?;
    row_to_document(&row)
}

/// The authoritative document set for a chart, in upload order. The worker
/// reads this at claim time so files added between enqueue and claim are
/// included in the run.
#[instrument(skip(pool))]
pub async fn list_by_chart(
    pool: &PgPool,
    chart_id: i64,
) -> Result<Vec<Document>, DocumentStorageError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            "SELECT * FROM cc.documents WHERE chart_id = $1 ORDER BY created_at, id",
            &[&chart_id],
        )
        .await?;
    rows.iter().map(row_to_document).collect()
}

#[instrument(skip(pool, text))]
pub async fn update_ocr_result(
    pool: &PgPool,
    document_id: i64,
    status: OcrStatus,
    text: Option<&str>,
    elapsed_ms: Option<i32>,
) -> Result<(), DocumentStorageError> {
    let client = pool.get().await?;
    let updated = client
        .execute(
            "UPDATE cc.documents
             SET ocr_status = $2, ocr_text = $3, ocr_ms = $4, updated_at = NOW()
             WHERE id = $1",
            &[&document_id, &status.as_str(), &text, &elapsed_ms],
        )
        .await?;

    if updated == 1 {
        Ok(())
    } else {
        Err(DocumentStorageError::NotFound(format!(
            "document {document_id} not found"
        )))
    }
}

#[instrument(skip(pool, summary))]
pub async fn update_summary(
    pool: &PgPool,
    document_id: i64,
    summary: &str,
) -> Result<(), DocumentStorageError> {
    let client = pool.get().await?;
    let updated = client
        .execute(
            "UPDATE cc.documents SET ai_summary = $2, updated_at = NOW() WHERE id = $1",
            &[&document_id, &summary],
        )
        .await?;

    if updated == 1 {
        Ok(())
    } else {
        Err(DocumentStorageError::NotFound(format!(
            "document {document_id} not found"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ocr_status_rejects_unknown() {
        assert_eq!(parse_ocr_status("pending").unwrap(), OcrStatus::Pending);
        assert_eq!(parse_ocr_status("completed").unwrap(), OcrStatus::Completed);
        assert_eq!(parse_ocr_status("failed").unwrap(), OcrStatus::Failed);
        assert!(parse_ocr_status("done").is_err());
    }
}
