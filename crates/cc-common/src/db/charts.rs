use deadpool_postgres::PoolError;
use serde_json::Value;
use tokio_postgres::Error as PgError;
use tokio_postgres::Row;
use tokio_postgres::Transaction;
use tracing::instrument;

use crate::chart::{original_codes_snapshot, AiStatus, Chart, NewChart, ReviewStatus};
use crate::db::PgPool;
use crate::notify::{ChartStatusEvent, CHART_STATUS_CHANNEL};

#[derive(Debug, thiserror::Error)]
pub enum ChartStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map chart row: {0}")]
    Mapping(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

fn parse_ai_status(value: &str) -> Result<AiStatus, ChartStorageError> {
    match value {
        "queued" => Ok(AiStatus::Queued),
        "processing" => Ok(AiStatus::Processing),
        "ready" => Ok(AiStatus::Ready),
        "retry_pending" => Ok(AiStatus::RetryPending),
        "failed" => Ok(AiStatus::Failed),
        "submitted" => Ok(AiStatus::Submitted),
        other => Err(ChartStorageError::Mapping(format!(
            "unknown ai_status: {other}"
        ))),
    }
}

fn parse_review_status(value: &str) -> Result<ReviewStatus, ChartStorageError> {
    match value {
        "pending" => Ok(ReviewStatus::Pending),
        "in_review" => Ok(ReviewStatus::InReview),
        "submitted" => Ok(ReviewStatus::Submitted),
        "rejected" => Ok(ReviewStatus::Rejected),
        other => Err(ChartStorageError::Mapping(format!(
            "unknown review_status: {other}"
        ))),
    }
}

fn row_to_chart(row: &Row) -> Result<Chart, ChartStorageError> {
    Ok(Chart {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        chart_number: row.try_get("chart_number")?,
        patient_name: row.try_get("patient_name")?,
        facility: row.try_get("facility")?,
        specialty: row.try_get("specialty")?,
        provider: row.try_get("provider")?,
        encounter_date: row.try_get("encounter_date")?,
        document_count: row.try_get("document_count")?,
        ai_status: parse_ai_status(row.try_get::<_, String>("ai_status")?.as_str())?,
        review_status: parse_review_status(row.try_get::<_, String>("review_status")?.as_str())?,
        ai_codes: row.try_get("ai_codes")?,
        original_ai_codes: row.try_get("original_ai_codes")?,
        user_modifications: row.try_get("user_modifications")?,
        final_codes: row.try_get("final_codes")?,
        sla: row.try_get("sla")?,
        last_error: row.try_get("last_error")?,
        last_error_at: row.try_get("last_error_at")?,
        retry_count: row.try_get("retry_count")?,
        processing_started_at: row.try_get("processing_started_at")?,
        processing_completed_at: row.try_get("processing_completed_at")?,
        submitted_at: row.try_get("submitted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Emit the chart transition inside the transaction that records it.
async fn notify_chart(
    tx: &Transaction<'_>,
    session_id: &str,
    ai_status: &str,
) -> Result<(), ChartStorageError> {
    let event = ChartStatusEvent::new(session_id, ai_status);
    let payload =
        serde_json::to_string(&event).map_err(|e| ChartStorageError::Mapping(e.to_string()))?;
    tx.execute(
        "SELECT pg_notify($1, $2)",
        &[&CHART_STATUS_CHANNEL, &payload],
    )
    .await?;
    Ok(())
}

/// Upsert a chart by its upload-session key. A repeat upload into an existing
/// session adds its document count and refreshes metadata; a chart that is
/// already `ready` or `submitted` keeps its status, anything else goes back
/// to `queued` so the new batch is picked up.
#[instrument(skip(pool, chart))]
pub async fn create_queued(pool: &PgPool, chart: &NewChart) -> Result<Chart, ChartStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_one(
            "INSERT INTO cc.charts (
                session_id, chart_number, patient_name, facility, specialty,
                provider, encounter_date, document_count, ai_status, review_status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued', 'pending')
            ON CONFLICT (session_id) DO UPDATE SET
                patient_name = COALESCE(EXCLUDED.patient_name, cc.charts.patient_name),
                facility = COALESCE(EXCLUDED.facility, cc.charts.facility),
                specialty = COALESCE(EXCLUDED.specialty, cc.charts.specialty),
                provider = COALESCE(EXCLUDED.provider, cc.charts.provider),
                encounter_date = COALESCE(EXCLUDED.encounter_date, cc.charts.encounter_date),
                document_count = cc.charts.document_count + EXCLUDED.document_count,
                ai_status = CASE
                    WHEN cc.charts.ai_status IN ('ready', 'submitted') THEN cc.charts.ai_status
                    ELSE 'queued'
                END,
                updated_at = NOW()
            RETURNING *",
            &[
                &chart.session_id,
                &chart.chart_number,
                &chart.patient_name,
                &chart.facility,
                &chart.specialty,
                &chart.provider,
                &chart.encounter_date,
                &chart.document_count,
            ],
        )
        .await?;

    let chart = row_to_chart(&row)?;
    notify_chart(&tx, &chart.session_id, chart.ai_status.as_str()).await?;
    tx.commit().await?;

    Ok(chart)
}

#[instrument(skip(pool))]
pub async fn mark_processing(pool: &PgPool, chart_number: &str) -> Result<(), ChartStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            "UPDATE cc.charts
             SET ai_status = 'processing', processing_started_at = NOW(), updated_at = NOW()
             WHERE chart_number = $1
             RETURNING session_id",
            &[&chart_number],
        )
        .await?
        .ok_or_else(|| {
            ChartStorageError::NotFound(format!("chart {chart_number} not found"))
        })?;

    let session_id: String = row.get("session_id");
    notify_chart(&tx, &session_id, AiStatus::Processing.as_str()).await?;
    tx.commit().await?;

    Ok(())
}

/// Persist a successful coding generation: payload, the once-only snapshot of
/// its code categories, SLA data, and the transition to `ready`. Refused once
/// the chart's review was submitted.
#[instrument(skip(pool, payload, sla))]
pub async fn store_results(
    pool: &PgPool,
    chart_number: &str,
    payload: &Value,
    sla: Option<&Value>,
) -> Result<(), ChartStorageError> {
    let snapshot = original_codes_snapshot(payload);

    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            "UPDATE cc.charts
             SET ai_codes = $2,
                 original_ai_codes = COALESCE(original_ai_codes, $3),
                 sla = $4,
                 ai_status = 'ready',
                 processing_completed_at = NOW(),
                 last_error = NULL,
                 last_error_at = NULL,
                 retry_count = 0,
                 updated_at = NOW()
             WHERE chart_number = $1 AND review_status <> 'submitted'
             RETURNING session_id",
            &[&chart_number, &payload, &snapshot, &sla],
        )
        .await?;

    if let Some(row) = row {
        let session_id: String = row.get("session_id");
        notify_chart(&tx, &session_id, AiStatus::Ready.as_str()).await?;
        tx.commit().await?;
        return Ok(());
    }
    tx.commit().await?;

    let status_row = client
        .query_opt(
            "SELECT review_status FROM cc.charts WHERE chart_number = $1",
            &[&chart_number],
        )
        .await?;

    match status_row {
        None => Err(ChartStorageError::NotFound(format!(
            "chart {chart_number} not found"
        ))),
        Some(_) => Err(ChartStorageError::Conflict(format!(
            "chart {chart_number} is submitted; AI fields are frozen"
        ))),
    }
}

/// Record a failed generation and move the chart to `retry_pending` or
/// `failed` per the queue's decision.
#[instrument(skip(pool, error))]
pub async fn record_error(
    pool: &PgPool,
    chart_number: &str,
    error: &str,
    will_retry: bool,
    attempts: i32,
) -> Result<(), ChartStorageError> {
    let ai_status = if will_retry {
        AiStatus::RetryPending
    } else {
        AiStatus::Failed
    };

    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            "UPDATE cc.charts
             SET ai_status = $2,
                 last_error = $3,
                 last_error_at = NOW(),
                 retry_count = $4,
                 updated_at = NOW()
             WHERE chart_number = $1
             RETURNING session_id",
            &[&chart_number, &ai_status.as_str(), &error, &attempts],
        )
        .await?
        .ok_or_else(|| {
            ChartStorageError::NotFound(format!("chart {chart_number} not found"))
        })?;

    let session_id: String = row.get("session_id");
    notify_chart(&tx, &session_id, ai_status.as_str()).await?;
    tx.commit().await?;

    Ok(())
}

/// Admin-initiated return to `queued`, only from `failed` or `retry_pending`.
/// Clears the error history and the original-codes snapshot so the next
/// successful generation re-takes it.
#[instrument(skip(pool))]
pub async fn reset_for_retry(pool: &PgPool, chart_number: &str) -> Result<(), ChartStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            "UPDATE cc.charts
             SET ai_status = 'queued',
                 last_error = NULL,
                 last_error_at = NULL,
                 retry_count = 0,
                 original_ai_codes = NULL,
                 updated_at = NOW()
             WHERE chart_number = $1 AND ai_status IN ('failed', 'retry_pending')
             RETURNING session_id",
            &[&chart_number],
        )
        .await?;

    if let Some(row) = row {
        let session_id: String = row.get("session_id");
        notify_chart(&tx, &session_id, AiStatus::Queued.as_str()).await?;
        tx.commit().await?;
        return Ok(());
    }
    tx.commit().await?;

    let status_row = client
        .query_opt(
            "SELECT ai_status FROM cc.charts WHERE chart_number = $1",
            &[&chart_number],
        )
        .await?;

    match status_row {
        None => Err(ChartStorageError::NotFound(format!(
            "chart {chart_number} not found"
        ))),
        Some(row) => {
            let status: String = row.get("ai_status");
            Err(ChartStorageError::Conflict(format!(
                "chart {chart_number} is {status} and cannot be reset"
            )))
        }
    }
}

#[instrument(skip(pool, modifications))]
pub async fn save_user_modifications(
    pool: &PgPool,
    chart_number: &str,
    modifications: &Value,
) -> Result<(), ChartStorageError> {
    let client = pool.get().await?;
    let updated = client
        .execute(
            "UPDATE cc.charts SET user_modifications = $2, updated_at = NOW()
             WHERE chart_number = $1",
            &[&chart_number, &modifications],
        )
        .await?;

    if updated == 1 {
        Ok(())
    } else {
        Err(ChartStorageError::NotFound(format!(
            "chart {chart_number} not found"
        )))
    }
}

/// Submit the reviewer's final codes. Submitting freezes the AI payload
/// fields; repeat submissions are rejected.
#[instrument(skip(pool, final_codes))]
pub async fn submit_final_codes(
    pool: &PgPool,
    chart_number: &str,
    final_codes: &Value,
) -> Result<(), ChartStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            "UPDATE cc.charts
             SET final_codes = $2,
                 review_status = 'submitted',
                 ai_status = 'submitted',
                 submitted_at = NOW(),
                 updated_at = NOW()
             WHERE chart_number = $1 AND review_status <> 'submitted'
             RETURNING session_id",
            &[&chart_number, &final_codes],
        )
        .await?;

    if let Some(row) = row {
        let session_id: String = row.get("session_id");
        notify_chart(&tx, &session_id, AiStatus::Submitted.as_str()).await?;
        tx.commit().await?;
        return Ok(());
    }
    tx.commit().await?;

    let exists: bool = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM cc.charts WHERE chart_number = $1)",
            &[&chart_number],
        )
        .await?
        .get(0);

    if exists {
        Err(ChartStorageError::Conflict(format!(
            "chart {chart_number} was already submitted"
        )))
    } else {
        Err(ChartStorageError::NotFound(format!(
            "chart {chart_number} not found"
        )))
    }
}

/// Review-side status write. Moving to `submitted` must go through
/// `submit_final_codes` so a chart can never be submitted without codes.
#[instrument(skip(pool))]
pub async fn update_review_status(
    pool: &PgPool,
    chart_number: &str,
    review_status: ReviewStatus,
) -> Result<(), ChartStorageError> {
    if review_status == ReviewStatus::Submitted {
        return Err(ChartStorageError::Conflict(
            "use submit_final_codes to submit a chart".into(),
        ));
    }

    let client = pool.get().await?;
    let updated = client
        .execute(
            "UPDATE cc.charts SET review_status = $2, updated_at = NOW()
             WHERE chart_number = $1",
            &[&chart_number, &review_status.as_str()],
        )
        .await?;

    if updated == 1 {
        Ok(())
    } else {
        Err(ChartStorageError::NotFound(format!(
            "chart {chart_number} not found"
        )))
    }
}

#[instrument(skip(pool))]
pub async fn get_chart(
    pool: &PgPool,
    chart_number: &str,
) -> Result<Option<Chart>, ChartStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT * FROM cc.charts WHERE chart_number = $1",
            &[&chart_number],
        )
        .await?;
    row.map(|r| row_to_chart(&r)).transpose()
}

#[instrument(skip(pool))]
pub async fn get_chart_by_session(
    pool: &PgPool,
    session_id: &str,
) -> Result<Option<Chart>, ChartStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT * FROM cc.charts WHERE session_id = $1",
            &[&session_id],
        )
        .await?;
    row.map(|r| row_to_chart(&r)).transpose()
}

/// Delete a chart; documents cascade with it.
#[instrument(skip(pool))]
pub async fn delete_chart(pool: &PgPool, chart_number: &str) -> Result<u64, ChartStorageError> {
    let client = pool.get().await?;
    let deleted = client
        .execute(
            "DELETE FROM cc.charts WHERE chart_number = $1",
            &[&chart_number],
        )
        .await?;
    Ok(deleted)
}
