use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::PoolError;
use serde_json::Value;
use tokio_postgres::Error as PgError;
use tokio_postgres::Row;
use tokio_postgres::Transaction;
use tracing::instrument;
use uuid::Uuid;

use crate::api::{JobStatusView, QueueStats};
use crate::db::PgPool;
use crate::notify::{ChartStatusEvent, JobStatusEvent, CHART_STATUS_CHANNEL, JOB_STATUS_CHANNEL};
use crate::queue::{
    retry_delay, FailOutcome, JobStatus, QueueJob, STUCK_RELEASE_RETRY_SECONDS,
};

#[derive(Debug, thiserror::Error)]
pub enum QueueStorageError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("postgres error: {0}")]
    Postgres(#[from] PgError),
    #[error("failed to map queue row: {0}")]
    Mapping(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

fn parse_status(value: &str) -> Result<JobStatus, QueueStorageError> {
    match value {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(QueueStorageError::Mapping(format!(
            "unknown job status: {other}"
        ))),
    }
}

fn row_to_job(row: &Row) -> Result<QueueJob, QueueStorageError> {
    Ok(QueueJob {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        chart_id: row.try_get("chart_id")?,
        chart_number: row.try_get("chart_number")?,
        status: parse_status(row.try_get::<_, String>("status")?.as_str())?,
        job_data: row.try_get("job_data")?,
        worker_id: row.try_get("worker_id")?,
        locked_at: row.try_get("locked_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        error_message: row.try_get("error_message")?,
        retry_after: row.try_get("retry_after")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Emit a job event inside the transaction that records the state change, so
/// a committed transition always implies a delivery attempt.
async fn notify_job(
    tx: &Transaction<'_>,
    event: &JobStatusEvent,
) -> Result<(), QueueStorageError> {
    let payload =
        serde_json::to_string(event).map_err(|e| QueueStorageError::Mapping(e.to_string()))?;
    tx.execute(
        "SELECT pg_notify($1, $2)",
        &[&JOB_STATUS_CHANNEL, &payload],
    )
    .await?;
    Ok(())
}

/// Insert a new pending job for a chart. Idempotency across upload batches is
/// the ingress path's responsibility via the chart's `session_id`.
#[instrument(skip(pool, job_data))]
pub async fn enqueue(
    pool: &PgPool,
    chart_id: i64,
    chart_number: &str,
    job_data: &Value,
) -> Result<Uuid, QueueStorageError> {
    let mut client = pool.get().await?;
    let job_id = Uuid::new_v4();

    let tx = client.transaction().await?;
    tx.execute(
        "INSERT INTO cc.processing_queue (job_id, chart_id, chart_number, status, job_data)
         VALUES ($1, $2, $3, 'pending', $4)",
        &[&job_id, &chart_id, &chart_number, &job_data],
    )
    .await?;
    notify_job(
        &tx,
        &JobStatusEvent::new(job_id, "pending", Some("enqueue"), None),
    )
    .await?;
    tx.commit().await?;

    Ok(job_id)
}

/// Atomically claim the single highest-priority claimable row: pending rows
/// strictly before retryable failures, oldest `created_at` first within each
/// class. The subselect uses `FOR UPDATE SKIP LOCKED` so competing workers
/// never double-claim.
#[instrument(skip(pool))]
pub async fn claim_next(
    pool: &PgPool,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<QueueJob>, QueueStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            "UPDATE cc.processing_queue
             SET status = 'processing',
                 worker_id = $1,
                 locked_at = $2,
                 started_at = COALESCE(started_at, $2),
                 attempts = attempts + 1,
                 retry_after = NULL,
                 updated_at = $2
             WHERE id = (
                 SELECT id FROM cc.processing_queue
                 WHERE status = 'pending'
                    OR (status = 'failed'
                        AND attempts < max_attempts
                        AND (retry_after IS NULL OR retry_after <= $2))
                 ORDER BY (status <> 'pending'), created_at, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
            &[&worker_id, &now],
        )
        .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(None);
    };

    let job = row_to_job(&row)?;
    notify_job(
        &tx,
        &JobStatusEvent::new(job.job_id, "processing", Some("claim"), None),
    )
    .await?;
    tx.commit().await?;

    Ok(Some(job))
}

/// Mark a job done. Completing an already-completed job is a no-op success.
#[instrument(skip(pool))]
pub async fn complete(pool: &PgPool, job_id: Uuid) -> Result<(), QueueStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let updated = tx
        .execute(
            "UPDATE cc.processing_queue
             SET status = 'completed',
                 completed_at = NOW(),
                 worker_id = NULL,
                 locked_at = NULL,
                 error_message = NULL,
                 retry_after = NULL,
                 updated_at = NOW()
             WHERE job_id = $1 AND status <> 'completed'",
            &[&job_id],
        )
        .await?;

    if updated == 1 {
        notify_job(
            &tx,
            &JobStatusEvent::new(job_id, "completed", None, None),
        )
        .await?;
        tx.commit().await?;
        return Ok(());
    }
    tx.commit().await?;

    let exists: bool = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM cc.processing_queue WHERE job_id = $1)",
            &[&job_id],
        )
        .await?
        .get(0);

    if exists {
        Ok(())
    } else {
        Err(QueueStorageError::NotFound(format!("job {job_id} not found")))
    }
}

/// Record a failed attempt and schedule the retry per the backoff table.
/// Returns the decision metadata so the worker can drive the chart status.
#[instrument(skip(pool, error))]
pub async fn fail(
    pool: &PgPool,
    job_id: Uuid,
    error: &str,
) -> Result<FailOutcome, QueueStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let row = tx
        .query_opt(
            "SELECT status, attempts, max_attempts FROM cc.processing_queue
             WHERE job_id = $1 FOR UPDATE",
            &[&job_id],
        )
        .await?
        .ok_or_else(|| QueueStorageError::NotFound(format!("job {job_id} not found")))?;

    let status: String = row.get("status");
    if status == "completed" {
        return Err(QueueStorageError::Conflict(format!(
            "job {job_id} is completed and cannot be failed"
        )));
    }

    let attempts: i32 = row.get("attempts");
    let max_attempts: i32 = row.get("max_attempts");
    let will_retry = attempts < max_attempts;
    let now = Utc::now();
    let retry_after = will_retry.then(|| now + retry_delay(attempts - 1));

    tx.execute(
        "UPDATE cc.processing_queue
         SET status = 'failed',
             error_message = $2,
             worker_id = NULL,
             locked_at = NULL,
             retry_after = $3,
             updated_at = $4
         WHERE job_id = $1",
        &[&job_id, &error, &retry_after, &now],
    )
    .await?;

    notify_job(
        &tx,
        &JobStatusEvent::new(job_id, "failed", None, Some(error)),
    )
    .await?;
    tx.commit().await?;

    Ok(FailOutcome {
        attempts,
        max_attempts,
        will_retry,
        retry_after,
        is_permanently_failed: !will_retry,
    })
}

/// Convert leases older than `stuck_minutes` into retryable failures, due
/// again after a short fixed delay. Run at worker startup and periodically.
#[instrument(skip(pool))]
pub async fn release_stuck(pool: &PgPool, stuck_minutes: i64) -> Result<u64, QueueStorageError> {
    let mut client = pool.get().await?;
    let now = Utc::now();
    let cutoff = now - Duration::minutes(stuck_minutes);
    let retry_at = now + Duration::seconds(STUCK_RELEASE_RETRY_SECONDS);

    let tx = client.transaction().await?;
    let rows = tx
        .query(
            "UPDATE cc.processing_queue
             SET status = 'failed',
                 error_message = 'released stuck lease held by ' || COALESCE(worker_id, 'unknown'),
                 worker_id = NULL,
                 locked_at = NULL,
                 retry_after = $1,
                 updated_at = $2
             WHERE status = 'processing' AND locked_at < $3
             RETURNING job_id",
            &[&retry_at, &now, &cutoff],
        )
        .await?;

    for row in &rows {
        let job_id: Uuid = row.get("job_id");
        notify_job(
            &tx,
            &JobStatusEvent::new(job_id, "failed", Some("stuck_release"), None),
        )
        .await?;
    }
    tx.commit().await?;

    Ok(rows.len() as u64)
}

/// Administrative reset back to the front of the retryable class. Only valid
/// from `failed`.
#[instrument(skip(pool))]
pub async fn retry(pool: &PgPool, job_id: Uuid) -> Result<(), QueueStorageError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let updated = tx
        .execute(
            "UPDATE cc.processing_queue
             SET status = 'pending',
                 attempts = 0,
                 worker_id = NULL,
                 locked_at = NULL,
                 error_message = NULL,
                 retry_after = NULL,
                 updated_at = NOW()
             WHERE job_id = $1 AND status = 'failed'",
            &[&job_id],
        )
        .await?;

    if updated == 1 {
        notify_job(
            &tx,
            &JobStatusEvent::new(job_id, "pending", Some("admin_retry"), None),
        )
        .await?;
        tx.commit().await?;
        return Ok(());
    }
    tx.commit().await?;

    let status_row = client
        .query_opt(
            "SELECT status FROM cc.processing_queue WHERE job_id = $1",
            &[&job_id],
        )
        .await?;

    match status_row {
        None => Err(QueueStorageError::NotFound(format!("job {job_id} not found"))),
        Some(row) => {
            let status: String = row.get("status");
            Err(QueueStorageError::Conflict(format!(
                "job {job_id} is {status} and cannot be retried"
            )))
        }
    }
}

#[instrument(skip(pool))]
pub async fn get_stats(pool: &PgPool) -> Result<QueueStats, QueueStorageError> {
    let client = pool.get().await?;

    let row = client
        .query_one(
            "SELECT \
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,\
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,\
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,\
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,\
                COUNT(*) FILTER (\
                    WHERE status = 'failed' AND attempts >= max_attempts\
                ) AS permanently_failed,\
                COUNT(*) FILTER (\
                    WHERE status = 'failed'\
                      AND attempts < max_attempts\
                      AND retry_after > NOW()\
                ) AS waiting_for_retry,\
                COUNT(*) FILTER (\
                    WHERE status = 'processing'\
                      AND locked_at <= NOW() - INTERVAL '10 minutes'\
                ) AS stale_processing,\
                EXTRACT(EPOCH FROM (\
                    NOW() - MIN(created_at) FILTER (WHERE status = 'pending')\
                ))::BIGINT AS oldest_pending_age_seconds,\
                COALESCE(MAX(updated_at), NOW()) AS updated_at\
            FROM cc.processing_queue",
            &[],
        )
        .await?;

    Ok(QueueStats {
        pending: row.get("pending"),
        processing: row.get("processing"),
        completed: row.get("completed"),
        failed: row.get("failed"),
        permanently_failed: row.get("permanently_failed"),
        waiting_for_retry: row.get("waiting_for_retry"),
        stale_processing: row.get("stale_processing"),
        oldest_pending_age_seconds: row.get("oldest_pending_age_seconds"),
        updated_at: row.get("updated_at"),
    })
}

#[instrument(skip(pool))]
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<QueueJob>, QueueStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT * FROM cc.processing_queue WHERE job_id = $1",
            &[&job_id],
        )
        .await?;
    row.map(|r| row_to_job(&r)).transpose()
}

#[instrument(skip(pool))]
pub async fn jobs_by_chart(
    pool: &PgPool,
    chart_number: &str,
) -> Result<Vec<QueueJob>, QueueStorageError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            "SELECT * FROM cc.processing_queue
             WHERE chart_number = $1
             ORDER BY created_at DESC, id DESC",
            &[&chart_number],
        )
        .await?;
    rows.iter().map(row_to_job).collect()
}

/// Latest job for a chart with the operator-facing effective status.
#[instrument(skip(pool))]
pub async fn get_job_status(
    pool: &PgPool,
    chart_number: &str,
) -> Result<Option<JobStatusView>, QueueStorageError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT * FROM cc.processing_queue
             WHERE chart_number = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            &[&chart_number],
        )
        .await?;

    row.map(|r| row_to_job(&r))
        .transpose()
        .map(|job| job.map(|job| JobStatusView::derive(&job, Utc::now())))
}

/// Emit a pipeline checkpoint on `job_status_update` outside any state write.
#[instrument(skip(pool, message))]
pub async fn notify_status(
    pool: &PgPool,
    job_id: Uuid,
    status: &str,
    phase: &str,
    message: Option<&str>,
) -> Result<(), QueueStorageError> {
    let client = pool.get().await?;
    let event = JobStatusEvent::new(job_id, status, Some(phase), message);
    let payload =
        serde_json::to_string(&event).map_err(|e| QueueStorageError::Mapping(e.to_string()))?;
    client
        .execute(
            "SELECT pg_notify($1, $2)",
            &[&JOB_STATUS_CHANNEL, &payload],
        )
        .await?;
    Ok(())
}

/// Emit a chart transition on `chart_status_update`.
#[instrument(skip(pool))]
pub async fn notify_chart(
    pool: &PgPool,
    session_id: &str,
    ai_status: &str,
) -> Result<(), QueueStorageError> {
    let client = pool.get().await?;
    let event = ChartStatusEvent::new(session_id, ai_status);
    let payload =
        serde_json::to_string(&event).map_err(|e| QueueStorageError::Mapping(e.to_string()))?;
    client
        .execute(
            "SELECT pg_notify($1, $2)",
            &[&CHART_STATUS_CHANNEL, &payload],
        )
        .await?;
    Ok(())
}

/// Delete completed jobs whose `completed_at` is past the retention window.
#[instrument(skip(pool))]
pub async fn cleanup(pool: &PgPool, older_than_days: i64) -> Result<u64, QueueStorageError> {
    let client = pool.get().await?;
    let cutoff = Utc::now() - Duration::days(older_than_days);
    let deleted = client
        .execute(
            "DELETE FROM cc.processing_queue
             WHERE status = 'completed' AND completed_at < $1",
            &[&cutoff],
        )
        .await?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_rejects_unknown_values() {
        assert_eq!(parse_status("pending").unwrap(), JobStatus::Pending);
        assert_eq!(parse_status("processing").unwrap(), JobStatus::Processing);
        assert_eq!(parse_status("completed").unwrap(), JobStatus::Completed);
        assert_eq!(parse_status("failed").unwrap(), JobStatus::Failed);

        let err = parse_status("cancelled").unwrap_err();
        assert!(format!("{err}").contains("unknown job status"));
    }
}
