use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::queue::{EffectiveStatus, QueueJob};

/// Aggregate queue counters for the operations dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub permanently_failed: i64,
    pub waiting_for_retry: i64,
    pub stale_processing: i64,
    pub oldest_pending_age_seconds: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub chart_number: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator view of a chart's latest job with the derived effective status.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: JobSummary,
    pub effective_status: EffectiveStatus,
    pub retry_in_seconds: Option<i64>,
}

impl From<&QueueJob> for JobSummary {
    fn from(job: &QueueJob) -> Self {
        Self {
            job_id: job.job_id,
            chart_number: job.chart_number.clone(),
            status: job.status.as_str().to_string(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            worker_id: job.worker_id.clone(),
            error_message: job.error_message.clone(),
            retry_after: job.retry_after,
            started_at: job.started_at,
            completed_at: job.completed_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

impl JobStatusView {
    pub fn derive(job: &QueueJob, now: DateTime<Utc>) -> Self {
        Self {
            job: JobSummary::from(job),
            effective_status: job.effective_status(now),
            retry_in_seconds: job.retry_in_seconds(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkQueue;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn view_carries_derived_fields() {
        let at = Utc::now();
        let mut queue = WorkQueue::default();
        let id = queue.enqueue(1, "CH-1", json!({}), at);
        queue.claim_next("w", at).unwrap();
        queue.fail(id, "transient", at).unwrap();

        let view = JobStatusView::derive(queue.get(id).unwrap(), at + Duration::seconds(10));
        assert_eq!(view.effective_status, EffectiveStatus::WaitingForRetry);
        assert_eq!(view.retry_in_seconds, Some(20));
        assert_eq!(view.job.status, "failed");

        let rendered = serde_json::to_value(&view).unwrap();
        assert_eq!(rendered["effective_status"], "waiting_for_retry");
        assert_eq!(rendered["chart_number"], "CH-1");
    }
}
