use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Durable queue lifecycle. `failed` rows with attempts left are reclaimable
/// once their `retry_after` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Operator-facing refinement of `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveStatus {
    Pending,
    Processing,
    Completed,
    PermanentlyFailed,
    WaitingForRetry,
    ReadyToRetry,
}

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Retry delays indexed by the zero-based count of attempts already spent.
pub const BACKOFF_SECONDS: [i64; 5] = [30, 60, 120, 300, 600];

/// Delay a failed job waits before its `attempts + 1`-th run. Overflowing
/// indexes clamp to the last entry.
pub fn retry_delay(prior_attempts: i32) -> Duration {
    let index = prior_attempts.max(0) as usize;
    Duration::seconds(BACKOFF_SECONDS[index.min(BACKOFF_SECONDS.len() - 1)])
}

/// Delay applied when a stuck lease is force-released.
pub const STUCK_RELEASE_RETRY_SECONDS: i64 = 30;

/// One unit of work on the processing queue for one chart.
#[derive(Debug, Clone, Serialize)]
pub struct QueueJob {
    pub id: i64,
    pub job_id: Uuid,
    pub chart_id: i64,
    pub chart_number: String,
    pub status: JobStatus,
    pub job_data: Value,
    pub worker_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJob {
    pub fn effective_status(&self, now: DateTime<Utc>) -> EffectiveStatus {
        match self.status {
            JobStatus::Pending => EffectiveStatus::Pending,
            JobStatus::Processing => EffectiveStatus::Processing,
            JobStatus::Completed => EffectiveStatus::Completed,
            JobStatus::Failed => {
                if self.attempts >= self.max_attempts {
                    EffectiveStatus::PermanentlyFailed
                } else {
                    match self.retry_after {
                        Some(at) if at > now => EffectiveStatus::WaitingForRetry,
                        _ => EffectiveStatus::ReadyToRetry,
                    }
                }
            }
        }
    }

    /// Seconds until the job becomes claimable again; zero once elapsed.
    pub fn retry_in_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.retry_after
            .map(|at| (at - now).num_seconds().max(0))
            .filter(|_| self.status == JobStatus::Failed && self.attempts < self.max_attempts)
    }

    fn claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Failed => {
                self.attempts < self.max_attempts
                    && self.retry_after.map(|at| at <= now).unwrap_or(true)
            }
            _ => false,
        }
    }
}

/// Chart context embedded in `job_data` at enqueue time. The worker re-reads
/// the authoritative document list from the store, so `document_ids` is a
/// hint for observability rather than the processing input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobData {
    pub chart_id: i64,
    pub chart_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub chart_info: ChartInfo,
    #[serde(default)]
    pub document_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartInfo {
    #[serde(default)]
    pub patient_name: Option<String>,
    #[serde(default)]
    pub facility: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub encounter_date: Option<String>,
}

/// What `fail` decided, for the caller to drive chart-status updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailOutcome {
    pub attempts: i32,
    pub max_attempts: i32,
    pub will_retry: bool,
    pub retry_after: Option<DateTime<Utc>>,
    pub is_permanently_failed: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkQueueError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// In-memory twin of the durable queue, implementing the identical claim
/// predicate, ordering, lease, backoff, and terminal-state rules. Used by the
/// unit tests and the recovery tool's dry-run path.
#[derive(Default)]
pub struct WorkQueue {
    pub jobs: Vec<QueueJob>,
    next_id: i64,
}

impl WorkQueue {
    pub fn enqueue(
        &mut self,
        chart_id: i64,
        chart_number: &str,
        job_data: Value,
        now: DateTime<Utc>,
    ) -> Uuid {
        self.next_id += 1;
        let job_id = Uuid::new_v4();
        self.jobs.push(QueueJob {
            id: self.next_id,
            job_id,
            chart_id,
            chart_number: chart_number.to_string(),
            status: JobStatus::Pending,
            job_data,
            worker_id: None,
            locked_at: None,
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            error_message: None,
            retry_after: None,
            created_at: now,
            updated_at: now,
        });
        job_id
    }

    /// Claim the single highest-priority claimable row: pending strictly
    /// before retryable, oldest `created_at` first within each class.
    pub fn claim_next(&mut self, worker_id: &str, now: DateTime<Utc>) -> Option<QueueJob> {
        let index = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.claimable(now))
            .min_by_key(|(_, job)| (job.status != JobStatus::Pending, job.created_at, job.id))
            .map(|(index, _)| index)?;

        let job = &mut self.jobs[index];
        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.started_at = job.started_at.or(Some(now));
        job.attempts += 1;
        job.retry_after = None;
        job.updated_at = now;
        Some(job.clone())
    }

    /// Idempotent: completing an already-completed job is a no-op success.
    pub fn complete(&mut self, job_id: Uuid, now: DateTime<Utc>) -> Result<(), WorkQueueError> {
        let job = self.job_mut(job_id)?;
        if job.status == JobStatus::Completed {
            return Ok(());
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.worker_id = None;
        job.locked_at = None;
        job.error_message = None;
        job.retry_after = None;
        job.updated_at = now;
        Ok(())
    }

    pub fn fail(
        &mut self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, WorkQueueError> {
        let job = self.job_mut(job_id)?;
        let will_retry = job.attempts < job.max_attempts;
        let retry_after = will_retry.then(|| now + retry_delay(job.attempts - 1));

        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.worker_id = None;
        job.locked_at = None;
        job.retry_after = retry_after;
        job.updated_at = now;

        Ok(FailOutcome {
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            will_retry,
            retry_after,
            is_permanently_failed: !will_retry,
        })
    }

    /// Convert leases older than `stuck_minutes` into retryable failures.
    pub fn release_stuck(&mut self, stuck_minutes: i64, now: DateTime<Utc>) -> u64 {
        let cutoff = now - Duration::minutes(stuck_minutes);
        let mut released = 0;
        for job in &mut self.jobs {
            if job.status != JobStatus::Processing {
                continue;
            }
            let Some(locked_at) = job.locked_at else {
                continue;
            };
            if locked_at >= cutoff {
                continue;
            }
            job.status = JobStatus::Failed;
            job.error_message = Some(format!(
                "released stuck lease held by {} since {}",
                job.worker_id.as_deref().unwrap_or("unknown"),
                locked_at.to_rfc3339(),
            ));
            job.worker_id = None;
            job.locked_at = None;
            job.retry_after = Some(now + Duration::seconds(STUCK_RELEASE_RETRY_SECONDS));
            job.updated_at = now;
            released += 1;
        }
        released
    }

    /// Administrative reset, only valid from `failed`.
    pub fn retry(&mut self, job_id: Uuid, now: DateTime<Utc>) -> Result<(), WorkQueueError> {
        let job = self.job_mut(job_id)?;
        if job.status != JobStatus::Failed {
            return Err(WorkQueueError::Conflict(format!(
                "job {job_id} is {} and cannot be retried",
                job.status.as_str()
            )));
        }
        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.worker_id = None;
        job.locked_at = None;
        job.error_message = None;
        job.retry_after = None;
        job.updated_at = now;
        Ok(())
    }

    /// Drop completed jobs older than the retention window.
    pub fn cleanup(&mut self, older_than_days: i64, now: DateTime<Utc>) -> u64 {
        let cutoff = now - Duration::days(older_than_days);
        let before = self.jobs.len();
        self.jobs.retain(|job| {
            !(job.status == JobStatus::Completed
                && job.completed_at.map(|at| at < cutoff).unwrap_or(false))
        });
        (before - self.jobs.len()) as u64
    }

    pub fn get(&self, job_id: Uuid) -> Option<&QueueJob> {
        self.jobs.iter().find(|job| job.job_id == job_id)
    }

    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut QueueJob, WorkQueueError> {
        self.jobs
            .iter_mut()
            .find(|job| job.job_id == job_id)
            .ok_or_else(|| WorkQueueError::NotFound(format!("job {job_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn queue_with_jobs(count: usize, at: DateTime<Utc>) -> (WorkQueue, Vec<Uuid>) {
        let mut queue = WorkQueue::default();
        let ids = (0..count)
            .map(|i| queue.enqueue(i as i64 + 1, &format!("CH-{i}"), json!({}), at))
            .collect();
        (queue, ids)
    }

    #[test]
    fn claim_is_exclusive_per_row() {
        let at = now();
        let (mut queue, mut expected) = queue_with_jobs(5, at);

        let mut claimed = Vec::new();
        for worker in 0..10 {
            if let Some(job) = queue.claim_next(&format!("worker-host-{worker}"), at) {
                claimed.push(job.job_id);
            }
        }

        assert_eq!(claimed.len(), 5);
        claimed.sort();
        expected.sort();
        assert_eq!(claimed, expected);
    }

    #[test]
    fn claim_sets_lease_and_counts_attempt() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);

        let job = queue.claim_next("worker-a-1", at).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.worker_id.as_deref(), Some("worker-a-1"));
        assert_eq!(job.locked_at, Some(at));
        assert_eq!(job.started_at, Some(at));
        assert_eq!(job.attempts, 1);
        assert!(job.retry_after.is_none());
        assert_eq!(job.job_id, ids[0]);
    }

    #[test]
    fn attempts_increase_per_claim_and_reset_only_by_admin_retry() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);

        for expected in 1..=DEFAULT_MAX_ATTEMPTS {
            let later = at + Duration::minutes(expected as i64 * 20);
            let job = queue.claim_next("w", later).unwrap();
            assert_eq!(job.attempts, expected);
            queue.fail(ids[0], "boom", later).unwrap();
        }

        assert_eq!(queue.get(ids[0]).unwrap().attempts, DEFAULT_MAX_ATTEMPTS);
        queue.retry(ids[0], at).unwrap();
        assert_eq!(queue.get(ids[0]).unwrap().attempts, 0);
    }

    #[test]
    fn backoff_follows_the_schedule_and_clamps() {
        let at = now();
        let mut queue = WorkQueue::default();
        let id = queue.enqueue(1, "CH-0", json!({}), at);
        queue.jobs[0].max_attempts = 10;

        let mut tick = at;
        for (prior, expected) in [(0, 30), (1, 60), (2, 120), (3, 300), (4, 600), (5, 600)] {
            let job = queue.claim_next("w", tick).unwrap();
            assert_eq!(job.attempts, prior + 1);
            let outcome = queue.fail(id, "transient", tick).unwrap();
            assert_eq!(
                outcome.retry_after,
                Some(tick + Duration::seconds(expected))
            );
            tick = tick + Duration::seconds(expected);
        }
    }

    #[test]
    fn completed_jobs_are_never_reclaimed() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);

        queue.claim_next("w", at).unwrap();
        queue.complete(ids[0], at).unwrap();

        // Even a stale retry_after must not resurrect a terminal job.
        queue.jobs[0].retry_after = Some(at - Duration::hours(1));
        assert!(queue.claim_next("w", at + Duration::days(1)).is_none());

        // Idempotent completion.
        assert_eq!(queue.complete(ids[0], at), Ok(()));
        assert!(queue.get(ids[0]).unwrap().error_message.is_none());
        assert!(queue.get(ids[0]).unwrap().retry_after.is_none());
    }

    #[test]
    fn pending_preempts_retryable_and_fifo_within_class() {
        let at = now();
        let mut queue = WorkQueue::default();

        let failed_old = queue.enqueue(1, "CH-old-failed", json!({}), at - Duration::hours(2));
        queue.claim_next("w", at - Duration::hours(2)).unwrap();
        queue
            .fail(failed_old, "transient", at - Duration::hours(2))
            .unwrap();

        let pending_old = queue.enqueue(2, "CH-old-pending", json!({}), at - Duration::hours(1));
        let pending_new = queue.enqueue(3, "CH-new-pending", json!({}), at);

        assert_eq!(queue.claim_next("w", at).unwrap().job_id, pending_old);
        assert_eq!(queue.claim_next("w", at).unwrap().job_id, pending_new);
        assert_eq!(queue.claim_next("w", at).unwrap().job_id, failed_old);
    }

    #[test]
    fn failed_job_waits_out_its_backoff() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);

        queue.claim_next("w", at).unwrap();
        let outcome = queue.fail(ids[0], "llm timeout", at).unwrap();
        assert!(outcome.will_retry);
        assert_eq!(outcome.retry_after, Some(at + Duration::seconds(30)));

        assert!(queue.claim_next("w", at + Duration::seconds(29)).is_none());
        assert!(queue.claim_next("w", at + Duration::seconds(30)).is_some());
    }

    #[test]
    fn transient_failures_then_success() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);

        let first = queue.claim_next("w", at).unwrap();
        assert_eq!(first.attempts, 1);
        let outcome = queue.fail(ids[0], "timeout", at).unwrap();
        assert_eq!(outcome.retry_after, Some(at + Duration::seconds(30)));

        let t2 = at + Duration::seconds(31);
        let second = queue.claim_next("w", t2).unwrap();
        assert_eq!(second.attempts, 2);
        let outcome = queue.fail(ids[0], "timeout", t2).unwrap();
        assert_eq!(outcome.retry_after, Some(t2 + Duration::seconds(60)));
        assert!(outcome.will_retry);

        let t3 = t2 + Duration::seconds(61);
        let third = queue.claim_next("w", t3).unwrap();
        assert_eq!(third.attempts, 3);
        queue.complete(ids[0], t3).unwrap();

        let job = queue.get(ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn exhausted_attempts_fail_permanently() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);

        let mut tick = at;
        let mut last = None;
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            queue.claim_next("w", tick).unwrap();
            last = Some(queue.fail(ids[0], "llm down", tick).unwrap());
            tick = tick + Duration::seconds(700);
        }

        let outcome = last.unwrap();
        assert!(!outcome.will_retry);
        assert!(outcome.is_permanently_failed);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.retry_after.is_none());

        let job = queue.get(ids[0]).unwrap().clone();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.retry_after.is_none());
        assert!(queue.claim_next("w", tick + Duration::days(1)).is_none());
        assert_eq!(
            job.effective_status(tick),
            EffectiveStatus::PermanentlyFailed
        );
    }

    #[test]
    fn stuck_lease_is_released_and_reprocessed() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);

        queue.claim_next("worker-dead-9", at - Duration::minutes(31));

        let released = queue.release_stuck(30, at);
        assert_eq!(released, 1);

        let job = queue.get(ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.worker_id.is_none());
        assert_eq!(job.retry_after, Some(at + Duration::seconds(30)));
        assert!(job
            .error_message
            .as_deref()
            .unwrap()
            .contains("worker-dead-9"));

        assert!(queue.claim_next("worker-live-1", at).is_none());
        let reclaimed = queue
            .claim_next("worker-live-1", at + Duration::seconds(30))
            .unwrap();
        assert_eq!(reclaimed.attempts, 2);
        queue
            .complete(ids[0], at + Duration::seconds(40))
            .unwrap();
    }

    #[test]
    fn fresh_leases_survive_release_stuck() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);
        queue.claim_next("w", at - Duration::minutes(5));

        assert_eq!(queue.release_stuck(30, at), 0);
        assert_eq!(queue.get(ids[0]).unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn retry_rejects_non_failed_jobs() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);

        assert!(matches!(
            queue.retry(ids[0], at),
            Err(WorkQueueError::Conflict(_))
        ));

        queue.claim_next("w", at).unwrap();
        queue.complete(ids[0], at).unwrap();
        assert!(matches!(
            queue.retry(ids[0], at),
            Err(WorkQueueError::Conflict(_))
        ));
        assert!(matches!(
            queue.retry(Uuid::new_v4(), at),
            Err(WorkQueueError::NotFound(_))
        ));
    }

    #[test]
    fn cleanup_only_touches_aged_completed_jobs() {
        let at = now();
        let mut queue = WorkQueue::default();

        let old_done = queue.enqueue(1, "CH-1", json!({}), at - Duration::days(10));
        queue.claim_next("w", at - Duration::days(10));
        queue.complete(old_done, at - Duration::days(9)).unwrap();

        let fresh_done = queue.enqueue(2, "CH-2", json!({}), at - Duration::days(2));
        queue.claim_next("w", at - Duration::days(2));
        queue.complete(fresh_done, at - Duration::days(2)).unwrap();

        let old_failed = queue.enqueue(3, "CH-3", json!({}), at - Duration::days(10));
        queue.claim_next("w", at - Duration::days(10));
        queue.fail(old_failed, "x", at - Duration::days(10)).unwrap();

        assert_eq!(queue.cleanup(7, at), 1);
        assert!(queue.get(old_done).is_none());
        assert!(queue.get(fresh_done).is_some());
        assert!(queue.get(old_failed).is_some());
    }

    #[test]
    fn effective_status_refines_failed() {
        let at = now();
        let (mut queue, ids) = queue_with_jobs(1, at);
        queue.claim_next("w", at).unwrap();
        queue.fail(ids[0], "x", at).unwrap();

        let job = queue.get(ids[0]).unwrap();
        assert_eq!(job.effective_status(at), EffectiveStatus::WaitingForRetry);
        assert_eq!(job.retry_in_seconds(at), Some(30));
        assert_eq!(
            job.effective_status(at + Duration::seconds(31)),
            EffectiveStatus::ReadyToRetry
        );
        assert_eq!(job.retry_in_seconds(at + Duration::seconds(31)), Some(0));
    }

    #[test]
    fn retry_delay_clamps_to_last_entry() {
        assert_eq!(retry_delay(0), Duration::seconds(30));
        assert_eq!(retry_delay(4), Duration::seconds(600));
        assert_eq!(retry_delay(99), Duration::seconds(600));
        assert_eq!(retry_delay(-1), Duration::seconds(30));
    }

    #[test]
    fn job_data_round_trips_with_optional_session() {
        let data = JobData {
            chart_id: 7,
            chart_number: "CH-7".into(),
            session_id: Some("sess-7".into()),
            chart_info: ChartInfo {
                patient_name: Some("Doe, Jane".into()),
                specialty: Some("general surgery".into()),
                ..ChartInfo::default()
            },
            document_ids: vec![1, 2],
        };

        let value = serde_json::to_value(&data).unwrap();
        let back: JobData = serde_json::from_value(value).unwrap();
        assert_eq!(back.chart_number, "CH-7");
        assert_eq!(back.session_id.as_deref(), Some("sess-7"));
        assert_eq!(back.document_ids, vec![1, 2]);

        let minimal: JobData =
            serde_json::from_value(json!({"chart_id": 1, "chart_number": "CH-1"})).unwrap();
        assert!(minimal.session_id.is_none());
        assert!(minimal.document_ids.is_empty());
    }
}
