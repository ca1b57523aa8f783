use chrono::Utc;
use metrics::{counter, histogram};
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use cc_common::db::{self, PgPool};
use cc_common::document::OcrStatus;
use cc_common::queue::{JobData, QueueJob};

use crate::extract::{self, Extraction, ExtractorConfig};
use crate::llm::{self, LlmConfig};

/// Whole-job failures, caught once at the top of the job. Per-document
/// extraction errors are recorded on the document instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid job data: {0}")]
    InvalidJobData(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("ai synthesis failed: {0}")]
    AiFailed(String),
    #[error("persist failed: {0}")]
    PersistFailed(String),
}

pub struct WorkerContext {
    pub pool: PgPool,
    pub http: Client,
    pub extractor: ExtractorConfig,
    pub llm: LlmConfig,
    pub worker_id: String,
}

/// Drive one claimed job to exactly one terminal queue transition and exactly
/// one chart-status update.
#[instrument(skip(ctx, job), fields(job_id = %job.job_id, chart_number = %job.chart_number))]
pub async fn process_job(ctx: &WorkerContext, job: &QueueJob) {
    let started = std::time::Instant::now();

    match run_phases(ctx, job).await {
        Ok(()) => {
            counter!("worker_jobs_completed_total").increment(1);
            histogram!("worker_job_duration_ms").record(started.elapsed().as_secs_f64() * 1000.0);
            info!(
                worker_id = %ctx.worker_id,
                attempts = job.attempts,
                "job completed"
            );
        }
        Err(err) => {
            counter!("worker_jobs_failed_total").increment(1);
            let message = err.to_string();
            error!(error = %message, "job failed");

            match db::fail(&ctx.pool, job.job_id, &message).await {
                Ok(outcome) => {
                    if let Err(chart_err) = db::record_error(
                        &ctx.pool,
                        &job.chart_number,
                        &message,
                        outcome.will_retry,
                        outcome.attempts,
                    )
                    .await
                    {
                        error!(error = %chart_err, "failed to record chart error");
                    }

                    if outcome.is_permanently_failed {
                        warn!(
                            attempts = outcome.attempts,
                            "job permanently failed; admin retry required"
                        );
                    }
                }
                Err(db_err) => {
                    // The lease stays held; release_stuck recovers it later.
                    error!(error = %db_err, "failed to mark job failed");
                }
            }
        }
    }
}

async fn run_phases(ctx: &WorkerContext, job: &QueueJob) -> Result<(), PipelineError> {
    let data: JobData = serde_json::from_value(job.job_data.clone())
        .map_err(|err| PipelineError::InvalidJobData(err.to_string()))?;

    let session_id = data.session_id.as_deref();

    // Phase 1: enter processing.
    checkpoint(ctx, job, session_id, "processing", "start", None).await;
    db::mark_processing(&ctx.pool, &job.chart_number)
        .await
        .map_err(|err| PipelineError::PersistFailed(err.to_string()))?;

    // The authoritative document list comes from the store, not job_data, so
    // files added between enqueue and claim are included.
    let documents = db::list_by_chart(&ctx.pool, data.chart_id)
        .await
        .map_err(|err| PipelineError::PersistFailed(err.to_string()))?;

    if documents.is_empty() {
        return Err(PipelineError::ExtractionFailed(format!(
            "chart {} has no documents to process",
            job.chart_number
        )));
    }

    // Phase 2: per-document text extraction, partial-failure tolerant.
    checkpoint(
        ctx,
        job,
        session_id,
        "processing",
        "extraction",
        Some(&format!("{} documents", documents.len())),
    )
    .await;

    let mut extractions: Vec<Extraction> = Vec::new();
    let mut failures = 0usize;
    for document in &documents {
        match extract::extract_document(&ctx.http, &ctx.extractor, document).await {
            Ok(extraction) => {
                if let Err(err) = db::update_ocr_result(
                    &ctx.pool,
                    document.id,
                    OcrStatus::Completed,
                    Some(&extraction.text),
                    Some(extraction.elapsed_ms),
                )
                .await
                {
                    return Err(PipelineError::PersistFailed(err.to_string()));
                }
                extractions.push(extraction);
            }
            Err(reason) => {
                failures += 1;
                warn!(
                    document_id = document.id,
                    file_name = %document.file_name,
                    error = %reason,
                    "document extraction failed"
                );
                if let Err(err) =
                    db::update_ocr_result(&ctx.pool, document.id, OcrStatus::Failed, None, None)
                        .await
                {
                    return Err(PipelineError::PersistFailed(err.to_string()));
                }
            }
        }
    }

    if extractions.is_empty() {
        return Err(PipelineError::ExtractionFailed(format!(
            "all {failures} of {} documents failed extraction",
            documents.len()
        )));
    }

    // Phase 3: coding synthesis over the successful extractions.
    checkpoint(
        ctx,
        job,
        session_id,
        "processing",
        "coding",
        Some(&format!(
            "{} extracted, {} failed",
            extractions.len(),
            failures
        )),
    )
    .await;

    let payload = llm::synthesize(&ctx.http, &ctx.llm, &data.chart_info, &extractions)
        .await
        .map_err(PipelineError::AiFailed)?;

    // Phase 4: per-document summaries, best effort.
    checkpoint(ctx, job, session_id, "processing", "summaries", None).await;
    for extraction in &extractions {
        match llm::summarize_document(&ctx.http, &ctx.llm, extraction).await {
            Ok(summary) => {
                if let Err(err) =
                    db::update_summary(&ctx.pool, extraction.document_id, &summary).await
                {
                    warn!(
                        document_id = extraction.document_id,
                        error = %err,
                        "failed to store document summary"
                    );
                }
            }
            Err(reason) => {
                warn!(
                    document_id = extraction.document_id,
                    error = %reason,
                    "document summary failed"
                );
            }
        }
    }

    // Phase 5: persist results and finish the job.
    let sla = json!({
        "completed_at": Utc::now(),
        "documents_total": documents.len(),
        "documents_extracted": extractions.len(),
        "documents_failed": failures,
    });

    db::store_results(&ctx.pool, &job.chart_number, &payload, Some(&sla))
        .await
        .map_err(|err| PipelineError::PersistFailed(err.to_string()))?;

    db::complete(&ctx.pool, job.job_id)
        .await
        .map_err(|err| PipelineError::PersistFailed(err.to_string()))?;

    checkpoint(ctx, job, session_id, "completed", "done", None).await;

    Ok(())
}

/// Phase checkpoints are observability only; a lost one never fails the job.
/// When the job data carries an upload session, chart subscribers get a
/// matching event.
async fn checkpoint(
    ctx: &WorkerContext,
    job: &QueueJob,
    session_id: Option<&str>,
    status: &str,
    phase: &str,
    message: Option<&str>,
) {
    if let Err(err) = db::notify_status(&ctx.pool, job.job_id, status, phase, message).await {
        warn!(phase, error = %err, "failed to emit status checkpoint");
    }

    if let Some(session_id) = session_id {
        if let Err(err) = db::notify_chart(&ctx.pool, session_id, status).await {
            warn!(phase, error = %err, "failed to emit chart checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_render_their_taxonomy() {
        assert_eq!(
            PipelineError::AiFailed("timeout".into()).to_string(),
            "ai synthesis failed: timeout"
        );
        assert_eq!(
            PipelineError::ExtractionFailed("all 3 of 3 documents failed extraction".into())
                .to_string(),
            "extraction failed: all 3 of 3 documents failed extraction"
        );
        assert!(PipelineError::InvalidJobData("missing chart_id".into())
            .to_string()
            .contains("invalid job data"));
    }
}
