use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::json;
use tracing::info;

use cc_common::api::JobStatusView;
use cc_common::chart::can_enqueue;
use cc_common::db;
use cc_common::queue::{ChartInfo, JobData, QueueJob};

use crate::error::ApiError;
use crate::SharedState;

pub async fn chart_jobs(
    State(state): State<SharedState>,
    Path(chart_number): Path<String>,
) -> Result<Json<Vec<QueueJob>>, ApiError> {
    let jobs = db::jobs_by_chart(&state.pool, &chart_number).await?;
    Ok(Json(jobs))
}

pub async fn job_status(
    State(state): State<SharedState>,
    Path(chart_number): Path<String>,
) -> Result<Json<JobStatusView>, ApiError> {
    let view = db::get_job_status(&state.pool, &chart_number)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("no jobs recorded for chart {chart_number}"))
        })?;
    Ok(Json(view))
}

/// Admin retry: reset the chart back to `queued` and enqueue a fresh job with
/// job data re-derived from the chart's current document set.
pub async fn retry_chart(
    State(state): State<SharedState>,
    Path(chart_number): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chart = db::get_chart(&state.pool, &chart_number)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("chart {chart_number} not found")))?;

    if !can_enqueue(chart.ai_status, state.config.allow_submitted_reprocess) {
        return Err(ApiError::Conflict(format!(
            "chart {chart_number} was submitted; reprocessing is disabled"
        )));
    }

    db::reset_for_retry(&state.pool, &chart_number).await?;

    let documents = db::list_by_chart(&state.pool, chart.id).await?;
    let job_data = JobData {
        chart_id: chart.id,
        chart_number: chart.chart_number.clone(),
        session_id: Some(chart.session_id.clone()),
        chart_info: ChartInfo {
            patient_name: chart.patient_name.clone(),
            facility: chart.facility.clone(),
            specialty: chart.specialty.clone(),
            provider: chart.provider.clone(),
            encounter_date: chart.encounter_date.map(|date| date.to_string()),
        },
        document_ids: documents.iter().map(|document| document.id).collect(),
    };

    let job_data = serde_json::to_value(&job_data)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let job_id = db::enqueue(&state.pool, chart.id, &chart.chart_number, &job_data).await?;

    info!(
        chart_number = %chart.chart_number,
        %job_id,
        documents = documents.len(),
        "admin retry enqueued"
    );

    Ok(Json(json!({
        "jobId": job_id,
        "chartNumber": chart.chart_number,
        "status": "queued",
    })))
}
