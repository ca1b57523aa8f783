use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use cc_common::api::QueueStats;
use cc_common::db;
use cc_common::queue::QueueJob;

use crate::error::ApiError;
use crate::SharedState;

pub async fn stats(State(state): State<SharedState>) -> Result<Json<QueueStats>, ApiError> {
    let stats = db::get_stats(&state.pool).await?;
    Ok(Json(stats))
}

pub async fn get_job(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<QueueJob>, ApiError> {
    let job = db::get_job(&state.pool, job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;
    Ok(Json(job))
}
