use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::video::{GenerateVideoRequest, GenerateVideoResponse, JobStatusResponse, ListJobsQuery};
use crate::routes::error::{ApiError, ApiResult};
use crate::routes::owner::Owner;

/// POST /api/v1/videos/generate — charge credits and queue a generation job.
pub async fn generate_video(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(request): Json<GenerateVideoRequest>,
) -> ApiResult<(StatusCode, Json<GenerateVideoResponse>)> {
    request
        .validate()
        .map_err(|report| ApiError::Validation(report.to_string()))?;

    let job = state.jobs.submit(owner, &request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateVideoResponse {
            job_id: job.id,
            status: job.status,
            credits_charged: job.credits_charged,
            message: "Video generation queued".to_string(),
        }),
    ))
}

/// GET /api/v1/videos/{id}
pub async fn get_video(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state.jobs.get(owner, job_id).await?;
    Ok(Json(JobStatusResponse::from(&job)))
}

/// GET /api/v1/videos[?status=]
pub async fn list_videos(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<JobStatusResponse>>> {
    let jobs = state.jobs.list(owner, query.status).await?;
    Ok(Json(jobs.iter().map(JobStatusResponse::from).collect()))
}

/// POST /api/v1/videos/{id}/cancel — ask the owning worker to stop the job.
pub async fn cancel_video(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<JobStatusResponse>)> {
    let job = state.jobs.request_cancel(owner, job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobStatusResponse::from(&job))))
}
