//! Job API Handlers
//!
//! HTTP endpoints for quoting, submitting, inspecting, polling and
//! cancelling training jobs.

use anvil_core::domain::job::JobRecord;
use anvil_core::dto::job::{
    PollJob, PollJobResponse, QuoteRequest, QuoteResponse, SubmitJob, SubmitJobResponse,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /job/quote
/// Routing decision and estimate for a prospective job
pub async fn quote_job(
    State(state): State<AppState>,
    Json(req): Json<QuoteRequest>,
) -> ApiResult<Json<QuoteResponse>> {
    tracing::debug!("Quoting {} job on {} tier", req.task_type, req.tier.as_str());

    let quote = state.jobs.quote(&req)?;
    Ok(Json(quote))
}

/// POST /job/submit
/// Accept a job and provision its worker
pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJob>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    tracing::info!(
        "Submitting {} job for project {} (user {})",
        req.task_type,
        req.project_id,
        req.user_id
    );

    let resp = state.jobs.submit(req).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

/// POST /job/poll
/// Reconcile a job against its status document
pub async fn poll_job(
    State(state): State<AppState>,
    Json(req): Json<PollJob>,
) -> ApiResult<Json<PollJobResponse>> {
    tracing::debug!("Polling job: {}", req.job_id);

    let resp = state.jobs.poll(&req).await?;
    Ok(Json(resp))
}

/// POST /job/{id}/cancel
/// Delete the worker and mark the job failed
pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    tracing::info!("Cancelling job: {}", id);

    state.jobs.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /job/{id}
/// Get job details by ID
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<JobRecord>> {
    tracing::debug!("Getting job: {}", id);

    let job = state.jobs.get(id).await?;
    Ok(Json(job))
}

/// GET /job/project/{project_id}
/// List jobs of a project, newest first
pub async fn list_jobs_by_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<JobRecord>>> {
    tracing::debug!("Listing jobs for project: {}", project_id);

    let jobs = state.jobs.list_by_project(&project_id).await?;
    Ok(Json(jobs))
}
