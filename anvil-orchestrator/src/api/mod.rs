//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod job;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::JobService;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Job endpoints
        .route("/job/quote", post(job::quote_job))
        .route("/job/submit", post(job::submit_job))
        .route("/job/poll", post(job::poll_job))
        .route("/job/{id}", get(job::get_job))
        .route("/job/{id}/cancel", post(job::cancel_job))
        .route("/job/project/{project_id}", get(job::list_jobs_by_project))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
