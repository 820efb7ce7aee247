//! Job DTOs for the orchestrator API

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::estimate::Estimate;
use crate::domain::job::{FailureKind, HyperParameters, JobStatus};
use crate::domain::routing::{DatasetType, RoutingDecision};
use crate::domain::script::ScriptSource;
use crate::domain::tier::Tier;

/// Request to submit a training job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJob {
    pub project_id: String,
    pub user_id: String,
    pub script: ScriptSource,
    #[serde(default)]
    pub config: HyperParameters,
    pub dataset_ref: String,
    #[serde(default)]
    pub dataset_type: DatasetType,
    #[serde(default)]
    pub dataset_size_mb: f64,
    pub task_type: String,
    pub tier: Tier,
    /// Retries carrying the same key resolve to the original job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl SubmitJob {
    /// The routing/estimation inputs of this submission
    pub fn quote_request(&self) -> QuoteRequest {
        QuoteRequest {
            tier: self.tier,
            dataset_type: self.dataset_type,
            task_type: self.task_type.clone(),
            prefer_gpu: self.config.prefer_gpu,
            dataset_size_mb: self.dataset_size_mb,
            epochs: self.config.epochs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub estimated_minutes: f64,
    pub estimated_cost: f64,
}

/// Pre-submission cost quote request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub tier: Tier,
    #[serde(default)]
    pub dataset_type: DatasetType,
    pub task_type: String,
    #[serde(default, rename = "preferGPU")]
    pub prefer_gpu: bool,
    #[serde(default)]
    pub dataset_size_mb: f64,
    #[serde(default)]
    pub epochs: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    pub decision: RoutingDecision,
    pub estimate: Estimate,
}

/// Completion poll request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollJob {
    pub job_id: Uuid,
    pub project_id: String,
}

/// Latest canonical state of a job after one poll
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollJobResponse {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Whether this poll advanced the job record
    pub changed: bool,
}
