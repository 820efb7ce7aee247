//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::routing::Backend;
use crate::domain::tier::Tier;

/// Job Record
///
/// Persisted by the orchestrator. Only the submission path (instance
/// identity) and the reconciler/cancellation path (status, metrics, error)
/// mutate it after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub project_id: String,
    pub user_id: String,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    pub tier: Tier,
    pub task_type: String,
    pub dataset_ref: String,
    pub backend: Backend,
    pub machine_class: String,
    pub gpu_class: Option<String>,
    pub cost_per_hour: f64,
    pub console_url: Option<String>,
    pub instance_name: Option<String>,
    pub instance_zone: Option<String>,
    pub hyperparameters: HyperParameters,
    pub metrics: HashMap<String, serde_json::Value>,
    pub estimated_minutes: f64,
    pub estimated_cost: f64,
    pub runtime_seconds: Option<i64>,
    pub cost: Option<f64>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Past this instant the reconciler tears the instance down
    pub deadline: DateTime<Utc>,
}

impl JobRecord {
    /// True once the job has a backing instance that may still be running
    pub fn has_live_instance(&self) -> bool {
        self.instance_name.is_some() && self.status.is_instance_backed()
    }
}

/// Canonical job status
///
/// Transitions are monotonic in declaration order. `Failed` is reachable
/// from every non-terminal status; nothing leaves a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Preparing,
    Uploading,
    Submitting,
    Provisioning,
    Installing,
    Downloading,
    Training,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Preparing,
        JobStatus::Uploading,
        JobStatus::Submitting,
        JobStatus::Provisioning,
        JobStatus::Installing,
        JobStatus::Downloading,
        JobStatus::Training,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    /// Position along the happy path
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Preparing => 0,
            JobStatus::Uploading => 1,
            JobStatus::Submitting => 2,
            JobStatus::Provisioning => 3,
            JobStatus::Installing => 4,
            JobStatus::Downloading => 5,
            JobStatus::Training => 6,
            JobStatus::Succeeded | JobStatus::Failed => 7,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Statuses in which an instance exists and the reconciler must poll
    pub fn is_instance_backed(self) -> bool {
        matches!(
            self,
            JobStatus::Provisioning
                | JobStatus::Installing
                | JobStatus::Downloading
                | JobStatus::Training
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed => true,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Preparing => "preparing",
            JobStatus::Uploading => "uploading",
            JobStatus::Submitting => "submitting",
            JobStatus::Provisioning => "provisioning",
            JobStatus::Installing => "installing",
            JobStatus::Downloading => "downloading",
            JobStatus::Training => "training",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Why a job ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Failed before an instance existed (script upload)
    Submission,
    /// The compute provider refused to create the instance
    Provisioning,
    /// The worker wrote a failed status document
    Worker,
    Cancelled,
    TimedOut,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Submission => "submission",
            FailureKind::Provisioning => "provisioning",
            FailureKind::Worker => "worker",
            FailureKind::Cancelled => "cancelled",
            FailureKind::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submission" => Some(FailureKind::Submission),
            "provisioning" => Some(FailureKind::Provisioning),
            "worker" => Some(FailureKind::Worker),
            "cancelled" => Some(FailureKind::Cancelled),
            "timed_out" => Some(FailureKind::TimedOut),
            _ => None,
        }
    }
}

/// User-chosen hyperparameters
///
/// Unset values are not exported to the worker; the training program falls
/// back to its own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trees: Option<u32>,
    #[serde(default, rename = "preferGPU")]
    pub prefer_gpu: bool,
}

impl HyperParameters {
    /// Environment overrides for the worker, only for explicitly set values
    pub fn env_overrides(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        if let Some(epochs) = self.epochs {
            env.push(("EPOCHS", epochs.to_string()));
        }
        if let Some(batch_size) = self.batch_size {
            env.push(("BATCH_SIZE", batch_size.to_string()));
        }
        if let Some(learning_rate) = self.learning_rate {
            env.push(("LEARNING_RATE", learning_rate.to_string()));
        }
        if let Some(trees) = self.trees {
            env.push(("N_ESTIMATORS", trees.to_string()));
        }
        env
    }
}
