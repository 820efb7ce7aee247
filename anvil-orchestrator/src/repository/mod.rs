//! Repository Module
//!
//! Data access layer for the orchestrator.
//!
//! Job records are written by different requests and tasks (submission,
//! reconciler polls, cancellation), so every status change goes through a
//! compare-and-set keyed on the status the writer last observed. The stores
//! are trait objects so the services run unchanged over PostgreSQL or the
//! in-memory implementations used in tests.

pub mod job;
pub mod memory;
pub mod quota;

use anvil_core::domain::job::{FailureKind, JobRecord, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

// Re-export for convenience
pub use job::PgJobStore;
pub use memory::{MemoryJobStore, MemoryQuotaStore};
pub use quota::PgQuotaStore;

/// Repository error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// A uniqueness constraint rejected the write
    #[error("conflicting record: {0}")]
    Conflict(String),

    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err.as_database_error() {
            Some(db) if db.is_unique_violation() => StoreError::Conflict(db.message().to_string()),
            _ => StoreError::Database(err),
        }
    }
}

/// Fields written alongside a status change
///
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub console_url: Option<String>,
    pub instance_name: Option<String>,
    pub instance_zone: Option<String>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub metrics: Option<HashMap<String, serde_json::Value>>,
    pub runtime_seconds: Option<i64>,
    pub cost: Option<f64>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            console_url: None,
            instance_name: None,
            instance_zone: None,
            provisioned_at: None,
            metrics: None,
            runtime_seconds: None,
            cost: None,
            error: None,
            failure_kind: None,
            completed_at: None,
        }
    }

    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            failure_kind: Some(kind),
            ..Self::status(JobStatus::Failed)
        }
    }

    /// Applies the update to an in-memory record
    pub fn apply(&self, job: &mut JobRecord, now: DateTime<Utc>) {
        job.status = self.status;
        job.updated_at = now;
        if let Some(v) = &self.console_url {
            job.console_url = Some(v.clone());
        }
        if let Some(v) = &self.instance_name {
            job.instance_name = Some(v.clone());
        }
        if let Some(v) = &self.instance_zone {
            job.instance_zone = Some(v.clone());
        }
        if let Some(v) = self.provisioned_at {
            job.provisioned_at = Some(v);
        }
        if let Some(v) = &self.metrics {
            job.metrics = v.clone();
        }
        if let Some(v) = self.runtime_seconds {
            job.runtime_seconds = Some(v);
        }
        if let Some(v) = self.cost {
            job.cost = Some(v);
        }
        if let Some(v) = &self.error {
            job.error = Some(v.clone());
        }
        if let Some(v) = self.failure_kind {
            job.failure_kind = Some(v);
        }
        if let Some(v) = self.completed_at {
            job.completed_at = Some(v);
        }
    }
}

/// Durable Job Record storage
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new record; fails with `Conflict` on a duplicate idempotency key
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Jobs of a project, newest first
    async fn list_by_project(&self, project_id: &str) -> Result<Vec<JobRecord>, StoreError>;

    /// Every job not yet in a terminal status
    async fn list_active(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Compare-and-set status update
    ///
    /// Applies `update` only if the stored status still equals `expected`
    /// and the transition is legal. Returns whether the write happened.
    async fn update_if_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        update: &JobUpdate,
    ) -> Result<bool, StoreError>;
}

/// Durable keyed counters with expiry
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Claims one of `limit` parallel-job slots for `user_id`
    ///
    /// Slots are keyed by job id, so claiming again for the same job
    /// succeeds without counting twice. Expired slots do not count.
    async fn acquire_slot(
        &self,
        user_id: &str,
        job_id: Uuid,
        limit: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Frees the slot held by `job_id`; releasing twice is a no-op
    async fn release_slot(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Increments the fixed-window counter for `key` and returns its new value
    async fn hit(&self, key: &str, window: Duration) -> Result<u64, StoreError>;
}

/// Start of the fixed window containing `now`
pub(crate) fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let secs = window.num_seconds().max(1);
    let start = now.timestamp().div_euclid(secs) * secs;
    DateTime::from_timestamp(start, 0).unwrap_or(now)
}
