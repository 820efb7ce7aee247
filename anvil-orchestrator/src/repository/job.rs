//! Job Repository
//!
//! Handles all PostgreSQL operations related to job records.

use anvil_core::domain::job::{FailureKind, HyperParameters, JobRecord, JobStatus};
use anvil_core::domain::routing::Backend;
use anvil_core::domain::tier::Tier;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{JobStore, JobUpdate, StoreError};

const JOB_COLUMNS: &str = r#"
    id, project_id, user_id, idempotency_key, status, tier, task_type, dataset_ref,
    backend, machine_class, gpu_class, cost_per_hour, console_url, instance_name,
    instance_zone, hyperparameters, metrics, estimated_minutes, estimated_cost,
    runtime_seconds, cost, error, failure_kind, created_at, updated_at,
    provisioned_at, completed_at, deadline
"#;

/// Create a new job in the database
pub async fn create(pool: &PgPool, job: &JobRecord) -> Result<(), StoreError> {
    let hyperparameters = serde_json::to_value(&job.hyperparameters).map_err(|e| StoreError::Corrupt {
        id: job.id,
        reason: e.to_string(),
    })?;
    let metrics = serde_json::to_value(&job.metrics).map_err(|e| StoreError::Corrupt {
        id: job.id,
        reason: e.to_string(),
    })?;

    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, project_id, user_id, idempotency_key, status, tier, task_type, dataset_ref,
            backend, machine_class, gpu_class, cost_per_hour, hyperparameters, metrics,
            estimated_minutes, estimated_cost, created_at, updated_at, deadline
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(job.id)
    .bind(&job.project_id)
    .bind(&job.user_id)
    .bind(&job.idempotency_key)
    .bind(job.status.as_str())
    .bind(job.tier.as_str())
    .bind(&job.task_type)
    .bind(&job.dataset_ref)
    .bind(job.backend.as_str())
    .bind(&job.machine_class)
    .bind(&job.gpu_class)
    .bind(job.cost_per_hour)
    .bind(hyperparameters)
    .bind(metrics)
    .bind(job.estimated_minutes)
    .bind(job.estimated_cost)
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.deadline)
    .execute(pool)
    .await?;

    Ok(())
}

/// Find a job by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
    let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(JobRecord::try_from).transpose()
}

/// Find a job by the submitter's idempotency key
pub async fn find_by_idempotency_key(
    pool: &PgPool,
    user_id: &str,
    key: &str,
) -> Result<Option<JobRecord>, StoreError> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {} FROM jobs WHERE user_id = $1 AND idempotency_key = $2",
        JOB_COLUMNS
    ))
    .bind(user_id)
    .bind(key)
    .fetch_optional(pool)
    .await?;

    row.map(JobRecord::try_from).transpose()
}

/// Find jobs by project ID
pub async fn find_by_project(pool: &PgPool, project_id: &str) -> Result<Vec<JobRecord>, StoreError> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {} FROM jobs WHERE project_id = $1 ORDER BY created_at DESC",
        JOB_COLUMNS
    ))
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRecord::try_from).collect()
}

/// Find all jobs that have not reached a terminal status
pub async fn find_active(pool: &PgPool) -> Result<Vec<JobRecord>, StoreError> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {} FROM jobs WHERE status NOT IN ($1, $2) ORDER BY created_at ASC",
        JOB_COLUMNS
    ))
    .bind(JobStatus::Succeeded.as_str())
    .bind(JobStatus::Failed.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRecord::try_from).collect()
}

/// Conditionally update a job, keyed on its expected current status
pub async fn update_if_status(
    pool: &PgPool,
    id: Uuid,
    expected: JobStatus,
    update: &JobUpdate,
) -> Result<bool, StoreError> {
    if !expected.can_transition_to(update.status) {
        return Ok(false);
    }

    let metrics = update
        .metrics
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            id,
            reason: e.to_string(),
        })?;

    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1,
            updated_at = $2,
            console_url = COALESCE($3, console_url),
            instance_name = COALESCE($4, instance_name),
            instance_zone = COALESCE($5, instance_zone),
            provisioned_at = COALESCE($6, provisioned_at),
            metrics = COALESCE($7, metrics),
            runtime_seconds = COALESCE($8, runtime_seconds),
            cost = COALESCE($9, cost),
            error = COALESCE($10, error),
            failure_kind = COALESCE($11, failure_kind),
            completed_at = COALESCE($12, completed_at)
        WHERE id = $13 AND status = $14
        "#,
    )
    .bind(update.status.as_str())
    .bind(chrono::Utc::now())
    .bind(&update.console_url)
    .bind(&update.instance_name)
    .bind(&update.instance_zone)
    .bind(update.provisioned_at)
    .bind(metrics)
    .bind(update.runtime_seconds)
    .bind(update.cost)
    .bind(&update.error)
    .bind(update.failure_kind.map(FailureKind::as_str))
    .bind(update.completed_at)
    .bind(id)
    .bind(expected.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// PostgreSQL-backed [`JobStore`]
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        create(&self.pool, job).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        find_by_id(&self.pool, id).await
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        find_by_idempotency_key(&self.pool, user_id, key).await
    }

    async fn list_by_project(&self, project_id: &str) -> Result<Vec<JobRecord>, StoreError> {
        find_by_project(&self.pool, project_id).await
    }

    async fn list_active(&self) -> Result<Vec<JobRecord>, StoreError> {
        find_active(&self.pool).await
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        update: &JobUpdate,
    ) -> Result<bool, StoreError> {
        update_if_status(&self.pool, id, expected, update).await
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    project_id: String,
    user_id: String,
    idempotency_key: Option<String>,
    status: String,
    tier: String,
    task_type: String,
    dataset_ref: String,
    backend: String,
    machine_class: String,
    gpu_class: Option<String>,
    cost_per_hour: f64,
    console_url: Option<String>,
    instance_name: Option<String>,
    instance_zone: Option<String>,
    hyperparameters: serde_json::Value,
    metrics: serde_json::Value,
    estimated_minutes: f64,
    estimated_cost: f64,
    runtime_seconds: Option<i64>,
    cost: Option<f64>,
    error: Option<String>,
    failure_kind: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    provisioned_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    deadline: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt { id: row.id, reason };

        // Unknown statuses must not be silently coerced; that could regress a job.
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let tier = row.tier.parse::<Tier>().map_err(corrupt)?;
        let backend = Backend::parse(&row.backend)
            .ok_or_else(|| corrupt(format!("unknown backend {}", row.backend)))?;
        let hyperparameters: HyperParameters = serde_json::from_value(row.hyperparameters)
            .map_err(|e| corrupt(e.to_string()))?;
        let metrics = serde_json::from_value(row.metrics).unwrap_or_default();

        Ok(JobRecord {
            id: row.id,
            project_id: row.project_id,
            user_id: row.user_id,
            idempotency_key: row.idempotency_key,
            status,
            tier,
            task_type: row.task_type,
            dataset_ref: row.dataset_ref,
            backend,
            machine_class: row.machine_class,
            gpu_class: row.gpu_class,
            cost_per_hour: row.cost_per_hour,
            console_url: row.console_url,
            instance_name: row.instance_name,
            instance_zone: row.instance_zone,
            hyperparameters,
            metrics,
            estimated_minutes: row.estimated_minutes,
            estimated_cost: row.estimated_cost,
            runtime_seconds: row.runtime_seconds,
            cost: row.cost,
            error: row.error,
            failure_kind: row.failure_kind.as_deref().and_then(FailureKind::parse),
            created_at: row.created_at,
            updated_at: row.updated_at,
            provisioned_at: row.provisioned_at,
            completed_at: row.completed_at,
            deadline: row.deadline,
        })
    }
}
