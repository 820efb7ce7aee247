use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            project_id VARCHAR(255) NOT NULL,
            user_id VARCHAR(255) NOT NULL,
            idempotency_key VARCHAR(255),
            status VARCHAR(50) NOT NULL,
            tier VARCHAR(50) NOT NULL,
            task_type VARCHAR(255) NOT NULL,
            dataset_ref TEXT NOT NULL,
            backend VARCHAR(50) NOT NULL,
            machine_class VARCHAR(100) NOT NULL,
            gpu_class VARCHAR(100),
            cost_per_hour DOUBLE PRECISION NOT NULL,
            console_url TEXT,
            instance_name VARCHAR(63),
            instance_zone VARCHAR(100),
            hyperparameters JSONB NOT NULL DEFAULT '{}',
            metrics JSONB NOT NULL DEFAULT '{}',
            estimated_minutes DOUBLE PRECISION NOT NULL,
            estimated_cost DOUBLE PRECISION NOT NULL,
            runtime_seconds BIGINT,
            cost DOUBLE PRECISION,
            error TEXT,
            failure_kind VARCHAR(50),
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            provisioned_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            deadline TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create parallel-job quota slots
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quota_slots (
            job_id UUID PRIMARY KEY,
            user_id VARCHAR(255) NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create fixed-window rate counters
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rate_counters (
            key VARCHAR(255) NOT NULL,
            window_start TIMESTAMPTZ NOT NULL,
            count BIGINT NOT NULL,
            PRIMARY KEY (key, window_start)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_project_id ON jobs(project_id, created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_idempotency ON jobs(user_id, idempotency_key) WHERE idempotency_key IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_quota_slots_user ON quota_slots(user_id, expires_at)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
