//! Quota Repository
//!
//! Per-user parallel-job slots and fixed-window rate counters, kept in
//! PostgreSQL so limits survive orchestrator restarts.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{QuotaStore, StoreError, window_start};

/// PostgreSQL-backed [`QuotaStore`]
#[derive(Debug, Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn acquire_slot(
        &self,
        user_id: &str,
        job_id: Uuid,
        limit: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Serializes slot accounting per user for the rest of the transaction
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let held: Option<(Uuid,)> =
            sqlx::query_as("SELECT job_id FROM quota_slots WHERE job_id = $1 AND expires_at > $2")
                .bind(job_id)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?;
        if held.is_some() {
            tx.commit().await?;
            return Ok(true);
        }

        sqlx::query("DELETE FROM quota_slots WHERE user_id = $1 AND expires_at <= $2")
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM quota_slots WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;

        if count >= i64::from(limit) {
            tx.commit().await?;
            tracing::debug!("User {} holds {} of {} slot(s)", user_id, count, limit);
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO quota_slots (job_id, user_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_id) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(job_id)
        .bind(user_id)
        .bind(now + ttl)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn release_slot(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM quota_slots WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn hit(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let start = window_start(Utc::now(), window);

        sqlx::query("DELETE FROM rate_counters WHERE key = $1 AND window_start < $2")
            .bind(key)
            .bind(start)
            .execute(&self.pool)
            .await?;

        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO rate_counters (key, window_start, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (key, window_start) DO UPDATE SET count = rate_counters.count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(start)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }
}
