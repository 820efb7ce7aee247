//! In-memory stores
//!
//! Same contracts as the PostgreSQL repositories, held in process memory.
//! Used by tests and local runs without a database.

use anvil_core::domain::job::{JobRecord, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{JobStore, JobUpdate, QuotaStore, StoreError, window_start};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut jobs = lock(&self.jobs);
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        if let Some(key) = &job.idempotency_key {
            let duplicate = jobs
                .values()
                .any(|j| j.user_id == job.user_id && j.idempotency_key.as_ref() == Some(key));
            if duplicate {
                return Err(StoreError::Conflict(format!("idempotency key {} already used", key)));
            }
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(lock(&self.jobs).get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        Ok(lock(&self.jobs)
            .values()
            .find(|j| j.user_id == user_id && j.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn list_by_project(&self, project_id: &str) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs: Vec<JobRecord> = lock(&self.jobs)
            .values()
            .filter(|j| j.project_id == project_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn list_active(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs: Vec<JobRecord> = lock(&self.jobs)
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        update: &JobUpdate,
    ) -> Result<bool, StoreError> {
        if !expected.can_transition_to(update.status) {
            return Ok(false);
        }
        let mut jobs = lock(&self.jobs);
        match jobs.get_mut(&id) {
            Some(job) if job.status == expected => {
                update.apply(job, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Debug, Default)]
struct QuotaState {
    slots: HashMap<Uuid, (String, DateTime<Utc>)>,
    counters: HashMap<String, (DateTime<Utc>, u64)>,
}

#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    state: Mutex<QuotaState>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots currently held by a user
    pub fn slots_held(&self, user_id: &str) -> usize {
        let now = Utc::now();
        lock(&self.state)
            .slots
            .values()
            .filter(|(owner, expires)| owner == user_id && *expires > now)
            .count()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn acquire_slot(
        &self,
        user_id: &str,
        job_id: Uuid,
        limit: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        state.slots.retain(|_, (_, expires)| *expires > now);

        if state.slots.contains_key(&job_id) {
            return Ok(true);
        }
        let held = state
            .slots
            .values()
            .filter(|(owner, _)| owner == user_id)
            .count();
        if held >= limit as usize {
            return Ok(false);
        }
        state.slots.insert(job_id, (user_id.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_slot(&self, job_id: Uuid) -> Result<(), StoreError> {
        lock(&self.state).slots.remove(&job_id);
        Ok(())
    }

    async fn hit(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let start = window_start(Utc::now(), window);
        let mut state = lock(&self.state);
        let entry = state.counters.entry(key.to_string()).or_insert((start, 0));
        if entry.0 != start {
            *entry = (start, 0);
        }
        entry.1 += 1;
        Ok(entry.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slot_acquire_is_idempotent_per_job() {
        let store = MemoryQuotaStore::new();
        let job = Uuid::new_v4();
        assert!(store.acquire_slot("u1", job, 1, Duration::hours(1)).await.unwrap());
        assert!(store.acquire_slot("u1", job, 1, Duration::hours(1)).await.unwrap());
        assert_eq!(store.slots_held("u1"), 1);

        assert!(!store
            .acquire_slot("u1", Uuid::new_v4(), 1, Duration::hours(1))
            .await
            .unwrap());

        store.release_slot(job).await.unwrap();
        store.release_slot(job).await.unwrap();
        assert_eq!(store.slots_held("u1"), 0);
    }

    #[tokio::test]
    async fn test_expired_slots_do_not_count() {
        let store = MemoryQuotaStore::new();
        assert!(store
            .acquire_slot("u1", Uuid::new_v4(), 1, Duration::seconds(-1))
            .await
            .unwrap());
        assert!(store
            .acquire_slot("u1", Uuid::new_v4(), 1, Duration::hours(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_hit_counts_within_window() {
        let store = MemoryQuotaStore::new();
        assert_eq!(store.hit("submit:u1", Duration::hours(1)).await.unwrap(), 1);
        assert_eq!(store.hit("submit:u1", Duration::hours(1)).await.unwrap(), 2);
        assert_eq!(store.hit("submit:u2", Duration::hours(1)).await.unwrap(), 1);
    }
}
