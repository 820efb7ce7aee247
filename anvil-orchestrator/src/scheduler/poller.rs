//! Job poller
//!
//! One task per active job. Each task waits out a grace period, then asks
//! the reconciler to advance the job every interval until the job reaches a
//! terminal status. A shared semaphore caps concurrent status reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::repository::{JobStore, StoreError};
use crate::service::job::JobError;
use crate::service::reconciler::Reconciler;

/// Polling cadence
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub grace_period: Duration,
    pub max_concurrent: usize,
}

impl From<&Config> for PollSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.poll_interval,
            grace_period: config.poll_grace_period,
            max_concurrent: config.max_concurrent_polls,
        }
    }
}

/// Owns the per-job polling tasks
pub struct PollScheduler {
    reconciler: Arc<Reconciler>,
    jobs: Arc<dyn JobStore>,
    semaphore: Arc<Semaphore>,
    settings: PollSettings,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl PollScheduler {
    pub fn new(reconciler: Arc<Reconciler>, jobs: Arc<dyn JobStore>, settings: PollSettings) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            reconciler,
            jobs,
            semaphore,
            settings,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Starts polling a job unless a task for it is already running
    pub fn track(&self, job_id: Uuid) {
        let mut tasks = self.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        if tasks.contains_key(&job_id) {
            debug!("Job {} is already tracked", job_id);
            return;
        }

        let handle = tokio::spawn(Self::poll_until_terminal(
            job_id,
            Arc::clone(&self.reconciler),
            Arc::clone(&self.semaphore),
            self.settings,
        ));
        tasks.insert(job_id, handle);
    }

    /// Stops polling a job; stopping an untracked job is a no-op
    pub fn stop(&self, job_id: Uuid) {
        if let Some(handle) = self.lock().remove(&job_id) {
            debug!("Stopped polling job {}", job_id);
            handle.abort();
        }
    }

    /// Re-establishes polling for every non-terminal job in the store
    pub async fn resume(&self) -> Result<usize, StoreError> {
        let active = self.jobs.list_active().await?;
        for job in &active {
            self.track(job.id);
        }
        info!("Resumed polling for {} active job(s)", active.len());
        Ok(active.len())
    }

    /// Number of polling tasks still running
    pub fn tracked(&self) -> usize {
        let mut tasks = self.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.len()
    }

    /// Aborts every polling task
    pub fn shutdown(&self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn poll_until_terminal(
        job_id: Uuid,
        reconciler: Arc<Reconciler>,
        semaphore: Arc<Semaphore>,
        settings: PollSettings,
    ) {
        time::sleep(settings.grace_period).await;

        let mut ticker = time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };

            match reconciler.poll(job_id).await {
                Ok(resp) if resp.status.is_terminal() => {
                    debug!("Job {} is {}, polling stops", job_id, resp.status);
                    return;
                }
                Ok(_) => {}
                Err(JobError::NotFound(_)) => {
                    warn!("Job {} disappeared, polling stops", job_id);
                    return;
                }
                Err(e) => {
                    warn!("Poll of job {} failed: {}", job_id, e);
                }
            }
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
