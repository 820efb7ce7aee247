//! Completion Reconciler
//!
//! Reads the Status Channel, maps what the worker wrote onto the canonical
//! state machine and commits the result with compare-and-set updates.
//!
//! Only the writer whose terminal compare-and-set succeeds releases the
//! quota slot and publishes the terminal event. Every other writer (a
//! concurrent poll, a late cancellation, a resumed task after a restart)
//! observes the terminal record and does nothing.

use anvil_core::domain::job::{FailureKind, JobRecord, JobStatus};
use anvil_core::domain::status::{StatusDocument, WorkerReport};
use anvil_core::dto::job::PollJobResponse;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::events::JobEvent;
use crate::provider;
use crate::repository::JobUpdate;
use crate::service::Deps;
use crate::service::job::JobError;
use crate::storage::{JobPaths, StatusChannel};

pub struct Reconciler {
    deps: Deps,
    channel: StatusChannel,
}

impl Reconciler {
    pub fn new(deps: Deps) -> Self {
        let channel = StatusChannel::new(deps.objects.clone());
        Self { deps, channel }
    }

    /// Runs one reconciliation step for a job
    pub async fn poll(&self, job_id: Uuid) -> Result<PollJobResponse, JobError> {
        let job = self.load(job_id).await?;
        if job.status.is_terminal() {
            return Ok(response(&job, false));
        }

        let now = Utc::now();
        let past_deadline = now > job.deadline;

        // The submission path still owns the record
        if !job.status.is_instance_backed() {
            if past_deadline {
                return self.time_out(&job).await;
            }
            return Ok(response(&job, false));
        }

        let paths = JobPaths::new(&job.project_id, job.id);
        let doc = match self.channel.read(&paths).await {
            Ok(Some(doc)) => doc,
            Ok(None) if past_deadline => return self.time_out(&job).await,
            Ok(None) => return Ok(response(&job, false)),
            Err(e) if past_deadline => {
                tracing::warn!("Could not read status of overdue job {}: {}", job_id, e);
                return self.time_out(&job).await;
            }
            Err(e) => {
                tracing::warn!("Poll of job {} failed, retrying next tick: {}", job_id, e);
                return Ok(response(&job, false));
            }
        };

        // A result the worker wrote before the deadline still counts
        if past_deadline && !finished_in_time(&doc, job.deadline) {
            return self.time_out(&job).await;
        }

        match doc.report() {
            WorkerReport::Progress(next) => self.advance(job, next).await,
            WorkerReport::Succeeded => {
                let completed_at = doc.completed_at().unwrap_or(now);
                let (runtime_seconds, cost) = finalize(&job, completed_at);
                let update = JobUpdate {
                    metrics: Some(self.metrics(&paths).await),
                    runtime_seconds,
                    cost,
                    completed_at: Some(completed_at),
                    ..JobUpdate::status(JobStatus::Succeeded)
                };
                self.finish(job, update).await
            }
            WorkerReport::Failed(error) => {
                let completed_at = doc.completed_at().unwrap_or(now);
                let (runtime_seconds, cost) = finalize(&job, completed_at);
                let update = JobUpdate {
                    metrics: Some(self.metrics(&paths).await),
                    runtime_seconds,
                    cost,
                    completed_at: Some(completed_at),
                    ..JobUpdate::failed(FailureKind::Worker, error)
                };
                self.finish(job, update).await
            }
            WorkerReport::Unrecognized => {
                tracing::debug!(
                    "Job {} has unrecognized status {:?}/{:?}",
                    job_id,
                    doc.status,
                    doc.phase
                );
                Ok(response(&job, false))
            }
        }
    }

    /// Moves a job to `Failed` and tears its instance down
    ///
    /// Returns whether this call performed the terminal transition. Calling
    /// it on a terminal job is a no-op.
    pub async fn terminate(&self, job_id: Uuid, kind: FailureKind, message: &str) -> Result<bool, JobError> {
        let job = self.load(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        let (runtime_seconds, cost) = if job.provisioned_at.is_some() {
            finalize(&job, now)
        } else {
            (None, None)
        };
        let update = JobUpdate {
            runtime_seconds,
            cost,
            completed_at: Some(now),
            ..JobUpdate::failed(kind, message)
        };

        match self.commit_terminal(job, &update).await? {
            Some(last_seen) => {
                tracing::info!("Job {} failed ({}): {}", job_id, kind.as_str(), message);
                if let (Some(name), Some(zone)) = (&last_seen.instance_name, &last_seen.instance_zone) {
                    provider::delete_best_effort(self.deps.provider.as_ref(), name, zone).await;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn time_out(&self, job: &JobRecord) -> Result<PollJobResponse, JobError> {
        let minutes = (job.deadline - job.created_at).num_minutes();
        let message = format!(
            "Job exceeded expected duration of {} minutes (estimated {:.1} minutes)",
            minutes, job.estimated_minutes
        );
        let changed = self.terminate(job.id, FailureKind::TimedOut, &message).await?;
        let current = self.load(job.id).await?;
        Ok(response(&current, changed))
    }

    async fn load(&self, job_id: Uuid) -> Result<JobRecord, JobError> {
        self.deps
            .jobs
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    async fn advance(&self, job: JobRecord, next: JobStatus) -> Result<PollJobResponse, JobError> {
        // Older or equal phases are stale reads; never regress
        if !job.status.can_transition_to(next) {
            return Ok(response(&job, false));
        }

        let won = self
            .deps
            .jobs
            .update_if_status(job.id, job.status, &JobUpdate::status(next))
            .await?;
        if !won {
            let current = self.load(job.id).await?;
            return Ok(response(&current, false));
        }

        tracing::info!("Job {} advanced {} -> {}", job.id, job.status, next);
        self.deps.events.publish(JobEvent::StatusChanged {
            job_id: job.id,
            from: job.status,
            to: next,
        });

        let current = self.load(job.id).await?;
        Ok(response(&current, true))
    }

    async fn finish(&self, job: JobRecord, update: JobUpdate) -> Result<PollJobResponse, JobError> {
        let job_id = job.id;
        let changed = self.commit_terminal(job, &update).await?.is_some();
        let current = self.load(job_id).await?;
        Ok(response(&current, changed))
    }

    /// Compare-and-set into a terminal status, firing side effects on success
    ///
    /// Retries while other writers advance the record through non-terminal
    /// statuses. Returns the record as last seen before the winning write,
    /// or `None` if another writer committed a terminal status first.
    async fn commit_terminal(&self, mut job: JobRecord, update: &JobUpdate) -> Result<Option<JobRecord>, JobError> {
        loop {
            if self
                .deps
                .jobs
                .update_if_status(job.id, job.status, update)
                .await?
            {
                break;
            }
            job = self.load(job.id).await?;
            if job.status.is_terminal() {
                tracing::debug!("Job {} already terminal ({})", job.id, job.status);
                return Ok(None);
            }
        }

        if let Err(e) = self.deps.quotas.release_slot(job.id).await {
            tracing::warn!("Failed to release quota slot of job {}: {}", job.id, e);
        }

        let event = match update.status {
            JobStatus::Succeeded => JobEvent::Succeeded {
                job_id: job.id,
                project_id: job.project_id.clone(),
                metrics: update.metrics.clone().unwrap_or_default(),
                runtime_seconds: update.runtime_seconds,
                cost: update.cost,
            },
            _ => JobEvent::Failed {
                job_id: job.id,
                project_id: job.project_id.clone(),
                kind: update.failure_kind.unwrap_or(FailureKind::Worker),
                error: update.error.clone().unwrap_or_default(),
            },
        };
        tracing::info!("Job {} reached {} from {}", job.id, update.status, job.status);
        self.deps.events.publish(event);

        Ok(Some(job))
    }

    async fn metrics(&self, paths: &JobPaths) -> HashMap<String, serde_json::Value> {
        match self.channel.read_metrics(paths).await {
            Ok(metrics) => metrics.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Could not load metrics: {}", e);
                HashMap::new()
            }
        }
    }
}

/// Actual runtime and cost, measured from provisioning
fn finalize(job: &JobRecord, completed_at: DateTime<Utc>) -> (Option<i64>, Option<f64>) {
    let started = job.provisioned_at.unwrap_or(job.created_at);
    let seconds = (completed_at - started).num_seconds().max(0);
    let cost = (seconds as f64 / 3600.0 * job.cost_per_hour * 100.0).round() / 100.0;
    (Some(seconds), Some(cost))
}

/// Whether the worker reported a terminal result no later than `deadline`
///
/// A terminal document without `completedAt` is taken at its word.
fn finished_in_time(doc: &StatusDocument, deadline: DateTime<Utc>) -> bool {
    match doc.report() {
        WorkerReport::Succeeded | WorkerReport::Failed(_) => {
            doc.completed_at().is_none_or(|at| at <= deadline)
        }
        _ => false,
    }
}

fn response(job: &JobRecord, changed: bool) -> PollJobResponse {
    PollJobResponse {
        status: job.status,
        metrics: job.status.is_terminal().then(|| job.metrics.clone()),
        error: job.error.clone(),
        failure_kind: job.failure_kind,
        changed,
    }
}
