//! Job Service
//!
//! Business logic for quoting, submitting, inspecting, polling and
//! cancelling training jobs.

use anvil_core::domain::estimate::{self, Estimate};
use anvil_core::domain::job::{FailureKind, JobRecord, JobStatus};
use anvil_core::domain::routing::{self, RoutingDecision};
use anvil_core::domain::tier::PolicyViolation;
use anvil_core::dto::job::{PollJob, PollJobResponse, QuoteRequest, QuoteResponse, SubmitJob, SubmitJobResponse};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::events::JobEvent;
use crate::provider::{self, InstanceSpec, naming};
use crate::repository::{JobUpdate, StoreError};
use crate::scheduler::{PollScheduler, PollSettings};
use crate::service::reconciler::Reconciler;
use crate::service::{Deps, Settings};
use crate::storage::JobPaths;
use crate::worker::bootstrap::{self, BootstrapContext};
use crate::worker::synthesizer::{self, SynthesisError};

/// Service error type
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error("QuotaExceededError: at most {limit} job(s) may run in parallel on this tier")]
    QuotaExceeded { limit: u32 },

    #[error("QuotaExceededError: at most {limit} submission(s) per hour on this tier")]
    RateLimited { limit: u32 },

    #[error("UploadError: {0}")]
    Upload(String),

    #[error("ProvisioningError: {0}")]
    Provisioning(String),

    #[error("job {0} was cancelled during submission")]
    Cancelled(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct JobService {
    deps: Deps,
    settings: Settings,
    reconciler: Arc<Reconciler>,
    scheduler: PollScheduler,
}

impl JobService {
    pub fn new(deps: Deps, settings: Settings, poll: PollSettings) -> Self {
        let reconciler = Arc::new(Reconciler::new(deps.clone()));
        let scheduler = PollScheduler::new(Arc::clone(&reconciler), Arc::clone(&deps.jobs), poll);
        Self {
            deps,
            settings,
            reconciler,
            scheduler,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    /// Routing decision and estimate, without creating anything
    pub fn quote(&self, req: &QuoteRequest) -> Result<QuoteResponse, JobError> {
        if !req.dataset_size_mb.is_finite() || req.dataset_size_mb < 0.0 {
            return Err(JobError::Validation("datasetSizeMb must be a non-negative number".to_string()));
        }
        let (decision, estimate) = plan(req);
        Ok(QuoteResponse { decision, estimate })
    }

    /// Accepts a job request and provisions its worker
    ///
    /// Returns once the provider accepted the instance creation; everything
    /// after that is driven by the reconciler.
    pub async fn submit(&self, req: SubmitJob) -> Result<SubmitJobResponse, JobError> {
        validate(&req)?;
        let policy = req.tier.policy();
        policy.check(&req.config, req.dataset_size_mb)?;

        if let Some(key) = &req.idempotency_key {
            if let Some(existing) = self.deps.jobs.find_by_idempotency_key(&req.user_id, key).await? {
                tracing::info!("Submission retry for key {} resolves to job {}", key, existing.id);
                return Ok(submit_response(&existing));
            }
        }

        let program = synthesizer::resolve(&req.script, &req.task_type)?;

        let (decision, estimate) = plan(&req.quote_request());
        let bound = estimate::timeout_bound(&estimate, &decision, self.settings.timeout_policy);
        let now = Utc::now();
        let job = JobRecord {
            id: Uuid::new_v4(),
            project_id: req.project_id.clone(),
            user_id: req.user_id.clone(),
            idempotency_key: req.idempotency_key.clone(),
            status: JobStatus::Preparing,
            tier: req.tier,
            task_type: req.task_type.clone(),
            dataset_ref: req.dataset_ref.clone(),
            backend: decision.backend,
            machine_class: decision.machine_class.clone(),
            gpu_class: decision.gpu_class.clone(),
            cost_per_hour: decision.cost_per_hour,
            console_url: None,
            instance_name: None,
            instance_zone: None,
            hyperparameters: req.config.clone(),
            metrics: HashMap::new(),
            estimated_minutes: estimate.minutes,
            estimated_cost: estimate.cost,
            runtime_seconds: None,
            cost: None,
            error: None,
            failure_kind: None,
            created_at: now,
            updated_at: now,
            provisioned_at: None,
            completed_at: None,
            deadline: now + bound,
        };

        let acquired = self
            .deps
            .quotas
            .acquire_slot(&job.user_id, job.id, policy.max_parallel_jobs, self.settings.quota_slot_ttl)
            .await?;
        if !acquired {
            return Err(JobError::QuotaExceeded {
                limit: policy.max_parallel_jobs,
            });
        }

        // Only submissions holding a slot count against the hourly allowance
        let submissions = match self
            .deps
            .quotas
            .hit(&format!("submit:{}", job.user_id), Duration::hours(1))
            .await
        {
            Ok(n) => n,
            Err(e) => {
                self.release(job.id).await;
                return Err(e.into());
            }
        };
        if submissions > u64::from(policy.max_submissions_per_hour) {
            self.release(job.id).await;
            return Err(JobError::RateLimited {
                limit: policy.max_submissions_per_hour,
            });
        }

        if let Err(e) = self.deps.jobs.insert(&job).await {
            self.release(job.id).await;
            return match (e, &job.idempotency_key) {
                // A concurrent retry with the same key got there first
                (StoreError::Conflict(_), Some(key)) => {
                    match self.deps.jobs.find_by_idempotency_key(&job.user_id, key).await? {
                        Some(existing) => Ok(submit_response(&existing)),
                        None => Err(JobError::Store(StoreError::Conflict(key.clone()))),
                    }
                }
                (e, _) => Err(e.into()),
            };
        }

        tracing::info!(
            "Job {} accepted for project {} on {} ({})",
            job.id,
            job.project_id,
            decision.machine_class,
            decision.justification
        );

        self.launch(&job, &req.dataset_ref, program).await?;
        Ok(submit_response(&job))
    }

    /// Uploads the program and creates the instance
    async fn launch(&self, job: &JobRecord, dataset_ref: &str, program: String) -> Result<(), JobError> {
        let paths = JobPaths::new(&job.project_id, job.id);

        self.step(job.id, JobStatus::Preparing, JobStatus::Uploading).await?;
        if let Err(e) = self
            .deps
            .objects
            .put(&paths.script(), program.into_bytes(), "text/x-python")
            .await
        {
            let message = format!("UploadError: could not store training script: {}", e);
            self.reconciler
                .terminate(job.id, FailureKind::Submission, &message)
                .await?;
            return Err(JobError::Upload(e.to_string()));
        }

        self.step(job.id, JobStatus::Uploading, JobStatus::Submitting).await?;

        let startup_script = bootstrap::render(BootstrapContext {
            job_id: job.id,
            script_uri: self.deps.objects.uri(&paths.script()),
            dataset_uri: dataset_ref.to_string(),
            status_uri: self.deps.objects.uri(&paths.status()),
            output_uri: self.deps.objects.uri(&paths.output()),
            env: job.hyperparameters.env_overrides(),
            gpu: job.gpu_class.is_some(),
        });
        let spec = InstanceSpec {
            name: naming::instance_name(job.id, Utc::now()),
            job_id: job.id,
            machine_class: job.machine_class.clone(),
            gpu_class: job.gpu_class.clone(),
            startup_script,
        };

        let handle = match self.deps.provider.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                // The operation may have been accepted even though we saw an error
                provider::delete_best_effort(self.deps.provider.as_ref(), &spec.name, self.deps.provider.zone())
                    .await;
                let message = format!("ProvisioningError: {}", e);
                self.reconciler
                    .terminate(job.id, FailureKind::Provisioning, &message)
                    .await?;
                return Err(JobError::Provisioning(e.to_string()));
            }
        };

        let update = JobUpdate {
            console_url: Some(handle.console_url.clone()),
            instance_name: Some(handle.name.clone()),
            instance_zone: Some(handle.zone.clone()),
            provisioned_at: Some(Utc::now()),
            ..JobUpdate::status(JobStatus::Provisioning)
        };
        let attached = self
            .deps
            .jobs
            .update_if_status(job.id, JobStatus::Submitting, &update)
            .await?;
        if !attached {
            tracing::warn!("Job {} ended during provisioning, removing {}", job.id, handle.name);
            provider::delete_best_effort(self.deps.provider.as_ref(), &handle.name, &handle.zone).await;
            return Err(JobError::Cancelled(job.id));
        }

        self.deps.events.publish(JobEvent::Submitted {
            job_id: job.id,
            project_id: job.project_id.clone(),
            instance_name: handle.name.clone(),
        });
        self.scheduler.track(job.id);

        Ok(())
    }

    async fn step(&self, job_id: Uuid, from: JobStatus, to: JobStatus) -> Result<(), JobError> {
        if self
            .deps
            .jobs
            .update_if_status(job_id, from, &JobUpdate::status(to))
            .await?
        {
            tracing::debug!("Job {} {} -> {}", job_id, from, to);
            Ok(())
        } else {
            Err(JobError::Cancelled(job_id))
        }
    }

    async fn release(&self, job_id: Uuid) {
        if let Err(e) = self.deps.quotas.release_slot(job_id).await {
            tracing::warn!("Failed to release quota slot of job {}: {}", job_id, e);
        }
    }

    /// Get a job by ID
    pub async fn get(&self, id: Uuid) -> Result<JobRecord, JobError> {
        self.deps.jobs.get(id).await?.ok_or(JobError::NotFound(id))
    }

    /// List jobs by project, newest first
    pub async fn list_by_project(&self, project_id: &str) -> Result<Vec<JobRecord>, JobError> {
        Ok(self.deps.jobs.list_by_project(project_id).await?)
    }

    /// Reconciles a job on demand
    pub async fn poll(&self, req: &PollJob) -> Result<PollJobResponse, JobError> {
        let job = self.get(req.job_id).await?;
        if job.project_id != req.project_id {
            return Err(JobError::NotFound(req.job_id));
        }
        self.reconciler.poll(req.job_id).await
    }

    /// Deletes the instance, marks the job failed and stops polling
    ///
    /// Cancelling a job that already finished is a no-op.
    pub async fn cancel(&self, id: Uuid) -> Result<(), JobError> {
        self.get(id).await?;
        self.reconciler
            .terminate(id, FailureKind::Cancelled, "Cancelled by user")
            .await?;
        self.scheduler.stop(id);
        Ok(())
    }
}

fn validate(req: &SubmitJob) -> Result<(), JobError> {
    let required = [
        ("projectId", &req.project_id),
        ("userId", &req.user_id),
        ("datasetRef", &req.dataset_ref),
        ("taskType", &req.task_type),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(JobError::Validation(format!("{} cannot be empty", field)));
        }
    }
    if !req.dataset_size_mb.is_finite() || req.dataset_size_mb < 0.0 {
        return Err(JobError::Validation("datasetSizeMb must be a non-negative number".to_string()));
    }
    if let Some(key) = &req.idempotency_key {
        if key.trim().is_empty() || key.len() > 255 {
            return Err(JobError::Validation("idempotencyKey must be 1 to 255 characters".to_string()));
        }
    }
    Ok(())
}

fn plan(req: &QuoteRequest) -> (RoutingDecision, Estimate) {
    let decision = routing::route(req.tier, req.dataset_type, &req.task_type, req.prefer_gpu);
    let estimate = estimate::estimate(&decision, req.dataset_size_mb, req.epochs);
    (decision, estimate)
}

fn submit_response(job: &JobRecord) -> SubmitJobResponse {
    SubmitJobResponse {
        job_id: job.id,
        estimated_minutes: job.estimated_minutes,
        estimated_cost: job.estimated_cost,
    }
}
