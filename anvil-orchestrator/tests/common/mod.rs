//! Shared harness: the job service over in-memory stores and a recording
//! compute provider

#![allow(dead_code)]

use anvil_core::domain::job::HyperParameters;
use anvil_core::domain::routing::DatasetType;
use anvil_core::domain::script::ScriptSource;
use anvil_core::domain::tier::Tier;
use anvil_core::dto::job::SubmitJob;
use anvil_orchestrator::events::EventBus;
use anvil_orchestrator::provider::{ComputeProvider, InstanceHandle, InstanceSpec, ProvisionError};
use anvil_orchestrator::repository::{MemoryJobStore, MemoryQuotaStore};
use anvil_orchestrator::scheduler::PollSettings;
use anvil_orchestrator::service::{Deps, JobService, Settings};
use anvil_orchestrator::storage::{JobPaths, MemoryObjectStore};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const ZONE: &str = "test-zone-a";

/// Compute provider that records every call and tracks live instances
#[derive(Default)]
pub struct RecordingProvider {
    pub fail_create: bool,
    created: Mutex<Vec<InstanceSpec>>,
    deleted: Mutex<Vec<String>>,
    live: Mutex<HashSet<String>>,
}

impl RecordingProvider {
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<InstanceSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

#[async_trait]
impl ComputeProvider for RecordingProvider {
    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceHandle, ProvisionError> {
        if self.fail_create {
            return Err(ProvisionError::Rejected {
                status: 403,
                message: "Quota 'GPUS_ALL_REGIONS' exceeded".to_string(),
            });
        }
        self.created.lock().unwrap().push(spec.clone());
        self.live.lock().unwrap().insert(spec.name.clone());
        Ok(InstanceHandle {
            name: spec.name.clone(),
            zone: ZONE.to_string(),
            console_url: format!("https://console.example/{}", spec.name),
        })
    }

    async fn delete(&self, name: &str, _zone: &str) -> Result<(), ProvisionError> {
        self.deleted.lock().unwrap().push(name.to_string());
        self.live.lock().unwrap().remove(name);
        Ok(())
    }

    fn zone(&self) -> &str {
        ZONE
    }
}

pub struct Harness {
    pub service: Arc<JobService>,
    pub jobs: Arc<MemoryJobStore>,
    pub quotas: Arc<MemoryQuotaStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub provider: Arc<RecordingProvider>,
    pub events: EventBus,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(RecordingProvider::default(), Settings::default())
    }

    pub fn build(provider: RecordingProvider, settings: Settings) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        let quotas = Arc::new(MemoryQuotaStore::new());
        let objects = Arc::new(MemoryObjectStore::new("anvil-test"));
        let provider = Arc::new(provider);
        let events = EventBus::new();

        let deps = Deps {
            jobs: jobs.clone(),
            quotas: quotas.clone(),
            objects: objects.clone(),
            provider: provider.clone(),
            events: events.clone(),
        };
        // Background polling stays out of the way; tests drive polls directly
        let poll = PollSettings {
            interval: Duration::from_secs(3600),
            grace_period: Duration::from_secs(3600),
            max_concurrent: 4,
        };

        Self {
            service: Arc::new(JobService::new(deps, settings, poll)),
            jobs,
            quotas,
            objects,
            provider,
            events,
        }
    }

    /// Writes the worker's status document for a job
    pub fn write_status(&self, job_id: Uuid, json: &str) {
        let paths = JobPaths::new("proj-1", job_id);
        self.objects.insert(&paths.status(), json.as_bytes().to_vec());
    }

    pub fn write_metrics(&self, job_id: Uuid, json: &str) {
        let paths = JobPaths::new("proj-1", job_id);
        self.objects.insert(&paths.metrics(), json.as_bytes().to_vec());
    }
}

pub fn submission(user: &str) -> SubmitJob {
    SubmitJob {
        project_id: "proj-1".to_string(),
        user_id: user.to_string(),
        script: ScriptSource::Source("print('accuracy: 0.9')".to_string()),
        config: HyperParameters {
            epochs: Some(5),
            ..HyperParameters::default()
        },
        dataset_ref: "gs://datasets/iris.csv".to_string(),
        dataset_type: DatasetType::Tabular,
        dataset_size_mb: 2.0,
        task_type: "classification".to_string(),
        tier: Tier::Free,
        idempotency_key: None,
    }
}
