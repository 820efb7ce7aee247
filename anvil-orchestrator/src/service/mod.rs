//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between stores, the object store and the compute
//! provider, and contain domain logic.

pub mod job;
pub mod reconciler;

use anvil_core::domain::estimate::TimeoutPolicy;
use std::sync::Arc;

use crate::config::Config;
use crate::events::EventBus;
use crate::provider::ComputeProvider;
use crate::repository::{JobStore, QuotaStore};
use crate::storage::ObjectStore;

// Re-export for convenience
pub use job::{JobError, JobService};
pub use reconciler::Reconciler;

/// Collaborators shared by every service
#[derive(Clone)]
pub struct Deps {
    pub jobs: Arc<dyn JobStore>,
    pub quotas: Arc<dyn QuotaStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub provider: Arc<dyn ComputeProvider>,
    pub events: EventBus,
}

/// Tunables the job service reads on each submission
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub timeout_policy: TimeoutPolicy,
    pub quota_slot_ttl: chrono::Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout_policy: TimeoutPolicy::default(),
            quota_slot_ttl: chrono::Duration::hours(12),
        }
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            timeout_policy: config.timeout_policy(),
            quota_slot_ttl: chrono::Duration::from_std(config.quota_slot_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(12)),
        }
    }
}
