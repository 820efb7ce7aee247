//! Provisioner
//!
//! Creates the ephemeral worker instance with the bootstrap program as
//! boot-time metadata, and force-deletes it on cancellation or timeout.

pub mod gce;
pub mod naming;

use async_trait::async_trait;
use uuid::Uuid;

use crate::credentials::CredentialsError;

pub use gce::ComputeEngine;

/// Everything needed to create one worker instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub name: String,
    pub job_id: Uuid,
    pub machine_class: String,
    /// Accelerator type, for GPU-backed jobs
    pub gpu_class: Option<String>,
    pub startup_script: String,
}

/// A created instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub name: String,
    pub zone: String,
    pub console_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("compute request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("compute api returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    #[error("invalid instance name: {0}")]
    InvalidName(String),
}

/// Compute provider seam
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Creates the instance; returns once the provider accepted the operation
    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceHandle, ProvisionError>;

    /// Forced deletion; an already-deleted instance is not an error
    async fn delete(&self, name: &str, zone: &str) -> Result<(), ProvisionError>;

    /// Zone new instances are created in
    fn zone(&self) -> &str;
}

/// Deletes an instance, logging instead of failing
pub async fn delete_best_effort(provider: &dyn ComputeProvider, name: &str, zone: &str) {
    match provider.delete(name, zone).await {
        Ok(()) => tracing::info!("Deleted instance {} in {}", name, zone),
        Err(e) => tracing::warn!("Failed to delete instance {} in {}: {}", name, zone, e),
    }
}
