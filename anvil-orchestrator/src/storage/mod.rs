//! Object storage and the Status Channel
//!
//! Every job owns a prefix in the artifact bucket. The orchestrator writes
//! the training program there before provisioning; after that the worker is
//! the only writer and the orchestrator only reads.

pub mod gcs;
pub mod memory;

use anvil_core::domain::status::StatusDocument;
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use crate::credentials::CredentialsError;

pub use gcs::GcsObjectStore;
pub use memory::MemoryObjectStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("object store returned {status} for {key}: {body}")]
    Status { status: u16, key: String, body: String },

    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    #[error("invalid object store url: {0}")]
    InvalidUrl(String),
}

/// Durable key/value object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads an object; `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Location of `key` as the worker addresses it
    fn uri(&self, key: &str) -> String;
}

/// Object keys of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    prefix: String,
}

impl JobPaths {
    pub fn new(project_id: &str, job_id: Uuid) -> Self {
        Self {
            prefix: format!("jobs/{}/{}", project_id, job_id),
        }
    }

    pub fn script(&self) -> String {
        format!("{}/script.py", self.prefix)
    }

    pub fn status(&self) -> String {
        format!("{}/status.json", self.prefix)
    }

    /// Directory the worker uploads artifacts into
    pub fn output(&self) -> String {
        format!("{}/output/", self.prefix)
    }

    pub fn metrics(&self) -> String {
        format!("{}/output/metrics.json", self.prefix)
    }

    pub fn training_log(&self) -> String {
        format!("{}/output/training.log", self.prefix)
    }
}

/// Errors reading the Status Channel
///
/// Always transient from the reconciler's point of view: logged and retried
/// at the next tick, never surfaced as a job failure.
#[derive(Debug, thiserror::Error)]
#[error("status channel read failed for {key}: {source}")]
pub struct PollError {
    pub key: String,
    #[source]
    pub source: StorageError,
}

/// Read side of the per-job status location
#[derive(Clone)]
pub struct StatusChannel {
    store: std::sync::Arc<dyn ObjectStore>,
}

impl StatusChannel {
    pub fn new(store: std::sync::Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Latest status document; absent and malformed documents both read as `None`
    pub async fn read(&self, paths: &JobPaths) -> Result<Option<StatusDocument>, PollError> {
        let key = paths.status();
        let bytes = self.fetch(&key).await?;

        Ok(bytes.and_then(|bytes| {
            let doc = StatusDocument::parse(&bytes);
            if doc.is_none() {
                tracing::warn!("Ignoring malformed status document at {}", key);
            }
            doc
        }))
    }

    /// Metrics uploaded by the worker, if any
    pub async fn read_metrics(
        &self,
        paths: &JobPaths,
    ) -> Result<Option<HashMap<String, serde_json::Value>>, PollError> {
        let key = paths.metrics();
        let bytes = self.fetch(&key).await?;

        Ok(bytes.and_then(|bytes| match serde_json::from_slice(&bytes) {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!("Ignoring unreadable metrics at {}: {}", key, e);
                None
            }
        }))
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, PollError> {
        self.store.get(key).await.map_err(|source| PollError {
            key: key.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_job_paths() {
        let id = Uuid::nil();
        let paths = JobPaths::new("proj", id);
        assert_eq!(
            paths.status(),
            "jobs/proj/00000000-0000-0000-0000-000000000000/status.json"
        );
        assert!(paths.metrics().starts_with(&paths.output()));
        assert!(paths.training_log().ends_with("output/training.log"));
    }

    #[tokio::test]
    async fn test_absent_and_malformed_documents_read_as_none() {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let channel = StatusChannel::new(store.clone());
        let paths = JobPaths::new("proj", Uuid::new_v4());

        assert!(channel.read(&paths).await.unwrap().is_none());

        store.insert(&paths.status(), br#"{"status": "runn"#.to_vec());
        assert!(channel.read(&paths).await.unwrap().is_none());

        store.insert(&paths.status(), br#"{"status":"running","phase":"training"}"#.to_vec());
        let doc = channel.read(&paths).await.unwrap().unwrap();
        assert_eq!(doc.phase, "training");
    }

    #[tokio::test]
    async fn test_metrics_read() {
        let store = Arc::new(MemoryObjectStore::new("bucket"));
        let channel = StatusChannel::new(store.clone());
        let paths = JobPaths::new("proj", Uuid::new_v4());

        store.insert(&paths.metrics(), br#"{"accuracy": 0.91}"#.to_vec());
        let metrics = channel.read_metrics(&paths).await.unwrap().unwrap();
        assert_eq!(metrics["accuracy"], serde_json::json!(0.91));
    }
}
