//! In-memory object store

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{ObjectStore, StorageError};

/// Process-local stand-in for a bucket
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Writes an object directly, as the worker would
    pub fn insert(&self, key: &str, body: Vec<u8>) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), body);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        self.insert(key, body);
        Ok(())
    }

    fn uri(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket, key)
    }
}
