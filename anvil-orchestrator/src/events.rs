//! Job lifecycle events
//!
//! Collaborators (model registry, notifier, real-time mirror) subscribe to a
//! broadcast channel. Terminal events are published only by the writer that
//! won the terminal compare-and-set, so each job emits exactly one.

use anvil_core::domain::job::{FailureKind, JobStatus};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Submitted {
        job_id: Uuid,
        project_id: String,
        instance_name: String,
    },
    StatusChanged {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    Succeeded {
        job_id: Uuid,
        project_id: String,
        metrics: HashMap<String, serde_json::Value>,
        runtime_seconds: Option<i64>,
        cost: Option<f64>,
    },
    Failed {
        job_id: Uuid,
        project_id: String,
        kind: FailureKind,
        error: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Submitted { job_id, .. }
            | JobEvent::StatusChanged { job_id, .. }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Succeeded { .. } | JobEvent::Failed { .. })
    }
}

/// In-process fan-out of [`JobEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishing with no subscribers is not an error
    pub fn publish(&self, event: JobEvent) {
        tracing::debug!("Publishing {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

/// Logs every event as structured JSON until the bus is dropped
pub fn spawn_event_logger(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    tracing::info!(job_id = %event.job_id(), "job event {}", payload);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event logger lagged, skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
