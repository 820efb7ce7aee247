//! Worker status document and the raw-phase mapping table
//!
//! The worker is the only writer of the status document. Raw strings are
//! normalized here, in one case-insensitive table, before anything compares
//! them against the canonical [`JobStatus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::JobStatus;

/// The sole artifact written by the worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDocument {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Phases the bootstrap program reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Installing,
    DownloadingScript,
    DownloadingDataset,
    Training,
    UploadingArtifacts,
    Completed,
    Failed,
}

impl WorkerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerPhase::Installing => "installing",
            WorkerPhase::DownloadingScript => "downloading_script",
            WorkerPhase::DownloadingDataset => "downloading",
            WorkerPhase::Training => "training",
            WorkerPhase::UploadingArtifacts => "uploading_artifacts",
            WorkerPhase::Completed => "completed",
            WorkerPhase::Failed => "failed",
        }
    }
}

/// What a single raw string means for the canonical state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meaning {
    Progress(JobStatus),
    Succeeded,
    Failed,
}

const PHASE_TABLE: &[(&str, Meaning)] = &[
    ("installing", Meaning::Progress(JobStatus::Installing)),
    ("downloading_script", Meaning::Progress(JobStatus::Installing)),
    ("downloading", Meaning::Progress(JobStatus::Downloading)),
    ("downloading_dataset", Meaning::Progress(JobStatus::Downloading)),
    ("running", Meaning::Progress(JobStatus::Training)),
    ("training", Meaning::Progress(JobStatus::Training)),
    ("uploading_artifacts", Meaning::Progress(JobStatus::Training)),
    ("completed", Meaning::Succeeded),
    ("succeeded", Meaning::Succeeded),
    ("success", Meaning::Succeeded),
    ("failed", Meaning::Failed),
    ("error", Meaning::Failed),
];

fn lookup(raw: &str) -> Option<Meaning> {
    let normalized: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    PHASE_TABLE
        .iter()
        .find(|(key, _)| *key == normalized)
        .map(|(_, meaning)| *meaning)
}

/// Interpretation of a status document against the canonical state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    Progress(JobStatus),
    Succeeded,
    Failed(String),
    /// Nothing recognizable; the job record must stay as it is
    Unrecognized,
}

impl StatusDocument {
    /// Parses a document, treating malformed or partially written bytes as absent
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    pub fn report(&self) -> WorkerReport {
        let status = lookup(&self.status);
        let phase = lookup(&self.phase);

        // A terminal `status` wins over whatever phase was last recorded.
        for meaning in [status, phase].into_iter().flatten() {
            match meaning {
                Meaning::Succeeded => return WorkerReport::Succeeded,
                Meaning::Failed => return WorkerReport::Failed(self.failure_message()),
                Meaning::Progress(_) => {}
            }
        }

        match (phase, status) {
            (Some(Meaning::Progress(s)), _) | (_, Some(Meaning::Progress(s))) => {
                WorkerReport::Progress(s)
            }
            _ => WorkerReport::Unrecognized,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn failure_message(&self) -> String {
        match self.error.as_deref().map(str::trim) {
            Some(error) if !error.is_empty() => error.to_string(),
            _ if !self.phase.trim().is_empty() => {
                format!("Worker reported failure during {}", self.phase.trim())
            }
            _ => "Worker reported failure".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(status: &str, phase: &str) -> StatusDocument {
        StatusDocument {
            status: status.to_string(),
            phase: phase.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_mapping_is_case_insensitive() {
        assert_eq!(
            doc("RUNNING", "").report(),
            WorkerReport::Progress(JobStatus::Training)
        );
        assert_eq!(
            doc("running", "Installing").report(),
            WorkerReport::Progress(JobStatus::Installing)
        );
        assert_eq!(doc("Completed", "").report(), WorkerReport::Succeeded);
    }

    #[test]
    fn test_download_phase_depends_on_artifact() {
        assert_eq!(
            doc("running", "downloading_script").report(),
            WorkerReport::Progress(JobStatus::Installing)
        );
        assert_eq!(
            doc("running", "downloading").report(),
            WorkerReport::Progress(JobStatus::Downloading)
        );
        assert_eq!(
            doc("running", "Downloading-Dataset").report(),
            WorkerReport::Progress(JobStatus::Downloading)
        );
    }

    #[test]
    fn test_terminal_status_wins_over_phase() {
        let failed = StatusDocument {
            status: "failed".to_string(),
            phase: "training".to_string(),
            error: Some("exit code 1".to_string()),
            ..Default::default()
        };
        assert_eq!(failed.report(), WorkerReport::Failed("exit code 1".to_string()));
    }

    #[test]
    fn test_failure_without_error_names_phase() {
        assert_eq!(
            doc("failed", "downloading").report(),
            WorkerReport::Failed("Worker reported failure during downloading".to_string())
        );
    }

    #[test]
    fn test_unknown_strings_are_unrecognized() {
        assert_eq!(doc("booting", "warming").report(), WorkerReport::Unrecognized);
        assert_eq!(doc("", "").report(), WorkerReport::Unrecognized);
    }

    #[test]
    fn test_parse_tolerates_malformed_documents() {
        assert!(StatusDocument::parse(br#"{"status":"runn"#).is_none());
        assert!(StatusDocument::parse(b"").is_none());

        let parsed = StatusDocument::parse(
            br#"{"status":"completed","phase":"completed","completedAt":"2026-01-02T03:04:05Z","error":""}"#,
        )
        .unwrap();
        assert_eq!(parsed.report(), WorkerReport::Succeeded);
        assert!(parsed.completed_at().is_some());
    }

    #[test]
    fn test_worker_phases_round_trip_through_table() {
        for phase in [
            WorkerPhase::Installing,
            WorkerPhase::DownloadingScript,
            WorkerPhase::DownloadingDataset,
            WorkerPhase::Training,
            WorkerPhase::UploadingArtifacts,
        ] {
            assert!(matches!(
                doc("running", phase.as_str()).report(),
                WorkerReport::Progress(_)
            ));
        }
    }
}
