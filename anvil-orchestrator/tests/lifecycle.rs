//! End-to-end job lifecycle over in-memory stores

mod common;

use anvil_core::domain::estimate::TimeoutPolicy;
use anvil_core::domain::job::{FailureKind, JobStatus};
use anvil_core::dto::job::PollJob;
use anvil_orchestrator::events::JobEvent;
use anvil_orchestrator::service::{JobError, Settings};
use anvil_orchestrator::storage::JobPaths;
use common::{Harness, RecordingProvider, submission};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

fn poll(job_id: Uuid) -> PollJob {
    PollJob {
        job_id,
        project_id: "proj-1".to_string(),
    }
}

fn terminal_events(rx: &mut tokio::sync::broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) if event.is_terminal() => events.push(event),
            Ok(_) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => {}
        }
    }
    events
}

#[tokio::test]
async fn test_submit_provisions_exactly_one_instance() {
    let h = Harness::new();
    let resp = h.service.submit(submission("alice")).await.unwrap();

    let job = h.service.get(resp.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Provisioning);
    assert_eq!(job.instance_zone.as_deref(), Some(common::ZONE));
    assert!(job.console_url.is_some());
    assert_eq!(resp.estimated_minutes, job.estimated_minutes);

    let created = h.provider.created();
    assert_eq!(created.len(), 1);
    assert_eq!(Some(&created[0].name), job.instance_name.as_ref());
    assert!(created[0].startup_script.contains("export EPOCHS='5'"));

    let paths = JobPaths::new("proj-1", resp.job_id);
    assert!(h.objects.contains(&paths.script()));
    assert_eq!(h.quotas.slots_held("alice"), 1);
}

#[tokio::test]
async fn test_successful_run_records_metrics_and_cost() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    h.write_status(job_id, r#"{"status":"running","phase":"training"}"#);
    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Training);
    assert!(resp.changed);
    assert!(resp.metrics.is_none());

    h.write_metrics(job_id, r#"{"accuracy":0.93}"#);
    h.write_status(
        job_id,
        r#"{"status":"completed","phase":"completed","completedAt":"2099-01-01T00:00:00Z"}"#,
    );
    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Succeeded);
    assert!(resp.changed);
    assert_eq!(resp.metrics.unwrap()["accuracy"], serde_json::json!(0.93));

    let job = h.service.get(job_id).await.unwrap();
    assert!(job.runtime_seconds.unwrap() > 0);
    assert!(job.cost.is_some());
    assert_eq!(h.quotas.slots_held("alice"), 0);
    assert_eq!(terminal_events(&mut rx).len(), 1);
}

#[tokio::test]
async fn test_worker_failure_is_committed_exactly_once() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    h.write_status(
        job_id,
        r#"{"status":"failed","phase":"training","error":"exit code 1"}"#,
    );
    let first = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(first.status, JobStatus::Failed);
    assert_eq!(first.error.as_deref(), Some("exit code 1"));
    assert_eq!(first.failure_kind, Some(FailureKind::Worker));
    assert!(first.changed);

    let before = h.service.get(job_id).await.unwrap();
    for _ in 0..3 {
        let again = h.service.poll(&poll(job_id)).await.unwrap();
        assert!(!again.changed);
        assert_eq!(again.status, JobStatus::Failed);
    }
    let after = h.service.get(job_id).await.unwrap();
    assert_eq!(before.updated_at, after.updated_at);

    assert_eq!(terminal_events(&mut rx).len(), 1);
    assert_eq!(h.quotas.slots_held("alice"), 0);
}

#[tokio::test]
async fn test_concurrent_polls_commit_one_terminal_transition() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;
    h.write_status(job_id, r#"{"status":"succeeded","phase":"completed"}"#);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = h.service.clone();
        handles.push(tokio::spawn(async move { service.poll(&poll(job_id)).await }));
    }
    let mut changed = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().changed {
            changed += 1;
        }
    }

    assert_eq!(changed, 1);
    assert_eq!(terminal_events(&mut rx).len(), 1);
}

#[tokio::test]
async fn test_stale_status_never_regresses_the_record() {
    let h = Harness::new();
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    h.write_status(job_id, r#"{"status":"running","phase":"training"}"#);
    h.service.poll(&poll(job_id)).await.unwrap();

    h.write_status(job_id, r#"{"status":"running","phase":"installing"}"#);
    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Training);
    assert!(!resp.changed);
}

#[tokio::test]
async fn test_phase_strings_are_case_insensitive() {
    let h = Harness::new();
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    h.write_status(job_id, r#"{"status":"RUNNING","phase":"Downloading"}"#);
    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Downloading);
}

#[tokio::test]
async fn test_missing_or_malformed_status_leaves_job_unchanged() {
    let h = Harness::new();
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Provisioning);
    assert!(!resp.changed);

    h.write_status(job_id, r#"{"status":"runn"#);
    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Provisioning);
    assert!(!resp.changed);
}

#[tokio::test]
async fn test_timeout_deletes_instance_with_distinct_error() {
    let h = Harness::build(RecordingProvider::default(), instant_deadline());
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Failed);
    assert_eq!(resp.failure_kind, Some(FailureKind::TimedOut));
    assert!(resp.error.unwrap().contains("exceeded expected duration"));

    assert_eq!(h.provider.live(), 0);
    assert_eq!(h.provider.deleted().len(), 1);
    assert_eq!(h.quotas.slots_held("alice"), 0);
}

fn instant_deadline() -> Settings {
    Settings {
        timeout_policy: TimeoutPolicy {
            multiplier: 0.0,
            min_minutes: 0.0,
        },
        ..Settings::default()
    }
}

#[tokio::test]
async fn test_result_written_before_deadline_survives_late_poll() {
    let h = Harness::build(RecordingProvider::default(), instant_deadline());
    let mut rx = h.events.subscribe();
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    h.write_metrics(job_id, r#"{"accuracy":0.91}"#);
    h.write_status(
        job_id,
        r#"{"status":"completed","phase":"completed","completedAt":"2000-01-01T00:00:00Z"}"#,
    );
    tokio::time::sleep(Duration::from_millis(20)).await;

    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Succeeded);
    assert_eq!(resp.failure_kind, None);
    assert_eq!(resp.metrics.unwrap()["accuracy"], serde_json::json!(0.91));
    assert_eq!(h.quotas.slots_held("alice"), 0);
    assert_eq!(terminal_events(&mut rx).len(), 1);
}

#[tokio::test]
async fn test_terminal_status_without_timestamp_survives_late_poll() {
    let h = Harness::build(RecordingProvider::default(), instant_deadline());
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    h.write_status(job_id, r#"{"status":"failed","phase":"training","error":"boom"}"#);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Failed);
    assert_eq!(resp.failure_kind, Some(FailureKind::Worker));
    assert_eq!(resp.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_result_written_after_deadline_times_out() {
    let h = Harness::build(RecordingProvider::default(), instant_deadline());
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    h.write_status(
        job_id,
        r#"{"status":"completed","phase":"completed","completedAt":"2099-01-01T00:00:00Z"}"#,
    );
    tokio::time::sleep(Duration::from_millis(20)).await;

    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Failed);
    assert_eq!(resp.failure_kind, Some(FailureKind::TimedOut));
    assert_eq!(h.provider.live(), 0);
}

#[tokio::test]
async fn test_running_status_past_deadline_times_out() {
    let h = Harness::build(RecordingProvider::default(), instant_deadline());
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    h.write_status(job_id, r#"{"status":"running","phase":"training"}"#);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.failure_kind, Some(FailureKind::TimedOut));
}

#[tokio::test]
async fn test_cancel_during_training_deletes_instance() {
    let h = Harness::new();
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;
    h.write_status(job_id, r#"{"status":"running","phase":"training"}"#);
    h.service.poll(&poll(job_id)).await.unwrap();

    h.service.cancel(job_id).await.unwrap();

    let job = h.service.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Cancelled));
    assert_eq!(job.error.as_deref(), Some("Cancelled by user"));
    assert_eq!(h.provider.live(), 0);
    assert_eq!(h.service.scheduler().tracked(), 0);

    // A late success report cannot overwrite the cancellation
    h.write_status(job_id, r#"{"status":"succeeded","phase":"completed"}"#);
    let resp = h.service.poll(&poll(job_id)).await.unwrap();
    assert_eq!(resp.status, JobStatus::Failed);

    h.service.cancel(job_id).await.unwrap();
    assert_eq!(h.provider.deleted().len(), 1);
}

#[tokio::test]
async fn test_provisioning_failure_leaves_no_instance() {
    let h = Harness::build(RecordingProvider::failing(), Settings::default());
    let err = h.service.submit(submission("alice")).await.unwrap_err();
    assert!(matches!(err, JobError::Provisioning(_)));

    let jobs = h.service.list_by_project("proj-1").await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].failure_kind, Some(FailureKind::Provisioning));
    assert!(jobs[0].error.as_deref().unwrap().starts_with("ProvisioningError"));

    assert!(h.provider.created().is_empty());
    assert_eq!(h.provider.live(), 0);
    assert_eq!(h.quotas.slots_held("alice"), 0);
}

#[tokio::test]
async fn test_parallel_quota_is_enforced_per_user() {
    let h = Harness::new();
    let first = h.service.submit(submission("alice")).await.unwrap().job_id;

    let err = h.service.submit(submission("alice")).await.unwrap_err();
    assert!(matches!(err, JobError::QuotaExceeded { limit: 1 }));

    // Other users are unaffected
    h.service.submit(submission("bob")).await.unwrap();

    h.service.cancel(first).await.unwrap();
    h.service.submit(submission("alice")).await.unwrap();
    assert_eq!(h.provider.created().len(), 3);
}

#[tokio::test]
async fn test_rejected_submissions_do_not_spend_hourly_allowance() {
    let h = Harness::new();
    let mut running = h.service.submit(submission("alice")).await.unwrap().job_id;

    // Free tier allows one job in flight and five submissions per hour
    for _ in 0..6 {
        let err = h.service.submit(submission("alice")).await.unwrap_err();
        assert!(matches!(err, JobError::QuotaExceeded { limit: 1 }));
    }

    for _ in 0..4 {
        h.service.cancel(running).await.unwrap();
        running = h.service.submit(submission("alice")).await.unwrap().job_id;
    }

    h.service.cancel(running).await.unwrap();
    let err = h.service.submit(submission("alice")).await.unwrap_err();
    assert!(matches!(err, JobError::RateLimited { limit: 5 }));
    assert_eq!(h.quotas.slots_held("alice"), 0);
    assert_eq!(h.provider.created().len(), 5);
}

#[tokio::test]
async fn test_idempotency_key_resolves_to_original_job() {
    let h = Harness::new();
    let mut req = submission("alice");
    req.idempotency_key = Some("retry-7".to_string());

    let first = h.service.submit(req.clone()).await.unwrap();
    let second = h.service.submit(req).await.unwrap();

    assert_eq!(first.job_id, second.job_id);
    assert_eq!(h.provider.created().len(), 1);
}

#[tokio::test]
async fn test_poll_with_wrong_project_is_not_found() {
    let h = Harness::new();
    let job_id = h.service.submit(submission("alice")).await.unwrap().job_id;

    let err = h
        .service
        .poll(&PollJob {
            job_id,
            project_id: "someone-else".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::NotFound(_)));
}

#[tokio::test]
async fn test_policy_violation_creates_nothing() {
    let h = Harness::new();
    let mut req = submission("alice");
    req.dataset_size_mb = 10_000.0;

    let err = h.service.submit(req).await.unwrap_err();
    assert!(matches!(err, JobError::Policy(_)));
    assert!(h.service.list_by_project("proj-1").await.unwrap().is_empty());
    assert!(h.provider.created().is_empty());
}
