//! End-to-end job lifecycle against a file-backed store.
//!
//! Jobs go in through `submit_job` and come out through `Worker::run_once`,
//! the same path the binary uses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;

use job_runtime::config::{SchedulerConfig, WorkerConfig};
use job_runtime::error::SubmitError;
use job_runtime::handlers::builtin::EchoHandler;
use job_runtime::handlers::{
    Handler, HandlerContext, HandlerFailure, HandlerRegistry, JobTypeRegistration,
};
use job_runtime::jobs::{JobStatus, JobSubmission, Worker, submit_job};
use job_runtime::metrics::Metrics;
use job_runtime::schedules::{ScheduleDispatcher, ScheduleSubmission, create_schedule};
use job_runtime::store::{JobStore, LibSqlBackend};

/// Fails every invocation with a handler-specific code.
struct AlwaysFails {
    calls: AtomicU32,
}

#[async_trait]
impl Handler for AlwaysFails {
    fn key(&self) -> &str {
        "always-fails"
    }

    async fn run(&self, _ctx: &HandlerContext, _input: Value) -> Result<Value, HandlerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerFailure::new("UPSTREAM_DOWN", "upstream returned 503")
            .with_details(json!({"status": 503})))
    }
}

/// Sleeps well past any reasonable deadline.
struct Sleeper;

#[async_trait]
impl Handler for Sleeper {
    fn key(&self) -> &str {
        "sleeper"
    }

    async fn run(&self, _ctx: &HandlerContext, _input: Value) -> Result<Value, HandlerFailure> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({}))
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<LibSqlBackend>,
    registry: Arc<HandlerRegistry>,
    failing: Arc<AlwaysFails>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            LibSqlBackend::new_local(&dir.path().join("jobs.db"))
                .await
                .unwrap(),
        );
        let registry = Arc::new(HandlerRegistry::new());
        let failing = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
        });

        registry.register(Arc::new(EchoHandler::new())).await;
        registry.register(failing.clone()).await;
        registry.register(Arc::new(Sleeper)).await;

        for registration in [
            EchoHandler::registration(),
            JobTypeRegistration::new("always-fails", 5, 3),
            JobTypeRegistration::new("sleeper", 1, 1),
        ] {
            store.upsert_job_type(&registration).await.unwrap();
        }

        Self {
            _dir: dir,
            store,
            registry,
            failing,
        }
    }

    fn worker(&self, id: &str) -> Arc<Worker> {
        Arc::new(Worker::new(
            WorkerConfig {
                worker_id: id.into(),
                poll_interval: Duration::from_millis(5),
                poll_jitter: Duration::ZERO,
                ..Default::default()
            },
            self.store.clone(),
            self.registry.clone(),
            Metrics::new(),
            None,
        ))
    }

    async fn submit(&self, submission: JobSubmission) -> String {
        submit_job(self.store.as_ref(), &self.registry, submission, None)
            .await
            .unwrap()
            .job
            .id
    }
}

#[tokio::test]
async fn echo_job_runs_to_success() {
    let h = Harness::new().await;
    let id = h
        .submit(JobSubmission {
            input: json!({"message": "hi"}),
            ..JobSubmission::new("echo")
        })
        .await;

    assert!(h.worker("w1").run_once().await.unwrap());

    let job = h.store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.result, Some(json!({"message": "hi"})));
    assert!(job.error.is_none());
    assert!(job.locked_at.is_none() && job.locked_by.is_none());

    let logs = h.store.list_job_logs(&id).await.unwrap();
    assert_eq!(logs.first().unwrap().message, "submitted");
    assert!(logs.len() >= 3);
}

#[tokio::test]
async fn failing_job_stops_after_max_attempts() {
    let h = Harness::new().await;
    let id = h.submit(JobSubmission::new("always-fails")).await;
    let worker = h.worker("w1");

    for expected_attempt in 1..=3u32 {
        assert!(worker.run_once().await.unwrap());
        let job = h.store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts, expected_attempt);
        assert!(job.locked_at.is_none());
        let expected = if expected_attempt < 3 {
            JobStatus::Queued
        } else {
            JobStatus::Failed
        };
        assert_eq!(job.status, expected);
    }

    // nothing left to claim, and the handler was not invoked a fourth time
    assert!(!worker.run_once().await.unwrap());
    assert_eq!(h.failing.calls.load(Ordering::SeqCst), 3);

    let job = h.store.get_job(&id).await.unwrap().unwrap();
    let error = job.error.unwrap();
    assert_eq!(error.code, "UPSTREAM_DOWN");
    assert_eq!(error.message, "upstream returned 503");
}

#[tokio::test]
async fn slow_handler_times_out() {
    let h = Harness::new().await;
    let id = h.submit(JobSubmission::new("sleeper")).await;

    let started = std::time::Instant::now();
    assert!(h.worker("w1").run_once().await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(10));

    let job = h.store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error.unwrap().code, "timeout");
}

#[tokio::test]
async fn timed_out_job_retries_until_attempts_run_out() {
    let h = Harness::new().await;
    let id = h
        .submit(JobSubmission {
            max_attempts: Some(2),
            ..JobSubmission::new("sleeper")
        })
        .await;
    let worker = h.worker("w1");

    assert!(worker.run_once().await.unwrap());
    let job = h.store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 1);
    assert!(job.locked_at.is_none());
    assert_eq!(job.error.unwrap().code, "timeout");

    assert!(worker.run_once().await.unwrap());
    let job = h.store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.error.unwrap().code, "timeout");

    assert!(!worker.run_once().await.unwrap());
}

#[tokio::test]
async fn failed_predecessor_blocks_dependent() {
    let h = Harness::new().await;
    let parent = h
        .submit(JobSubmission {
            max_attempts: Some(1),
            ..JobSubmission::new("always-fails")
        })
        .await;
    let child = h
        .submit(JobSubmission {
            input: json!({"depends_on": [parent.clone()]}),
            priority: Some(10),
            ..JobSubmission::new("echo")
        })
        .await;
    let worker = h.worker("w1");

    // the child outranks the parent but has to wait for it
    assert!(worker.run_once().await.unwrap());
    assert_eq!(
        h.store.get_job(&parent).await.unwrap().unwrap().status,
        JobStatus::Failed
    );
    assert_eq!(
        h.store.get_job(&child).await.unwrap().unwrap().status,
        JobStatus::Queued
    );

    assert!(!worker.run_once().await.unwrap());
    let child = h.store.get_job(&child).await.unwrap().unwrap();
    assert_eq!(child.status, JobStatus::Failed);
    assert_eq!(child.attempts, 0);
    let error = child.error.unwrap();
    assert_eq!(error.code, "DEPENDENCY_BLOCKED");
    assert_eq!(error.details["failed"], json!([parent]));
}

#[tokio::test]
async fn unknown_predecessor_blocks_dependent() {
    let h = Harness::new().await;
    let child = h
        .submit(JobSubmission {
            input: json!({"depends_on": ["no-such-job"]}),
            ..JobSubmission::new("echo")
        })
        .await;

    assert!(!h.worker("w1").run_once().await.unwrap());
    let child = h.store.get_job(&child).await.unwrap().unwrap();
    assert_eq!(child.status, JobStatus::Failed);
    assert_eq!(child.error.unwrap().details["missing"], json!(["no-such-job"]));
}

#[tokio::test]
async fn idempotency_key_replays_and_conflicts() {
    let h = Harness::new().await;
    let submission = JobSubmission {
        input: json!({"report": "daily"}),
        ..JobSubmission::new("echo")
    };

    let first = submit_job(h.store.as_ref(), &h.registry, submission.clone(), Some("abc"))
        .await
        .unwrap();
    assert!(!first.idempotent_replay);

    let replay = submit_job(h.store.as_ref(), &h.registry, submission, Some("abc"))
        .await
        .unwrap();
    assert!(replay.idempotent_replay);
    assert_eq!(replay.job.id, first.job.id);

    let different = JobSubmission {
        input: json!({"report": "weekly"}),
        ..JobSubmission::new("echo")
    };
    let err = submit_job(h.store.as_ref(), &h.registry, different, Some("abc"))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::IdempotencyConflict { .. }));
    assert_eq!(err.code(), "IDEMPOTENCY_CONFLICT");

    let counts = h.store.count_jobs_by_status().await.unwrap();
    assert_eq!(counts.values().sum::<u64>(), 1);
}

#[tokio::test]
async fn keyless_submissions_are_distinct() {
    let h = Harness::new().await;
    let request = || JobSubmission {
        queue: Some("default".into()),
        priority: Some(5),
        timeout_sec: Some(30),
        max_attempts: Some(1),
        ..JobSubmission::new("echo")
    };

    let a = h.submit(request()).await;
    let b = h.submit(request()).await;
    assert_ne!(a, b);

    let first = submit_job(h.store.as_ref(), &h.registry, request(), Some("same-key"))
        .await
        .unwrap();
    let second = submit_job(h.store.as_ref(), &h.registry, request(), Some("same-key"))
        .await
        .unwrap();
    assert_eq!(first.job.id, second.job.id);
    assert!(second.idempotent_replay);

    let counts = h.store.count_jobs_by_status().await.unwrap();
    assert_eq!(counts[&JobStatus::Queued], 3);
}

#[tokio::test]
async fn unknown_type_is_rejected_at_submit() {
    let h = Harness::new().await;
    let err = submit_job(
        h.store.as_ref(),
        &h.registry,
        JobSubmission::new("nope"),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "TYPE_UNAVAILABLE");
}

#[tokio::test]
async fn concurrent_workers_never_share_a_job() {
    let h = Harness::new().await;
    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(
            h.submit(JobSubmission {
                input: json!({"n": i}),
                ..JobSubmission::new("echo")
            })
            .await,
        );
    }

    let workers: Vec<_> = (0..4).map(|i| h.worker(&format!("w{i}"))).collect();
    let mut tasks = Vec::new();
    for worker in workers {
        tasks.push(tokio::spawn(async move {
            let mut claimed = 0u32;
            while worker.run_once().await.unwrap() {
                claimed += 1;
            }
            claimed
        }));
    }

    let mut total = 0;
    for task in tasks {
        total += task.await.unwrap();
    }
    assert_eq!(total, 20);

    for id in ids {
        let job = h.store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
    }
}

#[tokio::test]
async fn schedule_dispatch_feeds_workers() {
    let h = Harness::new().await;
    let schedule = create_schedule(
        h.store.as_ref(),
        ScheduleSubmission {
            name: "heartbeat".into(),
            job_type: "echo".into(),
            input: json!({"beat": true}),
            interval_sec: Some(60),
            start_in_sec: Some(0),
            ..Default::default()
        },
        Utc::now(),
    )
    .await
    .unwrap();

    let dispatchers: Vec<_> = (0..3)
        .map(|_| {
            ScheduleDispatcher::new(
                h.store.clone(),
                h.registry.clone(),
                Metrics::new(),
                SchedulerConfig::default(),
            )
        })
        .collect();
    let now = Utc::now();
    let (a, b, c) = tokio::join!(
        dispatchers[0].dispatch_due(now),
        dispatchers[1].dispatch_due(now),
        dispatchers[2].dispatch_due(now),
    );
    let created: Vec<_> = [a.unwrap(), b.unwrap(), c.unwrap()]
        .into_iter()
        .flat_map(|r| r.dispatched)
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, schedule.id);

    assert!(h.worker("w1").run_once().await.unwrap());
    let job = h.store.get_job(&created[0].1).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result, Some(json!({"beat": true})));

    let row = h.store.get_schedule(&schedule.id).await.unwrap().unwrap();
    assert_eq!(row.last_job_id.as_deref(), Some(job.id.as_str()));
    assert!(row.next_run_at > now);
}
