//! Execution wrapper: runs a claimed job under its deadline and records
//! the outcome with the retry policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::callbacks::CallbackDispatcher;
use crate::error::DatabaseError;
use crate::handlers::{Handler, HandlerContext, HandlerFailure, HandlerRegistry};
use crate::jobs::append_log;
use crate::jobs::model::{ErrorKind, Job, JobFailure, JobLog, JobStatus, LogLevel};
use crate::metrics::{MetricEvent, Metrics};
use crate::store::JobStore;

/// Convert a handler error into the persisted failure payload.
///
/// The handler's code, message and details are kept verbatim.
pub fn handler_failure(failure: HandlerFailure) -> JobFailure {
    let details = match failure.details {
        Some(serde_json::Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("details".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    JobFailure {
        kind: ErrorKind::Handler,
        code: failure.code,
        message: failure.message,
        details,
    }
}

/// Runs claimed jobs for one worker identity.
pub struct Executor {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    metrics: Metrics,
    callbacks: Option<Arc<CallbackDispatcher>>,
    worker_id: String,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        metrics: Metrics,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            metrics,
            callbacks: None,
            worker_id: worker_id.into(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<CallbackDispatcher>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Hand a terminal job to callback delivery, if configured.
    pub fn notify_terminal(&self, job: &Job) {
        if let Some(callbacks) = &self.callbacks {
            callbacks.notify(job);
        }
    }

    /// Execute a job this worker has locked.
    ///
    /// Returns the row after the outcome was recorded, or `None` when the
    /// lock was lost (for example to the lease reaper) before recording.
    pub async fn execute(&self, job: Job) -> Result<Option<Job>, DatabaseError> {
        let resolved = match self.registry.resolve(self.store.as_ref(), &job.job_type).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let failure = JobFailure::new(ErrorKind::TypeUnavailable, e.to_string())
                    .with_detail("type", job.job_type.clone());
                let updated = self
                    .store
                    .fail_running_job(&job.id, &self.worker_id, &failure, Utc::now())
                    .await?;
                if let Some(updated) = &updated {
                    self.record_terminal_failure(updated, &failure).await;
                }
                return Ok(updated);
            }
        };

        let Some(attempt) = self
            .store
            .begin_attempt(&job.id, &self.worker_id, Utc::now())
            .await?
        else {
            warn!(job_id = %job.id, "Lock lost before attempt started");
            return Ok(None);
        };

        let timeout = Duration::from_secs(job.timeout_sec as u64);
        let ctx = HandlerContext {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            queue: job.queue.clone(),
            attempt,
            max_attempts: job.max_attempts,
            deadline: tokio::time::Instant::now() + timeout,
        };

        let result = tokio::time::timeout_at(
            ctx.deadline,
            self.invoke(resolved.handler.as_ref(), &ctx, job.input.clone()),
        )
        .await;

        match result {
            Ok(Ok(output)) => self.record_success(&job, attempt, output).await,
            Ok(Err(failure)) => self.record_failure(&job, handler_failure(failure)).await,
            Err(_elapsed) => {
                warn!(job_id = %job.id, timeout_sec = job.timeout_sec, "Job timed out");
                self.record_failure(&job, JobFailure::timeout(job.timeout_sec))
                    .await
            }
        }
    }

    /// Run the handler, honoring at most one retry hint.
    async fn invoke(
        &self,
        handler: &dyn Handler,
        ctx: &HandlerContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerFailure> {
        let failure = match handler.run(ctx, input.clone()).await {
            Ok(output) => return Ok(output),
            Err(failure) => failure,
        };

        let Some(adjusted) = handler.retry_hint(&input, &failure) else {
            return Err(failure);
        };

        warn!(job_id = %ctx.job_id, code = %failure.code, "Retrying once with handler-adjusted input");
        let log = JobLog::new(
            &ctx.job_id,
            LogLevel::Warn,
            format!("retrying with adjusted input after {}", failure.code),
        )
        .with_metadata(serde_json::json!({ "code": failure.code, "message": failure.message }));
        append_log(self.store.as_ref(), &log).await;

        handler.run(ctx, adjusted).await
    }

    async fn record_success(
        &self,
        job: &Job,
        attempt: u32,
        output: serde_json::Value,
    ) -> Result<Option<Job>, DatabaseError> {
        let Some(updated) = self
            .store
            .complete_job(&job.id, &self.worker_id, &output, Utc::now())
            .await?
        else {
            warn!(job_id = %job.id, "Lock lost before result was recorded");
            return Ok(None);
        };

        info!(job_id = %updated.id, job_type = %updated.job_type, attempt, "Job succeeded");
        append_log(
            self.store.as_ref(),
            &JobLog::new(
                &updated.id,
                LogLevel::Info,
                format!("succeeded on attempt {attempt}"),
            ),
        )
        .await;
        self.metrics
            .record(MetricEvent::JobSucceeded {
                job_type: updated.job_type.clone(),
            })
            .await;
        self.notify_terminal(&updated);
        Ok(Some(updated))
    }

    async fn record_failure(
        &self,
        job: &Job,
        failure: JobFailure,
    ) -> Result<Option<Job>, DatabaseError> {
        let Some(updated) = self
            .store
            .record_job_failure(&job.id, &self.worker_id, &failure, Utc::now())
            .await?
        else {
            warn!(job_id = %job.id, "Lock lost before failure was recorded");
            return Ok(None);
        };

        if updated.status == JobStatus::Queued {
            info!(
                job_id = %updated.id,
                attempts = updated.attempts,
                max_attempts = updated.max_attempts,
                code = %failure.code,
                "Job failed, requeued for retry"
            );
            append_log(
                self.store.as_ref(),
                &JobLog::new(
                    &updated.id,
                    LogLevel::Info,
                    format!(
                        "attempt {}/{} failed, requeued",
                        updated.attempts, updated.max_attempts
                    ),
                )
                .with_metadata(serde_json::to_value(&failure).unwrap_or_default()),
            )
            .await;
            self.metrics
                .record(MetricEvent::JobRetried {
                    job_type: updated.job_type.clone(),
                    code: failure.code.clone(),
                })
                .await;
        } else {
            self.record_terminal_failure(&updated, &failure).await;
        }
        Ok(Some(updated))
    }

    async fn record_terminal_failure(&self, job: &Job, failure: &JobFailure) {
        error!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, error = %failure, "Job failed");
        append_log(
            self.store.as_ref(),
            &JobLog::new(&job.id, LogLevel::Error, failure.to_string())
                .with_metadata(serde_json::to_value(failure).unwrap_or_default()),
        )
        .await;
        self.metrics
            .record(MetricEvent::JobFailed {
                job_type: job.job_type.clone(),
                code: failure.code.clone(),
            })
            .await;
        self.notify_terminal(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::handlers::JobTypeRegistration;
    use crate::handlers::builtin::EchoHandler;
    use crate::jobs::model::NewJob;
    use crate::store::LibSqlBackend;

    /// Fails every call.
    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Handler for AlwaysFails {
        fn key(&self) -> &str {
            "always-fails"
        }

        async fn run(
            &self,
            _ctx: &HandlerContext,
            _input: serde_json::Value,
        ) -> Result<serde_json::Value, HandlerFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerFailure::new("E_BOOM", "always fails").with_details(json!({"hint": 1})))
        }
    }

    /// Sleeps past any reasonable deadline.
    struct Sleeper;

    #[async_trait]
    impl Handler for Sleeper {
        fn key(&self) -> &str {
            "sleeper"
        }

        async fn run(
            &self,
            _ctx: &HandlerContext,
            _input: serde_json::Value,
        ) -> Result<serde_json::Value, HandlerFailure> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!(null))
        }
    }

    /// Fails unless `fixed` is set, and suggests setting it.
    struct NeedsFlag;

    #[async_trait]
    impl Handler for NeedsFlag {
        fn key(&self) -> &str {
            "needs-flag"
        }

        async fn run(
            &self,
            _ctx: &HandlerContext,
            input: serde_json::Value,
        ) -> Result<serde_json::Value, HandlerFailure> {
            if input["fixed"] == json!(true) {
                Ok(json!({"fixed": true}))
            } else {
                Err(HandlerFailure::new("E_NEEDS_FLAG", "flag missing"))
            }
        }

        fn retry_hint(
            &self,
            input: &serde_json::Value,
            failure: &HandlerFailure,
        ) -> Option<serde_json::Value> {
            (failure.code == "E_NEEDS_FLAG").then(|| {
                let mut adjusted = input.clone();
                adjusted["fixed"] = json!(true);
                adjusted
            })
        }
    }

    async fn setup() -> (Arc<LibSqlBackend>, Arc<HandlerRegistry>, Arc<AlwaysFails>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(HandlerRegistry::new());
        let failing = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
        });
        registry.register(Arc::new(EchoHandler::new())).await;
        registry.register(failing.clone()).await;
        registry.register(Arc::new(Sleeper)).await;
        registry.register(Arc::new(NeedsFlag)).await;
        for reg in [
            EchoHandler::registration(),
            JobTypeRegistration::new("always-fails", 30, 3),
            JobTypeRegistration::new("sleeper", 1, 1),
            JobTypeRegistration::new("needs-flag", 30, 1),
        ] {
            store.upsert_job_type(&reg).await.unwrap();
        }
        (store, registry, failing)
    }

    async fn locked_job(store: &LibSqlBackend, job_type: &str, timeout_sec: u32, max_attempts: u32) -> Job {
        let job = NewJob {
            job_type: job_type.into(),
            queue: "default".into(),
            input: json!({"x": 1}),
            priority: 5,
            timeout_sec,
            max_attempts,
            callback_url: None,
            tags: vec![],
        }
        .into_job(Utc::now());
        store.insert_job(&job).await.unwrap();
        assert!(store.try_lock_job(&job.id, "w1", Utc::now()).await.unwrap());
        store.get_job(&job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_stores_result_and_clears_lock() {
        let (store, registry, _) = setup().await;
        let executor = Executor::new(store.clone(), registry, Metrics::new(), "w1");
        let job = locked_job(&store, "echo", 30, 1).await;

        let done = executor.execute(job).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.result, Some(json!({"x": 1})));
        assert!(done.locked_at.is_none() && done.locked_by.is_none());
    }

    #[tokio::test]
    async fn failure_requeues_then_fails_after_max_attempts() {
        let (store, registry, failing) = setup().await;
        let metrics = Metrics::new();
        let executor = Executor::new(store.clone(), registry, metrics.clone(), "w1");
        let job = locked_job(&store, "always-fails", 30, 3).await;
        let id = job.id.clone();

        let first = executor.execute(job).await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Queued);
        assert_eq!(first.attempts, 1);
        let error = first.error.unwrap();
        assert_eq!(error.code, "E_BOOM");
        assert_eq!(error.details["hint"], 1);

        for expected in [2, 3] {
            assert!(store.try_lock_job(&id, "w1", Utc::now()).await.unwrap());
            let job = store.get_job(&id).await.unwrap().unwrap();
            let row = executor.execute(job).await.unwrap().unwrap();
            assert_eq!(row.attempts, expected);
        }

        let last = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.attempts, 3);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().await.total("jobs_retried_total"), 2);
        assert_eq!(metrics.snapshot().await.total("jobs_failed_total"), 1);
    }

    #[tokio::test]
    async fn deadline_breach_is_timeout_failure() {
        let (store, registry, _) = setup().await;
        let executor = Executor::new(store.clone(), registry, Metrics::new(), "w1");
        let job = locked_job(&store, "sleeper", 1, 1).await;

        let row = executor.execute(job).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        let error = row.error.unwrap();
        assert_eq!(error.code, "timeout");
        assert_eq!(error.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn timeout_with_attempts_left_requeues_then_fails() {
        let (store, registry, _) = setup().await;
        let metrics = Metrics::new();
        let executor = Executor::new(store.clone(), registry, metrics.clone(), "w1");
        let job = locked_job(&store, "sleeper", 1, 2).await;
        let id = job.id.clone();

        let first = executor.execute(job).await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Queued);
        assert_eq!(first.attempts, 1);
        assert!(first.locked_at.is_none() && first.locked_by.is_none());
        assert_eq!(first.error.unwrap().kind, ErrorKind::Timeout);

        assert!(store.try_lock_job(&id, "w1", Utc::now()).await.unwrap());
        let job = store.get_job(&id).await.unwrap().unwrap();
        let last = executor.execute(job).await.unwrap().unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.attempts, 2);
        assert_eq!(last.error.unwrap().code, "timeout");
        assert_eq!(metrics.snapshot().await.total("jobs_retried_total"), 1);
        assert_eq!(metrics.snapshot().await.total("jobs_failed_total"), 1);
    }

    #[tokio::test]
    async fn outcomes_commit_when_job_log_writes_fail() {
        let (store, registry, _) = setup().await;
        store.execute_raw("DROP TABLE job_logs").await.unwrap();
        let executor = Executor::new(store.clone(), registry, Metrics::new(), "w1");

        let ok = locked_job(&store, "echo", 30, 1).await;
        let row = executor.execute(ok).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);

        let retried = locked_job(&store, "always-fails", 30, 2).await;
        let id = retried.id.clone();
        let row = executor.execute(retried).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);

        assert!(store.try_lock_job(&id, "w1", Utc::now()).await.unwrap());
        let job = store.get_job(&id).await.unwrap().unwrap();
        let row = executor.execute(job).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.attempts, 2);
    }

    #[tokio::test]
    async fn unavailable_type_fails_without_attempt() {
        let (store, registry, _) = setup().await;
        store
            .upsert_job_type(&JobTypeRegistration::new("echo", 30, 1).disabled())
            .await
            .unwrap();
        let executor = Executor::new(store.clone(), registry, Metrics::new(), "w1");
        let job = locked_job(&store, "echo", 30, 3).await;

        let row = executor.execute(job).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.error.unwrap().code, "TYPE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn retry_hint_reruns_once_within_attempt() {
        let (store, registry, _) = setup().await;
        let executor = Executor::new(store.clone(), registry, Metrics::new(), "w1");
        let job = locked_job(&store, "needs-flag", 30, 1).await;
        let id = job.id.clone();

        let row = executor.execute(job).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);
        assert_eq!(row.attempts, 1);

        let logs = store.list_job_logs(&id).await.unwrap();
        assert!(logs.iter().any(|l| l.level == LogLevel::Warn));
    }

    #[tokio::test]
    async fn lost_lock_is_reported_as_none() {
        let (store, registry, _) = setup().await;
        let executor = Executor::new(store.clone(), registry, Metrics::new(), "someone-else");
        let job = locked_job(&store, "echo", 30, 1).await;
        assert!(executor.execute(job).await.unwrap().is_none());
    }

    #[test]
    fn non_object_details_are_wrapped() {
        let failure = handler_failure(HandlerFailure::new("E", "m").with_details(json!([1, 2])));
        assert_eq!(failure.kind, ErrorKind::Handler);
        assert_eq!(failure.details["details"], json!([1, 2]));
    }
}
