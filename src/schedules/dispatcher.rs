//! Schedule dispatcher: materializes queued jobs from due schedules.
//!
//! Any number of dispatchers may run against the same store. A schedule is
//! only dispatched by the caller whose conditional write on `next_run_at`
//! matched; everyone else treats it as already handled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::DatabaseError;
use crate::handlers::HandlerRegistry;
use crate::jobs::append_log;
use crate::jobs::model::{ErrorKind, JobFailure, JobLog, LogLevel, NewJob};
use crate::metrics::{MetricEvent, Metrics};
use crate::schedules::cadence;
use crate::schedules::model::Schedule;
use crate::store::JobStore;

/// Summary of one dispatch pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// `(schedule_id, job_id)` for every job created.
    pub dispatched: Vec<(String, String)>,
    /// Schedules whose dispatch failed and were pushed back.
    pub errors: usize,
    /// Schedules claimed by someone else between read and write.
    pub lost_races: usize,
}

pub struct ScheduleDispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    metrics: Metrics,
    config: SchedulerConfig,
}

impl ScheduleDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        metrics: Metrics,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            metrics,
            config,
        }
    }

    fn backoff(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.error_backoff)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Dispatch up to `batch_limit` due schedules as of `now`.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchReport, DatabaseError> {
        let mut report = DispatchReport::default();

        for _ in 0..self.config.batch_limit {
            let Some(schedule) = self.store.next_due_schedule(now).await? else {
                break;
            };

            let next_run_at = match cadence::next_run_after(&schedule.cadence, now) {
                Ok(next) => next,
                Err(reason) => {
                    let failure = JobFailure::new(ErrorKind::ScheduleCronInvalid, reason);
                    let deferred = self
                        .store
                        .defer_schedule(
                            &schedule.id,
                            schedule.next_run_at,
                            now + self.backoff(),
                            &failure,
                        )
                        .await?;
                    if deferred {
                        self.note_error(&schedule, &failure).await;
                        report.errors += 1;
                    } else {
                        report.lost_races += 1;
                    }
                    continue;
                }
            };

            if !self
                .store
                .claim_schedule(&schedule.id, schedule.next_run_at, now, next_run_at)
                .await?
            {
                debug!(schedule = %schedule.name, "Schedule claimed elsewhere");
                report.lost_races += 1;
                continue;
            }

            match self.materialize(&schedule, now).await {
                Ok(job_id) => {
                    if let Err(e) = self
                        .store
                        .record_schedule_dispatch(&schedule.id, &job_id, now)
                        .await
                    {
                        warn!(schedule = %schedule.name, job_id = %job_id, error = %e, "Failed to record schedule dispatch");
                    }
                    info!(schedule = %schedule.name, job_id = %job_id, next_run_at = %next_run_at, "Schedule dispatched");
                    self.metrics
                        .record(MetricEvent::ScheduleDispatched {
                            schedule: schedule.name.clone(),
                        })
                        .await;
                    report.dispatched.push((schedule.id.clone(), job_id));
                }
                Err(failure) => {
                    let pushed = std::cmp::max(next_run_at, now + self.backoff());
                    self.store
                        .record_schedule_error(&schedule.id, &failure, pushed, now)
                        .await?;
                    self.note_error(&schedule, &failure).await;
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Insert the job for a claimed schedule.
    async fn materialize(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<String, JobFailure> {
        let resolved = self
            .registry
            .resolve(self.store.as_ref(), &schedule.job_type)
            .await
            .map_err(|e| {
                JobFailure::new(ErrorKind::ScheduleTypeUnavailable, e.to_string())
                    .with_detail("type", schedule.job_type.clone())
            })?;

        let job = NewJob {
            job_type: schedule.job_type.clone(),
            queue: schedule.queue.clone(),
            input: schedule.input.clone(),
            priority: schedule.priority,
            timeout_sec: schedule
                .timeout_sec
                .unwrap_or(resolved.registration.default_timeout_sec),
            max_attempts: schedule
                .max_attempts
                .unwrap_or(resolved.registration.default_max_attempts),
            callback_url: schedule.callback_url.clone(),
            tags: schedule.tags.clone(),
        }
        .into_job(now);

        self.store.insert_job(&job).await.map_err(|e| {
            JobFailure::new(ErrorKind::ScheduleDispatchError, e.to_string())
        })?;

        let log = JobLog::new(
            &job.id,
            LogLevel::Info,
            format!("created by schedule {}", schedule.name),
        )
        .with_metadata(serde_json::json!({ "schedule_id": schedule.id }));
        append_log(self.store.as_ref(), &log).await;
        Ok(job.id)
    }

    async fn note_error(&self, schedule: &Schedule, failure: &JobFailure) {
        warn!(schedule = %schedule.name, error = %failure, "Schedule dispatch failed");
        self.metrics
            .record(MetricEvent::ScheduleError {
                schedule: schedule.name.clone(),
                code: failure.code.clone(),
            })
            .await;
    }
}

/// Spawn the periodic dispatch tick.
pub fn spawn_schedule_ticker(
    dispatcher: Arc<ScheduleDispatcher>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match dispatcher.dispatch_due(Utc::now()).await {
                Ok(report) if report.dispatched.is_empty() && report.errors == 0 => {}
                Ok(report) => debug!(
                    dispatched = report.dispatched.len(),
                    errors = report.errors,
                    lost_races = report.lost_races,
                    "Schedule tick complete"
                ),
                Err(e) => error!(error = %e, "Schedule tick failed"),
            }
        }
    })
}
