//! Claim engine: pick and lock the next eligible job for a worker.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::jobs::append_log;
use crate::jobs::dependency::{self, DependencyState};
use crate::jobs::model::{Job, JobLog, JobStatus, LogLevel};
use crate::metrics::{MetricEvent, Metrics};
use crate::store::JobStore;

/// What a single claim pass did.
#[derive(Debug, Default)]
pub struct ClaimOutcome {
    /// The job now locked by the caller, if any.
    pub job: Option<Job>,
    /// Jobs failed during the scan because a predecessor can never succeed.
    pub blocked: Vec<Job>,
}

/// Selects one ready job per call, failing blocked jobs on the way.
pub struct ClaimEngine {
    store: Arc<dyn JobStore>,
    metrics: Metrics,
    window: usize,
}

impl ClaimEngine {
    pub fn new(store: Arc<dyn JobStore>, metrics: Metrics, window: usize) -> Self {
        Self {
            store,
            metrics,
            window,
        }
    }

    /// Scan up to `window` queued candidates and lock the first ready one.
    ///
    /// Waiting jobs are skipped so they never hold up independent work.
    /// A lost lock race moves on to the next candidate.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        queues: &[String],
    ) -> Result<ClaimOutcome, DatabaseError> {
        let mut outcome = ClaimOutcome::default();
        let candidates = self.store.claim_candidates(queues, self.window).await?;

        for candidate in candidates {
            let ids = dependency::dependency_ids(&candidate.id, &candidate.input);
            let state = dependency::resolve_dependencies(self.store.as_ref(), &ids).await?;

            match state {
                DependencyState::Waiting { pending } => {
                    debug!(job_id = %candidate.id, pending = pending.len(), "Job waiting on predecessors");
                }
                DependencyState::Blocked { .. } => {
                    let Some(failure) = state.blocked_failure() else {
                        continue;
                    };
                    let now = Utc::now();
                    if let Some(failed) = self
                        .store
                        .fail_queued_job(&candidate.id, &failure, now)
                        .await?
                    {
                        warn!(job_id = %failed.id, reason = %failure.message, "Job blocked by dependencies");
                        append_log(
                            self.store.as_ref(),
                            &JobLog::new(&failed.id, LogLevel::Error, failure.message.clone())
                                .with_metadata(serde_json::to_value(&failure).unwrap_or_default()),
                        )
                        .await;
                        self.metrics
                            .record(MetricEvent::JobDependencyBlocked {
                                queue: failed.queue.clone(),
                            })
                            .await;
                        outcome.blocked.push(failed);
                    }
                }
                DependencyState::Ready => {
                    let now = Utc::now();
                    if !self.store.try_lock_job(&candidate.id, worker_id, now).await? {
                        debug!(job_id = %candidate.id, "Lost claim race");
                        continue;
                    }

                    let mut job = candidate;
                    job.status = JobStatus::Running;
                    job.locked_at = Some(now);
                    job.locked_by = Some(worker_id.to_string());
                    job.updated_at = now;

                    info!(job_id = %job.id, job_type = %job.job_type, queue = %job.queue, worker = worker_id, "Job claimed");
                    append_log(
                        self.store.as_ref(),
                        &JobLog::new(&job.id, LogLevel::Info, format!("claimed by {worker_id}")),
                    )
                    .await;
                    self.metrics
                        .record(MetricEvent::JobClaimed {
                            queue: job.queue.clone(),
                        })
                        .await;
                    outcome.job = Some(job);
                    return Ok(outcome);
                }
            }
        }

        Ok(outcome)
    }
}
