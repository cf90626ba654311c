//! Worker poll loop and stale-lease reaper.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callbacks::CallbackDispatcher;
use crate::config::WorkerConfig;
use crate::error::DatabaseError;
use crate::handlers::HandlerRegistry;
use crate::jobs::append_log;
use crate::jobs::claim::ClaimEngine;
use crate::jobs::executor::Executor;
use crate::jobs::model::{JobLog, JobStatus, LogLevel};
use crate::metrics::{MetricEvent, Metrics};
use crate::store::JobStore;

/// One poll loop: claim a job, execute it, repeat.
pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    claims: ClaimEngine,
    executor: Executor,
    metrics: Metrics,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        metrics: Metrics,
        callbacks: Option<Arc<CallbackDispatcher>>,
    ) -> Self {
        let claims = ClaimEngine::new(store.clone(), metrics.clone(), config.claim_window);
        let mut executor = Executor::new(
            store.clone(),
            registry,
            metrics.clone(),
            config.worker_id.clone(),
        );
        if let Some(callbacks) = callbacks {
            executor = executor.with_callbacks(callbacks);
        }
        Self {
            config,
            store,
            claims,
            executor,
            metrics,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim and execute at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> Result<bool, DatabaseError> {
        let outcome = self
            .claims
            .claim_next(&self.config.worker_id, &self.config.queues)
            .await?;

        for blocked in &outcome.blocked {
            self.executor.notify_terminal(blocked);
        }

        match outcome.job {
            Some(job) => {
                self.executor.execute(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Requeue or fail jobs whose worker stopped renewing them.
    pub async fn reap_expired_leases(&self) -> Result<usize, DatabaseError> {
        let grace = self.config.lease_grace.as_secs() as u32;
        let reaped = self.store.reap_expired_leases(grace, Utc::now()).await?;

        for job in &reaped {
            warn!(job_id = %job.id, status = %job.status, "Reaped expired lease");
            let message = match job.status {
                JobStatus::Queued => "lease expired, requeued",
                _ => "lease expired, attempts exhausted",
            };
            let level = if job.status == JobStatus::Queued {
                LogLevel::Warn
            } else {
                LogLevel::Error
            };
            append_log(self.store.as_ref(), &JobLog::new(&job.id, level, message)).await;
            self.metrics
                .record(MetricEvent::JobLeaseExpired {
                    job_type: job.job_type.clone(),
                })
                .await;
            self.executor.notify_terminal(job);
        }
        Ok(reaped.len())
    }

    /// Idle delay with jitter so workers started together drift apart.
    fn idle_delay(&self) -> Duration {
        let jitter_ms = self.config.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.poll_interval + Duration::from_millis(jitter)
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.worker_id, queues = ?self.config.queues, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => self.idle_delay(),
                Err(e) => {
                    error!(worker = %self.config.worker_id, error = %e, "Worker poll failed");
                    self.idle_delay()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker = %self.config.worker_id, "Worker stopped");
    }
}

/// Spawn a worker poll loop.
pub fn spawn_worker(worker: Arc<Worker>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(worker.run(shutdown))
}

/// Spawn the periodic stale-lease reaper.
pub fn spawn_lease_reaper(
    worker: Arc<Worker>,
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
            match worker.reap_expired_leases().await {
                Ok(0) => debug!("No expired leases"),
                Ok(n) => info!(count = n, "Expired leases reaped"),
                Err(e) => error!(error = %e, "Lease reaper failed"),
            }
        }
    })
}
