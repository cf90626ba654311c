//! Periodic health checks over the job store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::AlertConfig;
use crate::error::DatabaseError;
use crate::metrics::{MetricEvent, Metrics};
use crate::store::JobStore;

/// A condition worth paging someone about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum Alert {
    /// The oldest queued job has waited longer than the threshold.
    QueueStalled {
        oldest_age_sec: i64,
        threshold_sec: u64,
    },
    /// Too many terminal outcomes in the window were failures.
    FailureRateHigh {
        rate: f64,
        failed: u64,
        completed: u64,
    },
}

impl Alert {
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueueStalled { .. } => "queue_stalled",
            Self::FailureRateHigh { .. } => "failure_rate_high",
        }
    }
}

pub struct AlertEvaluator {
    store: Arc<dyn JobStore>,
    metrics: Metrics,
    config: AlertConfig,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn JobStore>, metrics: Metrics, config: AlertConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// Evaluate every check as of `now` and return the ones that fired.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<Vec<Alert>, DatabaseError> {
        let mut alerts = Vec::new();

        if let Some(oldest) = self.store.oldest_queued_created_at().await? {
            let age = (now - oldest).num_seconds();
            let threshold = self.config.queue_stall_threshold.as_secs();
            if age >= 0 && age as u64 >= threshold {
                alerts.push(Alert::QueueStalled {
                    oldest_age_sec: age,
                    threshold_sec: threshold,
                });
            }
        }

        let window = chrono::Duration::from_std(self.config.failure_rate_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        let counts = self.store.completion_counts_since(now - window).await?;
        let completed = counts.total();
        if completed > 0 && completed >= self.config.failure_rate_min_completed {
            let rate = counts.failed as f64 / completed as f64;
            if rate >= self.config.failure_rate_threshold {
                alerts.push(Alert::FailureRateHigh {
                    rate,
                    failed: counts.failed,
                    completed,
                });
            }
        }

        for alert in &alerts {
            warn!(alert = alert.name(), details = ?alert, "Alert fired");
            self.metrics
                .record(MetricEvent::AlertFired {
                    alert: alert.name().to_string(),
                })
                .await;
        }
        Ok(alerts)
    }
}

/// Spawn the periodic alert evaluation.
pub fn spawn_alert_ticker(
    evaluator: Arc<AlertEvaluator>,
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
            match evaluator.evaluate(Utc::now()).await {
                Ok(alerts) if alerts.is_empty() => debug!("No alerts"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Alert evaluation failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::jobs::model::{ErrorKind, JobFailure, NewJob};
    use crate::store::LibSqlBackend;

    fn new_job() -> NewJob {
        NewJob {
            job_type: "echo".into(),
            queue: "default".into(),
            input: json!({}),
            priority: 5,
            timeout_sec: 5,
            max_attempts: 1,
            callback_url: None,
            tags: vec![],
        }
    }

    fn evaluator(store: Arc<LibSqlBackend>, metrics: Metrics) -> AlertEvaluator {
        AlertEvaluator::new(
            store,
            metrics,
            AlertConfig {
                queue_stall_threshold: Duration::from_secs(60),
                failure_rate_min_completed: 4,
                failure_rate_threshold: 0.5,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn quiet_store_fires_nothing() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let alerts = evaluator(store, Metrics::new())
            .evaluate(Utc::now())
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn old_queued_job_stalls_queue() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let metrics = Metrics::new();
        let created = Utc::now() - chrono::Duration::seconds(600);
        store.insert_job(&new_job().into_job(created)).await.unwrap();

        let alerts = evaluator(store, metrics.clone())
            .evaluate(Utc::now())
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0], Alert::QueueStalled { oldest_age_sec, .. } if oldest_age_sec >= 600));
        assert_eq!(
            metrics
                .counter("alerts_fired_total", &[("alert", "queue_stalled")])
                .await,
            1
        );
    }

    #[tokio::test]
    async fn failure_rate_needs_minimum_volume() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        let failure = JobFailure::new(ErrorKind::Handler, "boom");

        for _ in 0..3 {
            let job = new_job().into_job(now);
            store.insert_job(&job).await.unwrap();
            store.fail_queued_job(&job.id, &failure, now).await.unwrap();
        }

        let eval = evaluator(store.clone(), Metrics::new());
        // three completions is below the minimum of four
        assert!(eval.evaluate(now).await.unwrap().is_empty());

        let ok = new_job().into_job(now);
        store.insert_job(&ok).await.unwrap();
        store.try_lock_job(&ok.id, "w", now).await.unwrap();
        store.begin_attempt(&ok.id, "w", now).await.unwrap();
        store.complete_job(&ok.id, "w", &json!({}), now).await.unwrap();

        let alerts = eval.evaluate(now).await.unwrap();
        assert_eq!(
            alerts,
            vec![Alert::FailureRateHigh {
                rate: 0.75,
                failed: 3,
                completed: 4
            }]
        );
    }
}
