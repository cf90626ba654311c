//! In-process counters for job and schedule lifecycle events.
//!
//! Recording is observational only: nothing here feeds back into claim,
//! retry or dispatch decisions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

/// A lifecycle event worth counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
    JobClaimed { queue: String },
    JobSucceeded { job_type: String },
    JobRetried { job_type: String, code: String },
    JobFailed { job_type: String, code: String },
    JobDependencyBlocked { queue: String },
    JobLeaseExpired { job_type: String },
    ScheduleDispatched { schedule: String },
    ScheduleError { schedule: String, code: String },
    CallbackDelivered,
    CallbackFailed { reason: String },
    CallbackSkipped { reason: CallbackSkip },
    AlertFired { alert: String },
}

/// Why a callback was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSkip {
    Disabled,
    SigningMisconfigured,
    HostNotAllowed,
}

impl CallbackSkip {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::SigningMisconfigured => "signing_misconfigured",
            Self::HostNotAllowed => "host_not_allowed",
        }
    }
}

impl MetricEvent {
    /// Counter name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobClaimed { .. } => "jobs_claimed_total",
            Self::JobSucceeded { .. } => "jobs_succeeded_total",
            Self::JobRetried { .. } => "jobs_retried_total",
            Self::JobFailed { .. } => "jobs_failed_total",
            Self::JobDependencyBlocked { .. } => "jobs_dependency_blocked_total",
            Self::JobLeaseExpired { .. } => "jobs_lease_expired_total",
            Self::ScheduleDispatched { .. } => "schedules_dispatched_total",
            Self::ScheduleError { .. } => "schedule_errors_total",
            Self::CallbackDelivered => "callbacks_delivered_total",
            Self::CallbackFailed { .. } => "callbacks_failed_total",
            Self::CallbackSkipped { .. } => "callbacks_skipped_total",
            Self::AlertFired { .. } => "alerts_fired_total",
        }
    }

    /// Labels in a stable order.
    pub fn labels(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::JobClaimed { queue } | Self::JobDependencyBlocked { queue } => {
                vec![("queue", queue.clone())]
            }
            Self::JobSucceeded { job_type } | Self::JobLeaseExpired { job_type } => {
                vec![("type", job_type.clone())]
            }
            Self::JobRetried { job_type, code } | Self::JobFailed { job_type, code } => {
                vec![("type", job_type.clone()), ("code", code.clone())]
            }
            Self::ScheduleDispatched { schedule } => vec![("schedule", schedule.clone())],
            Self::ScheduleError { schedule, code } => {
                vec![("schedule", schedule.clone()), ("code", code.clone())]
            }
            Self::CallbackDelivered => Vec::new(),
            Self::CallbackFailed { reason } => vec![("reason", reason.clone())],
            Self::CallbackSkipped { reason } => vec![("reason", reason.as_str().to_string())],
            Self::AlertFired { alert } => vec![("alert", alert.clone())],
        }
    }

    fn series_key(&self) -> String {
        series_key(self.name(), &self.labels())
    }
}

fn series_key(name: &str, labels: &[(&str, String)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}{{{rendered}}}")
}

/// A point-in-time copy of every counter series.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Sum a counter across all of its label sets.
    pub fn total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|(key, _)| *key == name || key.starts_with(&format!("{name}{{")))
            .map(|(_, v)| *v)
            .sum()
    }
}

/// Counter registry shared by the worker, dispatcher and callback paths.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    counters: Arc<RwLock<BTreeMap<String, u64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter series for `event`.
    pub async fn record(&self, event: MetricEvent) {
        let key = event.series_key();
        debug!(metric = %key, "metric event");
        *self.counters.write().await.entry(key).or_insert(0) += 1;
    }

    /// Value of one exact series.
    pub async fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let labels: Vec<(&str, String)> = labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
        let key = series_key(name, &labels);
        self.counters.read().await.get(&key).copied().unwrap_or(0)
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().await.clone(),
        }
    }
}
