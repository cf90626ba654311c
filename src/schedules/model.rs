//! Schedule types.
//!
//! A schedule is a recurring template that materializes new queued jobs on
//! a fixed interval or a cron cadence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SubmitError;
use crate::jobs::model::JobFailure;
use crate::jobs::submit::{
    DEFAULT_PRIORITY, DEFAULT_QUEUE, validate_callback_url, validate_max_attempts,
    validate_priority, validate_queue, validate_tags, validate_timeout,
};
use crate::schedules::cadence;

/// Smallest allowed interval cadence.
pub const MIN_INTERVAL_SEC: u32 = 5;
/// Largest allowed interval cadence.
pub const MAX_INTERVAL_SEC: u32 = 86_400;

/// How often a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cadence {
    Interval { seconds: u32 },
    Cron { expr: String, timezone: String },
}

impl Cadence {
    /// The string tag used in logs and metric labels.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Cadence::Interval { .. } => "interval",
            Cadence::Cron { .. } => "cron",
        }
    }
}

/// A persisted schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub job_type: String,
    pub queue: String,
    pub input: serde_json::Value,
    pub priority: u8,
    /// Falls back to the job type's default when unset.
    pub timeout_sec: Option<u32>,
    /// Falls back to the job type's default when unset.
    pub max_attempts: Option<u32>,
    pub callback_url: Option<String>,
    pub tags: Vec<String>,
    pub cadence: Cadence,

    // Runtime state (dispatcher-managed)
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<String>,
    pub last_error: Option<JobFailure>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A schedule creation request as received from the API layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleSubmission {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub timeout_sec: Option<i64>,
    #[serde(default)]
    pub max_attempts: Option<i64>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub interval_sec: Option<i64>,
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub start_in_sec: Option<i64>,
}

impl ScheduleSubmission {
    /// Validate the request and build the schedule row.
    ///
    /// The first run is `now + start_in_sec` when an offset is given.
    /// Without an offset an interval schedule first fires one interval from
    /// now and a cron schedule at its next occurrence.
    pub fn validate(self, now: DateTime<Utc>) -> Result<Schedule, SubmitError> {
        let name = self.name.trim().to_string();
        if name.is_empty() || name.len() > 128 {
            return Err(SubmitError::validation("name", "must be 1-128 characters"));
        }
        if self.job_type.trim().is_empty() {
            return Err(SubmitError::validation("type", "is required"));
        }

        let queue = match self.queue {
            Some(q) => validate_queue(&q)?,
            None => DEFAULT_QUEUE.to_string(),
        };
        let priority = match self.priority {
            Some(p) => validate_priority(p)?,
            None => DEFAULT_PRIORITY,
        };
        let timeout_sec = self.timeout_sec.map(validate_timeout).transpose()?;
        let max_attempts = self.max_attempts.map(validate_max_attempts).transpose()?;
        let callback_url = self
            .callback_url
            .as_deref()
            .map(validate_callback_url)
            .transpose()?;
        let tags = validate_tags(self.tags)?;

        let cadence = match (self.interval_sec, self.cron_expr) {
            (Some(_), Some(_)) => {
                return Err(SubmitError::validation(
                    "cadence",
                    "exactly one of interval_sec or cron_expr is allowed",
                ));
            }
            (None, None) => {
                return Err(SubmitError::validation(
                    "cadence",
                    "one of interval_sec or cron_expr is required",
                ));
            }
            (Some(secs), None) => {
                if secs < MIN_INTERVAL_SEC as i64 || secs > MAX_INTERVAL_SEC as i64 {
                    return Err(SubmitError::validation(
                        "interval_sec",
                        format!("must be between {MIN_INTERVAL_SEC} and {MAX_INTERVAL_SEC}"),
                    ));
                }
                Cadence::Interval {
                    seconds: secs as u32,
                }
            }
            (None, Some(expr)) => {
                let timezone = self.timezone.unwrap_or_else(|| "UTC".to_string());
                cadence::parse_timezone(&timezone)
                    .map_err(|e| SubmitError::validation("timezone", e))?;
                cadence::parse_cron(&expr).map_err(|e| SubmitError::validation("cron_expr", e))?;
                Cadence::Cron { expr, timezone }
            }
        };

        let start_in = match self.start_in_sec {
            Some(s) if !(0..=MAX_INTERVAL_SEC as i64).contains(&s) => {
                return Err(SubmitError::validation(
                    "start_in_sec",
                    format!("must be between 0 and {MAX_INTERVAL_SEC}"),
                ));
            }
            Some(s) => Some(chrono::Duration::seconds(s)),
            None => None,
        };

        let next_run_at = match (&cadence, start_in) {
            (Cadence::Interval { .. }, Some(offset)) => now + offset,
            (Cadence::Interval { seconds }, None) => {
                now + chrono::Duration::seconds(*seconds as i64)
            }
            (Cadence::Cron { .. }, offset) => {
                let base = now + offset.unwrap_or_else(chrono::Duration::zero);
                cadence::next_run_after(&cadence, base)
                    .map_err(|e| SubmitError::validation("cron_expr", e))?
            }
        };

        Ok(Schedule {
            id: Uuid::new_v4().to_string(),
            name,
            enabled: self.enabled.unwrap_or(true),
            job_type: self.job_type.trim().to_string(),
            queue,
            input: self.input,
            priority,
            timeout_sec,
            max_attempts,
            callback_url,
            tags,
            cadence,
            next_run_at,
            last_run_at: None,
            last_job_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}
