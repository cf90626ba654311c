//! Core job types.
//!
//! A job is a single unit of work with a type, an input payload and a
//! lifecycle status. Payloads are persisted as JSON text; everything in
//! process goes through the typed structs below.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Closed set of error kinds recorded on jobs and schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    DependencyBlocked,
    TypeUnavailable,
    ScheduleTypeUnavailable,
    ScheduleCronInvalid,
    ScheduleDispatchError,
    Timeout,
    LeaseExpired,
    /// Raised by a handler; `code` carries the handler's own code verbatim.
    Handler,
}

impl ErrorKind {
    /// The canonical code used when the error did not come from a handler.
    pub fn default_code(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::DependencyBlocked => "DEPENDENCY_BLOCKED",
            Self::TypeUnavailable => "TYPE_UNAVAILABLE",
            Self::ScheduleTypeUnavailable => "SCHEDULE_TYPE_UNAVAILABLE",
            Self::ScheduleCronInvalid => "SCHEDULE_CRON_INVALID",
            Self::ScheduleDispatchError => "SCHEDULE_DISPATCH_ERROR",
            Self::Timeout => "timeout",
            Self::LeaseExpired => "LEASE_EXPIRED",
            Self::Handler => "HANDLER_ERROR",
        }
    }
}

/// Structured error payload stored on a job or schedule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl JobFailure {
    /// Build a failure of a non-handler kind using its canonical code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.default_code().to_string(),
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    /// Attach a details entry.
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn timeout(timeout_sec: u32) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("handler did not finish within {timeout_sec}s"),
        )
        .with_detail("timeout_sec", timeout_sec)
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub queue: String,
    pub status: JobStatus,
    pub priority: u8,
    pub timeout_sec: u32,
    pub max_attempts: u32,
    pub attempts: u32,
    pub callback_url: Option<String>,
    pub tags: Vec<String>,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field values for a job about to be inserted.
///
/// Produced by submission validation or by the schedule dispatcher, with
/// all defaults already resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: String,
    pub queue: String,
    pub input: serde_json::Value,
    pub priority: u8,
    pub timeout_sec: u32,
    pub max_attempts: u32,
    pub callback_url: Option<String>,
    pub tags: Vec<String>,
}

impl NewJob {
    /// Materialize a queued job row with a fresh id.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::new_v4().to_string(),
            job_type: self.job_type,
            queue: self.queue,
            status: JobStatus::Queued,
            priority: self.priority,
            timeout_sec: self.timeout_sec,
            max_attempts: self.max_attempts,
            attempts: 0,
            callback_url: self.callback_url,
            tags: self.tags,
            input: self.input,
            result: None,
            error: None,
            locked_at: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Append-only job history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl JobLog {
    pub fn new(job_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
