//! Job submission: validation, type defaults and insertion.
//!
//! Validation failures are returned synchronously and never touch the
//! store.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::error::SubmitError;
use crate::handlers::HandlerRegistry;
use crate::jobs::idempotency::{self, SubmitOutcome};
use crate::jobs::append_log;
use crate::jobs::model::{JobLog, LogLevel, NewJob};
use crate::store::JobStore;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_PRIORITY: i64 = 10;
pub const MAX_TIMEOUT_SEC: i64 = 3600;
pub const MAX_ATTEMPTS: i64 = 10;
pub const MAX_TAGS: usize = 20;
const MAX_TAG_LEN: usize = 64;
const MAX_CALLBACK_URL_LEN: usize = 2048;

static QUEUE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,63}$").expect("static regex"));

/// A job creation request as received from the API layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSubmission {
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
}

impl JobSubmission {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    /// Validate every field and resolve defaults against the type registration.
    pub fn normalize(
        self,
        default_timeout_sec: u32,
        default_max_attempts: u32,
    ) -> Result<NewJob, SubmitError> {
        let job_type = self.job_type.trim().to_string();
        if job_type.is_empty() {
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
        let timeout_sec = match self.timeout_sec {
            Some(t) => validate_timeout(t)?,
            None => default_timeout_sec,
        };
        let max_attempts = match self.max_attempts {
            Some(a) => validate_max_attempts(a)?,
            None => default_max_attempts,
        };
        let callback_url = self
            .callback_url
            .as_deref()
            .map(validate_callback_url)
            .transpose()?;

        let input = match self.input {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };

        Ok(NewJob {
            job_type,
            queue,
            input,
            priority,
            timeout_sec,
            max_attempts,
            callback_url,
            tags: validate_tags(self.tags)?,
        })
    }
}

pub fn validate_queue(queue: &str) -> Result<String, SubmitError> {
    let queue = queue.trim();
    if !QUEUE_PATTERN.is_match(queue) {
        return Err(SubmitError::validation(
            "queue",
            "must be 1-64 characters of letters, digits, '_', '.', ':' or '-'",
        ));
    }
    Ok(queue.to_string())
}

pub fn validate_priority(priority: i64) -> Result<u8, SubmitError> {
    if !(0..=MAX_PRIORITY).contains(&priority) {
        return Err(SubmitError::validation(
            "priority",
            format!("must be between 0 and {MAX_PRIORITY}"),
        ));
    }
    Ok(priority as u8)
}

pub fn validate_timeout(timeout_sec: i64) -> Result<u32, SubmitError> {
    if !(1..=MAX_TIMEOUT_SEC).contains(&timeout_sec) {
        return Err(SubmitError::validation(
            "timeout_sec",
            format!("must be between 1 and {MAX_TIMEOUT_SEC}"),
        ));
    }
    Ok(timeout_sec as u32)
}

pub fn validate_max_attempts(max_attempts: i64) -> Result<u32, SubmitError> {
    if !(1..=MAX_ATTEMPTS).contains(&max_attempts) {
        return Err(SubmitError::validation(
            "max_attempts",
            format!("must be between 1 and {MAX_ATTEMPTS}"),
        ));
    }
    Ok(max_attempts as u32)
}

pub fn validate_callback_url(url: &str) -> Result<String, SubmitError> {
    let url = url.trim();
    if url.len() > MAX_CALLBACK_URL_LEN {
        return Err(SubmitError::validation("callback_url", "is too long"));
    }
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| SubmitError::validation("callback_url", format!("is not a URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SubmitError::validation(
            "callback_url",
            "must use http or https",
        ));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(SubmitError::validation("callback_url", "must have a host"));
    }
    Ok(url.to_string())
}

pub fn validate_tags(tags: Vec<String>) -> Result<Vec<String>, SubmitError> {
    if tags.len() > MAX_TAGS {
        return Err(SubmitError::validation(
            "tags",
            format!("at most {MAX_TAGS} tags are allowed"),
        ));
    }
    tags.into_iter()
        .map(|tag| {
            let tag = tag.trim().to_string();
            if tag.is_empty() || tag.len() > MAX_TAG_LEN {
                Err(SubmitError::validation(
                    "tags",
                    format!("each tag must be 1-{MAX_TAG_LEN} characters"),
                ))
            } else {
                Ok(tag)
            }
        })
        .collect()
}

/// Validate, resolve and persist a job submission.
///
/// With an idempotency key the insert goes through the idempotency guard,
/// which may return an existing job instead of creating one.
pub async fn submit_job(
    store: &dyn JobStore,
    registry: &HandlerRegistry,
    submission: JobSubmission,
    idempotency_key: Option<&str>,
) -> Result<SubmitOutcome, SubmitError> {
    let type_name = submission.job_type.trim().to_string();
    if type_name.is_empty() {
        return Err(SubmitError::validation("type", "is required"));
    }

    let resolved = registry
        .resolve(store, &type_name)
        .await
        .map_err(|e| SubmitError::TypeUnavailable {
            name: type_name.clone(),
            reason: e.to_string(),
        })?;

    let new_job = submission.normalize(
        resolved.registration.default_timeout_sec,
        resolved.registration.default_max_attempts,
    )?;
    let now = Utc::now();

    let outcome = match idempotency_key {
        Some(key) => idempotency::insert_idempotent(store, key, new_job, now).await?,
        None => {
            let job = new_job.into_job(now);
            store.insert_job(&job).await?;
            SubmitOutcome {
                job,
                idempotent_replay: false,
            }
        }
    };

    if !outcome.idempotent_replay {
        info!(
            job_id = %outcome.job.id,
            job_type = %outcome.job.job_type,
            queue = %outcome.job.queue,
            "Job submitted"
        );
        append_log(
            store,
            &JobLog::new(&outcome.job.id, LogLevel::Info, "submitted"),
        )
        .await;
    }
    Ok(outcome)
}
