//! libSQL backend for the async `JobStore` trait implementation.
//!
//! Supports local file and in-memory databases. Claim, attempt and
//! dispatch transitions are single conditional `UPDATE` statements so they
//! stay correct when several processes share the same database file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::handlers::JobTypeRegistration;
use crate::jobs::model::{ErrorKind, Job, JobFailure, JobLog, JobStatus, LogLevel};
use crate::schedules::model::{Cadence, Schedule};
use crate::store::migrations;
use crate::store::traits::{CompletionCounts, IdempotencyRecord, JobStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a raw statement, for tests that need to damage the schema.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("execute_raw: {e}")))
    }

    /// Run a statement that returns job rows.
    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    /// Run a statement that returns at most one job row.
    async fn query_job(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Job>, DatabaseError> {
        Ok(self.query_jobs(op, sql, params).await?.into_iter().next())
    }

    /// Run a statement that returns schedule rows.
    async fn query_schedules(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Schedule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut schedules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            schedules.push(row_to_schedule(&row)?);
        }
        Ok(schedules)
    }

    /// Count rows per status for a `SELECT status, COUNT(*)` query.
    async fn status_counts(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<HashMap<JobStatus, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut counts = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
            let count: i64 = row.get(1).unwrap_or(0);
            counts.insert(
                status.parse().map_err(DatabaseError::Serialization)?,
                narrow(count, "status count")?,
            );
        }
        Ok(counts)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, type, queue, status, priority, timeout_sec, max_attempts, attempts, callback_url, tags, input, result, error, locked_at, locked_by, created_at, updated_at";

const SCHEDULE_COLUMNS: &str = "id, name, enabled, type, queue, input, priority, timeout_sec, max_attempts, callback_url, tags, interval_sec, cron_expr, timezone, next_run_at, last_run_at, last_job_id, last_error, created_at, updated_at";

/// Canonical timestamp encoding: fixed-width RFC 3339 UTC with microseconds,
/// so lexical order is chronological and equality checks are exact.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!("invalid timestamp {s:?}")))
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(|s| parse_datetime(&s)).transpose()
}

/// Narrow a stored integer, rejecting values the column type cannot hold.
fn narrow<T: TryFrom<i64>>(value: i64, what: &str) -> Result<T, DatabaseError> {
    T::try_from(value)
        .map_err(|_| DatabaseError::Serialization(format!("{what} out of range: {value}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<u32>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v as i64),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn decode_failure(raw: Option<String>) -> Result<Option<JobFailure>, DatabaseError> {
    raw.map(|s| serde_json::from_str::<JobFailure>(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("error payload: {e}")))
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("job id: {e}")))?;
    let status_str: String = row.get(3).unwrap_or_else(|_| "queued".to_string());
    let tags_str: String = row.get(9).unwrap_or_else(|_| "[]".to_string());
    let input_str: String = row.get(10).unwrap_or_else(|_| "null".to_string());
    let result: Option<serde_json::Value> = match row.get::<String>(11).ok() {
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("job {id} result: {e}")))?,
        ),
        None => None,
    };
    let created_str: String = row.get(15).unwrap_or_default();
    let updated_str: String = row.get(16).unwrap_or_default();

    Ok(Job {
        job_type: row.get(1).unwrap_or_default(),
        queue: row.get(2).unwrap_or_default(),
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        priority: narrow(row.get::<i64>(4).unwrap_or(5), &format!("job {id} priority"))?,
        timeout_sec: narrow(row.get::<i64>(5).unwrap_or(0), &format!("job {id} timeout_sec"))?,
        max_attempts: narrow(row.get::<i64>(6).unwrap_or(1), &format!("job {id} max_attempts"))?,
        attempts: narrow(row.get::<i64>(7).unwrap_or(0), &format!("job {id} attempts"))?,
        callback_url: row.get::<String>(8).ok(),
        tags: serde_json::from_str(&tags_str)
            .map_err(|e| DatabaseError::Serialization(format!("job {id} tags: {e}")))?,
        input: serde_json::from_str(&input_str)
            .map_err(|e| DatabaseError::Serialization(format!("job {id} input: {e}")))?,
        result,
        error: decode_failure(row.get::<String>(12).ok())?,
        locked_at: parse_opt_datetime(row.get::<String>(13).ok())?,
        locked_by: row.get::<String>(14).ok(),
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
        id,
    })
}

/// Map a libsql Row to a Schedule.
///
/// Column order matches SCHEDULE_COLUMNS.
fn row_to_schedule(row: &libsql::Row) -> Result<Schedule, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("schedule id: {e}")))?;
    let input_str: String = row.get(5).unwrap_or_else(|_| "null".to_string());
    let tags_str: String = row.get(10).unwrap_or_else(|_| "[]".to_string());

    let cadence = match (row.get::<i64>(11).ok(), row.get::<String>(12).ok()) {
        (Some(secs), None) => Cadence::Interval {
            seconds: narrow(secs, &format!("schedule {id} interval_sec"))?,
        },
        (None, Some(expr)) => Cadence::Cron {
            expr,
            timezone: row.get::<String>(13).unwrap_or_else(|_| "UTC".to_string()),
        },
        _ => {
            return Err(DatabaseError::Serialization(format!(
                "schedule {id} must have exactly one cadence"
            )));
        }
    };

    let next_run_str: String = row.get(14).unwrap_or_default();
    let created_str: String = row.get(18).unwrap_or_default();
    let updated_str: String = row.get(19).unwrap_or_default();

    Ok(Schedule {
        name: row.get(1).unwrap_or_default(),
        enabled: row.get::<i64>(2).unwrap_or(0) != 0,
        job_type: row.get(3).unwrap_or_default(),
        queue: row.get(4).unwrap_or_default(),
        input: serde_json::from_str(&input_str)
            .map_err(|e| DatabaseError::Serialization(format!("schedule {id} input: {e}")))?,
        priority: narrow(row.get::<i64>(6).unwrap_or(5), &format!("schedule {id} priority"))?,
        timeout_sec: row
            .get::<i64>(7)
            .ok()
            .map(|v| narrow(v, &format!("schedule {id} timeout_sec")))
            .transpose()?,
        max_attempts: row
            .get::<i64>(8)
            .ok()
            .map(|v| narrow(v, &format!("schedule {id} max_attempts")))
            .transpose()?,
        callback_url: row.get::<String>(9).ok(),
        tags: serde_json::from_str(&tags_str)
            .map_err(|e| DatabaseError::Serialization(format!("schedule {id} tags: {e}")))?,
        cadence,
        next_run_at: parse_datetime(&next_run_str)?,
        last_run_at: parse_opt_datetime(row.get::<String>(15).ok())?,
        last_job_id: row.get::<String>(16).ok(),
        last_error: decode_failure(row.get::<String>(17).ok())?,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
        id,
    })
}

fn row_to_job_log(row: &libsql::Row) -> Result<JobLog, DatabaseError> {
    let level_str: String = row.get(2).unwrap_or_else(|_| "info".to_string());
    let created_str: String = row.get(1).unwrap_or_default();
    let metadata_str: String = row.get(4).unwrap_or_else(|_| "null".to_string());
    Ok(JobLog {
        job_id: row.get(0).unwrap_or_default(),
        timestamp: parse_datetime(&created_str)?,
        level: level_str.parse().unwrap_or(LogLevel::Info),
        message: row.get(3).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
    })
}

/// Whether a running job's lease has outlived its timeout plus grace.
fn lease_expired(job: &Job, grace_sec: u32, now: DateTime<Utc>) -> bool {
    match job.locked_at {
        Some(locked_at) => {
            let budget = chrono::Duration::seconds(job.timeout_sec as i64 + grace_sec as i64);
            locked_at + budget < now
        }
        None => false,
    }
}

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let result_json: libsql::Value = match &job.result {
            Some(v) => libsql::Value::Text(to_json(v)?),
            None => libsql::Value::Null,
        };
        let error_json: libsql::Value = match &job.error {
            Some(f) => libsql::Value::Text(to_json(f)?),
            None => libsql::Value::Null,
        };

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    job.id.clone(),
                    job.job_type.clone(),
                    job.queue.clone(),
                    job.status.as_str(),
                    job.priority as i64,
                    job.timeout_sec as i64,
                    job.max_attempts as i64,
                    job.attempts as i64,
                    opt_text(job.callback_url.as_deref()),
                    to_json(&job.tags)?,
                    to_json(&job.input)?,
                    result_json,
                    error_json,
                    opt_text(job.locked_at.map(fmt_ts).as_deref()),
                    opt_text(job.locked_by.as_deref()),
                    fmt_ts(job.created_at),
                    fmt_ts(job.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, DatabaseError> {
        self.query_job(
            "get_job",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
        )
        .await
    }

    async fn job_statuses(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, JobStatus>, DatabaseError> {
        let mut statuses = HashMap::new();
        if ids.is_empty() {
            return Ok(statuses);
        }

        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT id, status FROM jobs WHERE id IN ({placeholders})"),
                libsql::params::params_from_iter(ids.iter().cloned()),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("job_statuses: {e}")))?;

        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("job_statuses: {e}")))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("job_statuses: {e}")))?;
            let status: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("job_statuses: {e}")))?;
            statuses.insert(id, status.parse().map_err(DatabaseError::Serialization)?);
        }
        Ok(statuses)
    }

    async fn claim_candidates(
        &self,
        queues: &[String],
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        if queues.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let placeholders = (1..=queues.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let limit_idx = queues.len() + 1;
        let mut values: Vec<libsql::Value> = queues
            .iter()
            .map(|q| libsql::Value::Text(q.clone()))
            .collect();
        values.push(libsql::Value::Integer(limit as i64));

        self.query_jobs(
            "claim_candidates",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE status = 'queued' AND locked_at IS NULL AND queue IN ({placeholders}) \
                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT ?{limit_idx}"
            ),
            libsql::params::params_from_iter(values),
        )
        .await
    }

    async fn try_lock_job(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'running', locked_at = ?1, locked_by = ?2, updated_at = ?1 \
                 WHERE id = ?3 AND status = 'queued' AND locked_at IS NULL",
                params![fmt_ts(now), worker_id, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_lock_job: {e}")))?;
        Ok(count == 1)
    }

    async fn fail_queued_job(
        &self,
        id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        self.query_job(
            "fail_queued_job",
            &format!(
                "UPDATE jobs SET status = 'failed', error = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'queued' AND locked_at IS NULL \
                 RETURNING {JOB_COLUMNS}"
            ),
            params![to_json(failure)?, fmt_ts(now), id],
        )
        .await
    }

    async fn begin_attempt(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE jobs SET attempts = attempts + 1, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'running' AND locked_by = ?3 \
                 RETURNING attempts",
                params![fmt_ts(now), id, worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("begin_attempt: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(narrow(row.get::<i64>(0).unwrap_or(0), "attempts")?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("begin_attempt: {e}"))),
        }
    }

    async fn complete_job(
        &self,
        id: &str,
        worker_id: &str,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        self.query_job(
            "complete_job",
            &format!(
                "UPDATE jobs SET status = 'succeeded', result = ?1, error = NULL, \
                 locked_at = NULL, locked_by = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'running' AND locked_by = ?4 \
                 RETURNING {JOB_COLUMNS}"
            ),
            params![to_json(result)?, fmt_ts(now), id, worker_id],
        )
        .await
    }

    async fn record_job_failure(
        &self,
        id: &str,
        worker_id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        self.query_job(
            "record_job_failure",
            &format!(
                "UPDATE jobs SET \
                 status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'failed' END, \
                 error = ?1, locked_at = NULL, locked_by = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'running' AND locked_by = ?4 \
                 RETURNING {JOB_COLUMNS}"
            ),
            params![to_json(failure)?, fmt_ts(now), id, worker_id],
        )
        .await
    }

    async fn fail_running_job(
        &self,
        id: &str,
        worker_id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        self.query_job(
            "fail_running_job",
            &format!(
                "UPDATE jobs SET status = 'failed', error = ?1, \
                 locked_at = NULL, locked_by = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'running' AND locked_by = ?4 \
                 RETURNING {JOB_COLUMNS}"
            ),
            params![to_json(failure)?, fmt_ts(now), id, worker_id],
        )
        .await
    }

    async fn cancel_job(&self, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'cancelled', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'queued' AND locked_at IS NULL",
                params![fmt_ts(now), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_job: {e}")))?;
        Ok(count == 1)
    }

    async fn reap_expired_leases(
        &self,
        grace_sec: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let running = self
            .query_jobs(
                "reap_expired_leases",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running'"),
                (),
            )
            .await?;

        let mut reaped = Vec::new();
        for job in running.into_iter().filter(|j| lease_expired(j, grace_sec, now)) {
            let Some(locked_at) = job.locked_at else {
                continue;
            };
            let failure = JobFailure::new(
                ErrorKind::LeaseExpired,
                format!(
                    "lease held by {} expired without a result",
                    job.locked_by.as_deref().unwrap_or("unknown worker")
                ),
            )
            .with_detail("locked_by", job.locked_by.clone().unwrap_or_default())
            .with_detail("locked_at", fmt_ts(locked_at));

            let updated = self
                .query_job(
                    "reap_expired_leases",
                    &format!(
                        "UPDATE jobs SET \
                         status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'failed' END, \
                         error = ?1, locked_at = NULL, locked_by = NULL, updated_at = ?2 \
                         WHERE id = ?3 AND status = 'running' AND locked_at = ?4 \
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![to_json(&failure)?, fmt_ts(now), job.id.clone(), fmt_ts(locked_at)],
                )
                .await?;
            if let Some(updated) = updated {
                reaped.push(updated);
            }
        }
        Ok(reaped)
    }

    async fn count_jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>, DatabaseError> {
        self.status_counts(
            "count_jobs_by_status",
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
            (),
        )
        .await
    }

    async fn oldest_queued_created_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT MIN(created_at) FROM jobs WHERE status = 'queued'", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("oldest_queued_created_at: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => parse_opt_datetime(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "oldest_queued_created_at: {e}"
            ))),
        }
    }

    async fn completion_counts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<CompletionCounts, DatabaseError> {
        let counts = self
            .status_counts(
                "completion_counts_since",
                "SELECT status, COUNT(*) FROM jobs \
                 WHERE status IN ('succeeded', 'failed') AND updated_at >= ?1 GROUP BY status",
                params![fmt_ts(since)],
            )
            .await?;
        Ok(CompletionCounts {
            succeeded: counts.get(&JobStatus::Succeeded).copied().unwrap_or(0),
            failed: counts.get(&JobStatus::Failed).copied().unwrap_or(0),
        })
    }

    // ── Job logs ────────────────────────────────────────────────────

    async fn append_job_log(&self, log: &JobLog) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO job_logs (job_id, created_at, level, message, metadata) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    log.job_id.clone(),
                    fmt_ts(log.timestamp),
                    log.level.as_str(),
                    log.message.clone(),
                    to_json(&log.metadata)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_job_log: {e}")))?;
        Ok(())
    }

    async fn list_job_logs(&self, job_id: &str) -> Result<Vec<JobLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT job_id, created_at, level, message, metadata FROM job_logs WHERE job_id = ?1 ORDER BY id ASC",
                params![job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_job_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_job_logs: {e}")))?
        {
            logs.push(row_to_job_log(&row)?);
        }
        Ok(logs)
    }

    // ── Idempotency ─────────────────────────────────────────────────

    async fn get_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT key, request_fingerprint, job_id, created_at FROM idempotency_keys WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_idempotency_key: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let created_str: String = row.get(3).unwrap_or_default();
                Ok(Some(IdempotencyRecord {
                    key: row.get(0).unwrap_or_default(),
                    fingerprint: row.get(1).unwrap_or_default(),
                    job_id: row.get(2).unwrap_or_default(),
                    created_at: parse_datetime(&created_str)?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_idempotency_key: {e}"))),
        }
    }

    async fn reserve_idempotency_key(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "INSERT INTO idempotency_keys (key, request_fingerprint, job_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT(key) DO NOTHING",
                params![
                    record.key.clone(),
                    record.fingerprint.clone(),
                    record.job_id.clone(),
                    fmt_ts(record.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reserve_idempotency_key: {e}")))?;
        Ok(count == 1)
    }

    async fn reclaim_idempotency_key(
        &self,
        stale: &IdempotencyRecord,
        record: &IdempotencyRecord,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE idempotency_keys SET request_fingerprint = ?1, job_id = ?2, created_at = ?3 \
                 WHERE key = ?4 AND job_id = ?5 AND created_at = ?6",
                params![
                    record.fingerprint.clone(),
                    record.job_id.clone(),
                    fmt_ts(record.created_at),
                    stale.key.clone(),
                    stale.job_id.clone(),
                    fmt_ts(stale.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reclaim_idempotency_key: {e}")))?;
        Ok(count == 1)
    }

    async fn release_idempotency_key(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM idempotency_keys WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("release_idempotency_key: {e}")))?;
        Ok(())
    }

    // ── Schedules ───────────────────────────────────────────────────

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError> {
        let (interval_sec, cron_expr, timezone) = match &schedule.cadence {
            Cadence::Interval { seconds } => (opt_int(Some(*seconds)), libsql::Value::Null, libsql::Value::Null),
            Cadence::Cron { expr, timezone } => (
                libsql::Value::Null,
                libsql::Value::Text(expr.clone()),
                libsql::Value::Text(timezone.clone()),
            ),
        };
        let last_error: libsql::Value = match &schedule.last_error {
            Some(f) => libsql::Value::Text(to_json(f)?),
            None => libsql::Value::Null,
        };

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO job_schedules ({SCHEDULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
                ),
                params![
                    schedule.id.clone(),
                    schedule.name.clone(),
                    schedule.enabled as i64,
                    schedule.job_type.clone(),
                    schedule.queue.clone(),
                    to_json(&schedule.input)?,
                    schedule.priority as i64,
                    opt_int(schedule.timeout_sec),
                    opt_int(schedule.max_attempts),
                    opt_text(schedule.callback_url.as_deref()),
                    to_json(&schedule.tags)?,
                    interval_sec,
                    cron_expr,
                    timezone,
                    fmt_ts(schedule.next_run_at),
                    opt_text(schedule.last_run_at.map(fmt_ts).as_deref()),
                    opt_text(schedule.last_job_id.as_deref()),
                    last_error,
                    fmt_ts(schedule.created_at),
                    fmt_ts(schedule.updated_at),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!(
                        "schedule name {} already exists",
                        schedule.name
                    ))
                } else {
                    DatabaseError::Query(format!("insert_schedule: {msg}"))
                }
            })?;
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, DatabaseError> {
        Ok(self
            .query_schedules(
                "get_schedule",
                &format!("SELECT {SCHEDULE_COLUMNS} FROM job_schedules WHERE id = ?1"),
                params![id],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, DatabaseError> {
        self.query_schedules(
            "list_schedules",
            &format!("SELECT {SCHEDULE_COLUMNS} FROM job_schedules ORDER BY name"),
            (),
        )
        .await
    }

    async fn set_schedule_enabled(
        &self,
        id: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE job_schedules SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, fmt_ts(now), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_schedule_enabled: {e}")))?;
        Ok(count == 1)
    }

    async fn next_due_schedule(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Schedule>, DatabaseError> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM job_schedules \
             WHERE enabled = 1 AND next_run_at <= ?1 \
             ORDER BY next_run_at ASC, id ASC LIMIT 1"
        );
        loop {
            let mut rows = self
                .conn()
                .query(&sql, params![fmt_ts(now)])
                .await
                .map_err(|e| DatabaseError::Query(format!("next_due_schedule: {e}")))?;
            let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("next_due_schedule: {e}")))?
            else {
                return Ok(None);
            };

            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("schedule id: {e}")))?;
            let stored: String = row.get(14).unwrap_or_default();
            let decoded = match parse_datetime(&stored) {
                Ok(_) => Ok(row_to_schedule(&row)?),
                Err(e) => Err(e),
            };
            drop(rows);

            match decoded {
                Ok(schedule) => {
                    let canonical = fmt_ts(schedule.next_run_at);
                    if stored != canonical {
                        self.conn()
                            .execute(
                                "UPDATE job_schedules SET next_run_at = ?1 WHERE id = ?2 AND next_run_at = ?3",
                                params![canonical, id, stored],
                            )
                            .await
                            .map_err(|e| DatabaseError::Query(format!("next_due_schedule: {e}")))?;
                    }
                    return Ok(Some(schedule));
                }
                Err(e) => {
                    // Conditional writes on next_run_at could never match; park it.
                    warn!(schedule_id = %id, next_run_at = %stored, "Disabling schedule with unreadable next_run_at");
                    let failure = JobFailure::new(ErrorKind::ScheduleDispatchError, e.to_string());
                    self.conn()
                        .execute(
                            "UPDATE job_schedules SET enabled = 0, last_error = ?1, updated_at = ?2 \
                             WHERE id = ?3 AND next_run_at = ?4",
                            params![to_json(&failure)?, fmt_ts(now), id, stored],
                        )
                        .await
                        .map_err(|e| DatabaseError::Query(format!("next_due_schedule: {e}")))?;
                }
            }
        }
    }

    async fn claim_schedule(
        &self,
        id: &str,
        expected_next_run: DateTime<Utc>,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE job_schedules SET last_run_at = ?1, next_run_at = ?2, updated_at = ?1 \
                 WHERE id = ?3 AND enabled = 1 AND next_run_at = ?4",
                params![
                    fmt_ts(last_run_at),
                    fmt_ts(next_run_at),
                    id,
                    fmt_ts(expected_next_run),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_schedule: {e}")))?;
        Ok(count == 1)
    }

    async fn defer_schedule(
        &self,
        id: &str,
        expected_next_run: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        failure: &JobFailure,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE job_schedules SET next_run_at = ?1, last_error = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND next_run_at = ?5",
                params![
                    fmt_ts(next_run_at),
                    to_json(failure)?,
                    fmt_ts(Utc::now()),
                    id,
                    fmt_ts(expected_next_run),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("defer_schedule: {e}")))?;
        Ok(count == 1)
    }

    async fn record_schedule_dispatch(
        &self,
        id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE job_schedules SET last_job_id = ?1, last_error = NULL, updated_at = ?2 WHERE id = ?3",
                params![job_id, fmt_ts(now), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_schedule_dispatch: {e}")))?;
        Ok(())
    }

    async fn record_schedule_error(
        &self,
        id: &str,
        failure: &JobFailure,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE job_schedules SET last_error = ?1, next_run_at = MAX(next_run_at, ?2), updated_at = ?3 \
                 WHERE id = ?4",
                params![to_json(failure)?, fmt_ts(next_run_at), fmt_ts(now), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_schedule_error: {e}")))?;
        Ok(())
    }

    // ── Type registry ───────────────────────────────────────────────

    async fn get_job_type(
        &self,
        name: &str,
    ) -> Result<Option<JobTypeRegistration>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT name, enabled, handler_key, default_timeout_sec, default_max_attempts FROM job_types WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_type: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(JobTypeRegistration {
                name: row.get(0).unwrap_or_default(),
                enabled: row.get::<i64>(1).unwrap_or(0) != 0,
                handler_key: row.get(2).unwrap_or_default(),
                default_timeout_sec: narrow(row.get::<i64>(3).unwrap_or(60), "default_timeout_sec")?,
                default_max_attempts: narrow(row.get::<i64>(4).unwrap_or(1), "default_max_attempts")?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job_type: {e}"))),
        }
    }

    async fn upsert_job_type(
        &self,
        registration: &JobTypeRegistration,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO job_types (name, enabled, handler_key, default_timeout_sec, default_max_attempts) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(name) DO UPDATE SET enabled = excluded.enabled, handler_key = excluded.handler_key, \
                 default_timeout_sec = excluded.default_timeout_sec, default_max_attempts = excluded.default_max_attempts",
                params![
                    registration.name.clone(),
                    registration.enabled as i64,
                    registration.handler_key.clone(),
                    registration.default_timeout_sec as i64,
                    registration.default_max_attempts as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_job_type: {e}")))?;
        Ok(())
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;
                serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| DatabaseError::Serialization(format!("setting {key}: {e}")))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now')) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, to_json(value)?],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
