//! `JobStore` trait, the single async interface for all persistence.
//!
//! Every state transition that must hold across processes is a single
//! conditional write: it only takes effect if the watched column still
//! holds the value the caller observed.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::handlers::JobTypeRegistration;
use crate::jobs::model::{Job, JobFailure, JobLog, JobStatus};
use crate::schedules::model::Schedule;

/// A recorded idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
}

/// Succeeded/failed counts over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionCounts {
    pub succeeded: u64,
    pub failed: u64,
}

impl CompletionCounts {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Backend-agnostic store for jobs, schedules, idempotency keys and logs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job row.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &str) -> Result<Option<Job>, DatabaseError>;

    /// Batched `{id -> status}` lookup. Unknown ids are absent from the map.
    async fn job_statuses(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, JobStatus>, DatabaseError>;

    /// Queued, unlocked jobs in `queues`, ordered `priority desc, created_at asc`.
    async fn claim_candidates(
        &self,
        queues: &[String],
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Lock a queued job for `worker_id`. Returns false if another claimant won.
    async fn try_lock_job(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move a still-queued, unlocked job straight to `failed`.
    async fn fail_queued_job(
        &self,
        id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Increment `attempts` on a job locked by `worker_id`; returns the new count.
    async fn begin_attempt(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, DatabaseError>;

    /// Mark a locked job succeeded, storing its result and clearing lock and error.
    async fn complete_job(
        &self,
        id: &str,
        worker_id: &str,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Record a failed attempt: requeue while `attempts < max_attempts`,
    /// otherwise fail terminally. Decided atomically against the current row.
    async fn record_job_failure(
        &self,
        id: &str,
        worker_id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Fail a locked job terminally regardless of remaining attempts.
    async fn fail_running_job(
        &self,
        id: &str,
        worker_id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Cancel a job that is still queued and unlocked.
    async fn cancel_job(&self, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Release running jobs whose lease outlived `timeout_sec + grace_sec`.
    async fn reap_expired_leases(
        &self,
        grace_sec: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Job counts per status.
    async fn count_jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>, DatabaseError>;

    /// Creation time of the oldest queued job, if any.
    async fn oldest_queued_created_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Terminal outcomes recorded since `since`.
    async fn completion_counts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<CompletionCounts, DatabaseError>;

    // ── Job logs ────────────────────────────────────────────────────

    /// Append a job log entry.
    async fn append_job_log(&self, log: &JobLog) -> Result<(), DatabaseError>;

    /// All log entries for a job, oldest first.
    async fn list_job_logs(&self, job_id: &str) -> Result<Vec<JobLog>, DatabaseError>;

    // ── Idempotency ─────────────────────────────────────────────────

    /// Look up an idempotency key.
    async fn get_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, DatabaseError>;

    /// Insert a key if it is unseen. Returns false if it already exists.
    async fn reserve_idempotency_key(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<bool, DatabaseError>;

    /// Hand an abandoned reservation to a new submission.
    ///
    /// Compare-and-swap on the stale record's job id and creation time.
    /// Returns false if the key changed since `stale` was read.
    async fn reclaim_idempotency_key(
        &self,
        stale: &IdempotencyRecord,
        record: &IdempotencyRecord,
    ) -> Result<bool, DatabaseError>;

    /// Remove a key whose job insert failed.
    async fn release_idempotency_key(&self, key: &str) -> Result<(), DatabaseError>;

    // ── Schedules ───────────────────────────────────────────────────

    /// Insert a new schedule.
    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError>;

    /// Get a schedule by ID.
    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, DatabaseError>;

    /// List all schedules ordered by name.
    async fn list_schedules(&self) -> Result<Vec<Schedule>, DatabaseError>;

    /// Enable or disable a schedule.
    async fn set_schedule_enabled(
        &self,
        id: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// The enabled schedule with the earliest `next_run_at <= now`.
    async fn next_due_schedule(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Schedule>, DatabaseError>;

    /// Advance a schedule iff `next_run_at` still equals `expected_next_run`.
    async fn claim_schedule(
        &self,
        id: &str,
        expected_next_run: DateTime<Utc>,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Push `next_run_at` and record an error iff `next_run_at` still equals
    /// `expected_next_run`. Used when the cadence itself cannot be evaluated.
    async fn defer_schedule(
        &self,
        id: &str,
        expected_next_run: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        failure: &JobFailure,
    ) -> Result<bool, DatabaseError>;

    /// Record the job created by a dispatch and clear any prior error.
    async fn record_schedule_dispatch(
        &self,
        id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Record a dispatch failure, moving `next_run_at` no earlier than given.
    async fn record_schedule_error(
        &self,
        id: &str,
        failure: &JobFailure,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Type registry ───────────────────────────────────────────────

    /// Get a job type registration.
    async fn get_job_type(&self, name: &str)
    -> Result<Option<JobTypeRegistration>, DatabaseError>;

    /// Publish a job type registration.
    async fn upsert_job_type(&self, registration: &JobTypeRegistration)
    -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Get a runtime setting.
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Set a runtime setting (upsert).
    async fn set_setting(&self, key: &str, value: &serde_json::Value)
    -> Result<(), DatabaseError>;
}
