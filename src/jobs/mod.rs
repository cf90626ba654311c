//! Job lifecycle: submission, dependency gating, claiming and execution.

pub mod claim;
pub mod dependency;
pub mod executor;
pub mod idempotency;
pub mod model;
pub mod submit;
pub mod worker;

pub use claim::{ClaimEngine, ClaimOutcome};
pub use dependency::DependencyState;
pub use executor::Executor;
pub use idempotency::SubmitOutcome;
pub use model::{ErrorKind, Job, JobFailure, JobLog, JobStatus, LogLevel, NewJob};
pub use submit::{JobSubmission, submit_job};
pub use worker::{Worker, spawn_lease_reaper, spawn_worker};

use crate::store::JobStore;

/// Append a job log entry after a state change has committed.
///
/// A failed append is reported and otherwise ignored; the transition it
/// describes already happened.
pub(crate) async fn append_log(store: &dyn JobStore, log: &JobLog) {
    if let Err(e) = store.append_job_log(log).await {
        tracing::warn!(job_id = %log.job_id, error = %e, "Failed to append job log");
    }
}
