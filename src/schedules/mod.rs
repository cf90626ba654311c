//! Recurring schedules that materialize jobs.

pub mod cadence;
pub mod dispatcher;
pub mod model;

pub use dispatcher::{DispatchReport, ScheduleDispatcher, spawn_schedule_ticker};
pub use model::{Cadence, Schedule, ScheduleSubmission};

use chrono::{DateTime, Utc};

use crate::error::{DatabaseError, SubmitError};
use crate::store::JobStore;

/// Validate and persist a new schedule.
///
/// The target type is not resolved here; an unknown or disabled type is
/// recorded on the schedule when it comes due.
pub async fn create_schedule(
    store: &dyn JobStore,
    submission: ScheduleSubmission,
    now: DateTime<Utc>,
) -> Result<Schedule, SubmitError> {
    let schedule = submission.validate(now)?;
    match store.insert_schedule(&schedule).await {
        Ok(()) => {
            tracing::info!(
                schedule = %schedule.name,
                cadence = schedule.cadence.type_tag(),
                next_run_at = %schedule.next_run_at,
                "Schedule created"
            );
            Ok(schedule)
        }
        Err(DatabaseError::Constraint(_)) => Err(SubmitError::validation(
            "name",
            format!("schedule {} already exists", schedule.name),
        )),
        Err(e) => Err(e.into()),
    }
}
