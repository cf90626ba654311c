//! Predecessor gating via `input.depends_on`.

use serde_json::Value;

use crate::error::DatabaseError;
use crate::jobs::model::{ErrorKind, JobFailure, JobStatus};
use crate::store::JobStore;

/// Upper bound on predecessors considered per job; extras are dropped.
pub const MAX_DEPENDENCIES: usize = 50;

/// Readiness of a job with respect to its predecessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyState {
    /// No predecessors, or all of them succeeded.
    Ready,
    /// Every predecessor exists and none failed, but some are still in flight.
    Waiting { pending: Vec<String> },
    /// At least one predecessor is missing, failed or cancelled.
    Blocked {
        missing: Vec<String>,
        failed: Vec<String>,
    },
}

impl DependencyState {
    /// The failure recorded on a blocked job.
    pub fn blocked_failure(&self) -> Option<JobFailure> {
        match self {
            Self::Blocked { missing, failed } => {
                let mut parts = Vec::new();
                if !missing.is_empty() {
                    parts.push(format!("missing: {}", missing.join(", ")));
                }
                if !failed.is_empty() {
                    parts.push(format!("failed: {}", failed.join(", ")));
                }
                Some(
                    JobFailure::new(
                        ErrorKind::DependencyBlocked,
                        format!("predecessors cannot succeed ({})", parts.join("; ")),
                    )
                    .with_detail("missing", missing.clone())
                    .with_detail("failed", failed.clone()),
                )
            }
            _ => None,
        }
    }
}

/// Decode the declared predecessor ids of a job.
///
/// Non-string and blank entries are dropped, duplicates keep their first
/// position, a self reference is ignored, and the list is capped at
/// [`MAX_DEPENDENCIES`].
pub fn dependency_ids(job_id: &str, input: &Value) -> Vec<String> {
    let Some(entries) = input.get("depends_on").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut ids: Vec<String> = Vec::new();
    for entry in entries {
        let Some(id) = entry.as_str().map(str::trim) else {
            continue;
        };
        if id.is_empty() || id == job_id || ids.iter().any(|seen| seen == id) {
            continue;
        }
        ids.push(id.to_string());
        if ids.len() == MAX_DEPENDENCIES {
            break;
        }
    }
    ids
}

/// Classify readiness with a single batched status lookup.
pub async fn resolve_dependencies(
    store: &dyn JobStore,
    ids: &[String],
) -> Result<DependencyState, DatabaseError> {
    if ids.is_empty() {
        return Ok(DependencyState::Ready);
    }

    let statuses = store.job_statuses(ids).await?;
    let mut missing = Vec::new();
    let mut failed = Vec::new();
    let mut pending = Vec::new();

    for id in ids {
        match statuses.get(id) {
            None => missing.push(id.clone()),
            Some(JobStatus::Failed | JobStatus::Cancelled) => failed.push(id.clone()),
            Some(JobStatus::Queued | JobStatus::Running) => pending.push(id.clone()),
            Some(JobStatus::Succeeded) => {}
        }
    }

    Ok(if !missing.is_empty() || !failed.is_empty() {
        DependencyState::Blocked { missing, failed }
    } else if !pending.is_empty() {
        DependencyState::Waiting { pending }
    } else {
        DependencyState::Ready
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::jobs::model::{Job, NewJob};
    use crate::store::LibSqlBackend;

    #[test]
    fn ids_are_cleaned() {
        let input = json!({"depends_on": ["a", "  ", 7, "b", "a", "self", null, " c "]});
        assert_eq!(dependency_ids("self", &input), vec!["a", "b", "c"]);
    }

    #[test]
    fn ids_capped() {
        let many: Vec<String> = (0..80).map(|i| format!("job-{i}")).collect();
        let ids = dependency_ids("x", &json!({ "depends_on": many }));
        assert_eq!(ids.len(), MAX_DEPENDENCIES);
        assert_eq!(ids[0], "job-0");
        assert_eq!(ids[49], "job-49");
    }

    #[test]
    fn missing_or_malformed_field_means_none() {
        assert!(dependency_ids("x", &json!({})).is_empty());
        assert!(dependency_ids("x", &json!({"depends_on": "a"})).is_empty());
        assert!(dependency_ids("x", &json!(null)).is_empty());
    }

    async fn job_with_status(store: &LibSqlBackend, status: JobStatus) -> Job {
        let mut job = NewJob {
            job_type: "echo".into(),
            queue: "default".into(),
            input: json!({}),
            priority: 5,
            timeout_sec: 30,
            max_attempts: 1,
            callback_url: None,
            tags: vec![],
        }
        .into_job(Utc::now());
        job.status = status;
        if status == JobStatus::Running {
            job.locked_at = Some(Utc::now());
            job.locked_by = Some("w".into());
        }
        store.insert_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn classification() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let done = job_with_status(&store, JobStatus::Succeeded).await;
        let running = job_with_status(&store, JobStatus::Running).await;
        let failed = job_with_status(&store, JobStatus::Failed).await;
        let cancelled = job_with_status(&store, JobStatus::Cancelled).await;

        assert_eq!(
            resolve_dependencies(&store, &[]).await.unwrap(),
            DependencyState::Ready
        );
        assert_eq!(
            resolve_dependencies(&store, &[done.id.clone()]).await.unwrap(),
            DependencyState::Ready
        );
        assert_eq!(
            resolve_dependencies(&store, &[done.id.clone(), running.id.clone()])
                .await
                .unwrap(),
            DependencyState::Waiting {
                pending: vec![running.id.clone()]
            }
        );

        let blocked = resolve_dependencies(
            &store,
            &[running.id.clone(), failed.id.clone(), cancelled.id.clone(), "ghost".into()],
        )
        .await
        .unwrap();
        assert_eq!(
            blocked,
            DependencyState::Blocked {
                missing: vec!["ghost".into()],
                failed: vec![failed.id.clone(), cancelled.id.clone()],
            }
        );

        let failure = blocked.blocked_failure().unwrap();
        assert_eq!(failure.code, "DEPENDENCY_BLOCKED");
        assert_eq!(failure.details["missing"], json!(["ghost"]));
    }
}
