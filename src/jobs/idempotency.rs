//! Idempotent job creation keyed by a client-supplied token.
//!
//! A key is reserved before its job is inserted, so two concurrent
//! submissions with the same key can never both create a job. The stored
//! fingerprint covers every semantically relevant request field after
//! defaults are applied.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::SubmitError;
use crate::jobs::model::{Job, NewJob};
use crate::store::{IdempotencyRecord, JobStore};

const MAX_KEY_LEN: usize = 255;

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: Job,
    /// The job already existed for this idempotency key.
    pub idempotent_replay: bool,
}

/// Deterministic SHA-256 fingerprint of a normalized request.
pub fn fingerprint(job: &NewJob) -> String {
    let value = serde_json::to_value(job).unwrap_or(serde_json::Value::Null);
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Serialize JSON with object keys sorted at every depth.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn validate_key(key: &str) -> Result<&str, SubmitError> {
    let key = key.trim();
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(SubmitError::validation(
            "idempotency_key",
            format!("must be 1-{MAX_KEY_LEN} characters"),
        ));
    }
    Ok(key)
}

/// Age after which a reservation with no job is treated as abandoned.
///
/// A submission that dies between reserving its key and inserting its job
/// leaves such a row behind.
pub const ABANDONED_RESERVATION_SECS: i64 = 300;

/// Create `new_job` unless `key` was already used.
///
/// A matching fingerprint replays the existing job; a different one is a
/// conflict. A reservation older than [`ABANDONED_RESERVATION_SECS`] whose
/// job never appeared is reclaimed by this submission.
pub async fn insert_idempotent(
    store: &dyn JobStore,
    key: &str,
    new_job: NewJob,
    now: DateTime<Utc>,
) -> Result<SubmitOutcome, SubmitError> {
    let key = validate_key(key)?;
    let fingerprint = fingerprint(&new_job);
    let existing = store.get_idempotency_key(key).await?;

    if let Some(existing) = &existing {
        if !is_abandoned(store, existing, now).await? {
            return replay(store, existing.clone(), &fingerprint).await;
        }
    }

    let job = new_job.into_job(now);
    let record = IdempotencyRecord {
        key: key.to_string(),
        fingerprint: fingerprint.clone(),
        job_id: job.id.clone(),
        created_at: now,
    };

    let reserved = match &existing {
        Some(stale) => {
            let reclaimed = store.reclaim_idempotency_key(stale, &record).await?;
            if reclaimed {
                warn!(key, stale_job_id = %stale.job_id, "Reclaimed abandoned idempotency key");
            }
            reclaimed
        }
        None => store.reserve_idempotency_key(&record).await?,
    };

    if !reserved {
        // Lost the race to another submission with the same key.
        return match store.get_idempotency_key(key).await? {
            Some(current) => replay(store, current, &fingerprint).await,
            None => Err(SubmitError::IdempotencyInFlight {
                key: key.to_string(),
            }),
        };
    }

    if let Err(e) = store.insert_job(&job).await {
        warn!(key, error = %e, "Job insert failed, releasing idempotency key");
        if let Err(release_err) = store.release_idempotency_key(key).await {
            warn!(key, error = %release_err, "Failed to release idempotency key");
        }
        return Err(e.into());
    }

    Ok(SubmitOutcome {
        job,
        idempotent_replay: false,
    })
}

/// Whether a reservation is old enough and still has no job.
async fn is_abandoned(
    store: &dyn JobStore,
    record: &IdempotencyRecord,
    now: DateTime<Utc>,
) -> Result<bool, SubmitError> {
    if now - record.created_at < chrono::Duration::seconds(ABANDONED_RESERVATION_SECS) {
        return Ok(false);
    }
    Ok(store.get_job(&record.job_id).await?.is_none())
}

async fn replay(
    store: &dyn JobStore,
    existing: IdempotencyRecord,
    fingerprint: &str,
) -> Result<SubmitOutcome, SubmitError> {
    if existing.fingerprint != fingerprint {
        return Err(SubmitError::IdempotencyConflict { key: existing.key });
    }
    match store.get_job(&existing.job_id).await? {
        Some(job) => {
            debug!(key = %existing.key, job_id = %job.id, "Idempotent replay");
            Ok(SubmitOutcome {
                job,
                idempotent_replay: true,
            })
        }
        // Reserved but the owning submission has not inserted its job yet.
        None => Err(SubmitError::IdempotencyInFlight { key: existing.key }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    fn echo_job(input: serde_json::Value) -> NewJob {
        NewJob {
            job_type: "echo".into(),
            queue: "default".into(),
            input,
            priority: 5,
            timeout_sec: 30,
            max_attempts: 1,
            callback_url: None,
            tags: vec![],
        }
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = echo_job(serde_json::json!({"a": 1, "b": {"x": 1, "y": [1, 2]}}));
        let b = echo_job(serde_json::json!({"b": {"y": [1, 2], "x": 1}, "a": 1}));
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn fingerprint_covers_relevant_fields() {
        let base = echo_job(serde_json::json!({}));
        let mut other = base.clone();
        other.priority = 6;
        assert_ne!(fingerprint(&base), fingerprint(&other));

        let mut tagged = base.clone();
        tagged.tags = vec!["x".into()];
        assert_ne!(fingerprint(&base), fingerprint(&tagged));

        let mut reordered_tags = tagged.clone();
        reordered_tags.tags = vec!["x".into(), "y".into()];
        let mut reversed = tagged.clone();
        reversed.tags = vec!["y".into(), "x".into()];
        assert_ne!(fingerprint(&reordered_tags), fingerprint(&reversed));
    }

    #[tokio::test]
    async fn replay_and_conflict() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let first = insert_idempotent(&store, "k-1", echo_job(serde_json::json!({"n": 1})), Utc::now())
            .await
            .unwrap();
        assert!(!first.idempotent_replay);

        let second = insert_idempotent(&store, "k-1", echo_job(serde_json::json!({"n": 1})), Utc::now())
            .await
            .unwrap();
        assert!(second.idempotent_replay);
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(store.count_jobs_by_status().await.unwrap().values().sum::<u64>(), 1);

        let conflict =
            insert_idempotent(&store, "k-1", echo_job(serde_json::json!({"n": 2})), Utc::now())
                .await
                .unwrap_err();
        assert_eq!(conflict.code(), "IDEMPOTENCY_CONFLICT");
    }

    #[tokio::test]
    async fn reserved_key_without_job_is_in_flight() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let job = echo_job(serde_json::json!({}));
        store
            .reserve_idempotency_key(&IdempotencyRecord {
                key: "k-2".into(),
                fingerprint: fingerprint(&job),
                job_id: "not-yet-inserted".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let err = insert_idempotent(&store, "k-2", job, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::IdempotencyInFlight { .. }));
    }

    #[tokio::test]
    async fn abandoned_reservation_is_reclaimed() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let job = echo_job(serde_json::json!({"n": 3}));
        let now = Utc::now();
        store
            .reserve_idempotency_key(&IdempotencyRecord {
                key: "k-3".into(),
                fingerprint: fingerprint(&job),
                job_id: "never-inserted".into(),
                created_at: now - chrono::Duration::days(30),
            })
            .await
            .unwrap();

        let outcome = insert_idempotent(&store, "k-3", job.clone(), now)
            .await
            .unwrap();
        assert!(!outcome.idempotent_replay);
        assert!(store.get_job(&outcome.job.id).await.unwrap().is_some());

        let record = store.get_idempotency_key("k-3").await.unwrap().unwrap();
        assert_eq!(record.job_id, outcome.job.id);

        let replayed = insert_idempotent(&store, "k-3", job, now).await.unwrap();
        assert!(replayed.idempotent_replay);
        assert_eq!(replayed.job.id, outcome.job.id);
    }

    #[tokio::test]
    async fn reclaim_is_compare_and_swap() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        let stale = IdempotencyRecord {
            key: "k-4".into(),
            fingerprint: "f".into(),
            job_id: "gone".into(),
            created_at: now - chrono::Duration::hours(1),
        };
        store.reserve_idempotency_key(&stale).await.unwrap();

        let first = IdempotencyRecord {
            job_id: "first".into(),
            created_at: now,
            ..stale.clone()
        };
        let second = IdempotencyRecord {
            job_id: "second".into(),
            created_at: now,
            ..stale.clone()
        };
        assert!(store.reclaim_idempotency_key(&stale, &first).await.unwrap());
        assert!(!store.reclaim_idempotency_key(&stale, &second).await.unwrap());
        let record = store.get_idempotency_key("k-4").await.unwrap().unwrap();
        assert_eq!(record.job_id, "first");
    }

    #[tokio::test]
    async fn blank_key_is_validation_error() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let err = insert_idempotent(&store, "  ", echo_job(serde_json::json!({})), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
