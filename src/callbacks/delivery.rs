//! Best-effort delivery of terminal job state to `callback_url`.
//!
//! Delivery runs on its own task with its own timeout. Every outcome is
//! logged and counted; none of them feed back into job state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::callbacks::signing::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::config::{CallbackConfig, PolicyCache};
use crate::error::CallbackError;
use crate::jobs::model::{Job, JobFailure, JobStatus};
use crate::metrics::{CallbackSkip, MetricEvent, Metrics};
use crate::store::JobStore;

/// Settings-table key holding the runtime override.
pub const POLICY_SETTING_KEY: &str = "callbacks";

/// JSON body posted to the callback target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for CallbackPayload {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type.clone(),
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            result: job.result.clone(),
            error: job.error.clone(),
            updated_at: job.updated_at,
        }
    }
}

/// Effective delivery policy: static config overlaid with the settings row.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackPolicy {
    pub enabled: bool,
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyOverride {
    enabled: Option<bool>,
    allowed_hosts: Option<Vec<String>>,
}

/// Outcome of one delivery attempt.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Skipped(CallbackSkip),
    Failed(CallbackError),
}

/// Whether `url`'s host matches the allow-list.
///
/// An empty list allows every host. `*` matches everything, a leading `.`
/// matches the domain and all of its subdomains, anything else must match
/// exactly (case-insensitive).
pub fn host_allowed(url: &str, allowed_hosts: &[String]) -> bool {
    let Some(host) = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    else {
        return false;
    };
    if allowed_hosts.is_empty() {
        return true;
    }
    allowed_hosts.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        if entry == "*" {
            true
        } else if let Some(suffix) = entry.strip_prefix('.') {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host == entry
        }
    })
}

/// Signs and posts callbacks for terminal jobs.
pub struct CallbackDispatcher {
    config: CallbackConfig,
    store: Arc<dyn JobStore>,
    client: reqwest::Client,
    metrics: Metrics,
    policy: PolicyCache<CallbackPolicy>,
}

impl CallbackDispatcher {
    pub fn new(config: CallbackConfig, store: Arc<dyn JobStore>, metrics: Metrics) -> Self {
        let policy = PolicyCache::new(config.policy_ttl);
        Self {
            config,
            store,
            client: reqwest::Client::new(),
            metrics,
            policy,
        }
    }

    /// Spawn delivery for `job` if it is terminal and has a callback target.
    pub fn notify(self: &Arc<Self>, job: &Job) -> Option<JoinHandle<DeliveryOutcome>> {
        if !job.status.is_terminal() || job.callback_url.is_none() {
            return None;
        }
        let dispatcher = Arc::clone(self);
        let job = job.clone();
        Some(tokio::spawn(async move { dispatcher.deliver(&job).await }))
    }

    /// The current policy, refreshed from the settings table once per TTL.
    pub async fn current_policy(&self) -> CallbackPolicy {
        self.policy
            .get_or_refresh(|| async {
                let mut policy = CallbackPolicy {
                    enabled: self.config.enabled,
                    allowed_hosts: self.config.allowed_hosts.clone(),
                };
                match self.store.get_setting(POLICY_SETTING_KEY).await {
                    Ok(Some(value)) => match serde_json::from_value::<PolicyOverride>(value) {
                        Ok(overrides) => {
                            if let Some(enabled) = overrides.enabled {
                                policy.enabled = enabled;
                            }
                            if let Some(hosts) = overrides.allowed_hosts {
                                policy.allowed_hosts = hosts;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed callback policy setting"),
                    },
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Failed to read callback policy; using config"),
                }
                policy
            })
            .await
    }

    /// Deliver one callback. Never returns an error to the caller.
    pub async fn deliver(&self, job: &Job) -> DeliveryOutcome {
        let Some(url) = job.callback_url.as_deref() else {
            return DeliveryOutcome::Skipped(CallbackSkip::Disabled);
        };

        let policy = self.current_policy().await;
        if !policy.enabled {
            return self.skip(job, CallbackSkip::Disabled).await;
        }
        if self.config.require_signing && self.config.signing_secret.is_none() {
            return self.skip(job, CallbackSkip::SigningMisconfigured).await;
        }
        if !host_allowed(url, &policy.allowed_hosts) {
            return self.skip(job, CallbackSkip::HostNotAllowed).await;
        }

        match self.post(url, job).await {
            Ok(status) => {
                info!(job_id = %job.id, url, status, "Callback delivered");
                self.metrics.record(MetricEvent::CallbackDelivered).await;
                DeliveryOutcome::Delivered { status }
            }
            Err(e) => {
                warn!(job_id = %job.id, url, error = %e, "Callback delivery failed");
                let reason = match &e {
                    CallbackError::Timeout { .. } => "timeout",
                    CallbackError::BadStatus { .. } => "bad_status",
                    CallbackError::RequestFailed { .. } => "request_failed",
                    CallbackError::Signing(_) => "signing",
                    CallbackError::Serialization(_) => "serialization",
                };
                self.metrics
                    .record(MetricEvent::CallbackFailed {
                        reason: reason.to_string(),
                    })
                    .await;
                DeliveryOutcome::Failed(e)
            }
        }
    }

    async fn skip(&self, job: &Job, reason: CallbackSkip) -> DeliveryOutcome {
        if reason == CallbackSkip::Disabled {
            debug!(job_id = %job.id, "Callbacks disabled, skipping");
        } else {
            warn!(job_id = %job.id, reason = reason.as_str(), "Callback skipped");
        }
        self.metrics
            .record(MetricEvent::CallbackSkipped { reason })
            .await;
        DeliveryOutcome::Skipped(reason)
    }

    async fn post(&self, url: &str, job: &Job) -> Result<u16, CallbackError> {
        let body = serde_json::to_string(&CallbackPayload::from(job))?;
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.config.timeout);

        if let Some(secret) = &self.config.signing_secret {
            let timestamp = Utc::now().timestamp();
            let signature =
                signing::sign(&body, secret.expose_secret().as_bytes(), timestamp)?;
            request = request
                .header(TIMESTAMP_HEADER, timestamp.to_string())
                .header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                CallbackError::Timeout {
                    url: url.to_string(),
                    timeout: self.config.timeout,
                }
            } else {
                CallbackError::RequestFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallbackError::BadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(status.as_u16())
    }
}
