//! Configuration types.

use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use secrecy::SecretString;
use tokio::sync::Mutex;

use crate::error::ConfigError;

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path of the libSQL database file.
    pub database_path: PathBuf,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub callbacks: CallbackConfig,
    pub alerts: AlertConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/job-runtime.db"),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            callbacks: CallbackConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Build from `JOB_RUNTIME_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            database_path: std::env::var("JOB_RUNTIME_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default().database_path),
            worker: WorkerConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            callbacks: CallbackConfig::from_env(),
            alerts: AlertConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would leave a loop unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.queues.is_empty() {
            return Err(invalid("JOB_RUNTIME_QUEUES", "at least one queue is required"));
        }
        if self.worker.claim_window == 0 {
            return Err(invalid("JOB_RUNTIME_CLAIM_WINDOW", "must be positive"));
        }
        if self.worker.concurrency == 0 {
            return Err(invalid("JOB_RUNTIME_CONCURRENCY", "must be positive"));
        }
        if self.scheduler.batch_limit == 0 {
            return Err(invalid("JOB_RUNTIME_SCHEDULER_BATCH", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.alerts.failure_rate_threshold) {
            return Err(invalid(
                "JOB_RUNTIME_ALERT_FAILURE_RATE",
                "must be between 0 and 1",
            ));
        }
        Ok(())
    }
}

/// Worker poll loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written to `locked_by` on claimed jobs.
    pub worker_id: String,
    /// Queues this worker may claim from.
    pub queues: Vec<String>,
    /// Base delay between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound of random jitter added to each idle poll.
    pub poll_jitter: Duration,
    /// How many candidates a single claim scans.
    pub claim_window: usize,
    /// Number of poll loops run by this process.
    pub concurrency: usize,
    /// Extra time past `timeout_sec` before a running job's lease is reaped.
    pub lease_grace: Duration,
    /// How often the stale-lease reaper runs.
    pub reaper_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            queues: vec!["default".to_string()],
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(250),
            claim_window: 100,
            concurrency: 1,
            lease_grace: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let queues = env_list("JOB_RUNTIME_QUEUES");
        Self {
            worker_id: std::env::var("JOB_RUNTIME_WORKER_ID").unwrap_or(defaults.worker_id),
            queues: if queues.is_empty() {
                defaults.queues
            } else {
                queues
            },
            poll_interval: env_millis("JOB_RUNTIME_POLL_MS", defaults.poll_interval),
            poll_jitter: env_millis("JOB_RUNTIME_POLL_JITTER_MS", defaults.poll_jitter),
            claim_window: env_parse("JOB_RUNTIME_CLAIM_WINDOW", defaults.claim_window),
            concurrency: env_parse("JOB_RUNTIME_CONCURRENCY", defaults.concurrency),
            lease_grace: env_secs("JOB_RUNTIME_LEASE_GRACE_SECS", defaults.lease_grace),
            reaper_interval: env_secs("JOB_RUNTIME_REAPER_SECS", defaults.reaper_interval),
        }
    }
}

/// Schedule dispatcher configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval: Duration,
    /// Maximum schedules dispatched per tick.
    pub batch_limit: usize,
    /// How far `next_run_at` is pushed when a schedule cannot be dispatched.
    pub error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(5),
            batch_limit: 25,
            error_backoff: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("JOB_RUNTIME_SCHEDULER_ENABLED", defaults.enabled),
            tick_interval: env_secs("JOB_RUNTIME_SCHEDULER_TICK_SECS", defaults.tick_interval),
            batch_limit: env_parse("JOB_RUNTIME_SCHEDULER_BATCH", defaults.batch_limit),
            error_backoff: env_secs("JOB_RUNTIME_SCHEDULER_BACKOFF_SECS", defaults.error_backoff),
        }
    }
}

/// Callback delivery configuration.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub enabled: bool,
    /// HMAC secret. Payloads are signed whenever this is set.
    pub signing_secret: Option<SecretString>,
    /// Refuse to deliver unsigned callbacks.
    pub require_signing: bool,
    /// Hosts callbacks may target. Empty allows any host; a leading `.`
    /// matches subdomains; `*` matches everything.
    pub allowed_hosts: Vec<String>,
    pub timeout: Duration,
    /// Maximum clock skew accepted by `verify`.
    pub tolerance: Duration,
    /// How long the runtime policy read from the settings table is reused.
    pub policy_ttl: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signing_secret: None,
            require_signing: false,
            allowed_hosts: Vec::new(),
            timeout: Duration::from_secs(5),
            tolerance: Duration::from_secs(300),
            policy_ttl: Duration::from_secs(30),
        }
    }
}

impl CallbackConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("JOB_RUNTIME_CALLBACKS_ENABLED", defaults.enabled),
            signing_secret: std::env::var("JOB_RUNTIME_CALLBACK_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            require_signing: env_bool("JOB_RUNTIME_CALLBACK_REQUIRE_SIGNING", defaults.require_signing),
            allowed_hosts: env_list("JOB_RUNTIME_CALLBACK_ALLOWED_HOSTS"),
            timeout: env_millis("JOB_RUNTIME_CALLBACK_TIMEOUT_MS", defaults.timeout),
            tolerance: env_secs("JOB_RUNTIME_CALLBACK_TOLERANCE_SECS", defaults.tolerance),
            policy_ttl: env_secs("JOB_RUNTIME_CALLBACK_POLICY_TTL_SECS", defaults.policy_ttl),
        }
    }
}

/// Alert evaluator configuration.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Oldest queued job age that counts as a stalled queue.
    pub queue_stall_threshold: Duration,
    pub failure_rate_window: Duration,
    pub failure_rate_threshold: f64,
    /// Completed jobs required in the window before the failure rate counts.
    pub failure_rate_min_completed: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            queue_stall_threshold: Duration::from_secs(300),
            failure_rate_window: Duration::from_secs(900),
            failure_rate_threshold: 0.5,
            failure_rate_min_completed: 20,
        }
    }
}

impl AlertConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("JOB_RUNTIME_ALERTS_ENABLED", defaults.enabled),
            interval: env_secs("JOB_RUNTIME_ALERT_INTERVAL_SECS", defaults.interval),
            queue_stall_threshold: env_secs(
                "JOB_RUNTIME_ALERT_QUEUE_STALL_SECS",
                defaults.queue_stall_threshold,
            ),
            failure_rate_window: env_secs(
                "JOB_RUNTIME_ALERT_FAILURE_WINDOW_SECS",
                defaults.failure_rate_window,
            ),
            failure_rate_threshold: env_parse(
                "JOB_RUNTIME_ALERT_FAILURE_RATE",
                defaults.failure_rate_threshold,
            ),
            failure_rate_min_completed: env_parse(
                "JOB_RUNTIME_ALERT_MIN_COMPLETED",
                defaults.failure_rate_min_completed,
            ),
        }
    }
}

/// A single cached value with a time-to-live.
///
/// Owned by whichever component reads the underlying policy; there is no
/// process-wide cache.
#[derive(Debug)]
pub struct PolicyCache<T> {
    ttl: Duration,
    slot: Mutex<Option<(T, Instant)>>,
}

impl<T: Clone> PolicyCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Return the cached value, calling `fetch` if it is missing or stale.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut slot = self.slot.lock().await;
        if let Some((value, fetched_at)) = slot.as_ref()
            && fetched_at.elapsed() < self.ttl
        {
            return value.clone();
        }
        let value = fetch().await;
        *slot = Some((value.clone(), Instant::now()));
        value
    }

    /// Drop the cached value so the next read refetches.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

fn default_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref().map(str::trim) {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.worker.claim_window, 100);
        assert_eq!(config.scheduler.batch_limit, 25);
        assert_eq!(config.scheduler.error_backoff, Duration::from_secs(60));
        assert!(config.worker.worker_id.starts_with("worker-"));
        assert_eq!(config.worker.worker_id.len(), "worker-".len() + 8);
    }

    #[test]
    fn validate_rejects_empty_queues() {
        let mut config = RuntimeConfig::default();
        config.worker.queues.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "JOB_RUNTIME_QUEUES"
        ));
    }

    #[test]
    fn validate_rejects_bad_failure_rate() {
        let mut config = RuntimeConfig::default();
        config.alerts.failure_rate_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn policy_cache_reuses_until_stale() {
        let cache = PolicyCache::new(Duration::from_secs(60));
        let fetches = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fetches = fetches.clone();
            let value = cache
                .get_or_refresh(|| async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    42
                })
                .await;
            assert_eq!(value, 42);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        cache.invalidate().await;
        let value = cache.get_or_refresh(|| async { 7 }).await;
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn zero_ttl_always_refetches() {
        let cache = PolicyCache::new(Duration::ZERO);
        assert_eq!(cache.get_or_refresh(|| async { 1 }).await, 1);
        assert_eq!(cache.get_or_refresh(|| async { 2 }).await, 2);
    }
}
