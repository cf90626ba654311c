//! Handler contract and registry.
//!
//! Handlers are the pluggable business logic behind a job type. The core
//! only sees them through the [`Handler`] trait; job types are published
//! in the store's type registry and point at a handler key registered here
//! at startup.

pub mod builtin;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use registry::{HandlerRegistry, ResolvedType};

/// A job type registration as stored in the type registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTypeRegistration {
    pub name: String,
    pub enabled: bool,
    pub handler_key: String,
    pub default_timeout_sec: u32,
    pub default_max_attempts: u32,
}

impl JobTypeRegistration {
    /// An enabled registration whose name equals its handler key.
    pub fn new(name: impl Into<String>, default_timeout_sec: u32, default_max_attempts: u32) -> Self {
        let name = name.into();
        Self {
            handler_key: name.clone(),
            name,
            enabled: true,
            default_timeout_sec,
            default_max_attempts,
        }
    }

    pub fn with_handler_key(mut self, key: impl Into<String>) -> Self {
        self.handler_key = key.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// An error raised by a handler.
///
/// `code`, `message` and `details` are recorded on the job verbatim.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct HandlerFailure {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// What a handler knows about the invocation it is serving.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: String,
    pub job_type: String,
    pub queue: String,
    /// 1-based attempt number of this invocation.
    pub attempt: u32,
    pub max_attempts: u32,
    /// The invocation is abandoned once this instant passes.
    pub deadline: tokio::time::Instant,
}

impl HandlerContext {
    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .saturating_duration_since(tokio::time::Instant::now())
    }
}

/// Business logic for one or more job types.
///
/// Handlers must observe cancellation at their own await points: the
/// executor drops the future once the deadline passes.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Registry key this handler is published under.
    fn key(&self) -> &str;

    /// Contract version, for diagnostics.
    fn version(&self) -> u32 {
        1
    }

    /// Execute the job.
    async fn run(
        &self,
        ctx: &HandlerContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerFailure>;

    /// Given a failure, optionally suggest an adjusted input that is safe to
    /// retry exactly once within the same attempt.
    fn retry_hint(
        &self,
        _input: &serde_json::Value,
        _failure: &HandlerFailure,
    ) -> Option<serde_json::Value> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_builders() {
        let reg = JobTypeRegistration::new("report", 60, 3)
            .with_handler_key("reports.v2")
            .disabled();
        assert_eq!(reg.name, "report");
        assert_eq!(reg.handler_key, "reports.v2");
        assert!(!reg.enabled);
    }

    #[test]
    fn failure_display() {
        let f = HandlerFailure::new("E_IO", "disk full");
        assert_eq!(f.to_string(), "E_IO: disk full");
    }
}
