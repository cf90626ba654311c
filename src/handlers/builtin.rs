//! Built-in handlers.

use async_trait::async_trait;

use crate::handlers::{Handler, HandlerContext, HandlerFailure, JobTypeRegistration};

/// Returns its input unchanged. Used for smoke tests and health checks.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl EchoHandler {
    pub const KEY: &'static str = "echo";

    pub fn new() -> Self {
        Self
    }

    /// The registration published for this handler at startup.
    pub fn registration() -> JobTypeRegistration {
        JobTypeRegistration::new(Self::KEY, 30, 1)
    }
}

#[async_trait]
impl Handler for EchoHandler {
    fn key(&self) -> &str {
        Self::KEY
    }

    async fn run(
        &self,
        _ctx: &HandlerContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerFailure> {
        Ok(input)
    }
}
