//! Job Runtime: durable job queue, workers and schedules.

pub mod alerts;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod metrics;
pub mod schedules;
pub mod store;

pub use error::{Error, Result};
