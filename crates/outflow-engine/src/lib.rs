//! Replication engine for outflow: manifest config, the read/write
//! pipeline, orchestration activities, retries, and scheduling.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod activities;
pub mod config;
pub mod cursor;
pub mod errors;
pub mod orchestrator;
pub mod pipeline;
pub mod projector;
pub mod rate_limiter;
pub mod scheduler;
pub mod staging;

// Re-export public API for convenience
pub use activities::{Activities, ReplicateOutput};
pub use errors::{RetryPolicy, SyncError};
pub use orchestrator::{execute_sync, SyncExecution};
pub use pipeline::PipelineOptions;
pub use scheduler::{ExecutionReport, Scheduler, SchedulerError};
