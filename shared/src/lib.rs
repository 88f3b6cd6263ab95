//! Shared data structures and utilities for the Cadence scheduling engine
//!
//! This crate contains the value types used across the engine: configuration
//! structures, the task log record schema, the time period library and small
//! utilities.

pub mod config;
pub mod defaults;
pub mod records;
pub mod time;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::{ConfigManager, ExecutionMode, PreExistPolicy, RestartPolicy, SchedulerConfig};
pub use records::{Action, LogRecord};
pub use time::{TimeDelta, TimeInterval, TimeOfDay, TimePeriod, WeekDays};
pub use utils::{current_epoch, validate_task_name};

/// Result type alias used throughout the workspace
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the scheduling engine
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task registration error: {0}")]
    Registration(String),

    #[error("Condition parse error: {0}")]
    CondParse(String),

    #[error("Log repository error: {0}")]
    Repository(String),
}

#[cfg(test)]
mod tests;
