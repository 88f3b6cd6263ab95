//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain fields.

/// Default task timeout (30 minutes)
pub fn default_timeout_seconds() -> u64 {
    1800
}

/// Default scheduler tick interval (100 milliseconds)
pub fn default_tick_interval_ms() -> u64 {
    100
}

/// Minimum accepted tick interval (10 milliseconds)
pub fn min_tick_interval_ms() -> u64 {
    10
}

/// Maximum accepted tick interval (60 seconds)
pub fn max_tick_interval_ms() -> u64 {
    60_000
}

/// Default wait for in-flight tasks during shutdown (30 seconds)
pub fn default_shutdown_grace_seconds() -> u64 {
    30
}

/// Default base name for task event loggers
pub fn default_task_logger_basename() -> String {
    "cadence.task".to_string()
}

/// Capacity of the task finish channel between workers and the loop
pub fn default_channel_buffer_size() -> usize {
    1000
}
