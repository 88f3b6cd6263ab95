//! Configuration types and validation for the scheduling engine
//!
//! This module defines the scheduler configuration structure, the enums it is
//! built from, validation logic and a small manager that loads the
//! configuration from a TOML file and detects on-disk changes by checksum.

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a task execution is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Inline in the scheduler loop; the tick blocks until completion.
    #[default]
    Main,
    /// On a background OS thread with cooperative cancellation.
    Thread,
    /// In a separate OS process, killed on termination.
    Process,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::Main => "main",
            ExecutionMode::Thread => "thread",
            ExecutionMode::Process => "process",
        };
        f.write_str(s)
    }
}

/// What to do when a task is registered under a name that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreExistPolicy {
    /// Reject the registration (default).
    #[default]
    Raise,
    /// Keep the existing task, drop the new one.
    Ignore,
    /// Register the new task under `"<name> - N"` with the smallest free N.
    Rename,
    /// Swap the new task in place of the existing one.
    Replace,
}

/// How the registry is treated when the scheduler restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Re-enter the loop with the registry exactly as it is.
    #[default]
    Recall,
    /// Reload configuration if changed on disk and reset task statuses.
    Relaunch,
    /// Reset statuses and cached projections; the log itself is preserved.
    Fresh,
}

/// Scheduler configuration, loadable from `scheduler.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Execution mode used when a task does not specify one
    #[serde(default)]
    pub task_execution: ExecutionMode,
    /// Name collision policy at registration
    #[serde(default)]
    pub task_pre_exist: PreExistPolicy,
    /// Downgrade parameter-resolution failures to warnings (the task still fails)
    #[serde(default)]
    pub silence_task_prerun: bool,
    /// Treat condition evaluation errors as false instead of aborting the loop
    #[serde(default)]
    pub silence_cond_check: bool,
    /// Default task timeout in seconds, measured from the start of a run
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Condition string evaluated each tick; when true the scheduler shuts down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shut_cond: Option<String>,
    /// Registry treatment on restart
    #[serde(default)]
    pub restarting: RestartPolicy,
    /// Derive task status from the log instead of the cached projections
    #[serde(default)]
    pub force_status_from_logs: bool,
    /// Base name for per-task event loggers
    #[serde(default = "default_task_logger_basename")]
    pub task_logger_basename: String,
    /// Skip the grace wait for running tasks on shutdown
    #[serde(default)]
    pub instant_shutdown: bool,
    /// Scheduler tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Maximum wait for in-flight tasks during graceful shutdown, in seconds
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    /// Capacity of the worker-to-loop finish channel
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_execution: ExecutionMode::default(),
            task_pre_exist: PreExistPolicy::default(),
            silence_task_prerun: false,
            silence_cond_check: false,
            timeout_seconds: default_timeout_seconds(),
            shut_cond: None,
            restarting: RestartPolicy::default(),
            force_status_from_logs: false,
            task_logger_basename: default_task_logger_basename(),
            instant_shutdown: false,
            tick_interval_ms: default_tick_interval_ms(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            channel_buffer_size: default_channel_buffer_size(),
        }
    }
}

impl SchedulerConfig {
    /// Check configured values for out-of-range settings.
    pub fn validate(&self) -> crate::Result<()> {
        if self.tick_interval_ms < min_tick_interval_ms()
            || self.tick_interval_ms > max_tick_interval_ms()
        {
            return Err(crate::SchedulingError::Config(format!(
                "tick_interval_ms must be between {} and {}, got {}",
                min_tick_interval_ms(),
                max_tick_interval_ms(),
                self.tick_interval_ms
            ))
            .into());
        }
        if self.timeout_seconds == 0 {
            return Err(crate::SchedulingError::Config(
                "timeout_seconds must be greater than zero".to_string(),
            )
            .into());
        }
        if self.task_logger_basename.is_empty() {
            return Err(crate::SchedulingError::Config(
                "task_logger_basename cannot be empty".to_string(),
            )
            .into());
        }
        if self.channel_buffer_size == 0 {
            return Err(crate::SchedulingError::Config(
                "channel_buffer_size must be greater than zero".to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Loads the scheduler configuration from disk and tracks its checksum so a
/// restart can decide whether a reload is warranted.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    pub config: SchedulerConfig,
    checksum: String,
}

impl ConfigManager {
    /// Load, validate and checksum the configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            crate::SchedulingError::Config(format!(
                "Failed to read configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: SchedulerConfig = toml::from_str(&content).map_err(|e| {
            crate::SchedulingError::Config(format!(
                "Failed to parse configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        let checksum = crate::utils::calculate_string_checksum(&content);
        tracing::debug!(path = %path.display(), "Loaded scheduler configuration");
        Ok(Self {
            path,
            config,
            checksum,
        })
    }

    /// Whether the file on disk differs from the loaded configuration.
    pub fn changed_on_disk(&self) -> bool {
        crate::utils::calculate_file_checksum(&self.path)
            .map(|sum| sum != self.checksum)
            .unwrap_or(false)
    }

    /// Reload the file if it changed; returns whether a reload happened.
    pub fn reload_if_changed(&mut self) -> crate::Result<bool> {
        if !self.changed_on_disk() {
            return Ok(false);
        }
        let reloaded = Self::load(&self.path)?;
        self.config = reloaded.config;
        self.checksum = reloaded.checksum;
        tracing::info!(path = %self.path.display(), "Reloaded changed configuration");
        Ok(true)
    }
}
