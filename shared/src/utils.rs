//! Utility functions for the scheduling engine
//!
//! Checksums for configuration change detection, task name validation and the
//! epoch/calendar conversions used between the log (epoch floats) and the
//! period library (naive local datetimes).

use blake3::Hasher;
use chrono::{Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Calculate BLAKE3 checksum of a string
///
/// Returns the hash as a hex-encoded string (64 characters).
pub fn calculate_string_checksum(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Calculate BLAKE3 checksum of file contents
pub fn calculate_file_checksum<P: AsRef<Path>>(file_path: P) -> crate::Result<String> {
    let content = fs::read_to_string(file_path)?;
    Ok(calculate_string_checksum(&content))
}

/// Validate a task name
///
/// Names must be non-empty, at most 128 characters and free of control
/// characters. Uniqueness is enforced by the session, not here.
pub fn validate_task_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(
            crate::SchedulingError::Validation("Task name cannot be empty".to_string()).into(),
        );
    }

    if name.len() > 128 {
        return Err(crate::SchedulingError::Validation(
            "Task name cannot be longer than 128 characters".to_string(),
        )
        .into());
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(crate::SchedulingError::Validation(
            "Task name cannot contain control characters".to_string(),
        )
        .into());
    }

    Ok(())
}

/// Current time as epoch seconds with sub-second precision
pub fn current_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Current time on the local calendar
pub fn now_naive() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Convert epoch seconds to a local calendar datetime
pub fn epoch_to_datetime(epoch: f64) -> NaiveDateTime {
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1e9).round() as u32;
    match Local.timestamp_opt(secs, nanos) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.naive_local(),
        LocalResult::None => Utc
            .timestamp_opt(secs, nanos)
            .single()
            .map(|dt| dt.naive_utc())
            .unwrap_or(NaiveDateTime::MIN),
    }
}

/// Convert a local calendar datetime to epoch seconds
pub fn datetime_to_epoch(dt: NaiveDateTime) -> f64 {
    match Local.from_local_datetime(&dt) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => {
            t.timestamp_micros() as f64 / 1e6
        }
        // Instant skipped by a DST jump: fall back to interpreting it as UTC.
        LocalResult::None => Utc.from_utc_datetime(&dt).timestamp_micros() as f64 / 1e6,
    }
}

/// Format a runtime in human-readable form
pub fn format_runtime(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{:.1}ms", seconds * 1000.0)
    } else if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else {
        format!("{:.1}m", seconds / 60.0)
    }
}
