//! Test modules for the engine crate

mod dependencies_tests;
mod repo_tests;
mod scheduler_tests;
mod task_tests;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::sync::Arc;

use shared::config::SchedulerConfig;
use shared::records::{Action, LogRecord};
use shared::utils::datetime_to_epoch;

use crate::session::Session;

/// Naive local datetime helper.
pub(crate) fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, mi, s)
        .unwrap()
}

/// Epoch seconds of a naive local datetime.
pub(crate) fn epoch(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> f64 {
    datetime_to_epoch(dt(y, mo, d, h, mi, s))
}

/// Route engine logs to the test output when `RUST_LOG` is set.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A session with default configuration and the in-memory repository.
pub(crate) fn test_session() -> Arc<Session> {
    init_test_logging();
    Session::new(SchedulerConfig::default())
}

/// A session ticking fast enough for loop tests.
pub(crate) fn fast_session() -> Arc<Session> {
    init_test_logging();
    let mut config = SchedulerConfig::default();
    config.tick_interval_ms = 10;
    config.shutdown_grace_seconds = 2;
    Session::new(config)
}

/// Append a history record and keep the task's cached projection in sync,
/// the way the executor maintains both during a run.
pub(crate) fn record_event(session: &Arc<Session>, task_name: &str, action: Action, created: f64) {
    let record = match action {
        Action::Run => LogRecord::run(task_name, created),
        terminal => LogRecord::terminal(task_name, terminal, None, created),
    };
    session.repo().append(record).unwrap();
    if let Ok(task) = session.get_task(task_name) {
        task.set_last(action, created);
    }
}

/// A body that succeeds with no value.
pub(crate) fn noop_body(
    _ctx: crate::task::TaskContext,
) -> Result<Value, crate::task::TaskError> {
    Ok(Value::Null)
}
