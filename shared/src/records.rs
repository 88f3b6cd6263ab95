//! Task log record schema
//!
//! Every task event the engine observes is appended to a log repository as a
//! `LogRecord`. All task history the condition evaluator consumes is derived
//! from these records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of event a log record describes.
///
/// `Run` marks the start of one task execution; the other four are the
/// terminal outcomes of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Run,
    Success,
    Fail,
    Terminate,
    Inaction,
}

impl Action {
    /// Whether this action closes a run (everything except `Run`).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Action::Run)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Success => "success",
            Action::Fail => "fail",
            Action::Terminate => "terminate",
            Action::Inaction => "inaction",
        }
    }

    /// The three actions counted as "finished" (success, fail or terminate).
    pub fn finished() -> [Action; 3] {
        [Action::Success, Action::Fail, Action::Terminate]
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = crate::SchedulingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Action::Run),
            "success" => Ok(Action::Success),
            "fail" => Ok(Action::Fail),
            "terminate" => Ok(Action::Terminate),
            "inaction" => Ok(Action::Inaction),
            other => Err(crate::SchedulingError::Validation(format!(
                "Unknown log action: '{}'",
                other
            ))),
        }
    }
}

/// A single, immutable entry in the task event log.
///
/// `created` is the event time as epoch seconds. Terminal records carry the
/// `start` of the run they close, their own `end` and the resulting `runtime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub task_name: String,
    pub action: Action,
    pub created: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_text: Option<String>,
}

impl LogRecord {
    /// Record for a task starting to run at `created`.
    pub fn run(task_name: impl Into<String>, created: f64) -> Self {
        let task_name = task_name.into();
        Self {
            message: Some(format!("Task '{}' status: 'run'", task_name)),
            task_name,
            action: Action::Run,
            created,
            start: Some(created),
            end: None,
            runtime: None,
            exc_text: None,
        }
    }

    /// Terminal record closing a run that started at `started` (if known).
    pub fn terminal(
        task_name: impl Into<String>,
        action: Action,
        started: Option<f64>,
        created: f64,
    ) -> Self {
        debug_assert!(action.is_terminal());
        let task_name = task_name.into();
        Self {
            message: Some(format!("Task '{}' status: '{}'", task_name, action)),
            task_name,
            action,
            created,
            start: started,
            end: Some(created),
            runtime: started.map(|s| created - s),
            exc_text: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_exc_text(mut self, exc_text: impl Into<String>) -> Self {
        self.exc_text = Some(exc_text.into());
        self
    }
}
