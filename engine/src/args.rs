//! Argument providers
//!
//! Task parameters are declared as `(name, source)` pairs; the executor
//! resolves every declared source just before launch and hands the resulting
//! values to the task body. Sources cover literals, session parameter
//! lookups, the current task's name, a prior task's return value and
//! functions of the session evaluated at dispatch time.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::session::Session;
use crate::task::Task;

type SessionFn = Arc<dyn Fn(&Session) -> shared::Result<Value> + Send + Sync>;

/// Where a declared parameter's value comes from.
#[derive(Clone)]
pub enum ArgSource {
    /// A fixed value.
    Literal(Value),
    /// Lookup in the session parameters by key.
    Param { key: String },
    /// The name of the task being dispatched.
    TaskName,
    /// The return value of another task, with an optional default for when
    /// that task has not produced one yet.
    Return {
        task: String,
        default: Option<Value>,
    },
    /// A function of the session, evaluated at dispatch time.
    Func(SessionFn),
}

impl ArgSource {
    pub fn literal(value: impl Into<Value>) -> Self {
        ArgSource::Literal(value.into())
    }

    pub fn param(key: impl Into<String>) -> Self {
        ArgSource::Param { key: key.into() }
    }

    pub fn task_name() -> Self {
        ArgSource::TaskName
    }

    pub fn task_return(task: impl Into<String>) -> Self {
        ArgSource::Return {
            task: task.into(),
            default: None,
        }
    }

    pub fn task_return_or(task: impl Into<String>, default: impl Into<Value>) -> Self {
        ArgSource::Return {
            task: task.into(),
            default: Some(default.into()),
        }
    }

    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&Session) -> shared::Result<Value> + Send + Sync + 'static,
    {
        ArgSource::Func(Arc::new(f))
    }

    /// Resolve to a concrete value for the given dispatch.
    pub fn resolve(&self, session: &Session, task: &Task) -> shared::Result<Value> {
        match self {
            ArgSource::Literal(value) => Ok(value.clone()),
            ArgSource::Param { key } => session.param(key).ok_or_else(|| {
                shared::SchedulingError::Validation(format!(
                    "Session has no parameter '{}'",
                    key
                ))
                .into()
            }),
            ArgSource::TaskName => Ok(Value::String(task.name())),
            ArgSource::Return { task: source, default } => {
                if let Some(value) = session.returns_of(source) {
                    return Ok(value);
                }
                // Distinguish "no return yet" from "no such task".
                session.get_task(source).map_err(|_| {
                    shared::SchedulingError::Validation(format!(
                        "Task '{}' does not exist; cannot take its return value",
                        source
                    ))
                })?;
                default.clone().ok_or_else(|| {
                    shared::SchedulingError::Validation(format!(
                        "Task '{}' has not returned a value and no default was given",
                        source
                    ))
                    .into()
                })
            }
            ArgSource::Func(f) => f(session),
        }
    }
}

impl fmt::Debug for ArgSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgSource::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            ArgSource::Param { key } => f.debug_struct("Param").field("key", key).finish(),
            ArgSource::TaskName => f.write_str("TaskName"),
            ArgSource::Return { task, default } => f
                .debug_struct("Return")
                .field("task", task)
                .field("default", default)
                .finish(),
            ArgSource::Func(_) => f.write_str("Func(..)"),
        }
    }
}
