//! User-supplied predicate conditions
//!
//! `FuncCond` wraps an arbitrary predicate directly. `TaskCond` is for checks
//! too slow to run on every tick: the predicate is registered as an ordinary
//! task and the condition reads that task's recorded outcome, valid for as
//! long as its last success lies within the configured active time.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use shared::records::Action;
use shared::time::TimePeriod;
use shared::utils::epoch_to_datetime;

use crate::conditions::{CondContext, Observed, Statement, StatementKind};
use crate::repo::RecordQuery;

type Predicate = Arc<dyn Fn(&CondContext<'_>) -> shared::Result<bool> + Send + Sync>;

/// A condition whose truth comes straight from a user function.
#[derive(Clone)]
pub struct FuncCond {
    name: String,
    func: Predicate,
}

impl FuncCond {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn observe(&self, ctx: &CondContext<'_>) -> shared::Result<Observed> {
        Ok(Observed::Bool((self.func)(ctx)?))
    }
}

impl fmt::Debug for FuncCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FuncCond({})", self.name)
    }
}

impl PartialEq for FuncCond {
    fn eq(&self, other: &Self) -> bool {
        // Identity comparison: two FuncConds are equal when they wrap the
        // same function instance under the same name.
        self.name == other.name && Arc::ptr_eq(&self.func, &other.func)
    }
}

/// Build a statement from a named predicate.
pub fn func_cond<F>(name: impl Into<String>, func: F) -> Statement
where
    F: Fn(&CondContext<'_>) -> shared::Result<bool> + Send + Sync + 'static,
{
    Statement::new(StatementKind::Func(FuncCond {
        name: name.into(),
        func: Arc::new(func),
    }))
}

/// Build the statement reading a checker task's outcome.
///
/// The checker task itself is registered separately (see
/// `Session::register_cond_task`, which does both at once).
pub fn task_cond(task: impl Into<String>, active_time: TimePeriod) -> Statement {
    Statement::new(StatementKind::TaskCond {
        task: task.into(),
        active_time,
    })
}

/// How a recorded return value reads as a boolean.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub(crate) fn observe_task_cond(
    ctx: &CondContext<'_>,
    task_name: &str,
    active_time: &TimePeriod,
) -> shared::Result<Observed> {
    let task = ctx.session.get_task(task_name)?;

    let last_success = if ctx.session.config().force_status_from_logs {
        ctx.session
            .repo()
            .filter(&RecordQuery::new().task(task.name()).action(Action::Success))
            .last()
            .map(|r| r.created)
    } else {
        task.last_success()
    };

    let valid = match last_success {
        None => false,
        Some(epoch) => active_time.contains(epoch_to_datetime(epoch)),
    };
    if !valid {
        // The last check expired (or never ran): default to false.
        return Ok(Observed::Bool(false));
    }

    let value = ctx.session.returns_of(&task.name());
    Ok(Observed::Bool(value.map_or(false, |v| truthy(&v))))
}
