//! Task-history, dependency and scheduler statements
//!
//! Constructors for the built-in statement vocabulary and the observation
//! logic behind them. Historical statements read the log repository (or the
//! cached task projections, depending on `force_status_from_logs`); live
//! statements read the running set.

use chrono::NaiveDateTime;
use std::sync::Arc;

use shared::records::Action;
use shared::time::TimePeriod;
use shared::utils::{datetime_to_epoch, epoch_to_datetime};

use crate::cond_func;
use crate::conditions::{CondContext, Observed, Statement, StatementKind};
use crate::repo::RecordQuery;
use crate::task::Task;

/// Count of `run` records for the task.
pub fn task_started(task: impl Into<String>) -> Statement {
    Statement::new(StatementKind::TaskStarted {
        task: Some(task.into()),
    })
}

/// Count of `success` records for the task.
pub fn task_succeeded(task: impl Into<String>) -> Statement {
    Statement::new(StatementKind::TaskSucceeded {
        task: Some(task.into()),
    })
}

/// Count of `fail` records for the task.
pub fn task_failed(task: impl Into<String>) -> Statement {
    Statement::new(StatementKind::TaskFailed {
        task: Some(task.into()),
    })
}

/// Count of `terminate` records for the task.
pub fn task_terminated(task: impl Into<String>) -> Statement {
    Statement::new(StatementKind::TaskTerminated {
        task: Some(task.into()),
    })
}

/// Count of `inaction` records for the task.
pub fn task_inacted(task: impl Into<String>) -> Statement {
    Statement::new(StatementKind::TaskInacted {
        task: Some(task.into()),
    })
}

/// Count of finished (success, fail or terminate) records for the task.
pub fn task_finished(task: impl Into<String>) -> Statement {
    Statement::new(StatementKind::TaskFinished {
        task: Some(task.into()),
    })
}

/// Whether the task is currently running.
pub fn task_running(task: impl Into<String>) -> Statement {
    Statement::new(StatementKind::TaskRunning {
        task: Some(task.into()),
    })
}

/// Whether the task should run within the given period window.
pub fn task_executable(task: impl Into<String>, period: TimePeriod, retries: u32) -> Statement {
    Statement::new(StatementKind::TaskExecutable {
        task: Some(task.into()),
        retries,
    })
    .with_period(period)
}

/// `task_executable` for the task whose condition is being evaluated.
pub fn current_executable(period: TimePeriod, retries: u32) -> Statement {
    Statement::new(StatementKind::TaskExecutable {
        task: None,
        retries,
    })
    .with_period(period)
}

/// Whether `depend` succeeded after this task last started.
pub fn depend_success(depend: impl Into<String>) -> Statement {
    Statement::new(StatementKind::DependSuccess {
        depend: depend.into(),
    })
}

/// Whether `depend` failed after this task last started.
pub fn depend_failure(depend: impl Into<String>) -> Statement {
    Statement::new(StatementKind::DependFailure {
        depend: depend.into(),
    })
}

/// Whether `depend` finished after this task last started.
pub fn depend_finish(depend: impl Into<String>) -> Statement {
    Statement::new(StatementKind::DependFinish {
        depend: depend.into(),
    })
}

/// Whether the scheduler started within the given period.
pub fn scheduler_started(period: TimePeriod) -> Statement {
    Statement::new(StatementKind::SchedulerStarted).with_period(period)
}

/// Resolve an optional task reference to a name, defaulting to the task in
/// the evaluation context.
fn resolve_task_name(ctx: &CondContext<'_>, task: &Option<String>) -> shared::Result<String> {
    match task {
        Some(name) => Ok(name.clone()),
        None => ctx.task.as_ref().map(|t| t.name()).ok_or_else(|| {
            shared::SchedulingError::Validation(
                "Statement refers to the current task but none is in context".to_string(),
            )
            .into()
        }),
    }
}

/// Epoch bounds of the period window ending at `now`. An unset period means
/// all history; a window opening at the beginning of time leaves the lower
/// bound open.
fn epoch_range(period: Option<&TimePeriod>, now: NaiveDateTime) -> (Option<f64>, Option<f64>) {
    match period {
        None => (None, None),
        Some(period) => {
            let interval = period.rollback(now);
            let min = if interval.start == NaiveDateTime::MIN {
                None
            } else {
                Some(datetime_to_epoch(interval.start))
            };
            (min, Some(datetime_to_epoch(interval.end)))
        }
    }
}

fn count_records(
    ctx: &CondContext<'_>,
    task_name: &str,
    actions: &[Action],
    period: Option<&TimePeriod>,
) -> i64 {
    let (min, max) = epoch_range(period, ctx.now);
    let query = RecordQuery::new()
        .task(task_name)
        .actions(actions.iter().copied())
        .created_range(min, max);
    ctx.session.repo().count(&query) as i64
}

/// Most recent `created` of the given action, from the cached projection or
/// the log depending on configuration.
fn last_of(ctx: &CondContext<'_>, task: &Arc<Task>, action: Action) -> Option<f64> {
    if ctx.session.config().force_status_from_logs {
        ctx.session
            .repo()
            .filter(&RecordQuery::new().task(task.name()).action(action))
            .last()
            .map(|r| r.created)
    } else {
        task.last_for(action)
    }
}

fn last_finished(ctx: &CondContext<'_>, task: &Arc<Task>) -> Option<f64> {
    Action::finished()
        .into_iter()
        .filter_map(|action| last_of(ctx, task, action))
        .fold(None, |acc: Option<f64>, t| {
            Some(acc.map_or(t, |a| a.max(t)))
        })
}

/// Whether the task is in the live running set: an open `run` record, or the
/// cached status, depending on configuration.
fn is_running(ctx: &CondContext<'_>, task_name: &str) -> bool {
    let from_logs = ctx.session.config().force_status_from_logs;
    if !from_logs {
        if let Ok(task) = ctx.session.get_task(task_name) {
            return task.is_running();
        }
    }
    let repo = ctx.session.repo();
    let last_run = repo
        .filter(&RecordQuery::new().task(task_name).action(Action::Run))
        .last()
        .map(|r| r.created);
    let last_terminal = repo
        .filter(
            &RecordQuery::new()
                .task(task_name)
                .actions([
                    Action::Success,
                    Action::Fail,
                    Action::Terminate,
                    Action::Inaction,
                ]),
        )
        .last()
        .map(|r| r.created);
    match (last_run, last_terminal) {
        (Some(run), Some(terminal)) => terminal < run,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Whether the window `[min, max]` holds at least one record of `action`.
fn occurred_within(
    ctx: &CondContext<'_>,
    task_name: &str,
    action: Action,
    min: Option<f64>,
    max: Option<f64>,
) -> bool {
    if !ctx.session.config().force_status_from_logs {
        // The cached projection suffices for a zero/nonzero check.
        if let Ok(task) = ctx.session.get_task(task_name) {
            return match task.last_for(action) {
                None => false,
                Some(t) => min.map_or(true, |m| t >= m) && max.map_or(true, |m| t <= m),
            };
        }
    }
    let query = RecordQuery::new()
        .task(task_name)
        .action(action)
        .created_range(min, max);
    ctx.session.repo().count(&query) > 0
}

fn observe_executable(
    ctx: &CondContext<'_>,
    task: &Option<String>,
    retries: u32,
    period: Option<&TimePeriod>,
) -> shared::Result<Observed> {
    let period = period.cloned().unwrap_or(TimePeriod::Always);
    if !period.contains(ctx.now) {
        return Ok(Observed::Bool(false));
    }
    let name = resolve_task_name(ctx, task)?;

    // A task already running must not be dispatched again.
    if is_running(ctx, &name) {
        return Ok(Observed::Bool(false));
    }

    let (min, max) = epoch_range(Some(&period), ctx.now);
    if occurred_within(ctx, &name, Action::Success, min, max)
        || occurred_within(ctx, &name, Action::Terminate, min, max)
        || occurred_within(ctx, &name, Action::Inaction, min, max)
    {
        return Ok(Observed::Bool(false));
    }

    let fails = count_records(ctx, &name, &[Action::Fail], Some(&period));
    Ok(Observed::Bool(fails <= retries as i64))
}

fn observe_depend(
    ctx: &CondContext<'_>,
    depend: &str,
    actions: DependOn,
) -> shared::Result<Observed> {
    let this = ctx.task.as_ref().ok_or_else(|| {
        shared::SchedulingError::Validation(
            "Dependency statement evaluated without a task in context".to_string(),
        )
    })?;
    let dep = ctx.session.get_task(depend)?;

    let dep_last = match actions {
        DependOn::Success => last_of(ctx, &dep, Action::Success),
        DependOn::Failure => last_of(ctx, &dep, Action::Fail),
        DependOn::Finish => last_finished(ctx, &dep),
    };
    let this_last_run = last_of(ctx, this, Action::Run);

    let ready = match dep_last {
        None => false,
        Some(dep_last) => this_last_run.map_or(true, |run| dep_last > run),
    };
    Ok(Observed::Bool(ready))
}

enum DependOn {
    Success,
    Failure,
    Finish,
}

/// Observe a statement kind against the context.
pub(crate) fn observe(
    kind: &StatementKind,
    period: Option<&TimePeriod>,
    ctx: &CondContext<'_>,
) -> shared::Result<Observed> {
    match kind {
        StatementKind::TaskStarted { task } => {
            let name = resolve_task_name(ctx, task)?;
            Ok(Observed::Count(count_records(
                ctx,
                &name,
                &[Action::Run],
                period,
            )))
        }
        StatementKind::TaskSucceeded { task } => {
            let name = resolve_task_name(ctx, task)?;
            Ok(Observed::Count(count_records(
                ctx,
                &name,
                &[Action::Success],
                period,
            )))
        }
        StatementKind::TaskFailed { task } => {
            let name = resolve_task_name(ctx, task)?;
            Ok(Observed::Count(count_records(
                ctx,
                &name,
                &[Action::Fail],
                period,
            )))
        }
        StatementKind::TaskTerminated { task } => {
            let name = resolve_task_name(ctx, task)?;
            Ok(Observed::Count(count_records(
                ctx,
                &name,
                &[Action::Terminate],
                period,
            )))
        }
        StatementKind::TaskInacted { task } => {
            let name = resolve_task_name(ctx, task)?;
            Ok(Observed::Count(count_records(
                ctx,
                &name,
                &[Action::Inaction],
                period,
            )))
        }
        StatementKind::TaskFinished { task } => {
            let name = resolve_task_name(ctx, task)?;
            Ok(Observed::Count(count_records(
                ctx,
                &name,
                &Action::finished(),
                period,
            )))
        }
        StatementKind::TaskRunning { task } => {
            let name = resolve_task_name(ctx, task)?;
            Ok(Observed::Bool(is_running(ctx, &name)))
        }
        StatementKind::TaskExecutable { task, retries } => {
            observe_executable(ctx, task, *retries, period)
        }
        StatementKind::DependSuccess { depend } => observe_depend(ctx, depend, DependOn::Success),
        StatementKind::DependFailure { depend } => observe_depend(ctx, depend, DependOn::Failure),
        StatementKind::DependFinish { depend } => observe_depend(ctx, depend, DependOn::Finish),
        StatementKind::SchedulerStarted => {
            let started = match ctx.session.started_at() {
                None => return Ok(Observed::Bool(false)),
                Some(epoch) => epoch_to_datetime(epoch),
            };
            let period = period.cloned().unwrap_or(TimePeriod::Always);
            Ok(Observed::Bool(period.rollback(ctx.now).contains(started)))
        }
        StatementKind::Func(func) => func.observe(ctx),
        StatementKind::TaskCond { task, active_time } => {
            cond_func::observe_task_cond(ctx, task, active_time)
        }
    }
}
