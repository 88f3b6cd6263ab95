//! Task records and the task builder
//!
//! A task pairs a runnable body with the declarative state the scheduler
//! acts on: start/end conditions, execution mode, timeout, parameter
//! declarations and the cached projections of its own log history
//! (`last_run`, `last_success`, ...). Tasks are built with [`TaskSpec`] and
//! registered on a session, which enforces name uniqueness.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shared::config::ExecutionMode;
use shared::records::Action;

use crate::args::ArgSource;
use crate::conditions::{Condition, Statement};
use crate::session::Session;

/// Error type task bodies return.
///
/// `Inaction` means "this run had nothing to do" and is logged as its own
/// outcome rather than a failure. `Terminated` is what a cooperative body
/// returns after noticing its cancellation flag. `Restart` and `Shutdown`
/// are the scheduler sentinels; a main-mode body returning one transitions
/// the loop, any other mode sets the matching session flag.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failure(String),
    #[error("nothing to do")]
    Inaction,
    #[error("terminated")]
    Terminated,
    #[error("scheduler restart requested")]
    Restart,
    #[error("scheduler shutdown requested")]
    Shutdown,
}

impl TaskError {
    pub fn failure(msg: impl Into<String>) -> Self {
        TaskError::Failure(msg.into())
    }
}

/// Context handed to every function body at dispatch.
#[derive(Clone)]
pub struct TaskContext {
    session: Arc<Session>,
    task_name: String,
    params: HashMap<String, Value>,
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    pub(crate) fn new(
        session: Arc<Session>,
        task_name: String,
        params: HashMap<String, Value>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session,
            task_name,
            params,
            cancel,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn params(&self) -> &HashMap<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Whether termination has been requested for this run.
    ///
    /// Long-running bodies must poll this (or call [`check_cancelled`]) at
    /// suitable suspension points; a body that never does will outlive
    /// termination requests until it returns.
    ///
    /// [`check_cancelled`]: TaskContext::check_cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Bail out with `TaskError::Terminated` if termination was requested.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Terminated)
        } else {
            Ok(())
        }
    }
}

pub type TaskFn = Arc<dyn Fn(TaskContext) -> Result<Value, TaskError> + Send + Sync>;

/// What a task runs.
///
/// Only a `Command` body can cross a process boundary; `Func` bodies are
/// restricted to main and thread execution. A command exiting with code 75
/// is recorded as inaction, any other non-zero exit as failure.
#[derive(Clone)]
pub enum TaskBody {
    Func(TaskFn),
    Command { program: String, args: Vec<String> },
}

impl fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskBody::Func(_) => f.write_str("Func(..)"),
            TaskBody::Command { program, args } => f
                .debug_struct("Command")
                .field("program", program)
                .field("args", args)
                .finish(),
        }
    }
}

/// Last observed outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    None,
    Run,
    Success,
    Fail,
    Terminate,
    Inaction,
}

impl TaskStatus {
    pub fn from_action(action: Action) -> Self {
        match action {
            Action::Run => TaskStatus::Run,
            Action::Success => TaskStatus::Success,
            Action::Fail => TaskStatus::Fail,
            Action::Terminate => TaskStatus::Terminate,
            Action::Inaction => TaskStatus::Inaction,
        }
    }
}

/// Mutable per-task state, guarded by one mutex.
#[derive(Debug, Default)]
struct TaskState {
    name: String,
    status: TaskStatus,
    force_run: bool,
    last_run: Option<f64>,
    last_success: Option<f64>,
    last_fail: Option<f64>,
    last_terminate: Option<f64>,
    last_inaction: Option<f64>,
}

/// A registered task.
pub struct Task {
    state: Mutex<TaskState>,
    pub body: TaskBody,
    pub execution: ExecutionMode,
    pub start_cond: Condition,
    pub end_cond: Condition,
    pub timeout: Option<Duration>,
    pub parameters: Vec<(String, ArgSource)>,
    pub permanent: bool,
    pub on_startup: bool,
    pub on_shutdown: bool,
    pub description: Option<String>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("execution", &self.execution)
            .field("status", &self.status())
            .finish()
    }
}

impl Task {
    /// Start building a task with the given name.
    pub fn named(name: impl Into<String>) -> TaskSpec {
        TaskSpec::new(name)
    }

    /// Builder for the built-in restart task: a main-mode body raising the
    /// restart sentinel, caught by the scheduler loop.
    pub fn restart_task() -> TaskSpec {
        Task::named("restart")
            .execution(ExecutionMode::Main)
            .func(|_ctx| Err(TaskError::Restart))
    }

    /// Builder for the built-in shutdown task.
    pub fn shutdown_task() -> TaskSpec {
        Task::named("shutdown")
            .execution(ExecutionMode::Main)
            .func(|_ctx| Err(TaskError::Shutdown))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        self.lock().name = name;
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.lock().status = status;
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Run
    }

    pub fn force_run(&self) -> bool {
        self.lock().force_run
    }

    pub fn set_force_run(&self, force: bool) {
        self.lock().force_run = force;
    }

    /// Consume the force-run flag; returns whether it was set.
    pub(crate) fn take_force_run(&self) -> bool {
        let mut state = self.lock();
        std::mem::take(&mut state.force_run)
    }

    pub fn last_run(&self) -> Option<f64> {
        self.lock().last_run
    }

    pub fn last_success(&self) -> Option<f64> {
        self.lock().last_success
    }

    pub fn last_fail(&self) -> Option<f64> {
        self.lock().last_fail
    }

    pub fn last_terminate(&self) -> Option<f64> {
        self.lock().last_terminate
    }

    pub fn last_inaction(&self) -> Option<f64> {
        self.lock().last_inaction
    }

    /// Cached projection: the `created` of the most recent record of the
    /// given action for this task.
    pub fn last_for(&self, action: Action) -> Option<f64> {
        let state = self.lock();
        match action {
            Action::Run => state.last_run,
            Action::Success => state.last_success,
            Action::Fail => state.last_fail,
            Action::Terminate => state.last_terminate,
            Action::Inaction => state.last_inaction,
        }
    }

    pub(crate) fn set_last(&self, action: Action, created: f64) {
        let mut state = self.lock();
        match action {
            Action::Run => state.last_run = Some(created),
            Action::Success => state.last_success = Some(created),
            Action::Fail => state.last_fail = Some(created),
            Action::Terminate => state.last_terminate = Some(created),
            Action::Inaction => state.last_inaction = Some(created),
        }
    }

    /// Reset status (and optionally the cached projections), used between
    /// restart cycles. The log itself is untouched.
    pub(crate) fn reset_state(&self, clear_projections: bool) {
        let mut state = self.lock();
        state.status = TaskStatus::None;
        state.force_run = false;
        if clear_projections {
            state.last_run = None;
            state.last_success = None;
            state.last_fail = None;
            state.last_terminate = None;
            state.last_inaction = None;
        }
    }
}

/// Condition given to the builder: already parsed, or a string for the
/// session's parser registry.
#[derive(Debug, Clone)]
pub enum CondSpec {
    Parsed(Condition),
    Text(String),
}

impl From<Condition> for CondSpec {
    fn from(cond: Condition) -> Self {
        CondSpec::Parsed(cond)
    }
}

impl From<Statement> for CondSpec {
    fn from(statement: Statement) -> Self {
        CondSpec::Parsed(statement.into())
    }
}

impl From<&str> for CondSpec {
    fn from(text: &str) -> Self {
        CondSpec::Text(text.to_string())
    }
}

/// Builder for a task. Finalize by registering on a session.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub(crate) name: String,
    body: Option<TaskBody>,
    execution: Option<ExecutionMode>,
    start_cond: Option<CondSpec>,
    end_cond: Option<CondSpec>,
    timeout: Option<Duration>,
    parameters: Vec<(String, ArgSource)>,
    force_run: bool,
    permanent: bool,
    on_startup: bool,
    on_shutdown: bool,
    description: Option<String>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: None,
            execution: None,
            start_cond: None,
            end_cond: None,
            timeout: None,
            parameters: Vec::new(),
            force_run: false,
            permanent: false,
            on_startup: false,
            on_shutdown: false,
            description: None,
        }
    }

    /// Function body run in main or thread execution.
    pub fn func<F>(mut self, f: F) -> Self
    where
        F: Fn(TaskContext) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.body = Some(TaskBody::Func(Arc::new(f)));
        self
    }

    /// Command body, runnable in any execution mode including process.
    pub fn command(
        mut self,
        program: impl Into<String>,
        args: impl IntoIterator<Item = String>,
    ) -> Self {
        self.body = Some(TaskBody::Command {
            program: program.into(),
            args: args.into_iter().collect(),
        });
        self
    }

    pub fn execution(mut self, mode: ExecutionMode) -> Self {
        self.execution = Some(mode);
        self
    }

    pub fn start_cond(mut self, cond: impl Into<CondSpec>) -> Self {
        self.start_cond = Some(cond.into());
        self
    }

    pub fn end_cond(mut self, cond: impl Into<CondSpec>) -> Self {
        self.end_cond = Some(cond.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declare a parameter: the executor resolves each declared source just
    /// before launch and hands the values to the body.
    pub fn param(mut self, name: impl Into<String>, source: ArgSource) -> Self {
        self.parameters.push((name.into(), source));
        self
    }

    pub fn force_run(mut self) -> Self {
        self.force_run = true;
        self
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    pub fn on_startup(mut self) -> Self {
        self.on_startup = true;
        self
    }

    pub fn on_shutdown(mut self) -> Self {
        self.on_shutdown = true;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Resolve the spec against a session: validate the name, parse string
    /// conditions, apply the configured default execution mode and check
    /// that a process task has a transportable body.
    pub(crate) fn build(self, session: &Session) -> shared::Result<Task> {
        shared::validate_task_name(&self.name)?;

        let execution = self
            .execution
            .unwrap_or_else(|| session.config().task_execution);

        let body = self.body.ok_or_else(|| {
            shared::SchedulingError::Registration(format!(
                "Task '{}' has no body; give it a function or a command",
                self.name
            ))
        })?;

        if execution == ExecutionMode::Process && !matches!(body, TaskBody::Command { .. }) {
            return Err(shared::SchedulingError::Registration(format!(
                "Task '{}' cannot use process execution: a function body cannot be \
                 carried across a process boundary, use a command body",
                self.name
            ))
            .into());
        }

        let start_cond = Self::resolve_cond(self.start_cond, session)?;
        let end_cond = Self::resolve_cond(self.end_cond, session)?;

        Ok(Task {
            state: Mutex::new(TaskState {
                name: self.name,
                status: TaskStatus::None,
                force_run: self.force_run,
                ..TaskState::default()
            }),
            body,
            execution,
            start_cond,
            end_cond,
            timeout: self.timeout,
            parameters: self.parameters,
            permanent: self.permanent,
            on_startup: self.on_startup,
            on_shutdown: self.on_shutdown,
            description: self.description,
        })
    }

    fn resolve_cond(spec: Option<CondSpec>, session: &Session) -> shared::Result<Condition> {
        match spec {
            None => Ok(Condition::False),
            Some(CondSpec::Parsed(cond)) => Ok(cond),
            Some(CondSpec::Text(text)) => session.parse_cond(&text),
        }
    }
}
