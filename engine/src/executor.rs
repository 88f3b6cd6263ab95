//! Task executor
//!
//! The executor owns one dispatch: it appends the `run` record, resolves the
//! declared parameters just before launch, starts the body in its execution
//! mode and turns the outcome into a terminal record, the task's new status
//! and (on success) the captured return value.
//!
//! Main-mode bodies run inline and block the scheduler tick. Thread-mode
//! bodies run on a background OS thread and report back over the finish
//! channel. Process-mode bodies are child processes the scheduler reaps by
//! polling their handle.

use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use shared::config::ExecutionMode;
use shared::records::{Action, LogRecord};
use shared::utils::current_epoch;

use crate::repo::LogRepo;
use crate::session::Session;
use crate::task::{Task, TaskBody, TaskContext, TaskError, TaskStatus};

/// Exit code a command body uses to report "nothing to do".
pub const INACTION_EXIT_CODE: i32 = 75;

/// Grace between the termination request (SIGTERM) and the forced kill
/// (SIGKILL) of a process task that has not exited on its own.
pub const TERMINATE_GRACE_SECS: f64 = 10.0;

/// Scheduler-wide signal raised by a task body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    Restart,
    Shutdown,
}

/// Terminal outcome of one task run.
#[derive(Debug)]
pub struct TaskFinish {
    pub task_name: String,
    pub action: Action,
    pub payload: Option<Value>,
    pub error: Option<String>,
    pub started: f64,
    pub finished: f64,
}

impl TaskFinish {
    fn new(task_name: impl Into<String>, action: Action, started: f64) -> Self {
        Self {
            task_name: task_name.into(),
            action,
            payload: None,
            error: None,
            started,
            finished: current_epoch(),
        }
    }
}

/// Result of dispatching a task.
pub enum Dispatch {
    /// Main execution completed inline, possibly raising a loop signal.
    Finished(Option<LoopSignal>),
    /// Thread or process execution is underway.
    Running(RunHandle),
}

/// Live handle to a thread or process execution. The scheduler keeps one per
/// running task and uses it for termination and (for processes) completion
/// polling.
pub struct RunHandle {
    pub task_name: String,
    /// Epoch of the run record; timeouts are measured from here.
    pub started: f64,
    terminate_requested: bool,
    kind: HandleKind,
}

enum HandleKind {
    Thread {
        cancel: Arc<AtomicBool>,
    },
    Process {
        child: Child,
        /// Epoch at which a still-running child is forcibly killed.
        kill_after: Option<f64>,
        killed: bool,
    },
}

/// First phase of process termination; SIGKILL follows from the poll path
/// once the grace window elapses with the child still alive.
#[cfg(unix)]
fn request_stop(task_name: &str, child: &mut Child, _killed: &mut bool) {
    let pid = child.id();
    match Command::new("kill").arg("-TERM").arg(pid.to_string()).output() {
        Ok(output) if output.status.success() => {
            debug!(task = %task_name, "Sent SIGTERM to child {}", pid);
        }
        Ok(output) => {
            debug!(task = %task_name, "kill -TERM exited with {} (child likely gone)", output.status);
        }
        Err(e) => warn!(task = %task_name, "Failed to send SIGTERM to child {}: {}", pid, e),
    }
}

/// Without SIGTERM on this platform, the request kills directly.
#[cfg(not(unix))]
fn request_stop(task_name: &str, child: &mut Child, killed: &mut bool) {
    if let Err(e) = child.kill() {
        debug!(task = %task_name, "Kill failed (child likely exited): {}", e);
    }
    *killed = true;
}

impl RunHandle {
    pub fn execution(&self) -> ExecutionMode {
        match self.kind {
            HandleKind::Thread { .. } => ExecutionMode::Thread,
            HandleKind::Process { .. } => ExecutionMode::Process,
        }
    }

    /// Request termination: cooperative flag for a thread; SIGTERM for a
    /// process, escalated to SIGKILL once the grace window elapses with the
    /// child still running. A thread body that never polls its flag will run
    /// on until it returns.
    pub fn terminate(&mut self) {
        self.terminate_with_grace(TERMINATE_GRACE_SECS);
    }

    pub(crate) fn terminate_with_grace(&mut self, grace_secs: f64) {
        self.terminate_requested = true;
        match &mut self.kind {
            HandleKind::Thread { cancel } => cancel.store(true, Ordering::SeqCst),
            HandleKind::Process {
                child,
                kill_after,
                killed,
            } => {
                // Signal once; repeated requests leave the pending escalation
                // deadline alone.
                if kill_after.is_none() {
                    request_stop(&self.task_name, child, killed);
                    *kill_after = Some(current_epoch() + grace_secs);
                }
            }
        }
    }

    /// Last resort at shutdown: kill a process child outright and reap it;
    /// sets the cooperative flag for a thread.
    pub(crate) fn force_kill(&mut self) {
        self.terminate_requested = true;
        match &mut self.kind {
            HandleKind::Thread { cancel } => cancel.store(true, Ordering::SeqCst),
            HandleKind::Process { child, killed, .. } => {
                if let Err(e) = child.kill() {
                    debug!(task = %self.task_name, "Kill failed (child likely exited): {}", e);
                }
                let _ = child.wait();
                *killed = true;
            }
        }
    }

    /// Reap a finished child process, turning its exit into a finish, and
    /// escalate an overdue termination to SIGKILL. Returns `None` for thread
    /// handles and still-running children.
    pub(crate) fn poll_process(&mut self) -> Option<TaskFinish> {
        let HandleKind::Process {
            child,
            kill_after,
            killed,
        } = &mut self.kind
        else {
            return None;
        };
        match child.try_wait() {
            Ok(None) => {
                if let Some(due) = *kill_after {
                    if !*killed && current_epoch() >= due {
                        warn!(
                            task = %self.task_name,
                            "Termination grace elapsed, killing child"
                        );
                        if let Err(e) = child.kill() {
                            debug!(task = %self.task_name, "Kill failed (child likely exited): {}", e);
                        }
                        *killed = true;
                    }
                }
                None
            }
            Ok(Some(status)) => {
                let stdout = read_pipe(child.stdout.take());
                let stderr = read_pipe(child.stderr.take());
                let mut finish = TaskFinish::new(self.task_name.clone(), Action::Success, self.started);
                if self.terminate_requested {
                    finish.action = Action::Terminate;
                } else if status.success() {
                    finish.payload = Some(parse_stdout_value(&stdout));
                } else if status.code() == Some(INACTION_EXIT_CODE) {
                    finish.action = Action::Inaction;
                } else {
                    finish.action = Action::Fail;
                    finish.error = Some(describe_exit(status, &stderr));
                }
                Some(finish)
            }
            Err(e) => {
                let mut finish = TaskFinish::new(self.task_name.clone(), Action::Fail, self.started);
                finish.error = Some(format!("Failed to poll child process: {}", e));
                Some(finish)
            }
        }
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// The return value of a command body is its last non-empty stdout line,
/// parsed as JSON when possible.
fn parse_stdout_value(stdout: &str) -> Value {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty());
    match line {
        None => Value::Null,
        Some(line) => serde_json::from_str(line.trim())
            .unwrap_or_else(|_| Value::String(line.trim().to_string())),
    }
}

fn describe_exit(status: ExitStatus, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("Command exited with {}", status)
    } else {
        format!("Command exited with {}: {}", status, stderr)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("Task panicked: {}", msg)
    } else {
        "Task panicked".to_string()
    }
}

/// Run a body to completion on the current thread.
fn run_body(body: &TaskBody, ctx: TaskContext) -> Result<Value, TaskError> {
    match body {
        TaskBody::Func(func) => {
            let func = func.clone();
            match catch_unwind(AssertUnwindSafe(move || func(ctx))) {
                Ok(result) => result,
                Err(panic) => Err(TaskError::Failure(panic_message(panic))),
            }
        }
        TaskBody::Command { program, args } => run_command_blocking(program, args, &ctx),
    }
}

fn run_command_blocking(
    program: &str,
    args: &[String],
    ctx: &TaskContext,
) -> Result<Value, TaskError> {
    let mut command = Command::new(program);
    command.args(args);
    append_params_arg(&mut command, ctx.params())?;
    let output = command
        .output()
        .map_err(|e| TaskError::Failure(format!("Failed to launch '{}': {}", program, e)))?;
    if output.status.success() {
        Ok(parse_stdout_value(&String::from_utf8_lossy(&output.stdout)))
    } else if output.status.code() == Some(INACTION_EXIT_CODE) {
        Err(TaskError::Inaction)
    } else {
        Err(TaskError::Failure(describe_exit(
            output.status,
            &String::from_utf8_lossy(&output.stderr),
        )))
    }
}

/// Resolved parameters travel to a child process as one trailing JSON
/// argument.
fn append_params_arg(
    command: &mut Command,
    params: &HashMap<String, Value>,
) -> Result<(), TaskError> {
    if params.is_empty() {
        return Ok(());
    }
    let json = serde_json::to_string(params)
        .map_err(|e| TaskError::Failure(format!("Failed to serialize parameters: {}", e)))?;
    command.arg(json);
    Ok(())
}

/// Map a body outcome to its terminal finish and any loop signal it raised.
fn outcome_to_finish(
    task_name: &str,
    started: f64,
    outcome: Result<Value, TaskError>,
) -> (TaskFinish, Option<LoopSignal>) {
    match outcome {
        Ok(value) => {
            let mut finish = TaskFinish::new(task_name, Action::Success, started);
            finish.payload = Some(value);
            (finish, None)
        }
        Err(TaskError::Inaction) => (TaskFinish::new(task_name, Action::Inaction, started), None),
        Err(TaskError::Terminated) => {
            (TaskFinish::new(task_name, Action::Terminate, started), None)
        }
        Err(TaskError::Failure(msg)) => {
            let mut finish = TaskFinish::new(task_name, Action::Fail, started);
            finish.error = Some(msg);
            (finish, None)
        }
        // Sentinel runs themselves succeed; the signal travels separately
        // and is never recorded as a task failure.
        Err(TaskError::Restart) => {
            let mut finish = TaskFinish::new(task_name, Action::Success, started);
            finish.payload = Some(Value::Null);
            (finish, Some(LoopSignal::Restart))
        }
        Err(TaskError::Shutdown) => {
            let mut finish = TaskFinish::new(task_name, Action::Success, started);
            finish.payload = Some(Value::Null);
            (finish, Some(LoopSignal::Shutdown))
        }
    }
}

pub struct Executor {
    repo: Arc<dyn LogRepo>,
    finish_tx: mpsc::Sender<TaskFinish>,
    logger_basename: String,
}

impl Executor {
    pub fn new(
        repo: Arc<dyn LogRepo>,
        finish_tx: mpsc::Sender<TaskFinish>,
        logger_basename: String,
    ) -> Self {
        Self {
            repo,
            finish_tx,
            logger_basename,
        }
    }

    /// Dispatch one run of the task: log `run`, resolve parameters, launch.
    pub fn dispatch(&self, session: &Arc<Session>, task: &Arc<Task>) -> shared::Result<Dispatch> {
        let name = task.name();
        let started = current_epoch();

        self.repo.append(LogRecord::run(&name, started))?;
        task.set_status(TaskStatus::Run);
        task.set_last(Action::Run, started);
        debug!(
            logger = %format!("{}.{}", self.logger_basename, name),
            execution = %task.execution,
            "Task '{}' starting",
            name
        );

        // Resolve declared parameters just before launch; a failure here
        // fails the task without running the body.
        let mut params: HashMap<String, Value> = HashMap::new();
        for (param_name, source) in &task.parameters {
            match source.resolve(session, task) {
                Ok(value) => {
                    params.insert(param_name.clone(), value);
                }
                Err(e) => {
                    let msg = format!("Failed to resolve parameter '{}': {}", param_name, e);
                    if session.config().silence_task_prerun {
                        warn!(task = %name, "{}", msg);
                    } else {
                        error!(task = %name, "{}", msg);
                    }
                    let mut finish = TaskFinish::new(&name, Action::Fail, started);
                    finish.error = Some(msg);
                    self.apply_finish(session, finish)?;
                    return Ok(Dispatch::Finished(None));
                }
            }
        }

        match task.execution {
            ExecutionMode::Main => {
                let cancel = Arc::new(AtomicBool::new(false));
                let ctx = TaskContext::new(session.clone(), name.clone(), params, cancel);
                let outcome = run_body(&task.body, ctx);
                let (finish, signal) = outcome_to_finish(&name, started, outcome);
                self.apply_finish(session, finish)?;
                Ok(Dispatch::Finished(signal))
            }
            ExecutionMode::Thread => {
                let cancel = Arc::new(AtomicBool::new(false));
                let ctx = TaskContext::new(session.clone(), name.clone(), params, cancel.clone());
                let body = task.body.clone();
                let tx = self.finish_tx.clone();
                let session = session.clone();
                let thread_name = name.clone();
                std::thread::Builder::new()
                    .name(format!("task-{}", name))
                    .spawn(move || {
                        let outcome = run_body(&body, ctx);
                        let (finish, signal) = outcome_to_finish(&thread_name, started, outcome);
                        match signal {
                            Some(LoopSignal::Restart) => session.restart(),
                            Some(LoopSignal::Shutdown) => session.shutdown(),
                            None => {}
                        }
                        if tx.blocking_send(finish).is_err() {
                            warn!(task = %thread_name, "Finish channel closed; result dropped");
                        }
                    })
                    .map_err(|e| {
                        shared::SchedulingError::Validation(format!(
                            "Failed to spawn worker thread for task '{}': {}",
                            name, e
                        ))
                    })?;
                Ok(Dispatch::Running(RunHandle {
                    task_name: name,
                    started,
                    terminate_requested: false,
                    kind: HandleKind::Thread { cancel },
                }))
            }
            ExecutionMode::Process => {
                let TaskBody::Command { program, args } = &task.body else {
                    // Registration validates this; defend anyway.
                    let mut finish = TaskFinish::new(&name, Action::Fail, started);
                    finish.error =
                        Some("Process execution requires a command body".to_string());
                    self.apply_finish(session, finish)?;
                    return Ok(Dispatch::Finished(None));
                };
                let mut command = Command::new(program);
                command
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                if let Err(e) = append_params_arg(&mut command, &params) {
                    let mut finish = TaskFinish::new(&name, Action::Fail, started);
                    finish.error = Some(e.to_string());
                    self.apply_finish(session, finish)?;
                    return Ok(Dispatch::Finished(None));
                }
                match command.spawn() {
                    Ok(child) => Ok(Dispatch::Running(RunHandle {
                        task_name: name,
                        started,
                        terminate_requested: false,
                        kind: HandleKind::Process {
                            child,
                            kill_after: None,
                            killed: false,
                        },
                    })),
                    Err(e) => {
                        let mut finish = TaskFinish::new(&name, Action::Fail, started);
                        finish.error =
                            Some(format!("Failed to launch '{}': {}", program, e));
                        self.apply_finish(session, finish)?;
                        Ok(Dispatch::Finished(None))
                    }
                }
            }
        }
    }

    /// Apply a terminal finish: append the record, update the task's status
    /// and projections, capture the return value.
    pub fn apply_finish(&self, session: &Arc<Session>, finish: TaskFinish) -> shared::Result<()> {
        let mut record = LogRecord::terminal(
            &finish.task_name,
            finish.action,
            Some(finish.started),
            finish.finished,
        );
        if let Some(error) = &finish.error {
            record = record.with_exc_text(error.clone());
        }
        self.repo.append(record)?;

        match session.get_task(&finish.task_name) {
            Ok(task) => {
                task.set_status(TaskStatus::from_action(finish.action));
                task.set_last(finish.action, finish.finished);
            }
            Err(_) => {
                // Removed or renamed while running; the record stands on its own.
                debug!(task = %finish.task_name, "Finish for a task no longer registered");
            }
        }

        if finish.action == Action::Success {
            session.set_return(&finish.task_name, finish.payload.unwrap_or(Value::Null));
        }

        match finish.action {
            Action::Fail => warn!(
                "Task '{}' failed: {}",
                finish.task_name,
                finish.error.as_deref().unwrap_or("unknown error")
            ),
            Action::Terminate => debug!("Task '{}' terminated", finish.task_name),
            _ => debug!(
                "Task '{}' finished with '{}' in {}",
                finish.task_name,
                finish.action,
                shared::utils::format_runtime(finish.finished - finish.started)
            ),
        }
        Ok(())
    }
}
