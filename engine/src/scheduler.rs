//! Scheduler loop
//!
//! A single cooperative control loop: each tick it applies finished runs,
//! checks the shutdown condition and the session's restart/shutdown flags,
//! terminates running tasks whose end condition or timeout fired, and
//! dispatches tasks whose start condition (or force-run flag) holds.
//!
//! The loop is the sole mutator of dispatch decisions and task status
//! transitions; workers only report back through the finish channel and the
//! log repository.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use shared::config::RestartPolicy;
use shared::records::Action;
use shared::utils::{current_epoch, now_naive};

use crate::conditions::{CondContext, Condition};
use crate::executor::{Dispatch, Executor, LoopSignal, RunHandle, TaskFinish};
use crate::session::Session;
use crate::task::Task;

/// Loop lifecycle: `Initial -> Running -> Stopping | Restarting`, and
/// `Terminated` once the final shutdown sequence has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Initial,
    Running,
    Stopping,
    Restarting,
    Terminated,
}

pub struct Scheduler {
    session: Arc<Session>,
    executor: Executor,
    finish_rx: mpsc::Receiver<TaskFinish>,
    /// Live thread/process runs, keyed by task name.
    handles: HashMap<String, RunHandle>,
    /// Parsed shutdown condition for the current cycle.
    shut_cond: Option<Condition>,
    pub state: SchedulerState,
}

impl Scheduler {
    pub fn new(session: Arc<Session>) -> shared::Result<Self> {
        let config = session.config();
        config.validate()?;
        let (finish_tx, finish_rx) = mpsc::channel(config.channel_buffer_size);
        let executor = Executor::new(
            session.repo(),
            finish_tx,
            config.task_logger_basename.clone(),
        );
        Ok(Self {
            session,
            executor,
            finish_rx,
            handles: HashMap::new(),
            shut_cond: None,
            state: SchedulerState::Initial,
        })
    }

    pub fn is_running(&self) -> bool {
        self.state == SchedulerState::Running
    }

    /// Run until shut down. A restart re-enters the startup sequence per the
    /// configured restart policy.
    pub async fn run(&mut self) -> shared::Result<()> {
        info!("Starting scheduler");
        // Pick up history from a repository that outlived the process.
        self.session.rebuild_projections();
        loop {
            self.startup().await?;
            if self.state == SchedulerState::Running {
                self.main_loop().await?;
            }
            self.shutdown_sequence().await?;
            if self.state == SchedulerState::Restarting {
                self.apply_restart_policy()?;
                info!("Restarting scheduler loop");
                continue;
            }
            self.state = SchedulerState::Terminated;
            info!("Scheduler terminated");
            return Ok(());
        }
    }

    /// Begin a cycle: parse the shutdown condition and run every startup
    /// task to completion, in registration order, before scheduling begins.
    async fn startup(&mut self) -> shared::Result<()> {
        let config = self.session.config();
        self.session.set_started_at(current_epoch());
        // Drain stale flags so a request from a previous cycle cannot trip
        // this one.
        self.session.take_shutdown_request();
        self.session.take_restart_request();

        self.shut_cond = match &config.shut_cond {
            Some(text) => Some(self.session.parse_cond(text)?),
            None => None,
        };
        self.state = SchedulerState::Running;

        let startup_tasks: Vec<Arc<Task>> = self
            .session
            .tasks()
            .into_iter()
            .filter(|t| t.on_startup)
            .collect();
        for task in startup_tasks {
            debug!(task = %task.name(), "Dispatching startup task");
            self.dispatch_task(&task)?;
            let name = task.name();
            self.wait_for_task(&name).await?;
            if self.state != SchedulerState::Running {
                break;
            }
        }
        Ok(())
    }

    async fn main_loop(&mut self) -> shared::Result<()> {
        let tick_interval = self.session.config().tick_interval();
        info!("Scheduler running");
        while self.state == SchedulerState::Running {
            self.tick()?;
            if self.state != SchedulerState::Running {
                break;
            }
            sleep(tick_interval).await;
        }
        Ok(())
    }

    /// One pass over the registry.
    fn tick(&mut self) -> shared::Result<()> {
        self.drain_finishes()?;

        if self.session.take_shutdown_request() {
            self.state = SchedulerState::Stopping;
            return Ok(());
        }
        if self.session.take_restart_request() {
            self.state = SchedulerState::Restarting;
            return Ok(());
        }
        let shut = match &self.shut_cond {
            Some(shut_cond) => self.eval_cond(shut_cond, None)?,
            None => false,
        };
        if shut {
            info!("Shutdown condition met");
            self.state = SchedulerState::Stopping;
            return Ok(());
        }

        let config = self.session.config();
        for task in self.session.tasks() {
            // Startup/shutdown tasks run only in their own phases.
            if task.on_startup || task.on_shutdown {
                continue;
            }
            let name = task.name();

            if let Some(started) = self.handles.get(&name).map(|h| h.started) {
                // Permanent tasks are only terminated at shutdown.
                if task.permanent {
                    continue;
                }
                let limit = task.timeout.unwrap_or_else(|| config.timeout());
                let timed_out = current_epoch() - started >= limit.as_secs_f64();
                let ended =
                    timed_out || self.eval_cond(&task.end_cond, Some(task.clone()))?;
                if ended {
                    if timed_out {
                        warn!(task = %name, "Task run exceeded its timeout, terminating");
                    } else {
                        debug!(task = %name, "End condition met, terminating");
                    }
                    if let Some(handle) = self.handles.get_mut(&name) {
                        handle.terminate();
                    }
                }
            } else if !task.is_running() {
                let force = task.force_run();
                let due = force || self.eval_cond(&task.start_cond, Some(task.clone()))?;
                if due {
                    if force {
                        // Consumed on the dispatch it caused.
                        task.take_force_run();
                    }
                    self.dispatch_task(&task)?;
                    if self.state != SchedulerState::Running {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch one task and track its handle or react to its signal.
    fn dispatch_task(&mut self, task: &Arc<Task>) -> shared::Result<()> {
        match self.executor.dispatch(&self.session, task)? {
            Dispatch::Finished(Some(LoopSignal::Shutdown)) => {
                info!(task = %task.name(), "Shutdown raised by task");
                self.state = SchedulerState::Stopping;
            }
            Dispatch::Finished(Some(LoopSignal::Restart)) => {
                // A restart can only interrupt a running loop; during
                // shutdown it is ignored.
                if self.state == SchedulerState::Running
                    || self.state == SchedulerState::Initial
                {
                    info!(task = %task.name(), "Restart raised by task");
                    self.state = SchedulerState::Restarting;
                }
            }
            Dispatch::Finished(None) => {}
            Dispatch::Running(handle) => {
                self.handles.insert(handle.task_name.clone(), handle);
            }
        }
        Ok(())
    }

    /// Apply all pending thread results and reap finished child processes.
    fn drain_finishes(&mut self) -> shared::Result<()> {
        while let Ok(finish) = self.finish_rx.try_recv() {
            if self.handles.remove(&finish.task_name).is_none() {
                // Already force-terminated at shutdown; the terminate record
                // stands and this late result is dropped.
                debug!(task = %finish.task_name, "Dropping result of an untracked run");
                continue;
            }
            self.executor.apply_finish(&self.session, finish)?;
        }

        let mut reaped = Vec::new();
        for (name, handle) in self.handles.iter_mut() {
            if let Some(finish) = handle.poll_process() {
                reaped.push((name.clone(), finish));
            }
        }
        for (name, finish) in reaped {
            self.handles.remove(&name);
            self.executor.apply_finish(&self.session, finish)?;
        }
        Ok(())
    }

    /// Block (cooperatively) until the named task has no live handle.
    async fn wait_for_task(&mut self, name: &str) -> shared::Result<()> {
        while self.handles.contains_key(name) {
            self.drain_finishes()?;
            if !self.handles.contains_key(name) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Wind a cycle down: wait for in-flight tasks up to the grace period,
    /// terminate stragglers, then run the shutdown tasks to completion.
    async fn shutdown_sequence(&mut self) -> shared::Result<()> {
        let config = self.session.config();
        info!("Shutting down scheduler");

        if !config.instant_shutdown && !self.handles.is_empty() {
            info!(
                "Waiting for {} in-flight tasks to complete (timeout: {}s)",
                self.handles.len(),
                config.shutdown_grace_seconds
            );
            let deadline = Instant::now() + config.shutdown_grace();
            while !self.handles.is_empty() {
                self.drain_finishes()?;
                if self.handles.is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(
                        "Shutdown grace elapsed, {} tasks still running",
                        self.handles.len()
                    );
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
        }

        if !self.handles.is_empty() {
            for handle in self.handles.values_mut() {
                handle.terminate();
            }
            // Short window for terminated workers to report back.
            let deadline = Instant::now() + Duration::from_secs(2);
            while !self.handles.is_empty() && Instant::now() < deadline {
                self.drain_finishes()?;
                sleep(Duration::from_millis(20)).await;
            }
            // Whatever lingers is killed outright and recorded as
            // terminated; a late worker result is dropped as untracked.
            let mut remaining: Vec<RunHandle> =
                self.handles.drain().map(|(_, handle)| handle).collect();
            for handle in &mut remaining {
                handle.force_kill();
            }
            for handle in remaining {
                let finish = TaskFinish {
                    task_name: handle.task_name.clone(),
                    action: Action::Terminate,
                    payload: None,
                    error: None,
                    started: handle.started,
                    finished: current_epoch(),
                };
                self.executor.apply_finish(&self.session, finish)?;
            }
        }

        let shutdown_tasks: Vec<Arc<Task>> = self
            .session
            .tasks()
            .into_iter()
            .filter(|t| t.on_shutdown)
            .collect();
        for task in shutdown_tasks {
            debug!(task = %task.name(), "Dispatching shutdown task");
            self.dispatch_task(&task)?;
            let name = task.name();
            self.wait_for_task(&name).await?;
        }
        self.drain_finishes()?;
        Ok(())
    }

    fn apply_restart_policy(&mut self) -> shared::Result<()> {
        match self.session.config().restarting {
            RestartPolicy::Recall => {}
            RestartPolicy::Relaunch => {
                self.session.reload_config_if_changed()?;
                self.session.reset_task_states(false);
            }
            RestartPolicy::Fresh => {
                self.session.reset_task_states(true);
            }
        }
        Ok(())
    }

    /// Evaluate a condition, honoring `silence_cond_check`.
    fn eval_cond(&self, cond: &Condition, task: Option<Arc<Task>>) -> shared::Result<bool> {
        let mut ctx = CondContext::new(&self.session, now_naive());
        if let Some(task) = task {
            ctx = ctx.with_task(task);
        }
        match cond.eval(&ctx) {
            Ok(value) => Ok(value),
            Err(e) => {
                if self.session.config().silence_cond_check {
                    warn!("Condition check failed, treating as false: {}", e);
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }
}
