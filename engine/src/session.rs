//! Session: the container a scheduler runs against
//!
//! A session holds the task registry, shared parameters, the per-task return
//! values, the configuration, the condition parser registry and a handle to
//! the log repository. Task registration, lookup, rename and the
//! shutdown/restart signalling all go through it.

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use shared::config::{ConfigManager, PreExistPolicy, SchedulerConfig};
use shared::time::TimePeriod;

use crate::cond_func;
use crate::conditions::Condition;
use crate::parser::ParserRegistry;
use crate::repo::{LogRepo, MemoryRepo, RecordQuery};
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskContext, TaskError, TaskSpec};

pub struct Session {
    config: RwLock<SchedulerConfig>,
    repo: Arc<dyn LogRepo>,
    /// Registered tasks in registration order; names are unique.
    tasks: RwLock<Vec<Arc<Task>>>,
    parameters: RwLock<HashMap<String, Value>>,
    /// Last return value per task name.
    returns: RwLock<HashMap<String, Value>>,
    parser: RwLock<ParserRegistry>,
    /// Epoch of the current scheduler start, set by the loop.
    started_at: RwLock<Option<f64>>,
    shut_flag: AtomicBool,
    restart_flag: AtomicBool,
    /// Present when the configuration came from a file; used by the
    /// relaunch restart policy to pick up on-disk changes.
    config_manager: Mutex<Option<ConfigManager>>,
}

impl Session {
    /// Session with the canonical in-memory log repository.
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Self::with_repo(config, Arc::new(MemoryRepo::new()))
    }

    pub fn with_repo(config: SchedulerConfig, repo: Arc<dyn LogRepo>) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            repo,
            tasks: RwLock::new(Vec::new()),
            parameters: RwLock::new(HashMap::new()),
            returns: RwLock::new(HashMap::new()),
            parser: RwLock::new(ParserRegistry::with_builtins()),
            started_at: RwLock::new(None),
            shut_flag: AtomicBool::new(false),
            restart_flag: AtomicBool::new(false),
            config_manager: Mutex::new(None),
        })
    }

    /// Session configured from a `scheduler.toml` file.
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> shared::Result<Arc<Self>> {
        let manager = ConfigManager::load(path)?;
        let session = Self::new(manager.config.clone());
        *session
            .config_manager
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(manager);
        Ok(session)
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn update_config(&self, update: impl FnOnce(&mut SchedulerConfig)) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        update(&mut config);
    }

    /// Pick up on-disk configuration changes, if the session was loaded from
    /// a file. Returns whether anything changed.
    pub(crate) fn reload_config_if_changed(&self) -> shared::Result<bool> {
        let mut guard = self
            .config_manager
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(manager) = guard.as_mut() {
            if manager.reload_if_changed()? {
                *self.config.write().unwrap_or_else(|e| e.into_inner()) = manager.config.clone();
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn repo(&self) -> Arc<dyn LogRepo> {
        self.repo.clone()
    }

    /// Register a task, applying the configured name collision policy.
    pub fn register(self: &Arc<Self>, spec: TaskSpec) -> shared::Result<Arc<Task>> {
        let mut spec = spec;
        shared::validate_task_name(&spec.name)?;

        if let Ok(existing) = self.get_task(&spec.name) {
            match self.config().task_pre_exist {
                PreExistPolicy::Raise => {
                    return Err(shared::SchedulingError::Registration(format!(
                        "Task '{}' already exists",
                        spec.name
                    ))
                    .into());
                }
                PreExistPolicy::Ignore => {
                    debug!(task = %spec.name, "Task already exists, keeping the existing one");
                    return Ok(existing);
                }
                PreExistPolicy::Rename => {
                    let base = spec.name.clone();
                    let mut n = 1;
                    loop {
                        let candidate = format!("{} - {}", base, n);
                        if self.get_task(&candidate).is_err() {
                            spec.name = candidate;
                            break;
                        }
                        n += 1;
                    }
                    debug!(task = %spec.name, "Renamed colliding task registration");
                }
                PreExistPolicy::Replace => {
                    self.remove_task(&spec.name)?;
                    debug!(task = %spec.name, "Replacing existing task");
                }
            }
        }

        let task = Arc::new(spec.build(self)?);
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        debug!(task = %task.name(), execution = %task.execution, "Registered task");
        tasks.push(task.clone());
        Ok(task)
    }

    pub fn get_task(&self, name: &str) -> shared::Result<Arc<Task>> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| {
                shared::SchedulingError::Validation(format!("Task '{}' not found", name)).into()
            })
    }

    /// Snapshot of the registry in registration order.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks()
            .into_iter()
            .map(|task| task.name())
            .collect()
    }

    /// Rename a task. A collision rejects the rename and leaves everything
    /// unchanged.
    pub fn rename_task(&self, old: &str, new: &str) -> shared::Result<()> {
        if old == new {
            return Ok(());
        }
        shared::validate_task_name(new)?;
        let task = self.get_task(old)?;
        if self.get_task(new).is_ok() {
            return Err(shared::SchedulingError::Registration(format!(
                "Cannot rename task '{}' to '{}': the name is taken",
                old, new
            ))
            .into());
        }
        task.set_name(new.to_string());

        // The returns map is keyed by name; carry the value over.
        let mut returns = self.returns.write().unwrap_or_else(|e| e.into_inner());
        if let Some(value) = returns.remove(old) {
            returns.insert(new.to_string(), value);
        }
        debug!(from = %old, to = %new, "Renamed task");
        Ok(())
    }

    pub fn remove_task(&self, name: &str) -> shared::Result<()> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let before = tasks.len();
        tasks.retain(|t| t.name() != name);
        if tasks.len() == before {
            return Err(
                shared::SchedulingError::Validation(format!("Task '{}' not found", name)).into(),
            );
        }
        drop(tasks);
        self.returns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        Ok(())
    }

    pub fn set_param(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.parameters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    pub fn param(&self, key: &str) -> Option<Value> {
        self.parameters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub(crate) fn set_return(&self, task_name: impl Into<String>, value: Value) {
        self.returns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_name.into(), value);
    }

    /// Last recorded return value of a task, if any.
    pub fn returns_of(&self, task_name: &str) -> Option<Value> {
        self.returns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_name)
            .cloned()
    }

    /// Request scheduler shutdown; honored on the next tick. Callable from
    /// task bodies on any execution mode.
    pub fn shutdown(&self) {
        info!("Session shutdown requested");
        self.shut_flag.store(true, Ordering::SeqCst);
    }

    /// Request scheduler restart; honored on the next tick.
    pub fn restart(&self) {
        info!("Session restart requested");
        self.restart_flag.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_shutdown_request(&self) -> bool {
        self.shut_flag.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_restart_request(&self) -> bool {
        self.restart_flag.swap(false, Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<f64> {
        *self.started_at.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_started_at(&self, epoch: f64) {
        *self.started_at.write().unwrap_or_else(|e| e.into_inner()) = Some(epoch);
    }

    /// Parse a condition string against the session's parser registry.
    pub fn parse_cond(&self, input: &str) -> shared::Result<Condition> {
        self.parser
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .parse(input)
    }

    /// Register a literal condition syntax.
    pub fn register_cond_literal<F>(&self, syntax: impl Into<String>, factory: F)
    where
        F: Fn(&HashMap<String, String>) -> shared::Result<Condition> + Send + Sync + 'static,
    {
        self.parser
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register_literal(syntax, factory);
    }

    /// Register a regex condition syntax; named capture groups become the
    /// factory's keyword arguments.
    pub fn register_cond_pattern<F>(&self, pattern: regex::Regex, factory: F)
    where
        F: Fn(&HashMap<String, String>) -> shared::Result<Condition> + Send + Sync + 'static,
    {
        self.parser
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register_pattern(pattern, factory);
    }

    /// Wrap a slow predicate in a checker task and return the condition
    /// reading its outcome.
    ///
    /// The checker runs like any other task, per `trigger`; the returned
    /// condition is true while the last successful check both returned true
    /// and happened within `active_time`.
    pub fn register_cond_task<F>(
        self: &Arc<Self>,
        name: &str,
        trigger: Condition,
        active_time: TimePeriod,
        check: F,
    ) -> shared::Result<Condition>
    where
        F: Fn(&TaskContext) -> shared::Result<bool> + Send + Sync + 'static,
    {
        let task_name = format!("_condition-{}", name);
        let body = move |ctx: TaskContext| -> Result<Value, TaskError> {
            match check(&ctx) {
                Ok(state) => Ok(Value::Bool(state)),
                Err(e) => Err(TaskError::Failure(e.to_string())),
            }
        };
        self.register(
            Task::named(&task_name)
                .func(body)
                .start_cond(trigger),
        )?;
        Ok(cond_func::task_cond(task_name, active_time).into())
    }

    /// Reset per-task runtime state between restart cycles.
    pub(crate) fn reset_task_states(&self, clear_projections: bool) {
        for task in self.tasks() {
            task.reset_state(clear_projections);
        }
    }

    /// Dependency links (success/failure/finish relations) declared by the
    /// tasks' start conditions, in registration order.
    pub fn dependencies(&self) -> Vec<crate::dependencies::Link> {
        crate::dependencies::get_dependencies(self)
    }

    /// Rebuild the cached `last_*` projections by scanning the log.
    ///
    /// Useful when the repository outlives the process (the SQLite backend):
    /// a fresh session picks up each task's history without replaying it.
    pub fn rebuild_projections(&self) {
        use shared::records::Action;

        for task in self.tasks() {
            let name = task.name();
            for action in [
                Action::Run,
                Action::Success,
                Action::Fail,
                Action::Terminate,
                Action::Inaction,
            ] {
                let last = self
                    .repo
                    .filter(&RecordQuery::new().task(name.as_str()).action(action))
                    .last()
                    .map(|record| record.created);
                if let Some(created) = last {
                    task.set_last(action, created);
                }
            }
        }
        debug!("Rebuilt task projections from the log");
    }

    /// Run a scheduler against this session until it terminates.
    pub async fn start(self: &Arc<Self>) -> shared::Result<()> {
        let mut scheduler = Scheduler::new(self.clone())?;
        scheduler.run().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tasks", &self.task_names())
            .field("started_at", &self.started_at())
            .finish()
    }
}
