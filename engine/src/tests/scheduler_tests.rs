//! Scheduler loop tests: dispatch rules, signals, shutdown and restart
//! sequencing, dependency chains and return piping.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shared::config::{ExecutionMode, RestartPolicy};
use shared::records::Action;
use shared::time::TimePeriod;

use crate::args::ArgSource;
use crate::cond_task::{scheduler_started, task_started, task_terminated};
use crate::conditions::Condition;
use crate::repo::RecordQuery;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::session::Session;
use crate::task::{Task, TaskContext, TaskError, TaskStatus};
use crate::tests::fast_session;

/// Shared timeline the task bodies append to.
type Timeline = Arc<Mutex<Vec<&'static str>>>;

fn timeline() -> Timeline {
    Arc::new(Mutex::new(Vec::new()))
}

fn mark(timeline: &Timeline, entry: &'static str) {
    timeline.lock().unwrap().push(entry);
}

/// Shut the scheduler down once the named task has started `count` times,
/// with a wall-clock fallback so a broken loop cannot hang the test.
fn shut_after_started(session: &Arc<Session>, task: &'static str, count: i64) {
    session.register_cond_literal("test is over", move |_| {
        let done = Condition::from(task_started(task).ge_(count));
        let timed_out = Condition::from(scheduler_started(TimePeriod::past_secs(10))).not_();
        Ok(done | timed_out)
    });
    session.update_config(|c| c.shut_cond = Some("test is over".to_string()));
}

fn first_run_epoch(session: &Arc<Session>, task: &str) -> f64 {
    session
        .repo()
        .filter(&RecordQuery::new().task(task).action(Action::Run))
        .first()
        .map(|r| r.created)
        .unwrap_or_else(|| panic!("task '{}' never ran", task))
}

fn run_count(session: &Arc<Session>, task: &str) -> usize {
    session
        .repo()
        .count(&RecordQuery::new().task(task).action(Action::Run))
}

#[tokio::test]
async fn test_scheduler_terminates_on_shut_cond() {
    let session = fast_session();
    session.register(Task::named("tick").func(|_| Ok(Value::Null)).start_cond("always true"))
        .unwrap();
    shut_after_started(&session, "tick", 1);

    let mut scheduler = Scheduler::new(session.clone()).unwrap();
    assert_eq!(scheduler.state, SchedulerState::Initial);
    scheduler.run().await.unwrap();
    assert_eq!(scheduler.state, SchedulerState::Terminated);
    assert!(!scheduler.is_running());
    assert!(run_count(&session, "tick") >= 1);
}

#[tokio::test]
async fn test_not_dispatched_without_start_cond_or_force() {
    let session = fast_session();
    session
        .register(Task::named("idle").func(|_| Ok(Value::Null)))
        .unwrap();
    // Only the wall-clock fallback ends the run
    session.register_cond_literal("short run", |_| {
        Ok(Condition::from(scheduler_started(TimePeriod::past_secs(1))).not_())
    });
    session.update_config(|c| c.shut_cond = Some("short run".to_string()));

    session.start().await.unwrap();
    assert_eq!(run_count(&session, "idle"), 0);
    assert_eq!(session.get_task("idle").unwrap().status(), TaskStatus::None);
}

#[tokio::test]
async fn test_force_run_dispatches_once_and_clears() {
    let session = fast_session();
    let task = session
        .register(Task::named("forced").func(|_| Ok(Value::Null)))
        .unwrap();
    task.set_force_run(true);
    session.register_cond_literal("short run", |_| {
        Ok(Condition::from(scheduler_started(TimePeriod::past_secs(1))).not_())
    });
    session.update_config(|c| c.shut_cond = Some("short run".to_string()));

    session.start().await.unwrap();
    // Dispatched exactly once; the flag was consumed on dispatch
    assert_eq!(run_count(&session, "forced"), 1);
    assert!(!task.force_run());
    assert_eq!(task.status(), TaskStatus::Success);
}

#[tokio::test]
async fn test_no_overrun_while_running() {
    let session = fast_session();
    session.update_config(|c| c.instant_shutdown = true);
    session
        .register(
            Task::named("busy")
                .func(|ctx| loop {
                    ctx.check_cancelled()?;
                    std::thread::sleep(Duration::from_millis(5));
                })
                .execution(ExecutionMode::Thread)
                .start_cond("always true"),
        )
        .unwrap();
    session.register_cond_literal("short run", |_| {
        Ok(Condition::from(scheduler_started(TimePeriod::past_secs(1))).not_())
    });
    session.update_config(|c| c.shut_cond = Some("short run".to_string()));

    session.start().await.unwrap();
    // Many ticks passed while the body ran; it was dispatched only once
    assert_eq!(run_count(&session, "busy"), 1);
}

async fn check_dependency_chain(execution: ExecutionMode) {
    let session = fast_session();
    let body = |_: TaskContext| Ok(Value::Null);

    // The source tasks run only once
    session
        .register(
            Task::named("a")
                .func(body)
                .execution(execution)
                .start_cond(Condition::from(task_started("a")).not_()),
        )
        .unwrap();
    session
        .register(
            Task::named("b")
                .func(body)
                .execution(execution)
                .start_cond(Condition::from(task_started("b")).not_()),
        )
        .unwrap();
    session
        .register(
            Task::named("after_a")
                .func(body)
                .execution(execution)
                .start_cond("after task 'a'"),
        )
        .unwrap();
    session
        .register(
            Task::named("after_b")
                .func(body)
                .execution(execution)
                .start_cond("after task 'b'"),
        )
        .unwrap();
    session
        .register(
            Task::named("after_all")
                .func(body)
                .execution(execution)
                .start_cond("after task 'after_a' & after task 'after_b'"),
        )
        .unwrap();

    shut_after_started(&session, "after_all", 1);
    session.start().await.unwrap();

    let a = first_run_epoch(&session, "a");
    let b = first_run_epoch(&session, "b");
    let after_a = first_run_epoch(&session, "after_a");
    let after_b = first_run_epoch(&session, "after_b");
    let after_all = first_run_epoch(&session, "after_all");

    assert!(a < after_a && after_a < after_all);
    assert!(b < after_b && after_b < after_all);
}

#[tokio::test]
async fn test_dependency_chain_main() {
    check_dependency_chain(ExecutionMode::Main).await;
}

#[tokio::test]
async fn test_dependency_chain_thread() {
    check_dependency_chain(ExecutionMode::Thread).await;
}

async fn check_return_piping(execution: ExecutionMode) {
    let session = fast_session();

    session
        .register(
            Task::named("producer")
                .func(|_| Ok(json!("x")))
                .execution(execution)
                .start_cond(Condition::from(task_started("producer")).not_()),
        )
        .unwrap();
    let consumer = session
        .register(
            Task::named("consumer")
                .func(|ctx| {
                    if ctx.param("myparam") == Some(&json!("x")) {
                        Ok(Value::Null)
                    } else {
                        Err(TaskError::failure("wrong parameter value"))
                    }
                })
                .execution(execution)
                .start_cond("after task 'producer'")
                .param("myparam", ArgSource::task_return("producer")),
        )
        .unwrap();

    shut_after_started(&session, "consumer", 1);
    session.start().await.unwrap();

    assert_eq!(session.returns_of("producer"), Some(json!("x")));
    assert_eq!(
        session.get_task("producer").unwrap().status(),
        TaskStatus::Success
    );
    assert_eq!(consumer.status(), TaskStatus::Success);
}

#[tokio::test]
async fn test_return_piping_main() {
    check_return_piping(ExecutionMode::Main).await;
}

#[tokio::test]
async fn test_return_piping_thread() {
    check_return_piping(ExecutionMode::Thread).await;
}

#[tokio::test]
async fn test_return_piping_missing_producer_fails() {
    let session = fast_session();
    session.update_config(|c| c.silence_task_prerun = true);
    let task = session
        .register(
            Task::named("consumer")
                .func(|_| Ok(Value::Null))
                .param("myparam", ArgSource::task_return("producer")),
        )
        .unwrap();
    task.set_force_run(true);
    shut_after_started(&session, "consumer", 1);

    session.start().await.unwrap();
    assert_eq!(task.status(), TaskStatus::Fail);
}

#[tokio::test]
async fn test_return_piping_default_when_not_run() {
    let session = fast_session();
    session
        .register(Task::named("producer").func(|_| Ok(json!("never"))))
        .unwrap();
    let task = session
        .register(
            Task::named("consumer")
                .func(|ctx| {
                    assert_eq!(ctx.param("myparam"), Some(&json!("x")));
                    Ok(Value::Null)
                })
                .param("myparam", ArgSource::task_return_or("producer", "x")),
        )
        .unwrap();
    task.set_force_run(true);
    shut_after_started(&session, "consumer", 1);

    session.start().await.unwrap();
    assert_eq!(task.status(), TaskStatus::Success);
}

async fn check_shutdown_ordering(execution: ExecutionMode) {
    let session = fast_session();
    let events = timeline();

    let t = events.clone();
    session
        .register(
            Task::named("startup")
                .func(move |_| {
                    mark(&t, "startup");
                    Ok(Value::Null)
                })
                .on_startup()
                .execution(execution)
                .start_cond("always true"),
        )
        .unwrap();
    let t = events.clone();
    session
        .register(
            Task::named("call-shutdown")
                .func(move |ctx| {
                    ctx.session().shutdown();
                    mark(&t, "shutdown-called");
                    Ok(Value::Null)
                })
                .execution(execution)
                .start_cond("always true"),
        )
        .unwrap();
    let t = events.clone();
    session
        .register(
            Task::named("shutdown")
                .func(move |_| {
                    mark(&t, "shutdown");
                    Ok(Value::Null)
                })
                .on_shutdown()
                .execution(execution)
                .start_cond("always true"),
        )
        .unwrap();

    shut_after_started(&session, "call-shutdown", 3);
    session.start().await.unwrap();

    assert_eq!(*events.lock().unwrap(), vec!["startup", "shutdown-called", "shutdown"]);
}

#[tokio::test]
async fn test_shutdown_ordering_main() {
    check_shutdown_ordering(ExecutionMode::Main).await;
}

#[tokio::test]
async fn test_shutdown_ordering_thread() {
    check_shutdown_ordering(ExecutionMode::Thread).await;
}

#[tokio::test]
async fn test_restart_recall_cycles() {
    let session = fast_session();
    session.update_config(|c| c.restarting = RestartPolicy::Recall);
    let events = timeline();

    let t = events.clone();
    session
        .register(
            Task::named("startup")
                .func(move |_| {
                    mark(&t, "startup");
                    Ok(Value::Null)
                })
                .on_startup(),
        )
        .unwrap();
    let t = events.clone();
    session
        .register(
            Task::named("call-restart")
                .func(move |ctx| {
                    ctx.session().restart();
                    mark(&t, "restart-called");
                    Ok(Value::Null)
                })
                .start_cond("always true"),
        )
        .unwrap();
    let t = events.clone();
    session
        .register(
            Task::named("shutdown")
                .func(move |_| {
                    mark(&t, "shutdown");
                    Ok(Value::Null)
                })
                .on_shutdown(),
        )
        .unwrap();

    // Stop for good once the shutdown task has run twice
    shut_after_started(&session, "shutdown", 2);
    session.start().await.unwrap();

    // One startup per restart cycle, shutdown tasks between cycles
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "startup",
            "restart-called",
            "shutdown",
            "startup",
            "restart-called",
            "shutdown",
            "startup",
            "shutdown",
        ]
    );
}

#[tokio::test]
async fn test_timeout_terminates_thread_task() {
    let session = fast_session();
    let task = session
        .register(
            Task::named("sleepy")
                .func(|ctx| loop {
                    ctx.check_cancelled()?;
                    std::thread::sleep(Duration::from_millis(5));
                })
                .execution(ExecutionMode::Thread)
                .timeout(Duration::from_millis(100))
                .start_cond(Condition::from(task_started("sleepy")).not_()),
        )
        .unwrap();

    session.register_cond_literal("sleeper gone", |_| {
        let done = Condition::from(task_terminated("sleepy").ge_(1));
        let timed_out = Condition::from(scheduler_started(TimePeriod::past_secs(10))).not_();
        Ok(done | timed_out)
    });
    session.update_config(|c| c.shut_cond = Some("sleeper gone".to_string()));

    session.start().await.unwrap();
    assert_eq!(task.status(), TaskStatus::Terminate);
    let actions: Vec<Action> = session
        .repo()
        .filter(&RecordQuery::new().task("sleepy"))
        .all()
        .into_iter()
        .map(|r| r.action)
        .collect();
    assert_eq!(actions, vec![Action::Run, Action::Terminate]);
}

#[tokio::test]
async fn test_end_cond_terminates_running_task() {
    let session = fast_session();
    let task = session
        .register(
            Task::named("bounded")
                .func(|ctx| loop {
                    ctx.check_cancelled()?;
                    std::thread::sleep(Duration::from_millis(5));
                })
                .execution(ExecutionMode::Thread)
                .start_cond(Condition::from(task_started("bounded")).not_())
                .end_cond("always true"),
        )
        .unwrap();

    session.register_cond_literal("bounded gone", |_| {
        let done = Condition::from(task_terminated("bounded").ge_(1));
        let timed_out = Condition::from(scheduler_started(TimePeriod::past_secs(10))).not_();
        Ok(done | timed_out)
    });
    session.update_config(|c| c.shut_cond = Some("bounded gone".to_string()));

    session.start().await.unwrap();
    assert_eq!(task.status(), TaskStatus::Terminate);
}

#[tokio::test]
async fn test_permanent_task_outlives_end_cond() {
    let session = fast_session();
    session.update_config(|c| c.instant_shutdown = true);
    let task = session
        .register(
            Task::named("daemon")
                .func(|ctx| loop {
                    ctx.check_cancelled()?;
                    std::thread::sleep(Duration::from_millis(5));
                })
                .execution(ExecutionMode::Thread)
                .permanent()
                .start_cond(Condition::from(task_started("daemon")).not_())
                .end_cond("always true"),
        )
        .unwrap();
    session.register_cond_literal("short run", |_| {
        Ok(Condition::from(scheduler_started(TimePeriod::past_secs(1))).not_())
    });
    session.update_config(|c| c.shut_cond = Some("short run".to_string()));

    session.start().await.unwrap();
    // The end condition held on every tick yet the task kept running; only
    // the shutdown sequence terminated it, and exactly once
    assert_eq!(run_count(&session, "daemon"), 1);
    assert_eq!(task.status(), TaskStatus::Terminate);
    let terminates = session
        .repo()
        .count(&RecordQuery::new().task("daemon").action(Action::Terminate));
    assert_eq!(terminates, 1);
}

#[tokio::test]
async fn test_startup_tasks_complete_before_loop() {
    let session = fast_session();
    let events = timeline();

    let t = events.clone();
    session
        .register(
            Task::named("warmup")
                .func(move |_| {
                    std::thread::sleep(Duration::from_millis(50));
                    mark(&t, "warmup-done");
                    Ok(Value::Null)
                })
                .execution(ExecutionMode::Thread)
                .on_startup(),
        )
        .unwrap();
    let t = events.clone();
    session
        .register(
            Task::named("regular")
                .func(move |_| {
                    mark(&t, "regular");
                    Ok(Value::Null)
                })
                .start_cond("always true"),
        )
        .unwrap();

    shut_after_started(&session, "regular", 1);
    session.start().await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.first(), Some(&"warmup-done"));
    assert!(events.contains(&"regular"));
}

#[tokio::test]
async fn test_builtin_shutdown_task_stops_loop() {
    let session = fast_session();
    let events = timeline();

    let t = events.clone();
    session
        .register(
            Task::named("write_startup")
                .func(move |_| {
                    mark(&t, "started");
                    Ok(Value::Null)
                })
                .on_startup(),
        )
        .unwrap();
    let t = events.clone();
    session
        .register(
            Task::named("write_shutdown")
                .func(move |_| {
                    mark(&t, "shut");
                    Ok(Value::Null)
                })
                .on_shutdown(),
        )
        .unwrap();
    let task = session.register(Task::shutdown_task()).unwrap();
    task.set_force_run(true);

    // shut_cond never fires on its own; the sentinel must stop the loop
    session.start().await.unwrap();

    assert_eq!(*events.lock().unwrap(), vec!["started", "shut"]);
    // The sentinel run is a success with exactly one run record
    let actions: Vec<Action> = session
        .repo()
        .filter(&RecordQuery::new().task("shutdown"))
        .all()
        .into_iter()
        .map(|r| r.action)
        .collect();
    assert_eq!(actions, vec![Action::Run, Action::Success]);
}
