//! Tests for task construction and registration policies

use shared::config::{ExecutionMode, PreExistPolicy};

use crate::conditions::Condition;
use crate::task::{Task, TaskStatus};
use crate::tests::{noop_body, test_session};

#[test]
fn test_construct_defaults() {
    let session = test_session();
    let task = session
        .register(Task::named("plain").func(noop_body))
        .unwrap();

    assert_eq!(task.name(), "plain");
    assert_eq!(task.status(), TaskStatus::None);
    // Unset conditions default to false
    assert_eq!(task.start_cond, Condition::False);
    assert_eq!(task.end_cond, Condition::False);
    // Execution defaults from configuration
    assert_eq!(task.execution, ExecutionMode::Main);
    assert!(task.last_run().is_none());
    assert!(task.last_success().is_none());
    assert!(!task.force_run());
}

#[test]
fn test_construct_with_default_execution_from_config() {
    let session = test_session();
    session.update_config(|c| c.task_execution = ExecutionMode::Thread);
    let task = session
        .register(Task::named("worker").func(noop_body))
        .unwrap();
    assert_eq!(task.execution, ExecutionMode::Thread);
}

#[test]
fn test_construct_requires_body() {
    let session = test_session();
    assert!(session.register(Task::named("empty")).is_err());
}

#[test]
fn test_process_requires_command_body() {
    let session = test_session();

    // A closure cannot cross a process boundary
    let result = session.register(
        Task::named("bad")
            .func(noop_body)
            .execution(ExecutionMode::Process),
    );
    assert!(result.is_err());
    // The failed registration leaves the session unchanged
    assert!(session.get_task("bad").is_err());

    // A command body is transportable
    let result = session.register(
        Task::named("good")
            .command("true", [])
            .execution(ExecutionMode::Process),
    );
    assert!(result.is_ok());
}

#[test]
fn test_construct_with_string_condition() {
    let session = test_session();
    let task = session
        .register(Task::named("gated").func(noop_body).start_cond("always true"))
        .unwrap();
    assert_eq!(task.start_cond, Condition::True);

    // An unparseable condition rejects the registration
    let result = session.register(
        Task::named("broken")
            .func(noop_body)
            .start_cond("gibberish syntax"),
    );
    assert!(result.is_err());
    assert!(session.get_task("broken").is_err());
}

#[test]
fn test_invalid_name_rejected() {
    let session = test_session();
    assert!(session.register(Task::named("").func(noop_body)).is_err());
    assert!(session
        .register(Task::named("bad\nname").func(noop_body))
        .is_err());
}

#[test]
fn test_pre_exist_raise() {
    let session = test_session();
    session.register(Task::named("dup").func(noop_body)).unwrap();
    // Default policy rejects the collision
    assert!(session.register(Task::named("dup").func(noop_body)).is_err());
    assert_eq!(session.task_names(), vec!["dup"]);
}

#[test]
fn test_pre_exist_ignore() {
    let session = test_session();
    session.update_config(|c| c.task_pre_exist = PreExistPolicy::Ignore);
    let first = session
        .register(Task::named("dup").func(noop_body).description("first"))
        .unwrap();
    let second = session
        .register(Task::named("dup").func(noop_body).description("second"))
        .unwrap();
    // The existing task is kept
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(second.description.as_deref(), Some("first"));
}

#[test]
fn test_pre_exist_rename() {
    let session = test_session();
    session.update_config(|c| c.task_pre_exist = PreExistPolicy::Rename);
    session.register(Task::named("dup").func(noop_body)).unwrap();
    let renamed = session.register(Task::named("dup").func(noop_body)).unwrap();
    assert_eq!(renamed.name(), "dup - 1");
    let renamed = session.register(Task::named("dup").func(noop_body)).unwrap();
    assert_eq!(renamed.name(), "dup - 2");
    assert_eq!(session.task_names(), vec!["dup", "dup - 1", "dup - 2"]);
}

#[test]
fn test_pre_exist_replace() {
    let session = test_session();
    session.update_config(|c| c.task_pre_exist = PreExistPolicy::Replace);
    session
        .register(Task::named("dup").func(noop_body).description("old"))
        .unwrap();
    let replacement = session
        .register(Task::named("dup").func(noop_body).description("new"))
        .unwrap();
    assert_eq!(session.task_names(), vec!["dup"]);
    assert_eq!(replacement.description.as_deref(), Some("new"));
}

#[test]
fn test_force_run_flag() {
    let session = test_session();
    let task = session.register(Task::named("t").func(noop_body)).unwrap();
    assert!(!task.force_run());

    task.set_force_run(true);
    assert!(task.force_run());
    // Consuming clears it
    assert!(task.take_force_run());
    assert!(!task.force_run());
    assert!(!task.take_force_run());
}

#[test]
fn test_builtin_signal_tasks_are_main_mode() {
    let session = test_session();
    let restart = session.register(Task::restart_task()).unwrap();
    let shutdown = session.register(Task::shutdown_task()).unwrap();
    assert_eq!(restart.execution, ExecutionMode::Main);
    assert_eq!(shutdown.execution, ExecutionMode::Main);
    assert_eq!(restart.name(), "restart");
    assert_eq!(shutdown.name(), "shutdown");
}

#[test]
fn test_timeout_and_flags() {
    let session = test_session();
    let task = session
        .register(
            Task::named("t")
                .func(noop_body)
                .timeout(std::time::Duration::from_secs(5))
                .permanent()
                .on_startup()
                .description("does things"),
        )
        .unwrap();
    assert_eq!(task.timeout, Some(std::time::Duration::from_secs(5)));
    assert!(task.permanent);
    assert!(task.on_startup);
    assert!(!task.on_shutdown);
    assert_eq!(task.description.as_deref(), Some("does things"));
}

#[test]
fn test_last_projection_accessors() {
    let session = test_session();
    let task = session.register(Task::named("t").func(noop_body)).unwrap();

    task.set_last(shared::records::Action::Success, 123.0);
    assert_eq!(task.last_success(), Some(123.0));
    assert_eq!(task.last_for(shared::records::Action::Success), Some(123.0));
    assert!(task.last_fail().is_none());
}
