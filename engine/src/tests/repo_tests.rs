//! Tests for the in-memory log repository and its query surface

use shared::records::{Action, LogRecord};

use crate::repo::{LogRepo, MemoryRepo, RecordQuery};

/// Four tasks: each starts an hour apart, then finishes one way each.
fn populated_repo() -> MemoryRepo {
    let repo = MemoryRepo::new();
    let hour = 3600.0;
    for (i, name) in ["task1", "task2", "task3", "task4"].iter().enumerate() {
        repo.append(LogRecord::run(*name, i as f64 * hour)).unwrap();
    }
    repo.append(LogRecord::terminal("task1", Action::Success, Some(0.0), 4.0 * hour))
        .unwrap();
    repo.append(LogRecord::terminal("task2", Action::Fail, Some(hour), 5.0 * hour))
        .unwrap();
    repo.append(LogRecord::terminal("task3", Action::Inaction, Some(2.0 * hour), 6.0 * hour))
        .unwrap();
    repo.append(LogRecord::terminal("task4", Action::Terminate, Some(3.0 * hour), 7.0 * hour))
        .unwrap();
    repo
}

#[test]
fn test_filter_by_action() {
    let repo = populated_repo();
    let runs = repo.filter(&RecordQuery::new().action(Action::Run)).all();
    assert_eq!(runs.len(), 4);
    assert!(runs.iter().all(|r| r.action == Action::Run));
    // Append order is preserved
    assert_eq!(runs[0].task_name, "task1");
    assert_eq!(runs[3].task_name, "task4");
}

#[test]
fn test_filter_by_action_set() {
    let repo = populated_repo();
    let finished = repo
        .filter(&RecordQuery::new().actions([Action::Success, Action::Fail]))
        .all();
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[0].task_name, "task1");
    assert_eq!(finished[1].task_name, "task2");
}

#[test]
fn test_filter_by_task_name() {
    let repo = populated_repo();
    let cursor = repo.filter(&RecordQuery::new().task("task2"));
    assert_eq!(cursor.count(), 2);
    assert_eq!(cursor.first().unwrap().action, Action::Run);
    assert_eq!(cursor.last().unwrap().action, Action::Fail);
}

#[test]
fn test_filter_created_range() {
    let repo = populated_repo();
    let hour = 3600.0;

    // Closed on both given endpoints
    let cursor = repo.filter(
        &RecordQuery::new()
            .action(Action::Run)
            .created_range(Some(2.0 * hour), Some(3.0 * hour)),
    );
    assert_eq!(cursor.count(), 2);

    // Open left endpoint
    let cursor = repo.filter(
        &RecordQuery::new()
            .action(Action::Run)
            .created_range(None, Some(3.0 * hour)),
    );
    assert_eq!(cursor.count(), 4);

    // Open right endpoint
    let cursor = repo.filter(
        &RecordQuery::new()
            .action(Action::Run)
            .created_range(Some(2.0 * hour), None),
    );
    assert_eq!(cursor.count(), 2);

    // Both open matches everything
    let cursor = repo.filter(&RecordQuery::new().action(Action::Run).created_range(None, None));
    assert_eq!(cursor.count(), 4);
}

#[test]
fn test_combined_criteria() {
    let repo = populated_repo();
    let cursor = repo.filter(
        &RecordQuery::new()
            .task("task1")
            .action(Action::Success)
            .created_range(Some(0.0), None),
    );
    assert_eq!(cursor.count(), 1);
    assert_eq!(cursor.first().unwrap().runtime, Some(4.0 * 3600.0));
}

#[test]
fn test_empty_cursor() {
    let repo = MemoryRepo::new();
    let cursor = repo.filter(&RecordQuery::new().task("missing"));
    assert!(cursor.is_empty());
    assert!(cursor.first().is_none());
    assert!(cursor.last().is_none());
    assert_eq!(cursor.count(), 0);
}

#[test]
fn test_concurrent_append() {
    let repo = std::sync::Arc::new(MemoryRepo::new());
    let mut workers = Vec::new();
    for i in 0..8 {
        let repo = repo.clone();
        workers.push(std::thread::spawn(move || {
            for j in 0..50 {
                repo.append(LogRecord::run(format!("task{}", i), j as f64))
                    .unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(repo.filter(&RecordQuery::new()).count(), 400);
}
