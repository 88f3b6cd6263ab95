//! Tests for dependency link introspection

use crate::cond_task::{depend_failure, depend_finish, depend_success, task_started};
use crate::conditions::Condition;
use crate::dependencies::{DependencyKind, Link, LinkCombinator};
use crate::task::Task;
use crate::tests::{noop_body, test_session};

#[test]
fn test_single_link() {
    let session = test_session();
    session.register(Task::named("a").func(noop_body)).unwrap();
    session
        .register(
            Task::named("after_a")
                .func(noop_body)
                .start_cond(depend_success("a")),
        )
        .unwrap();

    let links = session.dependencies();
    assert_eq!(
        links,
        vec![Link {
            parent: "a".to_string(),
            child: "after_a".to_string(),
            relation: DependencyKind::Success,
            combinator: None,
        }]
    );
}

#[test]
fn test_links_inside_combinators() {
    let session = test_session();
    session.register(Task::named("a").func(noop_body)).unwrap();
    session.register(Task::named("b").func(noop_body)).unwrap();
    session
        .register(
            Task::named("after_all")
                .func(noop_body)
                .start_cond(
                    Condition::from(depend_success("a")) & Condition::from(depend_success("b")),
                ),
        )
        .unwrap();
    session
        .register(
            Task::named("cleanup")
                .func(noop_body)
                .start_cond(
                    Condition::from(depend_failure("a")) | Condition::from(depend_finish("b")),
                ),
        )
        .unwrap();

    let links = session.dependencies();
    assert_eq!(links.len(), 4);

    assert_eq!(
        links[0],
        Link {
            parent: "a".to_string(),
            child: "after_all".to_string(),
            relation: DependencyKind::Success,
            combinator: Some(LinkCombinator::All),
        }
    );
    assert_eq!(links[1].parent, "b");
    assert_eq!(links[1].combinator, Some(LinkCombinator::All));

    assert_eq!(
        links[2],
        Link {
            parent: "a".to_string(),
            child: "cleanup".to_string(),
            relation: DependencyKind::Failure,
            combinator: Some(LinkCombinator::Any),
        }
    );
    assert_eq!(links[3].relation, DependencyKind::Finish);
    assert_eq!(links[3].combinator, Some(LinkCombinator::Any));
}

#[test]
fn test_non_dependency_conditions_yield_no_links() {
    let session = test_session();
    session
        .register(
            Task::named("periodic")
                .func(noop_body)
                .start_cond(Condition::from(task_started("periodic")).not_()),
        )
        .unwrap();
    session
        .register(Task::named("manual").func(noop_body).start_cond("always false"))
        .unwrap();

    assert!(session.dependencies().is_empty());
}

#[test]
fn test_link_display() {
    let link = Link {
        parent: "a".to_string(),
        child: "after_all".to_string(),
        relation: DependencyKind::Success,
        combinator: Some(LinkCombinator::All),
    };
    assert_eq!(link.to_string(), "'a' -> 'after_all' (multi)");

    let link = Link {
        combinator: None,
        ..link
    };
    assert_eq!(link.to_string(), "'a' -> 'after_all'");
}
