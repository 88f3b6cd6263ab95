//! Dependency graph introspection
//!
//! Tasks declare their ordering through dependency statements in their start
//! conditions. This module walks the registry and derives the explicit link
//! list, useful for visualizing a pipeline or checking its wiring without
//! evaluating anything.

use std::fmt;

use crate::conditions::{Condition, StatementKind};
use crate::session::Session;

/// Which outcome of the parent the link waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Success,
    Failure,
    Finish,
}

/// The combinator the dependency statement sat under, when it was part of a
/// larger expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCombinator {
    /// All sibling conditions must hold.
    All,
    /// Any sibling condition suffices.
    Any,
}

/// One edge of the dependency graph: `child` waits on `parent`.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub parent: String,
    pub child: String,
    pub relation: DependencyKind,
    pub combinator: Option<LinkCombinator>,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' -> '{}'", self.parent, self.child)?;
        if self.combinator == Some(LinkCombinator::All) {
            write!(f, " (multi)")?;
        }
        Ok(())
    }
}

/// Collect dependency statements from a condition tree. Links under an
/// AND/OR node carry the nearest enclosing combinator; negated dependencies
/// are not links.
fn collect_links(
    cond: &Condition,
    child: &str,
    combinator: Option<LinkCombinator>,
    links: &mut Vec<Link>,
) {
    match cond {
        Condition::And(left, right) => {
            collect_links(left, child, Some(LinkCombinator::All), links);
            collect_links(right, child, Some(LinkCombinator::All), links);
        }
        Condition::Or(left, right) => {
            collect_links(left, child, Some(LinkCombinator::Any), links);
            collect_links(right, child, Some(LinkCombinator::Any), links);
        }
        Condition::Statement(statement) => {
            let (parent, relation) = match &statement.kind {
                StatementKind::DependSuccess { depend } => (depend, DependencyKind::Success),
                StatementKind::DependFailure { depend } => (depend, DependencyKind::Failure),
                StatementKind::DependFinish { depend } => (depend, DependencyKind::Finish),
                _ => return,
            };
            links.push(Link {
                parent: parent.clone(),
                child: child.to_string(),
                relation,
                combinator,
            });
        }
        Condition::True | Condition::False | Condition::Not(_) => {}
    }
}

/// Dependency links declared across the whole registry, in registration
/// order.
pub fn get_dependencies(session: &Session) -> Vec<Link> {
    let mut links = Vec::new();
    for task in session.tasks() {
        collect_links(&task.start_cond, &task.name(), None, &mut links);
    }
    links
}
