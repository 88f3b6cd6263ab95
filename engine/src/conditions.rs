//! Condition algebra
//!
//! Conditions are recursive boolean expressions: constants, the AND/OR/NOT
//! combinators and statements. A statement observes external state, either
//! the task event log (history) or the live running set, and count-based
//! statements can carry comparators against an integer threshold.
//!
//! Conditions are evaluated lazily on each tick; nothing is memoized across
//! ticks.

use chrono::NaiveDateTime;
use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

use shared::time::TimePeriod;

use crate::cond_task;
use crate::session::Session;
use crate::task::Task;

/// Evaluation context: the session whose state is observed, the evaluation
/// instant, and optionally the task whose condition is being evaluated
/// (dependency statements and current-task statements need it).
pub struct CondContext<'a> {
    pub session: &'a Session,
    pub now: NaiveDateTime,
    pub task: Option<Arc<Task>>,
}

impl<'a> CondContext<'a> {
    pub fn new(session: &'a Session, now: NaiveDateTime) -> Self {
        Self {
            session,
            now,
            task: None,
        }
    }

    pub fn with_task(mut self, task: Arc<Task>) -> Self {
        self.task = Some(task);
        self
    }
}

/// A boolean expression over task history, time and live scheduler state.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    True,
    False,
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Statement(Statement),
}

impl Condition {
    pub fn and_(self, other: Condition) -> Condition {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn or_(self, other: Condition) -> Condition {
        Condition::Or(Box::new(self), Box::new(other))
    }

    /// Negation; negating a negation returns the original expression, so
    /// double negation is the identity structurally as well.
    pub fn not_(self) -> Condition {
        match self {
            Condition::Not(inner) => *inner,
            other => Condition::Not(Box::new(other)),
        }
    }

    /// Evaluate the expression, short-circuiting left to right.
    pub fn eval(&self, ctx: &CondContext<'_>) -> shared::Result<bool> {
        match self {
            Condition::True => Ok(true),
            Condition::False => Ok(false),
            Condition::And(left, right) => Ok(left.eval(ctx)? && right.eval(ctx)?),
            Condition::Or(left, right) => Ok(left.eval(ctx)? || right.eval(ctx)?),
            Condition::Not(inner) => Ok(!inner.eval(ctx)?),
            Condition::Statement(statement) => statement.eval(ctx),
        }
    }
}

impl From<Statement> for Condition {
    fn from(statement: Statement) -> Self {
        Condition::Statement(statement)
    }
}

impl BitAnd for Condition {
    type Output = Condition;

    fn bitand(self, rhs: Condition) -> Condition {
        self.and_(rhs)
    }
}

impl BitOr for Condition {
    type Output = Condition;

    fn bitor(self, rhs: Condition) -> Condition {
        self.or_(rhs)
    }
}

impl Not for Condition {
    type Output = Condition;

    fn not(self) -> Condition {
        self.not_()
    }
}

/// What a statement observation produced: a direct truth value, or a count
/// to be judged against the statement's comparators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observed {
    Bool(bool),
    Count(i64),
}

/// Comparators a count-based statement carries. Empty means "count > 0".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Comparisons {
    pub eq: Option<i64>,
    pub ne: Option<i64>,
    pub lt: Option<i64>,
    pub gt: Option<i64>,
    pub le: Option<i64>,
    pub ge: Option<i64>,
}

impl Comparisons {
    pub fn is_empty(&self) -> bool {
        *self == Comparisons::default()
    }

    /// Conjunction of all set comparator predicates applied to `count`.
    pub fn check(&self, count: i64) -> bool {
        if self.is_empty() {
            return count > 0;
        }
        let checks = [
            self.eq.map(|v| count == v),
            self.ne.map(|v| count != v),
            self.lt.map(|v| count < v),
            self.gt.map(|v| count > v),
            self.le.map(|v| count <= v),
            self.ge.map(|v| count >= v),
        ];
        checks.into_iter().flatten().all(|ok| ok)
    }
}

/// A leaf condition observing session state.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub period: Option<TimePeriod>,
    pub cmp: Comparisons,
}

impl Statement {
    pub fn new(kind: StatementKind) -> Self {
        Self {
            kind,
            period: None,
            cmp: Comparisons::default(),
        }
    }

    /// Scope the statement's history to a time window.
    pub fn with_period(mut self, period: TimePeriod) -> Self {
        self.period = Some(period);
        self
    }

    pub fn eq_(mut self, value: i64) -> Self {
        self.cmp.eq = Some(value);
        self
    }

    pub fn ne_(mut self, value: i64) -> Self {
        self.cmp.ne = Some(value);
        self
    }

    pub fn lt_(mut self, value: i64) -> Self {
        self.cmp.lt = Some(value);
        self
    }

    pub fn gt_(mut self, value: i64) -> Self {
        self.cmp.gt = Some(value);
        self
    }

    pub fn le_(mut self, value: i64) -> Self {
        self.cmp.le = Some(value);
        self
    }

    pub fn ge_(mut self, value: i64) -> Self {
        self.cmp.ge = Some(value);
        self
    }

    /// Observe and collapse to a truth value: booleans pass through, counts
    /// go through the comparators (or `> 0` when none are set).
    pub fn eval(&self, ctx: &CondContext<'_>) -> shared::Result<bool> {
        match cond_task::observe(&self.kind, self.period.as_ref(), ctx)? {
            Observed::Bool(value) => Ok(value),
            Observed::Count(count) => Ok(self.cmp.check(count)),
        }
    }
}

/// The statement vocabulary.
///
/// Task references are by name; `None` means "the task whose condition is
/// being evaluated" (resolved from the context).
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    /// Count of `run` records within the period.
    TaskStarted { task: Option<String> },
    /// Count of `success` records within the period.
    TaskSucceeded { task: Option<String> },
    /// Count of `fail` records within the period.
    TaskFailed { task: Option<String> },
    /// Count of `terminate` records within the period.
    TaskTerminated { task: Option<String> },
    /// Count of `inaction` records within the period.
    TaskInacted { task: Option<String> },
    /// Count of success, fail or terminate records within the period.
    TaskFinished { task: Option<String> },
    /// Whether the task is currently in the live running set.
    TaskRunning { task: Option<String> },
    /// Whether the task should run in the current period window: no
    /// success/terminate/inaction yet, at most `retries` failures, not
    /// already running, and the instant inside the period.
    TaskExecutable { task: Option<String>, retries: u32 },
    /// Dependency: `depend` succeeded after this task last started.
    DependSuccess { depend: String },
    /// Dependency: `depend` failed after this task last started.
    DependFailure { depend: String },
    /// Dependency: `depend` finished after this task last started.
    DependFinish { depend: String },
    /// Whether the scheduler's start time lies within the period.
    SchedulerStarted,
    /// User-supplied predicate.
    Func(crate::cond_func::FuncCond),
    /// Outcome of a checker task, valid while its last success lies within
    /// `active_time`.
    TaskCond {
        task: String,
        active_time: TimePeriod,
    },
}
