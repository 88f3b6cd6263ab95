//! Log repository interface and the canonical in-memory implementation
//!
//! The repository is an append-only ordered collection of task log records
//! with a small query surface: equality on task name, membership on action
//! and a closed/open range on the `created` timestamp. All task history the
//! condition evaluator consumes goes through this interface, so alternative
//! backends (see `database`) can be dropped in.

use shared::records::{Action, LogRecord};
use std::sync::RwLock;

/// Filter criteria for log records. Unset fields match everything; a `None`
/// endpoint on the created range leaves that side open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    pub task_name: Option<String>,
    pub actions: Option<Vec<Action>>,
    pub created_min: Option<f64>,
    pub created_max: Option<f64>,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions = Some(vec![action]);
        self
    }

    pub fn actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions = Some(actions.into_iter().collect());
        self
    }

    /// Closed range on `created`; pass `None` for an open endpoint.
    pub fn created_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.created_min = min;
        self.created_max = max;
        self
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(name) = &self.task_name {
            if record.task_name != *name {
                return false;
            }
        }
        if let Some(actions) = &self.actions {
            if !actions.contains(&record.action) {
                return false;
            }
        }
        if let Some(min) = self.created_min {
            if record.created < min {
                return false;
            }
        }
        if let Some(max) = self.created_max {
            if record.created > max {
                return false;
            }
        }
        true
    }
}

/// The matching records of one query, in append order.
#[derive(Debug, Clone)]
pub struct Cursor {
    records: Vec<LogRecord>,
}

impl Cursor {
    pub fn new(records: Vec<LogRecord>) -> Self {
        Self { records }
    }

    pub fn all(self) -> Vec<LogRecord> {
        self.records
    }

    pub fn first(&self) -> Option<&LogRecord> {
        self.records.first()
    }

    pub fn last(&self) -> Option<&LogRecord> {
        self.records.last()
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Append-only store of task log records.
///
/// Implementations must be safe for concurrent append and read: worker
/// threads append their own task's terminal records while the scheduler loop
/// reads history for condition evaluation.
pub trait LogRepo: Send + Sync {
    fn append(&self, record: LogRecord) -> shared::Result<()>;

    fn filter(&self, query: &RecordQuery) -> Cursor;

    fn count(&self, query: &RecordQuery) -> usize {
        self.filter(query).count()
    }
}

/// The canonical in-memory repository.
#[derive(Debug, Default)]
pub struct MemoryRepo {
    records: RwLock<Vec<LogRecord>>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogRepo for MemoryRepo {
    fn append(&self, record: LogRecord) -> shared::Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| shared::SchedulingError::Repository("Log store poisoned".to_string()))?;
        records.push(record);
        Ok(())
    }

    fn filter(&self, query: &RecordQuery) -> Cursor {
        let records = match self.records.read() {
            Ok(records) => records,
            Err(_) => return Cursor::new(Vec::new()),
        };
        Cursor::new(
            records
                .iter()
                .filter(|r| query.matches(r))
                .cloned()
                .collect(),
        )
    }
}
