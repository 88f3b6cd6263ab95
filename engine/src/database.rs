//! SQLite-backed log repository
//!
//! The in-memory repository is canonical, but a session that should survive a
//! process restart can point the engine at this backend instead: every task
//! event is inserted into an append-only `task_log` table, and on the next
//! start the projections can be rebuilt from it by enabling
//! `force_status_from_logs`.

use anyhow::Context;
use rusqlite::Connection;
use shared::records::{Action, LogRecord};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::repo::{Cursor, LogRepo, RecordQuery};

/// Default database file name. Using a constant avoids magic strings.
const DATABASE_FILE: &str = "task_log.db";

/// SQLite store of task log records.
///
/// The connection is guarded by a mutex so appends from worker threads and
/// reads from the scheduler loop serialize correctly.
pub struct SqliteRepo {
    db_path: PathBuf,
    connection: Mutex<Connection>,
}

impl SqliteRepo {
    /// Open (or create) the log database in the given data directory.
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> shared::Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        let db_path = data_dir.join(DATABASE_FILE);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // WAL mode lets the loop keep reading while a worker appends.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .context("Failed to enable WAL mode")?;
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout={};",
            busy_timeout_seconds * 1000
        ))
        .context("Failed to set busy timeout")?;

        Ok(Self {
            db_path,
            connection: Mutex::new(conn),
        })
    }

    /// Create the log table and indexes. Idempotent; safe on every startup.
    pub fn initialize(&self) -> shared::Result<()> {
        info!("Initializing task log database at {}", self.db_path.display());

        let conn = self.lock_connection()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS task_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                action TEXT NOT NULL,
                created REAL NOT NULL,
                start REAL,
                end REAL,
                runtime REAL,
                message TEXT,
                exc_text TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_task_log_task_name
                ON task_log (task_name, action);
            CREATE INDEX IF NOT EXISTS idx_task_log_created
                ON task_log (created);
            "#,
        )
        .context("Failed to create task_log table")?;

        debug!("Task log database initialization complete");
        Ok(())
    }

    fn lock_connection(&self) -> shared::Result<std::sync::MutexGuard<'_, Connection>> {
        self.connection.lock().map_err(|_| {
            shared::SchedulingError::Repository("Log database mutex poisoned".to_string()).into()
        })
    }
}

impl LogRepo for SqliteRepo {
    fn append(&self, record: LogRecord) -> shared::Result<()> {
        let conn = self.lock_connection()?;
        conn.execute(
            r#"
            INSERT INTO task_log
                (task_name, action, created, start, end, runtime, message, exc_text)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            rusqlite::params![
                record.task_name,
                record.action.as_str(),
                record.created,
                record.start,
                record.end,
                record.runtime,
                record.message,
                record.exc_text,
            ],
        )
        .context("Failed to insert log record")?;
        Ok(())
    }

    fn filter(&self, query: &RecordQuery) -> Cursor {
        let conn = match self.lock_connection() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Log database unavailable: {}", e);
                return Cursor::new(Vec::new());
            }
        };

        // Build the WHERE clause from the set criteria only.
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(name) = &query.task_name {
            clauses.push(format!("task_name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(actions) = &query.actions {
            let placeholders: Vec<String> = actions
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", params.len() + i + 1))
                .collect();
            clauses.push(format!("action IN ({})", placeholders.join(", ")));
            for action in actions {
                params.push(Box::new(action.as_str().to_string()));
            }
        }
        if let Some(min) = query.created_min {
            clauses.push(format!("created >= ?{}", params.len() + 1));
            params.push(Box::new(min));
        }
        if let Some(max) = query.created_max {
            clauses.push(format!("created <= ?{}", params.len() + 1));
            params.push(Box::new(max));
        }

        let mut sql = String::from(
            "SELECT task_name, action, created, start, end, runtime, message, exc_text \
             FROM task_log",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id ASC");

        let result = (|| -> anyhow::Result<Vec<LogRecord>> {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |row| {
                    let action_text: String = row.get(1)?;
                    let action = Action::from_str(&action_text).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                    Ok(LogRecord {
                        task_name: row.get(0)?,
                        action,
                        created: row.get(2)?,
                        start: row.get(3)?,
                        end: row.get(4)?,
                        runtime: row.get(5)?,
                        message: row.get(6)?,
                        exc_text: row.get(7)?,
                    })
                },
            )?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })();

        match result {
            Ok(records) => Cursor::new(records),
            Err(e) => {
                warn!("Log query failed: {}", e);
                Cursor::new(Vec::new())
            }
        }
    }
}
