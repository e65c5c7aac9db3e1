//! Durable schedule state and execution history.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::{ExecutionRecord, RunStatus, ScheduleState};
use crate::store_fs::FsStore;
use crate::store_sqlite::SqliteStore;

/// Persistence backend for schedule cursors and run history.
///
/// Implementations must be restart-safe and make every write atomic with
/// respect to concurrent writers.
pub trait StateStore: Send + Sync + 'static {
    /// Cursor of `job_id`, `None` if the job was never seeded.
    fn read_state(&self, job_id: &str) -> Result<Option<ScheduleState>>;

    /// Upsert a cursor. Fails with [`Error::CursorRegression`] if it would move
    /// `next_due_at` backwards.
    fn write_state(&self, state: &ScheduleState) -> Result<()>;

    /// Upsert a cursor unconditionally (operator reset, pattern change).
    fn reset_state(&self, state: &ScheduleState) -> Result<()>;

    /// All cursors, earliest `next_due_at` first.
    fn list_states(&self) -> Result<Vec<ScheduleState>>;

    /// Append one history entry. A second `success` for the same
    /// `(job_id, scheduled_for)` fails with [`Error::DuplicateExecution`].
    fn append_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Whether `scheduled_for` already has a `success` entry.
    fn has_success(&self, job_id: &str, scheduled_for: DateTime<Utc>) -> Result<bool>;

    /// Newest-first history of `job_id`.
    fn list_executions(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>>;

    /// Most recent history entry of `job_id`.
    fn last_execution(&self, job_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.list_executions(job_id, 1)?.into_iter().next())
    }

    /// Drop history entries that started before `before`; returns how many.
    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Which backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// SQLite database file.
    #[default]
    Sqlite,
    /// Directory of bincode-encoded files.
    Fs,
}

/// Open the configured backend at `path` (a file for SQLite, a directory for FS).
pub fn open_store(kind: StoreKind, path: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match kind {
        StoreKind::Sqlite => Arc::new(SqliteStore::open(path)?),
        StoreKind::Fs => Arc::new(FsStore::open(path)?),
    };
    Ok(store)
}

pub(crate) fn check_advance(current: Option<&ScheduleState>, next: &ScheduleState) -> Result<()> {
    match current {
        Some(cur) if next.next_due_at < cur.next_due_at => Err(Error::CursorRegression {
            job_id: next.job_id.clone(),
            current: cur.next_due_at,
            attempted: next.next_due_at,
        }),
        _ => Ok(()),
    }
}

pub(crate) fn duplicate(record: &ExecutionRecord) -> Error {
    Error::DuplicateExecution { job_id: record.job_id.clone(), scheduled_for: record.scheduled_for }
}

pub(crate) fn is_success(record: &ExecutionRecord) -> bool {
    record.status == RunStatus::Success
}
