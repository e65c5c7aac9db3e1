//! SQLite-backed [`StateStore`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use crate::error::Result;
use crate::job::{ExecutionRecord, RunStatus, ScheduleState};
use crate::store::{check_advance, duplicate, is_success, StateStore};

/// Create tables and indexes. Safe to call on every startup.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schedule_state (
            job_id          TEXT PRIMARY KEY,
            next_due_at     INTEGER NOT NULL,
            last_run_at     INTEGER,
            last_run_status TEXT,
            pattern         TEXT NOT NULL,
            active          INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS execution_log (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id          TEXT NOT NULL,
            scheduled_for   INTEGER NOT NULL,
            started_at      INTEGER NOT NULL,
            finished_at     INTEGER NOT NULL,
            status          TEXT NOT NULL,
            error_summary   TEXT,
            attempts        INTEGER NOT NULL DEFAULT 1
        );
        CREATE UNIQUE INDEX IF NOT EXISTS uq_execution_success
            ON execution_log(job_id, scheduled_for) WHERE status = 'success';
        CREATE INDEX IF NOT EXISTS idx_execution_job
            ON execution_log(job_id, started_at DESC);",
    )
}

/// Single-connection store; the connection is shared behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and its parent directory.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))?;
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // wardenctl and the daemon may hold the file at the same time
        conn.busy_timeout(Duration::from_secs(5))?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, format!("timestamp {ms} out of range").into())
    })
}

fn opt_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => from_millis(row, idx).map(Some),
        None => Ok(None),
    }
}

fn status(row: &Row<'_>, idx: usize) -> rusqlite::Result<RunStatus> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const STATE_COLS: &str = "job_id, next_due_at, last_run_at, last_run_status, pattern, active";
const EXEC_COLS: &str = "job_id, scheduled_for, started_at, finished_at, status, error_summary, attempts";

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleState> {
    let last_run_status = match row.get::<_, Option<String>>(3)? {
        Some(_) => Some(status(row, 3)?),
        None => None,
    };
    Ok(ScheduleState {
        job_id: row.get(0)?,
        next_due_at: from_millis(row, 1)?,
        last_run_at: opt_millis(row, 2)?,
        last_run_status,
        pattern: row.get(4)?,
        active: row.get(5)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        job_id: row.get(0)?,
        scheduled_for: from_millis(row, 1)?,
        started_at: from_millis(row, 2)?,
        finished_at: from_millis(row, 3)?,
        status: status(row, 4)?,
        error_summary: row.get(5)?,
        attempts: row.get(6)?,
    })
}

fn select_state(conn: &Connection, job_id: &str) -> rusqlite::Result<Option<ScheduleState>> {
    conn.query_row(
        &format!("SELECT {STATE_COLS} FROM schedule_state WHERE job_id = ?1"),
        params![job_id],
        state_from_row,
    )
    .optional()
}

fn upsert_state(conn: &Connection, s: &ScheduleState) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schedule_state (job_id, next_due_at, last_run_at, last_run_status, pattern, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(job_id) DO UPDATE SET
            next_due_at = excluded.next_due_at,
            last_run_at = excluded.last_run_at,
            last_run_status = excluded.last_run_status,
            pattern = excluded.pattern,
            active = excluded.active",
        params![
            s.job_id,
            millis(s.next_due_at),
            s.last_run_at.map(millis),
            s.last_run_status.map(RunStatus::as_str),
            s.pattern,
            s.active,
        ],
    )?;
    Ok(())
}

impl StateStore for SqliteStore {
    fn read_state(&self, job_id: &str) -> Result<Option<ScheduleState>> {
        Ok(select_state(&self.conn(), job_id)?)
    }

    fn write_state(&self, state: &ScheduleState) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = select_state(&tx, &state.job_id)?;
        check_advance(current.as_ref(), state)?;
        upsert_state(&tx, state)?;
        tx.commit()?;
        Ok(())
    }

    fn reset_state(&self, state: &ScheduleState) -> Result<()> {
        Ok(upsert_state(&self.conn(), state)?)
    }

    fn list_states(&self) -> Result<Vec<ScheduleState>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {STATE_COLS} FROM schedule_state ORDER BY next_due_at ASC, job_id ASC"))?;
        let states = stmt.query_map([], state_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    fn append_execution(&self, r: &ExecutionRecord) -> Result<()> {
        let res = self.conn().execute(
            &format!("INSERT INTO execution_log ({EXEC_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                r.job_id,
                millis(r.scheduled_for),
                millis(r.started_at),
                millis(r.finished_at),
                r.status.as_str(),
                r.error_summary,
                r.attempts,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation && is_success(r) => {
                Err(duplicate(r))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn has_success(&self, job_id: &str, scheduled_for: DateTime<Utc>) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM execution_log WHERE job_id = ?1 AND scheduled_for = ?2 AND status = 'success'",
                params![job_id, millis(scheduled_for)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn list_executions(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXEC_COLS} FROM execution_log WHERE job_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt.query_map(params![job_id, limit], record_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn().execute("DELETE FROM execution_log WHERE started_at < ?1", params![millis(before)])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::job::SchedulePattern;
    use chrono::TimeZone;

    #[test]
    fn in_memory_store_enforces_unique_success() {
        let store = SqliteStore::open_in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rec = ExecutionRecord {
            job_id: "j".into(),
            scheduled_for: at,
            started_at: at,
            finished_at: at,
            status: RunStatus::Success,
            error_summary: None,
            attempts: 1,
        };
        store.append_execution(&rec).unwrap();
        assert!(matches!(store.append_execution(&rec), Err(Error::DuplicateExecution { .. })));
        let skipped = ExecutionRecord { status: RunStatus::Skipped, ..rec };
        store.append_execution(&skipped).unwrap();
    }

    #[test]
    fn inactive_flag_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut s = ScheduleState::seed("gone", &SchedulePattern::every_hours(1), at);
        s.active = false;
        store.reset_state(&s).unwrap();
        assert!(!store.read_state("gone").unwrap().unwrap().active);
    }
}
