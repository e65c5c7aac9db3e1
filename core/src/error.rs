use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by the scheduling core.
///
/// Only [`Error::PersistenceUnavailable`] is allowed to escalate past a single
/// job; everything else is contained by the coordinator and recorded in the
/// execution log.
#[derive(Debug, Error)]
pub enum Error {
    /// A second `success` for an already satisfied boundary.
    #[error("duplicate execution: {job_id} already succeeded for {scheduled_for}")]
    DuplicateExecution {
        /// Job whose boundary was already satisfied.
        job_id: String,
        /// The boundary in question.
        scheduled_for: DateTime<Utc>,
    },

    /// The schedule pattern of a job cannot be evaluated.
    #[error("invalid schedule pattern: {reason}")]
    SchedulePatternInvalid {
        /// Human readable cause.
        reason: String,
    },

    /// The backing store failed to read or write.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// A regular state write tried to move `next_due_at` backwards.
    #[error("cursor regression for {job_id}: {current} -> {attempted}")]
    CursorRegression {
        /// Job id.
        job_id: String,
        /// Cursor currently stored.
        current: DateTime<Utc>,
        /// Cursor the caller tried to write.
        attempted: DateTime<Utc>,
    },

    /// No persisted state for the job.
    #[error("job not found: {job_id}")]
    JobNotFound {
        /// Job id.
        job_id: String,
    },

    /// The execution collaborator did not finish before the deadline.
    #[error("execution timed out after {}s", timeout.as_secs())]
    ExecutionTimeout {
        /// Deadline that expired.
        timeout: Duration,
    },

    /// The execution collaborator reported a failure.
    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    /// The job discovery source could not produce a snapshot.
    #[error("job source failed: {0}")]
    Source(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for [`Error::SchedulePatternInvalid`].
    pub fn invalid_pattern(reason: impl Into<String>) -> Self {
        Self::SchedulePatternInvalid { reason: reason.into() }
    }

    /// Shorthand for [`Error::JobNotFound`].
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound { job_id: job_id.into() }
    }

    /// True for errors that originate in the persistence layer.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::PersistenceUnavailable(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::PersistenceUnavailable(format!("sqlite: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::PersistenceUnavailable(format!("io: {e}"))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::PersistenceUnavailable(format!("bincode: {e}"))
    }
}

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, Error>;
