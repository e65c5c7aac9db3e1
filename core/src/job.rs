use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity and policy of one schedulable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Stable key derived from the job's source identity.
    pub id: String,
    /// When the job runs.
    pub schedule: SchedulePattern,
    /// Disabled jobs stay registered but are never scheduled.
    pub enabled: bool,
    /// Execution policy handed to the executor.
    pub policy: ExecPolicy,
    /// Opaque payload for the executor.
    pub action: Action,
}

impl JobSpec {
    /// Enabled job with the default policy and a no-op action.
    pub fn new(id: impl Into<String>, schedule: SchedulePattern) -> Self {
        Self {
            id: id.into(),
            schedule,
            enabled: true,
            policy: ExecPolicy::default(),
            action: Action::Noop,
        }
    }

    /// True when only non-scheduling fields differ from `other`.
    pub fn same_schedule(&self, other: &JobSpec) -> bool {
        self.schedule == other.schedule
    }
}

/// Timeout and retry policy for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecPolicy {
    /// Hard upper bound on one attempt (seconds).
    pub timeout_secs: u64,
    /// Extra attempts after a failure.
    pub retry_count: u32,
    /// Pause between attempts (seconds).
    pub retry_delay_secs: u64,
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self { timeout_secs: 300, retry_count: 0, retry_delay_secs: 60 }
    }
}

impl ExecPolicy {
    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Do nothing.
    #[default]
    Noop,
    /// Execute an OS command.
    Exec {
        /// Command/executable.
        cmd: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
    },
}

/// A clock-aligned schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulePattern {
    /// Every `every` units, aligned to the unit's clock boundary.
    Interval {
        /// Minutes, hours or days.
        unit: IntervalUnit,
        /// Step size; must divide the next larger unit for minutes/hours.
        every: u32,
    },
    /// Once a day at a wall-clock time.
    TimeOfDay {
        /// Wall-clock time.
        at: WallTime,
    },
    /// Once a week on `day` at `at`.
    Weekly {
        /// Day of the week.
        day: DayOfWeek,
        /// Wall-clock time.
        at: WallTime,
    },
    /// Cron expression, evaluated by the external strategy.
    Cron {
        /// Expression text (5, 6 or 7 fields).
        expr: String,
    },
}

impl SchedulePattern {
    /// Shorthand for `Interval { unit: Minutes, every }`.
    pub fn every_minutes(every: u32) -> Self {
        Self::Interval { unit: IntervalUnit::Minutes, every }
    }

    /// Shorthand for `Interval { unit: Hours, every }`.
    pub fn every_hours(every: u32) -> Self {
        Self::Interval { unit: IntervalUnit::Hours, every }
    }

    /// Stable textual form persisted next to the cursor.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }

    /// Inverse of [`SchedulePattern::fingerprint`].
    pub fn from_fingerprint(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::invalid_pattern(format!("stored pattern {s:?}: {e}")))
    }
}

impl fmt::Display for SchedulePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { unit, every } => write!(f, "every {every} {unit}"),
            Self::TimeOfDay { at } => write!(f, "daily at {at}"),
            Self::Weekly { day, at } => write!(f, "weekly on {day} at {at}"),
            Self::Cron { expr } => write!(f, "cron `{expr}`"),
        }
    }
}

/// Unit of an interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    /// Minutes past the hour.
    #[serde(alias = "minute")]
    Minutes,
    /// Hours past midnight.
    #[serde(alias = "hour")]
    Hours,
    /// Days, aligned to midnight.
    #[serde(alias = "day")]
    Days,
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        })
    }
}

/// Day of the week for weekly schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum DayOfWeek {
    #[serde(alias = "monday")]
    Mon,
    #[serde(alias = "tuesday")]
    Tue,
    #[serde(alias = "wednesday")]
    Wed,
    #[serde(alias = "thursday")]
    Thu,
    #[serde(alias = "friday")]
    Fri,
    #[serde(alias = "saturday")]
    Sat,
    #[serde(alias = "sunday")]
    Sun,
}

impl DayOfWeek {
    /// Matching chrono weekday.
    pub fn to_chrono(self) -> chrono::Weekday {
        match self {
            Self::Mon => chrono::Weekday::Mon,
            Self::Tue => chrono::Weekday::Tue,
            Self::Wed => chrono::Weekday::Wed,
            Self::Thu => chrono::Weekday::Thu,
            Self::Fri => chrono::Weekday::Fri,
            Self::Sat => chrono::Weekday::Sat,
            Self::Sun => chrono::Weekday::Sun,
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_chrono())
    }
}

/// `HH:MM` wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WallTime {
    /// 0..=23
    pub hour: u8,
    /// 0..=59
    pub minute: u8,
}

impl WallTime {
    /// Build a checked wall time.
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::invalid_pattern(format!("time {hour:02}:{minute:02} out of range")));
        }
        Ok(Self { hour, minute })
    }
}

impl FromStr for WallTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::invalid_pattern(format!("expected HH:MM, got {s:?}")))?;
        let hour = h.parse::<u8>().map_err(|_| Error::invalid_pattern(format!("bad hour in {s:?}")))?;
        let minute = m.parse::<u8>().map_err(|_| Error::invalid_pattern(format!("bad minute in {s:?}")))?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for WallTime {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<WallTime> for String {
    fn from(t: WallTime) -> Self {
        t.to_string()
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Outcome of a run as stored in state and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The executor reported success.
    Success,
    /// All attempts failed.
    Failure,
    /// The attempt hit its deadline.
    Timeout,
    /// The boundary was deliberately not executed.
    Skipped,
}

impl RunStatus {
    /// Persisted text form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            "skipped" => Ok(Self::Skipped),
            other => Err(Error::PersistenceUnavailable(format!("unknown run status {other:?}"))),
        }
    }
}

/// Durable scheduling cursor of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// Job id.
    pub job_id: String,
    /// Next boundary the job owes a run for.
    pub next_due_at: DateTime<Utc>,
    /// Start of the most recent recorded run.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent recorded run.
    pub last_run_status: Option<RunStatus>,
    /// Fingerprint of the pattern `next_due_at` was computed for.
    pub pattern: String,
    /// False once the job left the discovery source.
    pub active: bool,
}

impl ScheduleState {
    /// Fresh state for a job that has never run.
    pub fn seed(job_id: impl Into<String>, pattern: &SchedulePattern, next_due_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            next_due_at,
            last_run_at: None,
            last_run_status: None,
            pattern: pattern.fingerprint(),
            active: true,
        }
    }

    /// Decode the stored pattern.
    pub fn schedule_pattern(&self) -> Result<SchedulePattern> {
        SchedulePattern::from_fingerprint(&self.pattern)
    }
}

/// One dispatched attempt (append-only history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Job id.
    pub job_id: String,
    /// Boundary this run satisfies.
    pub scheduled_for: DateTime<Utc>,
    /// When the first attempt started.
    pub started_at: DateTime<Utc>,
    /// When the final attempt finished.
    pub finished_at: DateTime<Utc>,
    /// Final outcome.
    pub status: RunStatus,
    /// Cause for non-success outcomes.
    pub error_summary: Option<String>,
    /// Executor invocations consumed, retries included.
    pub attempts: u32,
}
