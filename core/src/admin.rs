//! Operator entry points over the store and the schedule engine.
//!
//! These work from persisted state alone (the stored pattern fingerprint),
//! so they can run from a separate process while the daemon is up.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::job::{ExecutionRecord, RunStatus, ScheduleState};
use crate::overdue::{Classification, OverdueDetector};
use crate::schedule::ScheduleEngine;
use crate::store::StateStore;

/// Knobs for [`reset_schedule`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOptions {
    /// Compute and report, write nothing.
    pub dry_run: bool,
    /// Only touch jobs whose cursor is already in the past.
    pub future_only: bool,
}

/// Outcome of a reset for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetPlan {
    /// Job id.
    pub job_id: String,
    /// Cursor before the reset.
    pub previous: DateTime<Utc>,
    /// Cursor after the reset (or that a dry run would write).
    pub next: DateTime<Utc>,
    /// Whether the store was written.
    pub applied: bool,
}

impl ResetPlan {
    /// The reset moves the cursor.
    pub fn changes(&self) -> bool {
        self.previous != self.next
    }
}

/// Move cursors to the first boundary strictly after `now`.
///
/// `job_ids` empty means every job in the store. Never writes history.
pub fn reset_schedule(
    store: &dyn StateStore,
    engine: &ScheduleEngine,
    job_ids: &[String],
    now: DateTime<Utc>,
    opts: ResetOptions,
) -> Result<Vec<ResetPlan>> {
    let states = select_states(store, job_ids)?;
    let mut plans = Vec::with_capacity(states.len());
    for state in states {
        if opts.future_only && state.next_due_at > now {
            continue;
        }
        let pattern = state.schedule_pattern()?;
        let next = engine.compute_next_due(&pattern, now)?;
        let applied = !opts.dry_run && next != state.next_due_at;
        if applied {
            store.reset_state(&ScheduleState { next_due_at: next, ..state.clone() })?;
        }
        plans.push(ResetPlan { job_id: state.job_id, previous: state.next_due_at, next, applied });
    }
    Ok(plans)
}

fn select_states(store: &dyn StateStore, job_ids: &[String]) -> Result<Vec<ScheduleState>> {
    if job_ids.is_empty() {
        return store.list_states();
    }
    job_ids
        .iter()
        .map(|id| store.read_state(id)?.ok_or_else(|| Error::job_not_found(id.clone())))
        .collect()
}

/// One job found overdue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverdueJob {
    /// Job id.
    pub job_id: String,
    /// Stored cursor.
    pub next_due_at: DateTime<Utc>,
    /// Boundaries elapsed since the cursor.
    pub missed_count: u64,
    /// Boundary a catch-up run would satisfy.
    pub boundary: DateTime<Utc>,
}

/// Active jobs the detector classifies as overdue at `now`, oldest cursor first.
pub fn list_overdue(store: &dyn StateStore, detector: &OverdueDetector, now: DateTime<Utc>) -> Result<Vec<OverdueJob>> {
    let mut out = Vec::new();
    for state in store.list_states()? {
        if !state.active {
            continue;
        }
        if let Classification::Overdue { missed_count, boundary } = classify(detector, now, &state)? {
            out.push(OverdueJob { job_id: state.job_id, next_due_at: state.next_due_at, missed_count, boundary });
        }
    }
    Ok(out)
}

fn classify(detector: &OverdueDetector, now: DateTime<Utc>, state: &ScheduleState) -> Result<Classification> {
    detector.classify(now, state, &state.schedule_pattern()?)
}

/// Per-job line of a status report.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    /// Job id.
    pub job_id: String,
    /// Human readable schedule.
    pub schedule: String,
    /// Stored cursor.
    pub next_due_at: DateTime<Utc>,
    /// Start of the last recorded run.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Outcome of the last recorded run.
    pub last_run_status: Option<RunStatus>,
    /// Still present in the job source.
    pub active: bool,
    /// `not_due`, `due` or `overdue`.
    pub state: &'static str,
    /// Set for overdue jobs.
    pub missed_count: Option<u64>,
}

/// Snapshot of every job in the store.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    /// Evaluation instant.
    pub now: DateTime<Utc>,
    /// Jobs known to the store.
    pub total: usize,
    /// Jobs still present in the source.
    pub active: usize,
    /// Active jobs classified overdue.
    pub overdue: usize,
    /// Resident memory of the reporting process, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resident_bytes: Option<u64>,
    /// Per-job detail, oldest cursor first.
    pub jobs: Vec<JobStatus>,
}

/// Build a [`StatusSummary`]. Jobs whose stored pattern no longer parses are
/// reported with state `invalid`.
pub fn status_summary(store: &dyn StateStore, detector: &OverdueDetector, now: DateTime<Utc>) -> Result<StatusSummary> {
    let mut jobs = Vec::new();
    for state in store.list_states()? {
        let (label, schedule, missed_count) = match state.schedule_pattern() {
            Ok(pattern) => {
                let (label, missed) = match detector.classify(now, &state, &pattern)? {
                    Classification::NotDue => ("not_due", None),
                    Classification::Due { .. } => ("due", None),
                    Classification::Overdue { missed_count, .. } => ("overdue", Some(missed_count)),
                };
                (label, pattern.to_string(), missed)
            }
            Err(_) => ("invalid", state.pattern.clone(), None),
        };
        jobs.push(JobStatus {
            job_id: state.job_id,
            schedule,
            next_due_at: state.next_due_at,
            last_run_at: state.last_run_at,
            last_run_status: state.last_run_status,
            active: state.active,
            state: label,
            missed_count,
        });
    }
    Ok(StatusSummary {
        now,
        total: jobs.len(),
        active: jobs.iter().filter(|j| j.active).count(),
        overdue: jobs.iter().filter(|j| j.active && j.state == "overdue").count(),
        resident_bytes: None,
        jobs,
    })
}

/// Newest-first history of a known job.
pub fn job_history(store: &dyn StateStore, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
    if store.read_state(job_id)?.is_none() {
        return Err(Error::job_not_found(job_id));
    }
    store.list_executions(job_id, limit)
}
