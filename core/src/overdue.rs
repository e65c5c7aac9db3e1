use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::job::{SchedulePattern, ScheduleState};
use crate::schedule::ScheduleEngine;

/// Where a job stands relative to its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The cursor is still in the future.
    NotDue,
    /// The cursor boundary is being hit on time.
    Due {
        /// Boundary to satisfy (the cursor itself).
        boundary: DateTime<Utc>,
    },
    /// The cursor boundary passed without a run.
    Overdue {
        /// Boundaries elapsed since the cursor, the cursor included.
        missed_count: u64,
        /// Most recent elapsed boundary; the only one that gets a run.
        boundary: DateTime<Utc>,
    },
}

impl Classification {
    /// Boundary a run would satisfy, if any.
    pub fn boundary(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::NotDue => None,
            Self::Due { boundary } | Self::Overdue { boundary, .. } => Some(*boundary),
        }
    }
}

/// Classifies jobs as not due, due, or overdue.
///
/// A boundary counts as on time while `now` is within `grace` of it and no
/// later boundary has elapsed. Past that the job is overdue, and however many
/// boundaries were missed it is run exactly once, for the most recent one.
#[derive(Debug, Clone)]
pub struct OverdueDetector {
    engine: ScheduleEngine,
    grace: Duration,
    catchup_window: Duration,
}

impl OverdueDetector {
    /// Detector with the given on-time grace and catch-up window.
    pub fn new(engine: ScheduleEngine, grace: Duration, catchup_window: Duration) -> Self {
        Self { engine, grace, catchup_window }
    }

    /// The engine boundaries are computed with.
    pub fn engine(&self) -> &ScheduleEngine {
        &self.engine
    }

    /// Pure classification; calling it twice with the same inputs yields the same answer.
    pub fn classify(&self, now: DateTime<Utc>, state: &ScheduleState, pattern: &SchedulePattern) -> Result<Classification> {
        if state.next_due_at > now {
            return Ok(Classification::NotDue);
        }
        let scan = self.engine.scan_boundaries(pattern, state.next_due_at, now)?;
        let boundary = scan.latest.unwrap_or(state.next_due_at);
        if scan.count <= 1 && now - state.next_due_at < self.grace {
            return Ok(Classification::Due { boundary });
        }
        Ok(Classification::Overdue { missed_count: scan.count, boundary })
    }

    /// True when `boundary` is too old to be worth a late run.
    pub fn beyond_catchup_window(&self, now: DateTime<Utc>, boundary: DateTime<Utc>) -> bool {
        now - boundary > self.catchup_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{IntervalUnit, WallTime};
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, h, m, s).unwrap()
    }

    fn detector() -> OverdueDetector {
        OverdueDetector::new(ScheduleEngine::default(), Duration::seconds(60), Duration::hours(24))
    }

    fn state(next: DateTime<Utc>, p: &SchedulePattern) -> ScheduleState {
        ScheduleState::seed("job", p, next)
    }

    #[test]
    fn future_cursor_is_not_due() {
        let p = SchedulePattern::every_minutes(10);
        assert_eq!(detector().classify(at(9, 19, 59), &state(at(9, 20, 0), &p), &p).unwrap(), Classification::NotDue);
    }

    #[test]
    fn boundary_hit_on_time_is_due() {
        let p = SchedulePattern::every_minutes(10);
        let c = detector().classify(at(9, 20, 5), &state(at(9, 20, 0), &p), &p).unwrap();
        assert_eq!(c, Classification::Due { boundary: at(9, 20, 0) });
    }

    #[test]
    fn restart_mid_period_is_overdue_by_one() {
        // last run satisfied 09:10, cursor 09:20, back up at 09:27
        let p = SchedulePattern::every_minutes(10);
        let c = detector().classify(at(9, 27, 0), &state(at(9, 20, 0), &p), &p).unwrap();
        assert_eq!(c, Classification::Overdue { missed_count: 1, boundary: at(9, 20, 0) });
    }

    #[test]
    fn long_outage_targets_latest_boundary() {
        let p = SchedulePattern::every_minutes(5);
        let c = detector().classify(at(12, 3, 0), &state(at(9, 5, 0), &p), &p).unwrap();
        assert_eq!(c, Classification::Overdue { missed_count: 36, boundary: at(12, 0, 0) });
    }

    #[test]
    fn classify_is_idempotent() {
        let p = SchedulePattern::Interval { unit: IntervalUnit::Hours, every: 1 };
        let d = detector();
        let s = state(at(3, 0, 0), &p);
        let first = d.classify(at(11, 30, 0), &s, &p).unwrap();
        let second = d.classify(at(11, 30, 0), &s, &p).unwrap();
        assert_eq!(first, second);
        assert_eq!(s, state(at(3, 0, 0), &p));
    }

    #[test]
    fn catchup_window_applies_to_the_target_boundary() {
        let d = detector();
        let p = SchedulePattern::TimeOfDay { at: WallTime::new(2, 0).unwrap() };
        let now = at(12, 0, 0);
        let boundary = d.classify(now, &state(at(2, 0, 0) - Duration::days(9), &p), &p).unwrap().boundary().unwrap();
        assert_eq!(boundary, at(2, 0, 0));
        assert!(!d.beyond_catchup_window(now, boundary));
        assert!(d.beyond_catchup_window(now, boundary - Duration::days(2)));
    }
}
