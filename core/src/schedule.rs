//! Clock-aligned boundary computation.
//!
//! Every boundary is computed in the configured timezone on naive wall-clock
//! values and then resolved back to UTC. Wall-clock instants that do not
//! exist (DST gap) are skipped; ambiguous ones resolve to the earliest
//! instant that is still strictly after `after`. Minute and hour intervals
//! also fire in the repeated hour of a fall-back fold; daily and weekly
//! patterns fire once.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::job::{IntervalUnit, SchedulePattern};

/// Upper bound on candidates tried while resolving one boundary.
const MAX_RESOLVE_STEPS: usize = 256;
/// Boundary counting stops here; callers treat it as "at least".
pub const MAX_COUNTED_BOUNDARIES: u64 = 10_000;

/// Evaluates schedule patterns that have no closed form here.
pub trait ExternalSchedule: Send + Sync {
    /// Reject expressions the strategy cannot evaluate.
    fn validate(&self, expr: &str) -> Result<()>;
    /// First fire time strictly after `after`, or `None` if the expression
    /// never fires again.
    fn next_after(&self, expr: &str, after: DateTime<Utc>, tz: Tz) -> Result<Option<DateTime<Utc>>>;
}

/// [`ExternalSchedule`] backed by the `cron` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct CronStrategy;

impl CronStrategy {
    fn parse(expr: &str) -> Result<cron::Schedule> {
        cron::Schedule::from_str(expr)
            .or_else(|_| {
                // The cron crate wants seconds and year; accept the classic 5 fields too.
                cron::Schedule::from_str(&format!("0 {expr} *"))
            })
            .map_err(|e| Error::invalid_pattern(format!("cron expression {expr:?}: {e}")))
    }
}

impl ExternalSchedule for CronStrategy {
    fn validate(&self, expr: &str) -> Result<()> {
        Self::parse(expr).map(|_| ())
    }

    fn next_after(&self, expr: &str, after: DateTime<Utc>, tz: Tz) -> Result<Option<DateTime<Utc>>> {
        let schedule = Self::parse(expr)?;
        let local = after.with_timezone(&tz);
        Ok(schedule.after(&local).next().map(|t| t.with_timezone(&Utc)))
    }
}

/// Result of walking the boundaries in a closed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryScan {
    /// Boundaries in the range, saturating at [`MAX_COUNTED_BOUNDARIES`].
    pub count: u64,
    /// Most recent boundary in the range.
    pub latest: Option<DateTime<Utc>>,
}

/// Pure next-boundary computation for [`SchedulePattern`]s.
#[derive(Clone)]
pub struct ScheduleEngine {
    tz: Tz,
    external: Arc<dyn ExternalSchedule>,
}

impl std::fmt::Debug for ScheduleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEngine").field("tz", &self.tz).finish_non_exhaustive()
    }
}

impl Default for ScheduleEngine {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl ScheduleEngine {
    /// Engine for `tz` using the cron crate for cron expressions.
    pub fn new(tz: Tz) -> Self {
        Self::with_external(tz, Arc::new(CronStrategy))
    }

    /// Engine with an injected strategy for cron expressions.
    pub fn with_external(tz: Tz, external: Arc<dyn ExternalSchedule>) -> Self {
        Self { tz, external }
    }

    /// Parse an IANA timezone name such as `Europe/Paris`.
    pub fn parse_timezone(name: &str) -> Result<Tz> {
        name.parse::<Tz>().map_err(|e| Error::Config(format!("unknown timezone {name:?}: {e}")))
    }

    /// Timezone boundaries are aligned in.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Reject patterns that cannot produce aligned boundaries.
    pub fn validate(&self, pattern: &SchedulePattern) -> Result<()> {
        match pattern {
            SchedulePattern::Interval { unit: IntervalUnit::Minutes, every } => {
                if *every == 0 || 60 % every != 0 {
                    return Err(Error::invalid_pattern(format!("{every} does not divide 60 minutes")));
                }
            }
            SchedulePattern::Interval { unit: IntervalUnit::Hours, every } => {
                if *every == 0 || 24 % every != 0 {
                    return Err(Error::invalid_pattern(format!("{every} does not divide 24 hours")));
                }
            }
            SchedulePattern::Interval { unit: IntervalUnit::Days, every } => {
                if *every == 0 {
                    return Err(Error::invalid_pattern("day interval must be at least 1"));
                }
            }
            SchedulePattern::TimeOfDay { .. } | SchedulePattern::Weekly { .. } => {}
            SchedulePattern::Cron { expr } => self.external.validate(expr)?,
        }
        Ok(())
    }

    /// Smallest boundary of `pattern` strictly after `after`.
    pub fn compute_next_due(&self, pattern: &SchedulePattern, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.validate(pattern)?;
        self.next_boundary(pattern, after)
    }

    /// [`compute_next_due`](Self::compute_next_due) for an already validated pattern.
    fn next_boundary(&self, pattern: &SchedulePattern, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz).naive_local();
        match pattern {
            SchedulePattern::Interval { unit: IntervalUnit::Minutes, every } => {
                let n = i64::from(*every);
                let local = self.fold_start(after);
                let hour = local.date().and_hms_opt(local.hour(), 0, 0).ok_or_else(no_boundary)?;
                let first = hour + Duration::minutes((i64::from(local.minute()) / n + 1) * n);
                self.resolve(after, first, Duration::minutes(n), true)
            }
            SchedulePattern::Interval { unit: IntervalUnit::Hours, every } => {
                let n = i64::from(*every);
                let local = self.fold_start(after);
                let midnight = local.date().and_hms_opt(0, 0, 0).ok_or_else(no_boundary)?;
                let first = midnight + Duration::hours((i64::from(local.hour()) / n + 1) * n);
                self.resolve(after, first, Duration::hours(n), true)
            }
            SchedulePattern::Interval { unit: IntervalUnit::Days, every } => {
                let n = i64::from(*every);
                let day = i64::from(local.date().num_days_from_ce());
                let target = i32::try_from((day / n + 1) * n).map_err(|_| no_boundary())?;
                let first = NaiveDate::from_num_days_from_ce_opt(target)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .ok_or_else(no_boundary)?;
                self.resolve(after, first, Duration::days(n), false)
            }
            SchedulePattern::TimeOfDay { at } => {
                let first = local
                    .date()
                    .and_hms_opt(u32::from(at.hour), u32::from(at.minute), 0)
                    .ok_or_else(no_boundary)?;
                self.resolve(after, first, Duration::days(1), false)
            }
            SchedulePattern::Weekly { day, at } => {
                let today = local.date();
                let ahead = (i64::from(day.to_chrono().num_days_from_monday())
                    - i64::from(today.weekday().num_days_from_monday()))
                .rem_euclid(7);
                let first = (today + Duration::days(ahead))
                    .and_hms_opt(u32::from(at.hour), u32::from(at.minute), 0)
                    .ok_or_else(no_boundary)?;
                self.resolve(after, first, Duration::days(7), false)
            }
            SchedulePattern::Cron { expr } => self
                .external
                .next_after(expr, after, self.tz)?
                .ok_or_else(|| Error::invalid_pattern(format!("cron expression {expr:?} never fires again"))),
        }
    }

    /// Most recent boundary at or before `at`, if one exists in a sane horizon.
    pub fn latest_boundary_at_or_before(&self, pattern: &SchedulePattern, at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.validate(pattern)?;
        self.latest_boundary(pattern, at)
    }

    fn latest_boundary(&self, pattern: &SchedulePattern, at: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let mut window = Duration::minutes(1);
        for _ in 0..32 {
            let Some(probe) = at.checked_sub_signed(window) else { break };
            let first = self.next_boundary(pattern, probe)?;
            if first <= at {
                let mut latest = first;
                loop {
                    let next = self.next_boundary(pattern, latest)?;
                    if next > at {
                        return Ok(Some(latest));
                    }
                    latest = next;
                }
            }
            window = window * 2;
        }
        Ok(None)
    }

    /// Walk the boundaries in `[from, to]`, treating `from` itself as one.
    pub fn scan_boundaries(&self, pattern: &SchedulePattern, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<BoundaryScan> {
        if from > to {
            return Ok(BoundaryScan { count: 0, latest: None });
        }
        self.validate(pattern)?;
        let mut count = 1;
        let mut cursor = from;
        loop {
            let next = self.next_boundary(pattern, cursor)?;
            if next > to {
                return Ok(BoundaryScan { count, latest: Some(cursor) });
            }
            count += 1;
            cursor = next;
            if count >= MAX_COUNTED_BOUNDARIES {
                let latest = self.latest_boundary(pattern, to)?.unwrap_or(cursor);
                return Ok(BoundaryScan { count, latest: Some(latest.max(cursor)) });
            }
        }
    }

    /// Wall-clock reading of `after`, moved back onto the later offset when
    /// `after` sits on the earlier side of a fold.
    fn fold_start(&self, after: DateTime<Utc>) -> NaiveDateTime {
        let local = after.with_timezone(&self.tz).naive_local();
        match self.tz.from_local_datetime(&local) {
            LocalResult::Ambiguous(early, late) if early.with_timezone(&Utc) == after => {
                local - (late.with_timezone(&Utc) - after)
            }
            _ => local,
        }
    }

    /// Earliest instant after `after` among the aligned candidates from `first`.
    ///
    /// Candidates are naive local times. Past the local reading of `after` they
    /// map to increasing instants; before it (only reachable from a fold) they
    /// can map to later instants than a following candidate, so the search
    /// keeps going until it has looked past that reading. Without
    /// `repeat_in_fold` an ambiguous candidate only counts on its earlier offset.
    fn resolve(&self, after: DateTime<Utc>, first: NaiveDateTime, step: Duration, repeat_in_fold: bool) -> Result<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz).naive_local();
        let mut best: Option<DateTime<Utc>> = None;
        let mut candidate = first;
        for _ in 0..MAX_RESOLVE_STEPS {
            let found = match self.tz.from_local_datetime(&candidate) {
                LocalResult::Single(t) => [Some(t), None],
                LocalResult::Ambiguous(early, late) => [Some(early), Some(late).filter(|_| repeat_in_fold)],
                LocalResult::None => [None, None],
            }
            .into_iter()
            .flatten()
            .map(|t| t.with_timezone(&Utc))
            .find(|t| *t > after);
            if let Some(t) = found {
                best = Some(best.map_or(t, |b| b.min(t)));
            }
            if best.is_some() && candidate > local {
                break;
            }
            candidate += step;
        }
        best.ok_or_else(no_boundary)
    }
}

fn no_boundary() -> Error {
    Error::invalid_pattern("no representable boundary")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DayOfWeek, WallTime};
    use rstest::rstest;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn ten_minute_interval_from_nine_oh_three() {
        let e = ScheduleEngine::default();
        let next = e.compute_next_due(&SchedulePattern::every_minutes(10), utc(2024, 5, 6, 9, 3, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 6, 9, 10, 0));
    }

    #[test]
    fn exact_boundary_yields_the_following_one() {
        let e = ScheduleEngine::default();
        let p = SchedulePattern::every_minutes(10);
        assert_eq!(e.compute_next_due(&p, utc(2024, 5, 6, 9, 10, 0)).unwrap(), utc(2024, 5, 6, 9, 20, 0));
        assert_eq!(e.compute_next_due(&p, utc(2024, 5, 6, 9, 50, 0)).unwrap(), utc(2024, 5, 6, 10, 0, 0));
        assert_eq!(e.compute_next_due(&p, utc(2024, 12, 31, 23, 55, 1)).unwrap(), utc(2025, 1, 1, 0, 0, 0));
    }

    #[rstest]
    fn minute_intervals_are_aligned(#[values(1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30, 60)] n: u32) {
        let e = ScheduleEngine::default();
        let p = SchedulePattern::every_minutes(n);
        let start = utc(2024, 2, 28, 22, 0, 0);
        // a 97-second stride hits every second-of-minute offset over time
        for i in 0..400 {
            let after = start + Duration::seconds(97 * i);
            let t = e.compute_next_due(&p, after).unwrap();
            assert!(t > after);
            assert_eq!(t.second(), 0);
            assert_eq!(t.minute() % n, 0);
            assert!(t - after <= Duration::minutes(i64::from(n)));
        }
    }

    #[test]
    fn hour_and_day_intervals() {
        let e = ScheduleEngine::default();
        let six_hourly = SchedulePattern::every_hours(6);
        assert_eq!(e.compute_next_due(&six_hourly, utc(2024, 5, 6, 13, 0, 0)).unwrap(), utc(2024, 5, 6, 18, 0, 0));
        assert_eq!(e.compute_next_due(&six_hourly, utc(2024, 5, 6, 18, 0, 0)).unwrap(), utc(2024, 5, 7, 0, 0, 0));
        let daily = SchedulePattern::Interval { unit: IntervalUnit::Days, every: 1 };
        assert_eq!(e.compute_next_due(&daily, utc(2024, 5, 6, 0, 0, 0)).unwrap(), utc(2024, 5, 7, 0, 0, 0));
    }

    #[test]
    fn time_of_day_rolls_over() {
        let e = ScheduleEngine::default();
        let p = SchedulePattern::TimeOfDay { at: WallTime::new(2, 0).unwrap() };
        assert_eq!(e.compute_next_due(&p, utc(2024, 5, 6, 1, 59, 59)).unwrap(), utc(2024, 5, 6, 2, 0, 0));
        assert_eq!(e.compute_next_due(&p, utc(2024, 5, 6, 2, 0, 0)).unwrap(), utc(2024, 5, 7, 2, 0, 0));
    }

    #[test]
    fn weekly_targets_the_right_weekday() {
        let e = ScheduleEngine::default();
        // 2024-05-06 is a Monday
        let p = SchedulePattern::Weekly { day: DayOfWeek::Wed, at: WallTime::new(9, 30).unwrap() };
        assert_eq!(e.compute_next_due(&p, utc(2024, 5, 6, 12, 0, 0)).unwrap(), utc(2024, 5, 8, 9, 30, 0));
        assert_eq!(e.compute_next_due(&p, utc(2024, 5, 8, 9, 30, 0)).unwrap(), utc(2024, 5, 15, 9, 30, 0));
        let monday = SchedulePattern::Weekly { day: DayOfWeek::Mon, at: WallTime::new(9, 0).unwrap() };
        assert_eq!(e.compute_next_due(&monday, utc(2024, 5, 6, 8, 0, 0)).unwrap(), utc(2024, 5, 6, 9, 0, 0));
    }

    #[test]
    fn configured_timezone_aligns_days_locally() {
        let e = ScheduleEngine::new(ScheduleEngine::parse_timezone("Europe/Paris").unwrap());
        let daily = SchedulePattern::Interval { unit: IntervalUnit::Days, every: 1 };
        // midnight in Paris during summer time is 22:00 UTC
        assert_eq!(e.compute_next_due(&daily, utc(2024, 7, 1, 12, 0, 0)).unwrap(), utc(2024, 7, 1, 22, 0, 0));
    }

    #[test]
    fn dst_gap_is_skipped() {
        let e = ScheduleEngine::new(ScheduleEngine::parse_timezone("Europe/Paris").unwrap());
        // 2024-03-31 02:30 does not exist in Paris
        let p = SchedulePattern::TimeOfDay { at: WallTime::new(2, 30).unwrap() };
        let next = e.compute_next_due(&p, utc(2024, 3, 30, 12, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 4, 1, 0, 30, 0));
    }

    #[test]
    fn dst_fold_keeps_the_repeated_hour() {
        let e = ScheduleEngine::new(ScheduleEngine::parse_timezone("Europe/Paris").unwrap());
        let p = SchedulePattern::every_minutes(10);
        // 2024-10-27 02:00-03:00 happens twice in Paris: 00:00-01:00 UTC, then 01:00-02:00 UTC
        assert_eq!(e.compute_next_due(&p, utc(2024, 10, 27, 0, 50, 0)).unwrap(), utc(2024, 10, 27, 1, 0, 0));
        assert_eq!(e.compute_next_due(&p, utc(2024, 10, 27, 1, 50, 0)).unwrap(), utc(2024, 10, 27, 2, 0, 0));

        let mut t = utc(2024, 10, 26, 23, 0, 0);
        for _ in 0..24 {
            let next = e.compute_next_due(&p, t).unwrap();
            assert_eq!(next - t, Duration::minutes(10), "gap after {t}");
            t = next;
        }
        let scan = e.scan_boundaries(&p, utc(2024, 10, 26, 23, 0, 0), utc(2024, 10, 27, 3, 0, 0)).unwrap();
        assert_eq!(scan.count, 25);

        let hourly = SchedulePattern::every_hours(1);
        assert_eq!(e.compute_next_due(&hourly, utc(2024, 10, 27, 0, 30, 0)).unwrap(), utc(2024, 10, 27, 1, 0, 0));

        // a wall-clock time inside the fold still fires once that day
        let daily = SchedulePattern::TimeOfDay { at: WallTime::new(2, 30).unwrap() };
        assert_eq!(e.compute_next_due(&daily, utc(2024, 10, 26, 12, 0, 0)).unwrap(), utc(2024, 10, 27, 0, 30, 0));
        assert_eq!(e.compute_next_due(&daily, utc(2024, 10, 27, 0, 30, 0)).unwrap(), utc(2024, 10, 28, 1, 30, 0));
    }

    #[test]
    fn scan_validates_once() {
        #[derive(Default)]
        struct Counting {
            validations: std::sync::atomic::AtomicUsize,
        }
        impl ExternalSchedule for Counting {
            fn validate(&self, _expr: &str) -> Result<()> {
                self.validations.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
            fn next_after(&self, _expr: &str, after: DateTime<Utc>, _tz: Tz) -> Result<Option<DateTime<Utc>>> {
                Ok(Some(after + Duration::minutes(1)))
            }
        }

        let counting = Arc::new(Counting::default());
        let e = ScheduleEngine::with_external(chrono_tz::UTC, counting.clone());
        let p = SchedulePattern::Cron { expr: "every minute".into() };
        let scan = e.scan_boundaries(&p, utc(2024, 5, 6, 9, 0, 0), utc(2024, 5, 6, 10, 0, 0)).unwrap();
        assert_eq!(scan.count, 61);
        assert_eq!(counting.validations.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let e = ScheduleEngine::default();
        assert!(e.validate(&SchedulePattern::every_minutes(7)).is_err());
        assert!(e.validate(&SchedulePattern::every_minutes(0)).is_err());
        assert!(e.validate(&SchedulePattern::every_hours(5)).is_err());
        assert!(e.validate(&SchedulePattern::Cron { expr: "not a cron".into() }).is_err());
        assert!(matches!(
            e.compute_next_due(&SchedulePattern::every_minutes(7), Utc::now()),
            Err(Error::SchedulePatternInvalid { .. })
        ));
    }

    #[test]
    fn cron_is_delegated() {
        let e = ScheduleEngine::default();
        let p = SchedulePattern::Cron { expr: "0 9 * * *".into() };
        assert_eq!(e.compute_next_due(&p, utc(2024, 2, 1, 0, 0, 0)).unwrap(), utc(2024, 2, 1, 9, 0, 0));
    }

    #[test]
    fn scan_counts_missed_boundaries() {
        let e = ScheduleEngine::default();
        let p = SchedulePattern::every_minutes(5);
        let scan = e.scan_boundaries(&p, utc(2024, 5, 6, 9, 5, 0), utc(2024, 5, 6, 12, 3, 0)).unwrap();
        assert_eq!(scan.count, 36);
        assert_eq!(scan.latest, Some(utc(2024, 5, 6, 12, 0, 0)));
        let none = e.scan_boundaries(&p, utc(2024, 5, 6, 12, 5, 0), utc(2024, 5, 6, 12, 3, 0)).unwrap();
        assert_eq!(none, BoundaryScan { count: 0, latest: None });
    }

    #[test]
    fn scan_saturates_on_long_outages() {
        let e = ScheduleEngine::default();
        let p = SchedulePattern::every_minutes(1);
        let scan = e.scan_boundaries(&p, utc(2023, 1, 1, 0, 0, 0), utc(2024, 1, 1, 0, 0, 30)).unwrap();
        assert_eq!(scan.count, MAX_COUNTED_BOUNDARIES);
        assert_eq!(scan.latest, Some(utc(2024, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn latest_boundary_lookup() {
        let e = ScheduleEngine::default();
        let p = SchedulePattern::TimeOfDay { at: WallTime::new(2, 0).unwrap() };
        assert_eq!(
            e.latest_boundary_at_or_before(&p, utc(2024, 5, 6, 1, 0, 0)).unwrap(),
            Some(utc(2024, 5, 5, 2, 0, 0))
        );
        assert_eq!(
            e.latest_boundary_at_or_before(&p, utc(2024, 5, 6, 2, 0, 0)).unwrap(),
            Some(utc(2024, 5, 6, 2, 0, 0))
        );
    }
}
