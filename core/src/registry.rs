//! Working set of jobs, reconciled against the discovery source.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::job::{JobSpec, ScheduleState};
use crate::schedule::ScheduleEngine;
use crate::store::StateStore;

/// Lifecycle of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    /// Present in the latest snapshot with a valid pattern.
    Active,
    /// Gone from the source; kept until its dispatch resolves.
    Removed,
    /// Present, but its pattern cannot be evaluated.
    Invalid(String),
}

/// One job as the registry sees it.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Latest spec seen for the id.
    pub spec: JobSpec,
    /// Where the entry stands.
    pub status: EntryStatus,
}

impl RegistryEntry {
    /// Eligible for the tick loop.
    pub fn schedulable(&self) -> bool {
        self.status == EntryStatus::Active && self.spec.enabled
    }
}

/// What one reload changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    /// Ids that entered the working set (restored ones included).
    pub added: Vec<String>,
    /// Ids that left the source.
    pub removed: Vec<String>,
    /// Ids whose pattern changed; cursor reset forward.
    pub rescheduled: Vec<String>,
    /// Ids whose non-scheduling fields changed.
    pub updated: Vec<String>,
    /// Ids registered disabled, with the reason.
    pub invalid: Vec<(String, String)>,
}

impl ReloadReport {
    /// Nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.rescheduled.is_empty()
            && self.updated.is_empty()
            && self.invalid.is_empty()
    }
}

impl fmt::Display for ReloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added={} removed={} rescheduled={} updated={} invalid={}",
            self.added.len(),
            self.removed.len(),
            self.rescheduled.len(),
            self.updated.len(),
            self.invalid.len()
        )
    }
}

/// In-memory id → spec map. Durable cursors live in the [`StateStore`].
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `id`.
    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    /// All entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.entries.iter()
    }

    /// Number of entries, removed ones still awaiting collection included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Specs the tick loop may evaluate.
    pub fn schedulable(&self) -> impl Iterator<Item = &JobSpec> {
        self.entries.values().filter(|e| e.schedulable()).map(|e| &e.spec)
    }

    /// Reconcile with a complete snapshot from the source.
    ///
    /// Persisted state is never deleted: removed jobs are soft-disabled and
    /// their history stays in the store. Jobs in `in_flight` keep their entry
    /// until a later collection.
    pub fn reload(
        &mut self,
        specs: Vec<JobSpec>,
        now: DateTime<Utc>,
        engine: &ScheduleEngine,
        store: &dyn StateStore,
        in_flight: &HashSet<String>,
    ) -> Result<ReloadReport> {
        let mut report = ReloadReport::default();
        let mut seen = HashSet::new();

        for spec in specs {
            if !seen.insert(spec.id.clone()) {
                warn!(job_id = %spec.id, "duplicate job id in snapshot, keeping the first");
                continue;
            }
            if let Err(e) = engine.validate(&spec.schedule) {
                warn!(job_id = %spec.id, error = %e, "job registered disabled");
                report.invalid.push((spec.id.clone(), e.to_string()));
                let id = spec.id.clone();
                self.entries.insert(id, RegistryEntry { spec, status: EntryStatus::Invalid(e.to_string()) });
                continue;
            }

            let previous = self.entries.get(&spec.id).filter(|e| e.status == EntryStatus::Active);
            match previous {
                Some(prev) if !prev.spec.same_schedule(&spec) => {
                    reset_forward(&spec, now, engine, store)?;
                    report.rescheduled.push(spec.id.clone());
                }
                Some(prev) => {
                    if prev.spec != spec {
                        report.updated.push(spec.id.clone());
                    }
                }
                None => {
                    if restore_or_seed(&spec, now, engine, store)? {
                        report.added.push(spec.id.clone());
                    } else {
                        report.rescheduled.push(spec.id.clone());
                    }
                }
            }
            let id = spec.id.clone();
            self.entries.insert(id, RegistryEntry { spec, status: EntryStatus::Active });
        }

        let gone: Vec<String> = self.entries.keys().filter(|id| !seen.contains(*id)).cloned().collect();
        for id in gone {
            let Some(entry) = self.entries.get_mut(&id) else { continue };
            match entry.status {
                EntryStatus::Active => {
                    // stays Active until the store agrees, so a failed write is retried next reload
                    deactivate(&id, store)?;
                    entry.status = EntryStatus::Removed;
                    report.removed.push(id);
                }
                EntryStatus::Invalid(_) => {
                    self.entries.remove(&id);
                }
                EntryStatus::Removed => {}
            }
        }

        self.collect_garbage(in_flight);
        if !report.is_empty() {
            info!(%report, "registry reloaded");
        }
        Ok(report)
    }

    /// Drop removed entries that are no longer in flight; returns how many.
    pub fn collect_garbage(&mut self, in_flight: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|id, e| e.status != EntryStatus::Removed || in_flight.contains(id));
        before - self.entries.len()
    }
}

/// Keep a persisted cursor whose pattern still matches, otherwise seed from `now`.
/// Returns `false` when an existing cursor had to be reset.
fn restore_or_seed(spec: &JobSpec, now: DateTime<Utc>, engine: &ScheduleEngine, store: &dyn StateStore) -> Result<bool> {
    let fingerprint = spec.schedule.fingerprint();
    match store.read_state(&spec.id)? {
        Some(mut state) if state.pattern == fingerprint => {
            if !state.active {
                state.active = true;
                store.reset_state(&state)?;
            }
            info!(job_id = %spec.id, next_due_at = %state.next_due_at, "restored persisted cursor");
            Ok(true)
        }
        Some(_) => {
            reset_forward(spec, now, engine, store)?;
            Ok(false)
        }
        None => {
            let next = engine.compute_next_due(&spec.schedule, now)?;
            store.reset_state(&ScheduleState::seed(spec.id.clone(), &spec.schedule, next))?;
            info!(job_id = %spec.id, next_due_at = %next, schedule = %spec.schedule, "seeded new job");
            Ok(true)
        }
    }
}

/// Recompute the cursor from `now` for a changed pattern. Run history is kept.
fn reset_forward(spec: &JobSpec, now: DateTime<Utc>, engine: &ScheduleEngine, store: &dyn StateStore) -> Result<()> {
    let next = engine.compute_next_due(&spec.schedule, now)?;
    let state = match store.read_state(&spec.id)? {
        Some(prev) => ScheduleState {
            next_due_at: next,
            pattern: spec.schedule.fingerprint(),
            active: true,
            ..prev
        },
        None => ScheduleState::seed(spec.id.clone(), &spec.schedule, next),
    };
    store.reset_state(&state)?;
    info!(job_id = %spec.id, next_due_at = %next, schedule = %spec.schedule, "schedule changed, cursor reset forward");
    Ok(())
}

fn deactivate(job_id: &str, store: &dyn StateStore) -> Result<()> {
    if let Some(mut state) = store.read_state(job_id)? {
        if state.active {
            state.active = false;
            store.reset_state(&state)?;
        }
    }
    info!(job_id, "job left the source, soft-disabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExecPolicy, SchedulePattern};
    use crate::error::Error;
    use crate::job::ExecutionRecord;
    use crate::store_sqlite::SqliteStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sqlite store whose cursor writes can be switched off.
    struct WriteFailingStore {
        inner: SqliteStore,
        failing: AtomicBool,
    }

    impl WriteFailingStore {
        fn new() -> Self {
            Self { inner: SqliteStore::open_in_memory().unwrap(), failing: AtomicBool::new(false) }
        }
        fn fail_writes(&self, on: bool) {
            self.failing.store(on, Ordering::SeqCst);
        }
        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::PersistenceUnavailable("read-only".into()));
            }
            Ok(())
        }
    }

    impl StateStore for WriteFailingStore {
        fn read_state(&self, job_id: &str) -> Result<Option<ScheduleState>> {
            self.inner.read_state(job_id)
        }
        fn write_state(&self, state: &ScheduleState) -> Result<()> {
            self.check()?;
            self.inner.write_state(state)
        }
        fn reset_state(&self, state: &ScheduleState) -> Result<()> {
            self.check()?;
            self.inner.reset_state(state)
        }
        fn list_states(&self) -> Result<Vec<ScheduleState>> {
            self.inner.list_states()
        }
        fn append_execution(&self, record: &ExecutionRecord) -> Result<()> {
            self.check()?;
            self.inner.append_execution(record)
        }
        fn has_success(&self, job_id: &str, scheduled_for: DateTime<Utc>) -> Result<bool> {
            self.inner.has_success(job_id, scheduled_for)
        }
        fn list_executions(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
            self.inner.list_executions(job_id, limit)
        }
        fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize> {
            self.inner.prune_executions(before)
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, h, m, 0).unwrap()
    }

    fn job(id: &str, every: u32) -> JobSpec {
        JobSpec::new(id, SchedulePattern::every_minutes(every))
    }

    fn setup() -> (JobRegistry, ScheduleEngine, SqliteStore) {
        (JobRegistry::new(), ScheduleEngine::default(), SqliteStore::open_in_memory().unwrap())
    }

    #[test]
    fn new_jobs_are_seeded_from_now() {
        let (mut reg, engine, store) = setup();
        let report = reg.reload(vec![job("a", 10), job("b", 15)], at(9, 3), &engine, &store, &HashSet::new()).unwrap();
        assert_eq!(report.added, ["a", "b"]);
        assert_eq!(store.read_state("a").unwrap().unwrap().next_due_at, at(9, 10));
        assert_eq!(store.read_state("b").unwrap().unwrap().next_due_at, at(9, 15));
        assert_eq!(reg.schedulable().count(), 2);
    }

    #[test]
    fn restart_keeps_persisted_cursor() {
        let (_, engine, store) = setup();
        store.reset_state(&ScheduleState::seed("a", &SchedulePattern::every_minutes(10), at(9, 20))).unwrap();
        let mut fresh = JobRegistry::new();
        fresh.reload(vec![job("a", 10)], at(9, 27), &engine, &store, &HashSet::new()).unwrap();
        assert_eq!(store.read_state("a").unwrap().unwrap().next_due_at, at(9, 20));
    }

    #[test]
    fn pattern_change_resets_cursor_forward() {
        let (mut reg, engine, store) = setup();
        reg.reload(vec![job("a", 10)], at(6, 0), &engine, &store, &HashSet::new()).unwrap();
        let report = reg.reload(vec![job("a", 30)], at(9, 3), &engine, &store, &HashSet::new()).unwrap();
        assert_eq!(report.rescheduled, ["a"]);
        let state = store.read_state("a").unwrap().unwrap();
        assert_eq!(state.next_due_at, at(9, 30));
        assert_eq!(state.schedule_pattern().unwrap(), SchedulePattern::every_minutes(30));
    }

    #[test]
    fn policy_change_leaves_cursor_alone() {
        let (mut reg, engine, store) = setup();
        reg.reload(vec![job("a", 10)], at(6, 0), &engine, &store, &HashSet::new()).unwrap();
        let mut edited = job("a", 10);
        edited.policy = ExecPolicy { timeout_secs: 5, retry_count: 3, retry_delay_secs: 1 };
        let report = reg.reload(vec![edited], at(9, 3), &engine, &store, &HashSet::new()).unwrap();
        assert_eq!(report.updated, ["a"]);
        assert_eq!(store.read_state("a").unwrap().unwrap().next_due_at, at(6, 10));
        assert_eq!(reg.get("a").unwrap().spec.policy.retry_count, 3);
    }

    #[test]
    fn removal_while_in_flight_defers_collection() {
        let (mut reg, engine, store) = setup();
        reg.reload(vec![job("a", 10)], at(9, 0), &engine, &store, &HashSet::new()).unwrap();
        let busy: HashSet<String> = ["a".to_string()].into();
        let report = reg.reload(vec![], at(9, 5), &engine, &store, &busy).unwrap();
        assert_eq!(report.removed, ["a"]);
        assert_eq!(reg.get("a").unwrap().status, EntryStatus::Removed);
        assert_eq!(reg.schedulable().count(), 0);
        let state = store.read_state("a").unwrap().unwrap();
        assert!(!state.active);

        assert_eq!(reg.collect_garbage(&busy), 0);
        assert_eq!(reg.collect_garbage(&HashSet::new()), 1);
        assert!(reg.get("a").is_none());
        assert!(store.read_state("a").unwrap().is_some());
    }

    #[test]
    fn removed_job_comes_back_with_its_cursor() {
        let (mut reg, engine, store) = setup();
        reg.reload(vec![job("a", 10)], at(9, 0), &engine, &store, &HashSet::new()).unwrap();
        reg.reload(vec![], at(9, 1), &engine, &store, &HashSet::new()).unwrap();
        let report = reg.reload(vec![job("a", 10)], at(9, 2), &engine, &store, &HashSet::new()).unwrap();
        assert_eq!(report.added, ["a"]);
        let state = store.read_state("a").unwrap().unwrap();
        assert!(state.active);
        assert_eq!(state.next_due_at, at(9, 10));
    }

    #[test]
    fn invalid_pattern_is_registered_disabled() {
        let (mut reg, engine, store) = setup();
        let report = reg.reload(vec![job("bad", 7), job("ok", 5)], at(9, 0), &engine, &store, &HashSet::new()).unwrap();
        assert_eq!(report.invalid.len(), 1);
        assert!(matches!(reg.get("bad").unwrap().status, EntryStatus::Invalid(_)));
        assert!(store.read_state("bad").unwrap().is_none());
        let ids: Vec<_> = reg.schedulable().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["ok"]);
    }

    #[test]
    fn failed_deactivation_is_retried_on_next_reload() {
        let mut reg = JobRegistry::new();
        let engine = ScheduleEngine::default();
        let store = WriteFailingStore::new();
        reg.reload(vec![job("a", 10), job("b", 10)], at(9, 0), &engine, &store, &HashSet::new()).unwrap();

        store.fail_writes(true);
        assert!(reg.reload(vec![job("b", 10)], at(9, 1), &engine, &store, &HashSet::new()).is_err());
        assert_eq!(reg.get("a").unwrap().status, EntryStatus::Active);
        assert!(store.read_state("a").unwrap().unwrap().active);

        store.fail_writes(false);
        let report = reg.reload(vec![job("b", 10)], at(9, 2), &engine, &store, &HashSet::new()).unwrap();
        assert_eq!(report.removed, ["a"]);
        assert!(!store.read_state("a").unwrap().unwrap().active);
        assert!(reg.get("a").is_none());
    }
}
