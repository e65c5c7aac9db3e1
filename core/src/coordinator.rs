//! Tick loop and per-job dispatch.
//!
//! Only the coordinator dispatches. Each job has at most one dispatch in
//! flight; the in-flight set is the guard. Reload takes the registry write
//! lock, while a tick and every dispatch completion hold the read lock, so a
//! reload never interleaves with a cursor update.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::job::{ExecutionRecord, JobSpec, RunStatus, ScheduleState};
use crate::overdue::{Classification, OverdueDetector};
use crate::registry::{JobRegistry, ReloadReport};
use crate::source::JobSource;
use crate::store::StateStore;

const PRUNE_EVERY: Duration = Duration::from_secs(24 * 60 * 60);
const DRAIN_POLL: Duration = Duration::from_millis(50);
/// Upper bound on waiting for in-flight dispatches at shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Hot-reloadable timing of the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// Execution tick.
    pub tick: Duration,
    /// Registry reload.
    pub reload: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self { tick: Duration::from_secs(10), reload: Duration::from_secs(60) }
    }
}

/// Static limits of a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Size of the dispatch pool.
    pub max_concurrency: usize,
    /// Consecutive store failures tolerated before the loop gives up.
    pub persistence_failure_limit: u32,
    /// History older than this is pruned.
    pub history_retention: chrono::Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().max(1),
            persistence_failure_limit: 5,
            history_retention: chrono::Duration::days(30),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Jobs dispatched, with the boundary each run satisfies.
    pub dispatched: Vec<(String, DateTime<Utc>)>,
    /// Boundaries recorded as skipped (outside the catch-up window).
    pub skipped: Vec<(String, DateTime<Utc>)>,
    /// Boundaries already satisfied; cursor advanced without a run.
    pub advanced: Vec<String>,
    /// Due jobs left alone because a dispatch is still in flight.
    pub busy: Vec<String>,
    /// Due jobs left for the next tick because the pool was full.
    pub saturated: usize,
    /// Spawned dispatches.
    pub handles: Vec<JoinHandle<()>>,
}

impl TickReport {
    /// Wait for every dispatch started by this tick.
    pub async fn join(self) {
        for h in self.handles {
            if let Err(e) = h.await {
                error!(error = %e, "dispatch task panicked");
            }
        }
    }
}

/// Removes the job from the in-flight set when the dispatch resolves.
struct DispatchGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl DispatchGuard {
    fn claim(in_flight: &Arc<Mutex<HashSet<String>>>, job_id: &str) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|p| p.into_inner());
        set.insert(job_id.to_string()).then(|| Self { in_flight: in_flight.clone(), job_id: job_id.to_string() })
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).remove(&self.job_id);
    }
}

/// Which side of the store a result came from.
#[derive(Debug, Clone, Copy)]
enum StoreOp {
    Read,
    Write,
}

/// Consecutive store failures, counted per side so that working reads do not
/// hide failing writes.
#[derive(Debug, Default)]
struct StoreFailures {
    reads: AtomicU32,
    writes: AtomicU32,
}

impl StoreFailures {
    fn counter(&self, op: StoreOp) -> &AtomicU32 {
        match op {
            StoreOp::Read => &self.reads,
            StoreOp::Write => &self.writes,
        }
    }

    fn worst(&self) -> u32 {
        self.reads.load(Ordering::Relaxed).max(self.writes.load(Ordering::Relaxed))
    }
}

/// Drives registry reloads, ticks and dispatches.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    store: Arc<dyn StateStore>,
    registry: Arc<RwLock<JobRegistry>>,
    source: Arc<dyn JobSource>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    detector: Arc<OverdueDetector>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    permits: Arc<Semaphore>,
    store_failures: Arc<StoreFailures>,
    failure_limit: u32,
    retention: chrono::Duration,
}

impl ExecutionCoordinator {
    /// Wire a coordinator. Nothing runs until [`reload`](Self::reload) / [`tick`](Self::tick) or [`run`](Self::run).
    pub fn new(
        store: Arc<dyn StateStore>,
        source: Arc<dyn JobSource>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        detector: OverdueDetector,
        opts: CoordinatorOptions,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(RwLock::new(JobRegistry::new())),
            source,
            executor,
            clock,
            detector: Arc::new(detector),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits: Arc::new(Semaphore::new(opts.max_concurrency.max(1))),
            store_failures: Arc::new(StoreFailures::default()),
            failure_limit: opts.persistence_failure_limit,
            retention: opts.history_retention,
        }
    }

    /// Shared registry, for read-only views.
    pub fn registry(&self) -> Arc<RwLock<JobRegistry>> {
        self.registry.clone()
    }

    /// Backing store.
    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    /// Detector used for classification.
    pub fn detector(&self) -> &OverdueDetector {
        &self.detector
    }

    /// Ids with a dispatch in flight, sorted.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.in_flight_set().into_iter().collect();
        ids.sort();
        ids
    }

    fn in_flight_set(&self) -> HashSet<String> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn is_in_flight(&self, job_id: &str) -> bool {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).contains(job_id)
    }

    /// Pull a snapshot from the source and reconcile the registry.
    pub async fn reload(&self) -> Result<ReloadReport> {
        let specs = self.source.produce_job_specs()?;
        let now = self.clock.now();
        let in_flight = self.in_flight_set();
        let mut registry = self.registry.write().await;
        let res = registry.reload(specs, now, self.detector.engine(), self.store.as_ref(), &in_flight);
        match self.persisted("*", StoreOp::Read, res)? {
            Some(report) => Ok(report),
            None => Ok(ReloadReport::default()),
        }
    }

    /// Evaluate every schedulable job once and dispatch the ones that are due.
    ///
    /// Returns an error only when the store has been failing for longer than
    /// the configured limit.
    pub async fn tick(&self) -> Result<TickReport> {
        self.check_fatal()?;
        let now = self.clock.now();
        {
            let in_flight = self.in_flight_set();
            let collected = self.registry.write().await.collect_garbage(&in_flight);
            if collected > 0 {
                debug!(collected, "collected removed jobs");
            }
        }

        let registry = self.registry.read().await;
        let mut report = TickReport::default();
        for spec in registry.schedulable() {
            if self.is_in_flight(&spec.id) {
                debug!(job_id = %spec.id, "still running, skipped this tick");
                report.busy.push(spec.id.clone());
                continue;
            }
            let Some(state) = self.persisted(&spec.id, StoreOp::Read, self.store.read_state(&spec.id))? else { continue };
            let Some(state) = state else {
                warn!(job_id = %spec.id, "no persisted cursor, waiting for the next reload");
                continue;
            };

            let boundary = match self.detector.classify(now, &state, &spec.schedule) {
                Ok(Classification::NotDue) => continue,
                Ok(Classification::Due { boundary }) => boundary,
                Ok(Classification::Overdue { missed_count, boundary }) => {
                    info!(job_id = %spec.id, missed_count, cursor = %state.next_due_at, %boundary, "overdue, running once for the latest boundary");
                    boundary
                }
                Err(e) => {
                    warn!(job_id = %spec.id, error = %e, "cannot classify job");
                    continue;
                }
            };

            if self.detector.beyond_catchup_window(now, boundary) {
                self.skip_boundary(spec, boundary, now)?;
                report.skipped.push((spec.id.clone(), boundary));
                continue;
            }

            match self.persisted(&spec.id, StoreOp::Read, self.store.has_success(&spec.id, boundary))? {
                None => continue,
                Some(true) => {
                    info!(job_id = %spec.id, %boundary, "boundary already satisfied, advancing cursor");
                    self.advance_cursor(spec, boundary, None)?;
                    report.advanced.push(spec.id.clone());
                    continue;
                }
                Some(false) => {}
            }

            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    debug!(job_id = %spec.id, "dispatch pool saturated");
                    report.saturated += 1;
                    continue;
                }
            };
            let Some(guard) = DispatchGuard::claim(&self.in_flight, &spec.id) else {
                report.busy.push(spec.id.clone());
                continue;
            };

            report.dispatched.push((spec.id.clone(), boundary));
            let this = self.clone();
            let spec = spec.clone();
            report.handles.push(tokio::spawn(async move {
                this.dispatch(spec, boundary, permit).await;
                drop(guard);
            }));
        }
        Ok(report)
    }

    async fn dispatch(&self, spec: JobSpec, boundary: DateTime<Utc>, _permit: OwnedSemaphorePermit) {
        info!(job_id = %spec.id, %boundary, "dispatching");
        let record = self.attempt(&spec, boundary).await;
        match record.status {
            RunStatus::Success => info!(job_id = %spec.id, %boundary, attempts = record.attempts, "run succeeded"),
            status => warn!(
                job_id = %spec.id,
                %boundary,
                %status,
                attempts = record.attempts,
                error = record.error_summary.as_deref().unwrap_or(""),
                "run did not succeed"
            ),
        }

        let _registry = self.registry.read().await;
        if let Err(e) = self.record_outcome(&spec, boundary, &record) {
            error!(job_id = %spec.id, error = %e, "could not record run outcome");
        }
    }

    /// Run the executor under the job's timeout and retry policy. Timeouts are
    /// final for the boundary; failures are retried `retry_count` times.
    async fn attempt(&self, spec: &JobSpec, boundary: DateTime<Utc>) -> ExecutionRecord {
        let policy = &spec.policy;
        let started_at = self.clock.now();
        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            let res = match timeout(policy.timeout(), self.executor.execute(&spec.id, &spec.action, policy.timeout())).await {
                Ok(res) => res,
                Err(_) => Err(Error::ExecutionTimeout { timeout: policy.timeout() }),
            };
            match res {
                Ok(()) => break Ok(()),
                Err(e @ Error::ExecutionTimeout { .. }) => break Err(e),
                Err(e) if attempts <= policy.retry_count => {
                    warn!(job_id = %spec.id, attempt = attempts, error = %e, "attempt failed, retrying");
                    tokio::time::sleep(policy.retry_delay()).await;
                }
                Err(e) => break Err(e),
            }
        };
        let (status, error_summary) = match outcome {
            Ok(()) => (RunStatus::Success, None),
            Err(e @ Error::ExecutionTimeout { .. }) => (RunStatus::Timeout, Some(e.to_string())),
            Err(e) => (RunStatus::Failure, Some(e.to_string())),
        };
        ExecutionRecord {
            job_id: spec.id.clone(),
            scheduled_for: boundary,
            started_at,
            finished_at: self.clock.now(),
            status,
            error_summary,
            attempts,
        }
    }

    fn record_outcome(&self, spec: &JobSpec, boundary: DateTime<Utc>, record: &ExecutionRecord) -> Result<()> {
        match self.store.append_execution(record) {
            Ok(()) => {}
            Err(Error::DuplicateExecution { .. }) => {
                info!(job_id = %spec.id, %boundary, "boundary was already satisfied, duplicate record dropped");
            }
            Err(e) => {
                // cursor stays put; the boundary is retried next tick
                self.persisted(&spec.id, StoreOp::Write, Err::<(), _>(e))?;
                return Ok(());
            }
        }
        self.advance_cursor(spec, boundary, Some(record))
    }

    fn skip_boundary(&self, spec: &JobSpec, boundary: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        warn!(job_id = %spec.id, %boundary, "boundary outside the catch-up window, skipped");
        let record = ExecutionRecord {
            job_id: spec.id.clone(),
            scheduled_for: boundary,
            started_at: now,
            finished_at: now,
            status: RunStatus::Skipped,
            error_summary: Some("boundary outside the catch-up window".into()),
            attempts: 0,
        };
        if self.persisted(&spec.id, StoreOp::Write, self.store.append_execution(&record))?.is_none() {
            return Ok(());
        }
        self.advance_cursor(spec, boundary, Some(&record))
    }

    /// Move the cursor past `boundary`. Never moves it backwards, and leaves it
    /// alone if the pattern changed while the run was in flight.
    fn advance_cursor(&self, spec: &JobSpec, boundary: DateTime<Utc>, run: Option<&ExecutionRecord>) -> Result<()> {
        let current = match self.persisted(&spec.id, StoreOp::Read, self.store.read_state(&spec.id))? {
            Some(Some(state)) => state,
            Some(None) => ScheduleState::seed(spec.id.clone(), &spec.schedule, boundary),
            None => return Ok(()),
        };
        let next_due_at = if current.pattern == spec.schedule.fingerprint() {
            match self.detector.engine().compute_next_due(&spec.schedule, boundary) {
                Ok(next) => next.max(current.next_due_at),
                Err(e) => {
                    warn!(job_id = %spec.id, error = %e, "cannot compute next boundary");
                    current.next_due_at
                }
            }
        } else {
            current.next_due_at
        };
        let mut state = ScheduleState { next_due_at, ..current };
        if let Some(r) = run {
            state.last_run_at = Some(r.started_at);
            state.last_run_status = Some(r.status);
        }
        match self.store.write_state(&state) {
            Err(e @ Error::CursorRegression { .. }) => {
                warn!(job_id = %spec.id, error = %e, "cursor moved concurrently, keeping the newer one");
            }
            res => {
                self.persisted(&spec.id, StoreOp::Write, res)?;
                debug!(job_id = %spec.id, next_due_at = %state.next_due_at, "cursor advanced");
            }
        }
        Ok(())
    }

    /// Delete history older than the retention period.
    pub async fn prune_history(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.retention;
        let pruned = self.store.prune_executions(cutoff)?;
        if pruned > 0 {
            info!(pruned, %cutoff, "pruned execution history");
        }
        Ok(pruned)
    }

    /// Wait for in-flight dispatches; `false` if some were still running at the deadline.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = self.in_flight();
            if remaining.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(?remaining, "shutting down with dispatches still in flight");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Main loop: reload, tick and prune on their cadences until `shutdown` flips.
    pub async fn run(&self, mut cadence: watch::Receiver<Cadence>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        match self.reload().await {
            Ok(report) => info!(%report, "initial job load"),
            Err(e) if e.is_persistence() => return Err(e),
            Err(e) => warn!(error = %e, "initial job load failed"),
        }

        let mut current = *cadence.borrow();
        let mut tick = interval(current.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reload = interval_at(Instant::now() + current.reload, current.reload);
        reload.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune = interval(PRUNE_EVERY);
        let mut cadence_open = true;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.tick().await?;
                }
                _ = reload.tick() => {
                    match self.reload().await {
                        Ok(_) => {}
                        Err(e) if e.is_persistence() => return Err(e),
                        Err(e) => warn!(error = %e, "job reload failed, keeping the previous set"),
                    }
                }
                _ = prune.tick() => {
                    if let Err(e) = self.prune_history().await {
                        warn!(error = %e, "history pruning failed");
                    }
                }
                changed = cadence.changed(), if cadence_open => {
                    if changed.is_err() {
                        cadence_open = false;
                        continue;
                    }
                    let next = *cadence.borrow_and_update();
                    if next != current {
                        info!(tick = ?next.tick, reload = ?next.reload, "cadence changed");
                        if next.tick != current.tick {
                            tick = interval_at(Instant::now() + next.tick, next.tick);
                            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        }
                        if next.reload != current.reload {
                            reload = interval_at(Instant::now() + next.reload, next.reload);
                            reload.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }
                        current = next;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("coordinator stopping");
                        break;
                    }
                }
            }
        }
        self.drain(DRAIN_TIMEOUT).await;
        Ok(())
    }

    fn check_fatal(&self) -> Result<()> {
        let n = self.store_failures.worst();
        if n > self.failure_limit {
            return Err(Error::PersistenceUnavailable(format!("{n} consecutive store failures")));
        }
        Ok(())
    }

    /// Book-keep a store result. Persistence errors are tolerated (the job is
    /// left for the next tick) until the limit is exceeded. Only a success on
    /// the same side clears the count.
    fn persisted<T>(&self, job_id: &str, op: StoreOp, res: Result<T>) -> Result<Option<T>> {
        let counter = self.store_failures.counter(op);
        match res {
            Ok(v) => {
                counter.store(0, Ordering::Relaxed);
                Ok(Some(v))
            }
            Err(e) if e.is_persistence() => {
                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                error!(job_id, ?op, error = %e, consecutive = n, "store unavailable");
                if n > self.failure_limit {
                    return Err(e);
                }
                Ok(None)
            }
            Err(e) => {
                warn!(job_id, error = %e, "store rejected operation");
                Ok(None)
            }
        }
    }
}
