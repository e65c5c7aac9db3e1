//! Resident-memory watchdog.
//!
//! The monitor never frees anything itself. On breach it asks the host to
//! shut down, and a supervisor is expected to restart the process.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Exit status for a memory-ceiling restart (`EX_TEMPFAIL`).
pub const EXIT_MEMORY_CEILING: i32 = 75;

const MIB: u64 = 1024 * 1024;

/// Reports the resident set size of the current process.
pub trait MemorySampler: Send + 'static {
    /// Bytes resident right now, `None` if unavailable.
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// [`MemorySampler`] backed by `sysinfo`.
pub struct ProcessSampler {
    sys: System,
    pid: Option<Pid>,
}

impl ProcessSampler {
    /// Sampler for the calling process.
    pub fn current() -> Self {
        Self { sys: System::new(), pid: sysinfo::get_current_pid().ok() }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::current()
    }
}

impl MemorySampler for ProcessSampler {
    fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.sys.process(pid).map(|p| p.memory())
    }
}

/// Hot-reloadable limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Ceiling in MiB; 0 disables the monitor.
    pub ceiling_mb: u64,
    /// Sampling period.
    pub check_every: Duration,
}

impl MemoryLimits {
    fn ceiling_bytes(&self) -> Option<u64> {
        (self.ceiling_mb > 0).then(|| self.ceiling_mb.saturating_mul(MIB))
    }
}

/// Sent to the host when the ceiling is exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    /// Sampled resident bytes.
    pub resident_bytes: u64,
    /// Configured ceiling in bytes.
    pub ceiling_bytes: u64,
}

impl ShutdownRequest {
    /// Suggested process exit status.
    pub fn exit_code(&self) -> i32 {
        EXIT_MEMORY_CEILING
    }
}

/// Samples memory and raises at most one [`ShutdownRequest`].
pub struct MemoryMonitor<S: MemorySampler = ProcessSampler> {
    sampler: S,
}

impl<S: MemorySampler> MemoryMonitor<S> {
    /// Monitor over `sampler`.
    pub fn new(sampler: S) -> Self {
        Self { sampler }
    }

    /// One sample against `limits`.
    pub fn check(&mut self, limits: &MemoryLimits) -> Option<ShutdownRequest> {
        let ceiling_bytes = limits.ceiling_bytes()?;
        let resident_bytes = self.sampler.resident_bytes()?;
        debug!(resident_mb = resident_bytes / MIB, ceiling_mb = limits.ceiling_mb, "memory sample");
        (resident_bytes > ceiling_bytes).then_some(ShutdownRequest { resident_bytes, ceiling_bytes })
    }

    /// Sample on the configured cadence until shutdown or a breach. A breach
    /// is delivered on `requests` and ends the loop.
    pub async fn run(
        mut self,
        mut limits: watch::Receiver<MemoryLimits>,
        mut shutdown: watch::Receiver<bool>,
        requests: mpsc::Sender<ShutdownRequest>,
    ) {
        let mut current = *limits.borrow();
        let mut tick = interval(current.check_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut limits_open = true;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Some(req) = self.check(&current) {
                        warn!(
                            resident_mb = req.resident_bytes / MIB,
                            ceiling_mb = current.ceiling_mb,
                            "memory ceiling exceeded, requesting restart"
                        );
                        if requests.send(req).await.is_err() {
                            warn!("nobody is listening for shutdown requests");
                        }
                        return;
                    }
                }
                changed = limits.changed(), if limits_open => {
                    if changed.is_err() {
                        limits_open = false;
                        continue;
                    }
                    let next = *limits.borrow_and_update();
                    if next.check_every != current.check_every {
                        tick = interval(next.check_every);
                        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    if next != current {
                        info!(ceiling_mb = next.ceiling_mb, check_every = ?next.check_every, "memory limits changed");
                    }
                    current = next;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
