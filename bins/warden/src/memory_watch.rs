use tokio::sync::mpsc;

use crate::module::{Module, ModuleCtx};
use warden_core::cfg::Config;
use warden_core::memory::{MemoryMonitor, ProcessSampler, ShutdownRequest};

/// Samples this process's RSS and forwards a restart request to `main`.
pub struct MemoryWatch {
    requests: mpsc::Sender<ShutdownRequest>,
}

impl MemoryWatch {
    pub fn new(requests: mpsc::Sender<ShutdownRequest>) -> Self { Self { requests } }
}

impl Module for MemoryWatch {
    fn name(&self) -> &'static str { "memory" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let limits = ctx.derive(Config::memory_limits);
            MemoryMonitor::new(ProcessSampler::current())
                .run(limits, ctx.shutdown.clone(), self.requests)
                .await;
            Ok(())
        })
    }
}
