use tracing::info;

use crate::module::{Module, ModuleCtx};
use warden_core::cfg::Config;
use warden_core::coordinator::ExecutionCoordinator;

/// Hosts the coordinator's run loop; the tick cadence follows the live config.
pub struct Scheduler {
    coordinator: ExecutionCoordinator,
}

impl Scheduler {
    pub fn new(coordinator: ExecutionCoordinator) -> Self {
        Self { coordinator }
    }
}

impl Module for Scheduler {
    fn name(&self) -> &'static str { "scheduler" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let cadence = ctx.derive(Config::cadence);
            self.coordinator.run(cadence, ctx.shutdown.clone()).await?;
            info!("scheduler stopped");
            Ok(())
        })
    }
}
