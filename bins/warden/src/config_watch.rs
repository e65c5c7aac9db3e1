use std::path::PathBuf;

use tokio::sync::watch;

use crate::module::{Module, ModuleCtx};
use warden_core::cfg::{self, Config};

/// Republishes `config.toml` whenever it changes on disk.
pub struct ConfigWatch {
    path: PathBuf,
    tx: watch::Sender<Config>,
}

impl ConfigWatch {
    pub fn new(path: PathBuf, tx: watch::Sender<Config>) -> Self { Self { path, tx } }
}

impl Module for ConfigWatch {
    fn name(&self) -> &'static str { "config" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            cfg::watch_config(self.path, cfg::CONFIG_POLL, self.tx, ctx.shutdown.clone()).await;
            Ok(())
        })
    }
}
