mod config_watch;
mod memory_watch;
mod module;
mod scheduler;
#[cfg(feature = "web-api")]
mod status;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config_watch::ConfigWatch;
use crate::memory_watch::MemoryWatch;
use crate::module::{Module, ModuleCtx};
use crate::scheduler::Scheduler;
use warden_core::cfg::{self, Config};
use warden_core::clock::SystemClock;
use warden_core::coordinator::{ExecutionCoordinator, DRAIN_TIMEOUT};
use warden_core::executor::ActionExecutor;
use warden_core::logx;
use warden_core::source::{DirSource, JobSource};
use warden_core::store::open_store;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Clock-aligned job scheduler daemon")]
struct Cli {
    /// Config file (created with defaults if missing)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log level override (info,debug,trace)
    #[arg(long)]
    log: Option<String>,
    /// Validate config and job files, then exit
    #[arg(long)]
    check: bool,
    /// Serve read-only status endpoints on this address (web-api builds)
    #[arg(long)]
    listen: Option<SocketAddr>,
}

/// Why the daemon stopped.
enum Stop {
    Signal,
    Memory(warden_core::memory::ShutdownRequest),
    Scheduler(Result<()>),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("warden: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let (path, cfg) = match &cli.config {
        Some(p) => (p.clone(), cfg::load_or_init_at(p)?),
        None => cfg::load_or_init(&cfg::APP)?,
    };
    logx::init(cli.log.as_deref().unwrap_or(&cfg.log_level));

    if cli.check {
        return check(&cfg);
    }

    #[cfg(feature = "rt-single")]
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    #[cfg(not(feature = "rt-single"))]
    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    rt.block_on(daemon(path, cfg, cli.listen))
}

fn check(cfg: &Config) -> Result<ExitCode> {
    let engine = cfg.engine()?;
    let specs = DirSource::new(&cfg.jobs_dir).produce_job_specs()?;
    let mut invalid = 0;
    for spec in &specs {
        match engine.validate(&spec.schedule) {
            Ok(()) => println!("ok       {:<24} {}", spec.id, spec.schedule),
            Err(e) => {
                invalid += 1;
                println!("invalid  {:<24} {e}", spec.id);
            }
        }
    }
    println!("{} job(s), {invalid} invalid, store {:?} at {}", specs.len(), cfg.store, cfg.db_path.display());
    Ok(if invalid == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn daemon(path: PathBuf, cfg: Config, listen: Option<SocketAddr>) -> Result<ExitCode> {
    info!("{} boot", env!("CARGO_PKG_NAME"));
    info!(config = %path.display(), db_path = %cfg.db_path.display(), jobs_dir = %cfg.jobs_dir.display(), tz = %cfg.timezone, "configuration");

    let store = open_store(cfg.store, &cfg.db_path).with_context(|| format!("open store {}", cfg.db_path.display()))?;
    let coordinator = ExecutionCoordinator::new(
        store,
        Arc::new(DirSource::new(&cfg.jobs_dir)),
        Arc::new(ActionExecutor),
        Arc::new(SystemClock),
        cfg.detector()?,
        cfg.coordinator_options(),
    );
    let status = status_module(listen, &coordinator)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (config_tx, config_rx) = watch::channel(cfg);
    let (memory_tx, mut memory_rx) = mpsc::channel(1);
    let ctx = ModuleCtx { config: config_rx, shutdown: shutdown_rx };

    let mut scheduler = Box::new(Scheduler::new(coordinator.clone())).spawn(ctx.clone());

    let mut modules: Vec<Box<dyn Module>> = vec![
        Box::new(ConfigWatch::new(path, config_tx)),
        Box::new(MemoryWatch::new(memory_tx)),
    ];
    modules.extend(status);

    let mut handles = Vec::new();
    for m in modules {
        info!("starting module {}", m.name());
        handles.push((m.name(), m.spawn(ctx.clone())));
    }

    let stop = tokio::select! {
        _ = shutdown_signal() => Stop::Signal,
        Some(req) = memory_rx.recv() => Stop::Memory(req),
        res = &mut scheduler => Stop::Scheduler(res.unwrap_or_else(|e| Err(e.into()))),
    };

    let _ = shutdown_tx.send(true);
    let mut code = ExitCode::SUCCESS;
    match stop {
        Stop::Signal => {
            info!("shutdown requested");
            join_scheduler(scheduler).await;
        }
        Stop::Memory(req) => {
            warn!(resident_bytes = req.resident_bytes, ceiling_bytes = req.ceiling_bytes, "memory ceiling exceeded, exiting for restart");
            join_scheduler(scheduler).await;
            code = ExitCode::from(req.exit_code() as u8);
        }
        Stop::Scheduler(Ok(())) => info!("scheduler finished"),
        Stop::Scheduler(Err(e)) => {
            error!("scheduler failed: {e:#}");
            code = ExitCode::FAILURE;
        }
    }

    for (name, h) in handles {
        match tokio::time::timeout(Duration::from_secs(5), h).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("module {name} ended with error: {e:#}"),
            Ok(Err(e)) => warn!("module {name} panicked: {e}"),
            Err(_) => warn!("module {name} did not stop in time"),
        }
    }
    info!("bye");
    Ok(code)
}

#[cfg(feature = "web-api")]
fn status_module(listen: Option<SocketAddr>, coordinator: &ExecutionCoordinator) -> Result<Option<Box<dyn Module>>> {
    Ok(listen.map(|addr| Box::new(status::StatusServer::new(addr, coordinator.clone())) as Box<dyn Module>))
}

#[cfg(not(feature = "web-api"))]
fn status_module(listen: Option<SocketAddr>, _coordinator: &ExecutionCoordinator) -> Result<Option<Box<dyn Module>>> {
    match listen {
        Some(addr) => anyhow::bail!("--listen {addr}: this build has no web-api feature"),
        None => Ok(None),
    }
}

async fn join_scheduler(h: tokio::task::JoinHandle<Result<()>>) {
    match tokio::time::timeout(DRAIN_TIMEOUT + Duration::from_secs(5), h).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("scheduler ended with error: {e:#}"),
        Ok(Err(e)) => warn!("scheduler panicked: {e}"),
        Err(_) => warn!("scheduler did not stop in time"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
