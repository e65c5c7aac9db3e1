use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::debug;

use warden_core::admin::{self, ResetOptions};
use warden_core::cfg::{self, Config};
use warden_core::clock::{Clock, SystemClock};
use warden_core::logx;
use warden_core::store::{open_store, StateStore};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Inspect and repair warden schedule state")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Config file (defaults to the per-user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Evaluate as of this RFC 3339 instant instead of now
    #[arg(long, global = true)]
    at: Option<DateTime<Utc>>,
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Every job in the store with its cursor and classification
    Status,
    /// Active jobs that missed their boundary
    Overdue,
    /// Move cursors to the next boundary after now
    Reset {
        /// Job to reset (repeatable); all jobs when omitted
        #[arg(long = "job")]
        jobs: Vec<String>,
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
        /// Only touch jobs whose cursor is in the past
        #[arg(long)]
        future_only: bool,
    },
    /// Recent runs of one job, newest first
    History {
        job: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose { 0 => "warn", 1 => "info", 2 => "debug", _ => "trace" };
    logx::init_stderr(level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wardenctl: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cfg = match &cli.config {
        Some(p) => cfg::load_or_init_at(p)?,
        None => cfg::load_or_init(&cfg::APP)?.1,
    };
    let store = open_store(cfg.store, &cfg.db_path).with_context(|| format!("open store {}", cfg.db_path.display()))?;
    let now = cli.at.unwrap_or_else(|| SystemClock.now());
    debug!(db_path = %cfg.db_path.display(), %now, "opened store");

    match cli.cmd {
        Command::Status => status(&cfg, store, now, cli.json),
        Command::Overdue => overdue(&cfg, store, now, cli.json),
        Command::Reset { jobs, dry_run, future_only } => {
            reset(&cfg, store, now, &jobs, ResetOptions { dry_run, future_only }, cli.json)
        }
        Command::History { job, limit } => history(store, &job, limit, cli.json),
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%SZ").to_string()
}

fn print_json<T: serde::Serialize + ?Sized>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn status(cfg: &Config, store: Arc<dyn StateStore>, now: DateTime<Utc>, json: bool) -> Result<()> {
    let summary = admin::status_summary(store.as_ref(), &cfg.detector()?, now)?;
    if json {
        return print_json(&summary);
    }
    println!(
        "{} job(s), {} active, {} overdue at {}",
        summary.total,
        summary.active,
        summary.overdue,
        ts(summary.now)
    );
    for j in &summary.jobs {
        let last = match (j.last_run_at, j.last_run_status) {
            (Some(at), Some(st)) => format!("{st} at {}", ts(at)),
            _ => "never".to_string(),
        };
        let flag = if j.active { "" } else { " (removed)" };
        println!(
            "{:<24} {:<8} next {}  last {}  [{}]{flag}",
            j.job_id,
            j.state,
            ts(j.next_due_at),
            last,
            j.schedule
        );
    }
    Ok(())
}

fn overdue(cfg: &Config, store: Arc<dyn StateStore>, now: DateTime<Utc>, json: bool) -> Result<()> {
    let list = admin::list_overdue(store.as_ref(), &cfg.detector()?, now)?;
    if json {
        return print_json(&list);
    }
    if list.is_empty() {
        println!("no overdue jobs");
    }
    for j in &list {
        println!(
            "{:<24} cursor {}  missed {}  catch-up boundary {}",
            j.job_id,
            ts(j.next_due_at),
            j.missed_count,
            ts(j.boundary)
        );
    }
    Ok(())
}

fn reset(
    cfg: &Config,
    store: Arc<dyn StateStore>,
    now: DateTime<Utc>,
    jobs: &[String],
    opts: ResetOptions,
    json: bool,
) -> Result<()> {
    let plans = admin::reset_schedule(store.as_ref(), &cfg.engine()?, jobs, now, opts)?;
    if json {
        return print_json(&plans);
    }
    if plans.is_empty() {
        println!("nothing to reset");
    }
    for p in &plans {
        let verb = if p.applied {
            "reset"
        } else if opts.dry_run && p.changes() {
            "would reset"
        } else {
            "unchanged"
        };
        println!("{:<24} {verb} {} -> {}", p.job_id, ts(p.previous), ts(p.next));
    }
    Ok(())
}

fn history(store: Arc<dyn StateStore>, job: &str, limit: usize, json: bool) -> Result<()> {
    let records = admin::job_history(store.as_ref(), job, limit)?;
    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("{job}: no runs recorded");
    }
    for r in &records {
        let err = r.error_summary.as_deref().map(|e| format!("  {e}")).unwrap_or_default();
        println!(
            "{}  {:<8} started {}  took {}s  attempts {}{err}",
            ts(r.scheduled_for),
            r.status,
            ts(r.started_at),
            (r.finished_at - r.started_at).num_seconds(),
            r.attempts
        );
    }
    Ok(())
}
