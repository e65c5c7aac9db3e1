use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::coordinator::{Cadence, CoordinatorOptions};
use crate::memory::MemoryLimits;
use crate::overdue::OverdueDetector;
use crate::schedule::ScheduleEngine;
use crate::store::StoreKind;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"dev"`.
    pub qualifier: &'static str,
    /// Organization or vendor name.
    pub organization: &'static str,
    /// Application name.
    pub application: &'static str,
}

/// The id both binaries resolve their config directory with.
pub const APP: AppId = AppId { qualifier: "dev", organization: "tickwarden", application: "tickwarden" };

/// How often [`watch_config`] looks at the file.
pub const CONFIG_POLL: Duration = Duration::from_secs(5);

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// SQLite file, or directory for the `fs` store. Relative to the config file.
    pub db_path: PathBuf,
    /// Store backend.
    pub store: StoreKind,
    /// Directory of `*.toml` job files. Relative to the config file.
    pub jobs_dir: PathBuf,
    /// IANA timezone boundaries are computed in.
    pub timezone: String,
    /// Execution tick (seconds).
    pub tick_interval_secs: u64,
    /// Registry reload cadence (seconds).
    pub reload_interval_secs: u64,
    /// Resident memory ceiling in MiB; 0 disables the monitor.
    pub memory_ceiling_mb: u64,
    /// Memory sampling cadence (seconds).
    pub memory_check_secs: u64,
    /// Concurrent dispatches; 0 means one per CPU.
    pub max_concurrency: usize,
    /// How late a boundary may be hit and still count as on time (seconds).
    pub due_grace_secs: u64,
    /// Boundaries older than this are skipped, not run (seconds).
    pub catchup_window_secs: u64,
    /// Consecutive store failures tolerated before the daemon exits.
    pub persistence_failure_limit: u32,
    /// Execution history kept for this many days.
    pub history_retention_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db_path: PathBuf::from("tickwarden.db"),
            store: StoreKind::Sqlite,
            jobs_dir: PathBuf::from("jobs"),
            timezone: "UTC".to_string(),
            tick_interval_secs: 10,
            reload_interval_secs: 60,
            memory_ceiling_mb: 500,
            memory_check_secs: 60,
            max_concurrency: 0,
            due_grace_secs: 60,
            catchup_window_secs: 24 * 60 * 60,
            persistence_failure_limit: 5,
            history_retention_days: 30,
        }
    }
}

impl Config {
    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be positive");
        }
        if self.reload_interval_secs == 0 {
            bail!("reload_interval_secs must be positive");
        }
        if self.memory_check_secs == 0 {
            bail!("memory_check_secs must be positive");
        }
        self.engine()?;
        Ok(())
    }

    /// Make relative paths relative to `base` (the config file's directory).
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        if self.db_path.is_relative() {
            self.db_path = base.join(&self.db_path);
        }
        if self.jobs_dir.is_relative() {
            self.jobs_dir = base.join(&self.jobs_dir);
        }
        self
    }

    /// Engine for the configured timezone.
    pub fn engine(&self) -> Result<ScheduleEngine> {
        let tz = ScheduleEngine::parse_timezone(&self.timezone).context("timezone")?;
        Ok(ScheduleEngine::new(tz))
    }

    /// Detector with the configured grace and catch-up window.
    pub fn detector(&self) -> Result<OverdueDetector> {
        Ok(OverdueDetector::new(
            self.engine()?,
            secs(self.due_grace_secs),
            secs(self.catchup_window_secs),
        ))
    }

    /// Static coordinator limits.
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        let defaults = CoordinatorOptions::default();
        CoordinatorOptions {
            max_concurrency: if self.max_concurrency == 0 { defaults.max_concurrency } else { self.max_concurrency },
            persistence_failure_limit: self.persistence_failure_limit,
            history_retention: chrono::Duration::days(i64::from(self.history_retention_days)),
        }
    }

    /// Hot-reloadable loop timing.
    pub fn cadence(&self) -> Cadence {
        Cadence {
            tick: Duration::from_secs(self.tick_interval_secs),
            reload: Duration::from_secs(self.reload_interval_secs),
        }
    }

    /// Hot-reloadable memory limits.
    pub fn memory_limits(&self) -> MemoryLimits {
        MemoryLimits { ceiling_mb: self.memory_ceiling_mb, check_every: Duration::from_secs(self.memory_check_secs) }
    }
}

fn secs(s: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(i64::try_from(s).unwrap_or(i64::MAX)).unwrap_or(chrono::Duration::MAX)
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
    let dir = pd.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// `config.toml` in the app config dir.
pub fn default_config_path(app: &AppId) -> Result<PathBuf> {
    Ok(config_dir(app)?.join("config.toml"))
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<(PathBuf, Config)> {
    let path = default_config_path(app)?;
    let cfg = load_or_init_at(&path)?;
    Ok((path, cfg))
}

/// Load `path`, writing a default config there first if it does not exist.
pub fn load_or_init_at(path: &Path) -> Result<Config> {
    if !path.exists() {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        save_config(path, &Config::default())?;
        info!(path = %path.display(), "wrote default config");
    }
    load_from(path)
}

/// Parse, validate and resolve an existing config file.
pub fn load_from(path: &Path) -> Result<Config> {
    let txt = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config = toml::from_str(&txt).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate().with_context(|| format!("validate {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(cfg.resolve_paths(base))
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Poll `path` every `poll` and publish each valid new version on `tx`.
///
/// Invalid edits are logged and ignored; the previous config stays live.
/// Returns when `shutdown` flips or every receiver is gone.
pub async fn watch_config(
    path: PathBuf,
    poll: Duration,
    tx: watch::Sender<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut seen = modified(&path);
    let mut tick = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = modified(&path);
                if now == seen {
                    continue;
                }
                seen = now;
                match load_from(&path) {
                    Ok(cfg) => {
                        let changed = tx.send_if_modified(|cur| {
                            if *cur == cfg {
                                return false;
                            }
                            *cur = cfg;
                            true
                        });
                        if changed {
                            info!(path = %path.display(), "configuration reloaded");
                        }
                    }
                    Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "ignoring invalid configuration"),
                }
                if tx.is_closed() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults_and_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.toml");
        let cfg = load_or_init_at(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.db_path, dir.path().join("conf").join("tickwarden.db"));
        assert_eq!(cfg.jobs_dir, dir.path().join("conf").join("jobs"));
        assert_eq!(cfg.tick_interval_secs, 10);
        assert_eq!(cfg.cadence(), Cadence::default());
    }

    #[test]
    fn partial_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "timezone = \"Europe/Paris\"\nstore = \"fs\"\ndb_path = \"/var/lib/warden\"\n").unwrap();
        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.store, StoreKind::Fs);
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/warden"));
        assert_eq!(cfg.memory_ceiling_mb, 500);
        assert_eq!(cfg.engine().unwrap().timezone(), chrono_tz::Europe::Paris);
    }

    #[test]
    fn bad_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "timezone = \"Mars/Olympus\"\n").unwrap();
        assert!(load_from(&path).is_err());
        fs::write(&path, "tick_interval_secs = 0\n").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn zero_concurrency_means_cpu_count() {
        let cfg = Config::default();
        assert_eq!(cfg.coordinator_options().max_concurrency, num_cpus::get().max(1));
        let cfg = Config { max_concurrency: 3, ..Config::default() };
        assert_eq!(cfg.coordinator_options().max_concurrency, 3);
    }

    #[tokio::test]
    async fn watcher_publishes_valid_edits_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let initial = load_or_init_at(&path).unwrap();
        let (tx, mut rx) = watch::channel(initial);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(watch_config(path.clone(), Duration::from_millis(20), tx, stop_rx));

        // make sure the mtime differs on coarse filesystems
        tokio::time::sleep(Duration::from_millis(1100)).await;
        fs::write(&path, "tick_interval_secs = 0\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.borrow().tick_interval_secs, 10);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        fs::write(&path, "tick_interval_secs = 3\n").unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed()).await.unwrap().unwrap();
        assert_eq!(rx.borrow().tick_interval_secs, 3);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
