//! Job discovery.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::job::{Action, ExecPolicy, JobSpec, SchedulePattern};

/// Produces the complete set of jobs on every call (a snapshot, not a delta).
pub trait JobSource: Send + Sync + 'static {
    /// Current snapshot.
    fn produce_job_specs(&self) -> Result<Vec<JobSpec>>;
}

/// On-disk shape of one job file; the id is the file stem.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobFile {
    schedule: SchedulePattern,
    #[serde(default = "yes")]
    enabled: bool,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
    #[serde(default)]
    retry_count: u32,
    #[serde(default = "default_retry_delay")]
    retry_delay_secs: u64,
    #[serde(default)]
    action: Action,
}

fn yes() -> bool {
    true
}
fn default_timeout() -> u64 {
    ExecPolicy::default().timeout_secs
}
fn default_retry_delay() -> u64 {
    ExecPolicy::default().retry_delay_secs
}

impl JobFile {
    fn into_spec(self, id: String) -> JobSpec {
        JobSpec {
            id,
            schedule: self.schedule,
            enabled: self.enabled,
            policy: ExecPolicy {
                timeout_secs: self.timeout_secs,
                retry_count: self.retry_count,
                retry_delay_secs: self.retry_delay_secs,
            },
            action: self.action,
        }
    }
}

/// Directory of `*.toml` job files.
#[derive(Debug, Clone)]
pub struct DirSource {
    dir: PathBuf,
}

impl DirSource {
    /// Source reading `dir`. A missing directory yields an empty snapshot.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being scanned.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load(path: &Path) -> std::result::Result<JobSpec, String> {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "file name is not a valid job id".to_string())?
            .to_string();
        let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let file: JobFile = toml::from_str(&text).map_err(|e| e.to_string())?;
        Ok(file.into_spec(id))
    }
}

impl JobSource for DirSource {
    fn produce_job_specs(&self) -> Result<Vec<JobSpec>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(dir = %self.dir.display(), "jobs directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(Error::Source(format!("read {}: {e}", self.dir.display()))),
        };

        let mut specs = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::Source(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") || !path.is_file() {
                continue;
            }
            match Self::load(&path) {
                Ok(spec) => specs.push(spec),
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(dir = %self.dir.display(), jobs = specs.len(), "scanned jobs directory");
        Ok(specs)
    }
}

/// Fixed, replaceable snapshot. Handy for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticSource {
    specs: Mutex<Vec<JobSpec>>,
}

impl StaticSource {
    /// Source returning `specs` until replaced.
    pub fn new(specs: Vec<JobSpec>) -> Self {
        Self { specs: Mutex::new(specs) }
    }

    /// Replace the snapshot.
    pub fn set(&self, specs: Vec<JobSpec>) {
        *self.specs.lock().unwrap_or_else(|p| p.into_inner()) = specs;
    }
}

impl JobSource for StaticSource {
    fn produce_job_specs(&self) -> Result<Vec<JobSpec>> {
        Ok(self.specs.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DayOfWeek, WallTime};

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn reads_toml_files_sorted_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "report.toml",
            r#"
timeout_secs = 30
retry_count = 2

[schedule]
kind = "weekly"
day = "mon"
at = "08:30"

[action]
type = "exec"
cmd = "echo"
args = ["hi"]
"#,
        );
        write(dir.path(), "backup.toml", "schedule = { kind = \"interval\", unit = \"minutes\", every = 10 }\n");
        write(dir.path(), "notes.txt", "ignored");

        let specs = DirSource::new(dir.path()).produce_job_specs().unwrap();
        let ids: Vec<_> = specs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["backup", "report"]);

        let backup = &specs[0];
        assert!(backup.enabled);
        assert_eq!(backup.policy, ExecPolicy::default());
        assert_eq!(backup.action, Action::Noop);

        let report = &specs[1];
        assert_eq!(report.schedule, SchedulePattern::Weekly { day: DayOfWeek::Mon, at: WallTime::new(8, 30).unwrap() });
        assert_eq!(report.policy.timeout_secs, 30);
        assert_eq!(report.policy.retry_count, 2);
        assert_eq!(report.policy.retry_delay_secs, 60);
        assert_eq!(report.action, Action::Exec { cmd: "echo".into(), args: vec!["hi".into()] });
    }

    #[test]
    fn broken_files_are_left_out() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ok.toml", "schedule = { kind = \"time_of_day\", at = \"02:00\" }\n");
        write(dir.path(), "broken.toml", "schedule = { kind = \"hourly\" }\n");
        write(dir.path(), "typo.toml", "schedule = { kind = \"time_of_day\", at = \"02:00\" }\ntimout_secs = 1\n");
        let specs = DirSource::new(dir.path()).produce_job_specs().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, "ok");
    }

    #[test]
    fn missing_directory_is_an_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let specs = DirSource::new(dir.path().join("nope")).produce_job_specs().unwrap();
        assert!(specs.is_empty());
    }
}
