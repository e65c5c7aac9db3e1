//! Execution collaborator: runs a job's payload.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};
use crate::job::Action;

/// Longest error summary kept from a failing command.
const MAX_SUMMARY: usize = 512;

/// Runs one attempt of a job.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Run `payload` for `job_id`, finishing within `timeout`.
    async fn execute(&self, job_id: &str, payload: &Action, timeout: Duration) -> Result<()>;
}

/// Default executor: interprets [`Action`] payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActionExecutor;

#[async_trait]
impl Executor for ActionExecutor {
    async fn execute(&self, job_id: &str, payload: &Action, limit: Duration) -> Result<()> {
        match payload {
            Action::Noop => Ok(()),

            Action::Exec { cmd, args } => {
                let mut c = Command::new(cmd);
                c.args(args)
                    .env("WARDEN_JOB_ID", job_id)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                debug!(job_id, cmd = %cmd, "spawning command");

                let out = timeout(limit, c.output())
                    .await
                    .map_err(|_| Error::ExecutionTimeout { timeout: limit })?
                    .map_err(|e| Error::ExecutionFailure(format!("spawn {cmd}: {e}")))?;
                if !out.status.success() {
                    return Err(Error::ExecutionFailure(summarize(out.status.code(), &out.stderr)));
                }
                Ok(())
            }
        }
    }
}

fn summarize(code: Option<i32>, stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let status = match code {
        Some(c) => format!("exit status {c}"),
        None => "terminated by signal".to_string(),
    };
    if text.is_empty() {
        return status;
    }
    let mut tail: String = text.chars().take(MAX_SUMMARY).collect();
    if tail.len() < text.len() {
        tail.push('…');
    }
    format!("{status}: {tail}")
}
