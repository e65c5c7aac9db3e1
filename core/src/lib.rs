#![deny(missing_docs)]
//! warden_core: clock-aligned schedules, durable job state and the execution
//! coordinator shared by the `warden` daemon and the `wardenctl` tool.

/// Configuration helpers (AppId, dirs, load_or_init, hot reload).
pub mod cfg;
/// Tracing/log initialization helpers.
pub mod logx;
/// Error taxonomy of the core.
pub mod error;
/// Injectable time source.
pub mod clock;
/// Job model: specs, patterns, cursors, history records.
pub mod job;
/// Boundary arithmetic.
pub mod schedule;
/// Due/overdue classification.
pub mod overdue;
/// Persistence contract and backend selection.
pub mod store;
/// SQLite backend.
pub mod store_sqlite;
/// File-per-key backend with serde helpers.
pub mod store_fs;
/// In-memory working set of jobs.
pub mod registry;
/// Job discovery.
pub mod source;
/// Job execution.
pub mod executor;
/// Tick loop and dispatch.
pub mod coordinator;
/// Memory watchdog.
pub mod memory;
/// Operator operations (reset, overdue listing, status).
pub mod admin;

pub use error::{Error, Result};
