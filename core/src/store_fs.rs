//! Directory-backed [`StateStore`]: one bincode file per key.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::job::{ExecutionRecord, ScheduleState};
use crate::store::{check_advance, duplicate, is_success, StateStore};

/// Minimal key/value interface over byte keys and values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &[u8], val: &[u8]) -> io::Result<()>;
    /// Delete `key`; returns `true` if a value existed.
    fn delete(&self, key: &[u8]) -> io::Result<bool>;
}

/// Serde helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key` using `bincode`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize::<T>(&bytes)?)),
            None => Ok(None),
        }
    }
    /// Serialize `val` with `bincode` and store at `key`.
    fn put_t<T: Serialize>(&self, key: &[u8], val: &T) -> Result<()> {
        let buf = bincode::serialize(val)?;
        self.put(key, &buf)?;
        Ok(())
    }
}
impl<T: Kv> KvSerde for T {}

/// Filesystem-backed key/value store.
#[derive(Clone)]
pub struct FsKv {
    root: PathBuf,
}

impl FsKv {
    /// Open a KV rooted at `dir` (created if missing).
    pub fn open<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let root = dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        // arbitrary bytes -> hex file name
        let mut name = String::with_capacity(key.len() * 2);
        for &b in key {
            name.push(hex_digit(b >> 4));
            name.push(hex_digit(b & 0xF));
        }
        self.root.join(name)
    }
}

fn hex_digit(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '?',
    }
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let mut f = match fs::File::open(self.path_for(key)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    fn put(&self, key: &[u8], val: &[u8]) -> io::Result<()> {
        let path = self.path_for(key);
        // write temp, fsync, rename over
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(val)?;
        f.sync_all()?;
        fs::rename(tmp, path)
    }

    fn delete(&self, key: &[u8]) -> io::Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    let mut s = String::with_capacity(ns.len() + 1 + key.len());
    s.push_str(ns);
    s.push(':');
    s.push_str(key);
    s.into_bytes()
}

const STATE: &str = "state";
const EXEC: &str = "exec";
const INDEX: &str = "index";

/// [`StateStore`] over an [`FsKv`].
///
/// Writers are serialized in-process; the layout is not meant to be shared
/// by two live daemons.
pub struct FsStore<K: Kv = FsKv> {
    kv: K,
    lock: Mutex<()>,
}

impl FsStore<FsKv> {
    /// Open (or create) the store directory.
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self::with_kv(FsKv::open(dir)?))
    }
}

impl<K: Kv> FsStore<K> {
    /// Store over an arbitrary KV.
    pub fn with_kv(kv: K) -> Self {
        Self { kv, lock: Mutex::new(()) }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn index(&self, which: &str) -> Result<BTreeSet<String>> {
        Ok(self.kv.get_t(&ns(INDEX, which))?.unwrap_or_default())
    }

    fn add_to_index(&self, which: &str, job_id: &str) -> Result<()> {
        let mut ids = self.index(which)?;
        if ids.insert(job_id.to_string()) {
            self.kv.put_t(&ns(INDEX, which), &ids)?;
        }
        Ok(())
    }

    fn log(&self, job_id: &str) -> Result<Vec<ExecutionRecord>> {
        Ok(self.kv.get_t(&ns(EXEC, job_id))?.unwrap_or_default())
    }

    fn put_state(&self, state: &ScheduleState) -> Result<()> {
        self.kv.put_t(&ns(STATE, &state.job_id), state)?;
        self.add_to_index(STATE, &state.job_id)
    }
}

impl<K: Kv> StateStore for FsStore<K> {
    fn read_state(&self, job_id: &str) -> Result<Option<ScheduleState>> {
        let _g = self.guard();
        self.kv.get_t(&ns(STATE, job_id))
    }

    fn write_state(&self, state: &ScheduleState) -> Result<()> {
        let _g = self.guard();
        let current: Option<ScheduleState> = self.kv.get_t(&ns(STATE, &state.job_id))?;
        check_advance(current.as_ref(), state)?;
        self.put_state(state)
    }

    fn reset_state(&self, state: &ScheduleState) -> Result<()> {
        let _g = self.guard();
        self.put_state(state)
    }

    fn list_states(&self) -> Result<Vec<ScheduleState>> {
        let _g = self.guard();
        let mut out = Vec::new();
        for id in self.index(STATE)? {
            if let Some(s) = self.kv.get_t::<ScheduleState>(&ns(STATE, &id))? {
                out.push(s);
            }
        }
        out.sort_by(|a, b| a.next_due_at.cmp(&b.next_due_at).then_with(|| a.job_id.cmp(&b.job_id)));
        Ok(out)
    }

    fn append_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let _g = self.guard();
        let mut log = self.log(&record.job_id)?;
        if is_success(record) && log.iter().any(|r| is_success(r) && r.scheduled_for == record.scheduled_for) {
            return Err(duplicate(record));
        }
        log.push(record.clone());
        self.kv.put_t(&ns(EXEC, &record.job_id), &log)?;
        self.add_to_index(EXEC, &record.job_id)
    }

    fn has_success(&self, job_id: &str, scheduled_for: DateTime<Utc>) -> Result<bool> {
        let _g = self.guard();
        Ok(self.log(job_id)?.iter().any(|r| is_success(r) && r.scheduled_for == scheduled_for))
    }

    fn list_executions(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let _g = self.guard();
        let mut log = self.log(job_id)?;
        log.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        log.truncate(limit);
        Ok(log)
    }

    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize> {
        let _g = self.guard();
        let mut pruned = 0;
        for id in self.index(EXEC)? {
            let mut log = self.log(&id)?;
            let len = log.len();
            log.retain(|r| r.started_at >= before);
            if log.len() == len {
                continue;
            }
            pruned += len - log.len();
            if log.is_empty() {
                self.kv.delete(&ns(EXEC, &id))?;
            } else {
                self.kv.put_t(&ns(EXEC, &id), &log)?;
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FsKv::open(dir.path()).unwrap();
        let key = ns("state", "nightly/backup");
        assert_eq!(kv.get(&key).unwrap(), None);
        kv.put(&key, b"abc").unwrap();
        assert_eq!(kv.get(&key).unwrap().as_deref(), Some(&b"abc"[..]));
        assert!(kv.delete(&key).unwrap());
        assert!(!kv.delete(&key).unwrap());
    }

    #[test]
    fn corrupt_value_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FsKv::open(dir.path()).unwrap();
        kv.put(&ns(STATE, "x"), &[0xff]).unwrap();
        let store = FsStore::with_kv(kv);
        assert!(store.read_state("x").unwrap_err().is_persistence());
    }
}
