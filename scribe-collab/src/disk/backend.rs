//! Storage backends behind [`Disk`](super::Disk).
//!
//! A backend stores opaque, already-encoded records keyed by document name.
//! It must report "not found" as `Ok(None)`, never as an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::DiskError;

/// Byte-level key/value store for persisted documents.
pub trait DiskBackend: Send + Sync + 'static {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, DiskError>;

    /// Replace the record for `key`. `version` is informational metadata.
    fn write(&self, key: &str, bytes: &[u8], version: u64) -> Result<(), DiskError>;

    /// Every key that currently has a record.
    fn keys(&self) -> Result<Vec<String>, DiskError>;
}

/// In-process backend. Records writes so tests can observe coalescing, and
/// can be told to fail writes.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, Vec<u8>>>,
    write_counts: Mutex<HashMap<String, u64>>,
    total_writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes across all keys.
    pub fn total_writes(&self) -> u64 {
        self.total_writes.load(Ordering::SeqCst)
    }

    /// Successful writes for one key.
    pub fn write_count(&self, key: &str) -> u64 {
        self.write_counts
            .lock()
            .map(|counts| counts.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl DiskBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, DiskError> {
        let records = self.records.lock().map_err(|_| DiskError::Poisoned)?;
        Ok(records.get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8], _version: u64) -> Result<(), DiskError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DiskError::Backend(format!("write to '{key}' rejected")));
        }
        self.records
            .lock()
            .map_err(|_| DiskError::Poisoned)?
            .insert(key.to_string(), bytes.to_vec());
        *self
            .write_counts
            .lock()
            .map_err(|_| DiskError::Poisoned)?
            .entry(key.to_string())
            .or_insert(0) += 1;
        self.total_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, DiskError> {
        let records = self.records.lock().map_err(|_| DiskError::Poisoned)?;
        let mut keys: Vec<String> = records.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
