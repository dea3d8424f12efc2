//! Debounced persistence for authoritative documents.
//!
//! ```text
//! update(key, getter) ──► debounce entry ──(wait / max-wait)──► getter() ──► bincode ──► LZ4 ──► backend
//!        ▲                     │
//!        └── coalesces ────────┘          flush(key, ..) / flush_all() skip the timer
//! ```
//!
//! - Repeated `update`s within `debounce_wait` collapse into one write.
//! - A write is forced once `debounce_max_wait` has passed since the first
//!   coalesced `update`, even under a continuous stream of updates.
//! - The getter of the last `update` is called at write time, so the write
//!   always carries the newest snapshot.
//! - A failed write keeps its key pending and its getter around; only
//!   [`Disk::flush_all`] retries it.
//!
//! Writes for one key are serialized, and a record older than the one
//! already written for that key is never written over it.

pub mod backend;
pub mod rocks;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use scribe_core::Document;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::CollabError;
use backend::{DiskBackend, MemoryBackend};

/// Persistence failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiskError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Storage lock poisoned")]
    Poisoned,
}

impl From<DiskError> for CollabError {
    fn from(err: DiskError) -> Self {
        CollabError::internal(err.to_string()).from_origin("disk")
    }
}

/// What gets persisted for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DiskRecord<D: Document> {
    pub doc: D,
    pub version: u64,
}

impl<D: Document> DiskRecord<D> {
    pub fn new(doc: D, version: u64) -> Self {
        Self { doc, version }
    }

    /// bincode, then LZ4 with the uncompressed size prepended.
    pub fn encode(&self) -> Result<Vec<u8>, DiskError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DiskError::Encode(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DiskError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| DiskError::Compression(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| DiskError::Decode(e.to_string()))?;
        Ok(record)
    }
}

/// Produces the snapshot to persist. Called lazily, at write time.
pub type SnapshotGetter<D> = Arc<dyn Fn() -> DiskRecord<D> + Send + Sync>;

/// Debounce configuration.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Quiet period after the last update before writing (default: 250ms)
    pub debounce_wait: Duration,
    /// Upper bound between the first coalesced update and its write (default: 1s)
    pub debounce_max_wait: Duration,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            debounce_wait: Duration::from_millis(250),
            debounce_max_wait: Duration::from_secs(1),
        }
    }
}

impl DiskConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce_wait: Duration::from_millis(10),
            debounce_max_wait: Duration::from_millis(40),
        }
    }
}

/// Disk statistics.
#[derive(Debug, Clone, Default)]
pub struct DiskStats {
    pub updates: u64,
    pub writes: u64,
    pub failed_writes: u64,
    /// Writes skipped because a newer record was already stored
    pub stale_skipped: u64,
}

/// Observable set of keys with outstanding writes.
///
/// A key joins on `update`/`flush` and leaves only once its write succeeded.
#[derive(Clone)]
pub struct PendingWrites {
    rx: watch::Receiver<BTreeSet<String>>,
}

impl PendingWrites {
    pub fn len(&self) -> usize {
        self.rx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.borrow().is_empty()
    }

    /// True when nothing is waiting to be written.
    pub fn is_settled(&self) -> bool {
        self.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rx.borrow().contains(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.rx.borrow().iter().cloned().collect()
    }

    /// Resolves once the pending set is empty.
    pub async fn settled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|keys| keys.is_empty()).await;
    }

    /// Receiver notified on every change of the pending set.
    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<String>> {
        self.rx.clone()
    }
}

struct Debounced<D: Document> {
    getter: SnapshotGetter<D>,
    first_call: Instant,
    last_call: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl<D: Document> Debounced<D> {
    fn deadline(&self, config: &DiskConfig) -> Instant {
        (self.last_call + config.debounce_wait).min(self.first_call + config.debounce_max_wait)
    }
}

struct DiskState<D: Document> {
    debounced: HashMap<String, Debounced<D>>,
    failed: HashMap<String, SnapshotGetter<D>>,
    in_flight: HashMap<String, usize>,
    written: HashMap<String, u64>,
    gates: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    next_generation: u64,
}

impl<D: Document> DiskState<D> {
    fn new() -> Self {
        Self {
            debounced: HashMap::new(),
            failed: HashMap::new(),
            in_flight: HashMap::new(),
            written: HashMap::new(),
            gates: HashMap::new(),
            next_generation: 0,
        }
    }

    fn pending_keys(&self) -> BTreeSet<String> {
        self.debounced
            .keys()
            .chain(self.failed.keys())
            .chain(self.in_flight.keys())
            .cloned()
            .collect()
    }

    fn in_flight_total(&self) -> usize {
        self.in_flight.values().sum()
    }

    fn begin_write(&mut self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        *self.in_flight.entry(key.to_string()).or_insert(0) += 1;
        self.gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn end_write(&mut self, key: &str) {
        if let Some(count) = self.in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(key);
            }
        }
    }
}

/// Debounced, coalescing document persistence.
pub struct Disk<D: Document> {
    backend: Arc<dyn DiskBackend>,
    config: DiskConfig,
    state: Mutex<DiskState<D>>,
    pending_tx: watch::Sender<BTreeSet<String>>,
    in_flight_tx: watch::Sender<usize>,
    on_pending_writes: Option<Box<dyn Fn(usize) + Send + Sync>>,
    updates: AtomicU64,
    writes: AtomicU64,
    failed_writes: AtomicU64,
    stale_skipped: AtomicU64,
}

impl<D: Document> Disk<D> {
    pub fn new(backend: Arc<dyn DiskBackend>, config: DiskConfig) -> Self {
        let (pending_tx, _) = watch::channel(BTreeSet::new());
        let (in_flight_tx, _) = watch::channel(0);
        Self {
            backend,
            config,
            state: Mutex::new(DiskState::new()),
            pending_tx,
            in_flight_tx,
            on_pending_writes: None,
            updates: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            stale_skipped: AtomicU64::new(0),
        }
    }

    /// Disk over a fresh [`MemoryBackend`].
    pub fn in_memory(config: DiskConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    /// Call `callback` with the new pending-set size whenever it changes.
    pub fn on_pending_writes(mut self, callback: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_pending_writes = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn DiskBackend> {
        &self.backend
    }

    pub fn pending_writes(&self) -> PendingWrites {
        PendingWrites {
            rx: self.pending_tx.subscribe(),
        }
    }

    pub fn stats(&self) -> DiskStats {
        DiskStats {
            updates: self.updates.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
        }
    }

    /// Read the stored record for `key`. Not found is `Ok(None)`.
    pub fn load(&self, key: &str) -> Result<Option<DiskRecord<D>>, DiskError> {
        match self.backend.read(key)? {
            Some(bytes) => Ok(Some(DiskRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every key with a stored record.
    pub fn stored_keys(&self) -> Result<Vec<String>, DiskError> {
        self.backend.keys()
    }

    /// Schedule a debounced write of whatever `getter` returns at write time.
    pub fn update(self: &Arc<Self>, key: &str, getter: SnapshotGetter<D>) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        {
            let mut state = self.lock_state();
            // The new getter supersedes one left behind by a failed write.
            state.failed.remove(key);
            if let Some(entry) = state.debounced.get_mut(key) {
                entry.getter = getter;
                entry.last_call = now;
                log::trace!("Coalesced update for '{key}'");
            } else {
                state.next_generation += 1;
                let generation = state.next_generation;
                let timer = tokio::spawn(Self::run_timer(self.clone(), key.to_string(), generation));
                state.debounced.insert(
                    key.to_string(),
                    Debounced {
                        getter,
                        first_call: now,
                        last_call: now,
                        generation,
                        timer: Some(timer),
                    },
                );
            }
            self.publish_pending(state);
        }
    }

    async fn run_timer(disk: Arc<Self>, key: String, generation: u64) {
        loop {
            let deadline = {
                let state = disk.lock_state();
                match state.debounced.get(&key) {
                    Some(entry) if entry.generation == generation => entry.deadline(&disk.config),
                    // Flushed or replaced in the meantime.
                    _ => return,
                }
            };
            if deadline > Instant::now() {
                tokio::time::sleep_until(deadline).await;
                continue;
            }

            let (getter, gate) = {
                let mut state = disk.lock_state();
                if !matches!(state.debounced.get(&key), Some(entry) if entry.generation == generation) {
                    return;
                }
                let Some(entry) = state.debounced.remove(&key) else {
                    return;
                };
                let gate = state.begin_write(&key);
                disk.publish_pending(state);
                (entry.getter, gate)
            };

            if let Err(e) = disk.write_entry(&key, getter, gate).await {
                log::error!("Debounced write for '{key}' failed: {e}");
            }
            return;
        }
    }

    /// Cancel any debounced write for `key` and write `doc` at `version` now.
    pub async fn flush(&self, key: &str, doc: D, version: u64) -> Result<(), DiskError> {
        let record = DiskRecord::new(doc, version);
        let getter: SnapshotGetter<D> = Arc::new(move || record.clone());
        let gate = {
            let mut state = self.lock_state();
            if let Some(entry) = state.debounced.remove(key) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
            state.failed.remove(key);
            let gate = state.begin_write(key);
            self.publish_pending(state);
            gate
        };
        self.write_entry(key, getter, gate).await
    }

    /// Write every debounced and previously failed entry now, then wait for
    /// writes already in progress.
    ///
    /// Returns the first write error; failed keys stay pending. On `Ok` the
    /// pending set is empty.
    pub async fn flush_all(&self) -> Result<(), DiskError> {
        loop {
            let batch = {
                let mut state = self.lock_state();
                let mut batch = Vec::new();
                let debounced: Vec<(String, Debounced<D>)> = state.debounced.drain().collect();
                for (key, entry) in debounced {
                    if let Some(timer) = entry.timer {
                        timer.abort();
                    }
                    batch.push((key, entry.getter));
                }
                let failed: Vec<(String, SnapshotGetter<D>)> = state.failed.drain().collect();
                batch.extend(failed);
                let batch: Vec<_> = batch
                    .into_iter()
                    .map(|(key, getter)| {
                        let gate = state.begin_write(&key);
                        (key, getter, gate)
                    })
                    .collect();
                self.publish_pending(state);
                batch
            };

            if !batch.is_empty() {
                log::debug!("Flushing {} pending document writes", batch.len());
            }

            let mut first_error = None;
            for (key, getter, gate) in batch {
                if let Err(e) = self.write_entry(&key, getter, gate).await {
                    log::error!("Flush of '{key}' failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            let mut in_flight = self.in_flight_tx.subscribe();
            let _ = in_flight.wait_for(|count| *count == 0).await;

            let settled = {
                let state = self.lock_state();
                state.debounced.is_empty() && state.failed.is_empty() && state.in_flight.is_empty()
            };
            if settled {
                return Ok(());
            }
        }
    }

    async fn write_entry(
        &self,
        key: &str,
        getter: SnapshotGetter<D>,
        gate: Arc<tokio::sync::Mutex<()>>,
    ) -> Result<(), DiskError> {
        let result = {
            let _guard = gate.lock().await;
            self.persist(key, &getter)
        };

        let mut state = self.lock_state();
        state.end_write(key);
        match &result {
            Ok(()) => {
                state.failed.remove(key);
            }
            Err(_) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                // A newer update already scheduled its own write.
                if !state.debounced.contains_key(key) {
                    state.failed.insert(key.to_string(), getter);
                }
            }
        }
        self.publish_pending(state);
        result
    }

    fn persist(&self, key: &str, getter: &SnapshotGetter<D>) -> Result<(), DiskError> {
        let record = getter();
        let last_written = self.lock_state().written.get(key).copied();
        if let Some(last) = last_written {
            if record.version < last {
                self.stale_skipped.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Skipping write of '{key}' at version {}; version {last} already stored",
                    record.version
                );
                return Ok(());
            }
        }

        let bytes = record.encode()?;
        self.backend.write(key, &bytes, record.version)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.lock_state().written.insert(key.to_string(), record.version);
        log::debug!("Persisted '{key}' at version {} ({} bytes)", record.version, bytes.len());
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, DiskState<D>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish the pending set and in-flight count; consumes the guard so the
    /// size callback runs unlocked.
    fn publish_pending(&self, state: MutexGuard<'_, DiskState<D>>) {
        let keys = state.pending_keys();
        let in_flight = state.in_flight_total();
        drop(state);

        self.in_flight_tx.send_replace(in_flight);
        let size = keys.len();
        let mut changed = false;
        self.pending_tx.send_if_modified(|current| {
            if *current != keys {
                changed = current.len() != keys.len();
                *current = keys;
                true
            } else {
                false
            }
        });
        if changed {
            if let Some(callback) = &self.on_pending_writes {
                callback(size);
            }
        }
    }
}

impl<D: Document> Drop for Disk<D> {
    fn drop(&mut self) {
        let state = self.lock_state();
        if !state.debounced.is_empty() || !state.failed.is_empty() {
            log::warn!(
                "Disk dropped with {} unwritten documents",
                state.debounced.len() + state.failed.len()
            );
        }
    }
}
