//! Server-side authority over named document instances.
//!
//! ```text
//!  handle(request) ──► get_document / push_events / pull_events
//!                              │
//!                    instances: doc_name → slot
//!                              │
//!                 ┌────────────┴─────────────┐
//!                 ▼                          ▼
//!        RwLock<Instance>             watch<DiskRecord> ──► Disk::update getter
//!        (one writer at a time,              │
//!         FIFO fair)                         └── latest {doc, version}
//!                 │
//!                 └── on push ──► RoomManager ──► VersionBump subscribers
//! ```
//!
//! Pushes for one document are applied one at a time in arrival order.
//! Distinct documents never contend beyond the short map lookup.
//!
//! Eviction, `close_instance` and `shutdown` flush the document to disk while
//! holding its write lock and then mark the instance evicted; requests that
//! were queued on that lock look the document up again. Once `shutdown` has
//! started, no instance is loaded or created, so late requests fail with
//! `500` instead of touching a document that will never be flushed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scribe_core::{Document, Step};
use serde_json::Value;
use tokio::sync::{broadcast, watch, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::disk::{Disk, DiskConfig, DiskRecord, SnapshotGetter};
use crate::error::CollabError;
use crate::instance::{ClientPresence, Instance};
use crate::protocol::{
    CollabReply, CollabRequest, CollabResponse, GetDocumentResponse, PullEventsRequest,
    PullEventsResponse, PushEventsRequest, PushEventsResponse, VersionBump,
};

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Steps retained per instance for pulls and rebasing (default: 10_000)
    pub max_step_history: usize,
    /// Seed an empty document when `GetDocument` names an unknown document
    pub create_missing: bool,
    /// Version-bump channel capacity per document
    pub broadcast_capacity: usize,
    /// Instances idle for longer than this are evicted by `evict_idle`
    pub idle_timeout: Duration,
    /// Roster entries not seen for this long are pruned by `evict_idle`
    pub client_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_step_history: 10_000,
            create_missing: true,
            broadcast_capacity: 256,
            idle_timeout: Duration::from_secs(300),
            client_timeout: Duration::from_secs(60),
        }
    }
}

impl ManagerConfig {
    pub fn for_testing() -> Self {
        Self {
            max_step_history: 100,
            create_missing: true,
            broadcast_capacity: 64,
            idle_timeout: Duration::from_millis(100),
            client_timeout: Duration::from_millis(100),
        }
    }
}

/// Manager statistics.
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub instances: usize,
    pub pushes: u64,
    pub pulls: u64,
    pub rejected_pushes: u64,
    pub steps_applied: u64,
    pub evictions: u64,
}

struct InstanceSlot<S: Step> {
    instance: Arc<RwLock<Instance<S>>>,
    snapshot: watch::Sender<DiskRecord<S::Doc>>,
}

impl<S: Step> InstanceSlot<S> {
    fn new(instance: Instance<S>) -> Self {
        let record = DiskRecord::new(instance.doc().clone(), instance.version());
        let (snapshot, _) = watch::channel(record);
        Self {
            instance: Arc::new(RwLock::new(instance)),
            snapshot,
        }
    }

    /// Reads whatever snapshot was published last.
    fn getter(&self) -> SnapshotGetter<S::Doc> {
        let rx = self.snapshot.subscribe();
        Arc::new(move || rx.borrow().clone())
    }
}

/// The authoritative document manager.
pub struct Manager<S: Step> {
    id: Uuid,
    config: ManagerConfig,
    instances: RwLock<HashMap<String, Arc<InstanceSlot<S>>>>,
    disk: Arc<Disk<S::Doc>>,
    rooms: RoomManager,
    closed: AtomicBool,
    pushes: AtomicU64,
    pulls: AtomicU64,
    rejected_pushes: AtomicU64,
    steps_applied: AtomicU64,
    evictions: AtomicU64,
}

impl<S: Step> Manager<S> {
    pub fn new(config: ManagerConfig, disk: Arc<Disk<S::Doc>>) -> Self {
        let id = Uuid::new_v4();
        log::info!("Manager {id} started (history window {} steps)", config.max_step_history);
        Self {
            id,
            rooms: RoomManager::new(config.broadcast_capacity),
            config,
            instances: RwLock::new(HashMap::new()),
            disk,
            closed: AtomicBool::new(false),
            pushes: AtomicU64::new(0),
            pulls: AtomicU64::new(0),
            rejected_pushes: AtomicU64::new(0),
            steps_applied: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Manager persisting to an in-memory disk.
    pub fn in_memory(config: ManagerConfig) -> Self {
        Self::new(config, Arc::new(Disk::in_memory(DiskConfig::default())))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn disk(&self) -> &Arc<Disk<S::Doc>> {
        &self.disk
    }

    /// True once `shutdown` has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Find the instance for `doc_name`, loading it from disk if needed.
    async fn slot(&self, doc_name: &str, create: bool) -> Result<Arc<InstanceSlot<S>>, CollabError> {
        {
            let instances = self.instances.read().await;
            if let Some(slot) = instances.get(doc_name) {
                return Ok(slot.clone());
            }
        }

        let mut instances = self.instances.write().await;
        // Double-check after acquiring write lock
        if let Some(slot) = instances.get(doc_name) {
            return Ok(slot.clone());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollabError::internal("manager is shutting down").from_origin("manager"));
        }

        let (doc, version) = match self.disk.load(doc_name)? {
            Some(record) => {
                log::info!("Loaded '{doc_name}' at version {} from disk", record.version);
                (record.doc, record.version)
            }
            None if create => {
                log::info!("Created document '{doc_name}'");
                (S::Doc::empty(), 0)
            }
            None => {
                return Err(CollabError::not_found(format!("no document named '{doc_name}'"))
                    .from_origin("manager"))
            }
        };

        let instance = Instance::new(doc_name, doc, version, self.config.max_step_history);
        let slot = Arc::new(InstanceSlot::new(instance));
        instances.insert(doc_name.to_string(), slot.clone());
        Ok(slot)
    }

    async fn lock_write(
        &self,
        doc_name: &str,
        create: bool,
    ) -> Result<(Arc<InstanceSlot<S>>, OwnedRwLockWriteGuard<Instance<S>>), CollabError> {
        loop {
            let slot = self.slot(doc_name, create).await?;
            let guard = slot.instance.clone().write_owned().await;
            if guard.evicted {
                log::trace!("'{doc_name}' was evicted while waiting; retrying lookup");
                continue;
            }
            return Ok((slot, guard));
        }
    }

    async fn lock_read(
        &self,
        doc_name: &str,
        create: bool,
    ) -> Result<OwnedRwLockReadGuard<Instance<S>>, CollabError> {
        loop {
            let slot = self.slot(doc_name, create).await?;
            let guard = slot.instance.clone().read_owned().await;
            if guard.evicted {
                continue;
            }
            return Ok(guard);
        }
    }

    /// Current document and version, creating the instance if allowed.
    pub async fn get_document(&self, doc_name: &str) -> Result<GetDocumentResponse<S::Doc>, CollabError> {
        let instance = self.lock_read(doc_name, self.config.create_missing).await?;
        Ok(GetDocumentResponse {
            doc: instance.doc().clone(),
            version: instance.version(),
            manager_id: self.id,
        })
    }

    /// Validate, rebase and apply a batch of steps.
    pub async fn push_events(&self, request: PushEventsRequest<S>) -> Result<PushEventsResponse, CollabError> {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        let PushEventsRequest {
            doc_name,
            version,
            steps,
            client_id,
        } = request;
        let count = steps.len();

        let (slot, mut instance) = match self.lock_write(&doc_name, false).await {
            Ok(locked) => locked,
            Err(e) => {
                self.rejected_pushes.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let new_version = match instance.add_steps(version, steps, &client_id) {
            Ok(v) => v,
            Err(e) => {
                self.rejected_pushes.fetch_add(1, Ordering::Relaxed);
                log::debug!("Rejected push of {count} steps to '{doc_name}' from '{client_id}': {e}");
                return Err(e);
            }
        };
        slot.snapshot
            .send_replace(DiskRecord::new(instance.doc().clone(), new_version));
        drop(instance);

        self.steps_applied.fetch_add(count as u64, Ordering::Relaxed);
        log::debug!("'{doc_name}' advanced to version {new_version} ({count} steps from '{client_id}')");

        self.disk.update(&doc_name, slot.getter());
        self.rooms
            .publish(VersionBump {
                doc_name,
                version: new_version,
                client_id,
            })
            .await;

        Ok(PushEventsResponse {
            version: new_version,
            manager_id: self.id,
        })
    }

    /// Every logged step with a version greater than `request.version`.
    pub async fn pull_events(&self, request: PullEventsRequest) -> Result<PullEventsResponse<S>, CollabError> {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        let (_slot, mut instance) = self.lock_write(&request.doc_name, false).await?;
        let steps = instance.steps_since(request.version)?;
        instance.touch(&request.client_id);
        Ok(PullEventsResponse {
            steps,
            version: instance.version(),
            manager_id: self.id,
        })
    }

    /// Dispatch a request and wrap the outcome in the response envelope.
    pub async fn handle(&self, request: CollabRequest<S>) -> CollabResponse<CollabReply<S>> {
        let doc_name = request.doc_name().to_string();
        let result = match request {
            CollabRequest::GetDocument(req) => self
                .get_document(&req.doc_name)
                .await
                .map(CollabReply::Document),
            CollabRequest::PushEvents(req) => self.push_events(req).await.map(CollabReply::Pushed),
            CollabRequest::PullEvents(req) => self.pull_events(req).await.map(CollabReply::Pulled),
        };
        if let Err(e) = &result {
            log::debug!("Request for '{doc_name}' failed: {e}");
        }
        result.into()
    }

    /// Version-bump notifications for one document.
    pub async fn subscribe(&self, doc_name: &str) -> broadcast::Receiver<VersionBump> {
        self.rooms.subscribe(doc_name).await
    }

    /// Roster of a loaded document.
    pub async fn clients(&self, doc_name: &str) -> Result<Vec<ClientPresence>, CollabError> {
        let instance = self.lock_read(doc_name, false).await?;
        Ok(instance.clients())
    }

    /// Attach attribution data (name, color, ...) to a client on the roster.
    pub async fn set_client_data(&self, doc_name: &str, client_id: &str, data: Value) -> Result<(), CollabError> {
        let (_slot, mut instance) = self.lock_write(doc_name, false).await?;
        instance.set_client_data(client_id, data);
        Ok(())
    }

    /// Flush and drop instances idle for longer than `idle_timeout`, prune
    /// stale roster entries of the rest and drop rooms nobody listens to.
    /// Returns the number evicted.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let client_cutoff = now.checked_sub(self.config.client_timeout).unwrap_or(now);
        let mut evicted = 0;

        for (doc_name, slot) in self.snapshot_slots().await {
            let mut instance = slot.instance.write().await;
            if instance.evicted {
                continue;
            }
            instance.prune_clients(client_cutoff);
            if now.duration_since(instance.last_active()) < self.config.idle_timeout {
                continue;
            }
            match self.retire(&doc_name, &mut instance).await {
                Ok(()) => evicted += 1,
                Err(e) => log::warn!("Keeping idle '{doc_name}' in memory, flush failed: {e}"),
            }
        }

        let pruned = self.rooms.prune_empty().await;
        if pruned > 0 {
            log::debug!("Dropped {pruned} rooms without subscribers");
        }
        if evicted > 0 {
            log::info!("Evicted {evicted} idle documents");
        }
        evicted
    }

    /// Flush and drop one instance. Returns `false` if it was not loaded.
    pub async fn close_instance(&self, doc_name: &str) -> Result<bool, CollabError> {
        let slot = self.instances.read().await.get(doc_name).cloned();
        let Some(slot) = slot else {
            return Ok(false);
        };
        let mut instance = slot.instance.write().await;
        if instance.evicted {
            return Ok(false);
        }
        self.retire(doc_name, &mut instance).await?;
        Ok(true)
    }

    /// Stop loading instances, flush every open one, drop them, and wait for
    /// all disk writes.
    pub async fn shutdown(&self) -> Result<(), CollabError> {
        {
            // Under the map lock, so no instance slips in after the snapshot below.
            let _instances = self.instances.write().await;
            self.closed.store(true, Ordering::SeqCst);
        }
        let mut first_error = None;
        for (doc_name, slot) in self.snapshot_slots().await {
            let mut instance = slot.instance.write().await;
            if instance.evicted {
                continue;
            }
            if let Err(e) = self.retire(&doc_name, &mut instance).await {
                log::error!("Failed to flush '{doc_name}' on shutdown: {e}");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.disk.flush_all().await {
            first_error.get_or_insert(e.into());
        }
        log::info!("Manager {} shut down", self.id);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush `instance` and unlink it. The caller holds its write lock.
    async fn retire(&self, doc_name: &str, instance: &mut Instance<S>) -> Result<(), CollabError> {
        self.disk
            .flush(doc_name, instance.doc().clone(), instance.version())
            .await?;
        instance.evicted = true;
        self.instances.write().await.remove(doc_name);
        self.rooms.remove_if_empty(doc_name).await;
        self.evictions.fetch_add(1, Ordering::Relaxed);
        log::debug!("Closed '{doc_name}' at version {}", instance.version());
        Ok(())
    }

    async fn snapshot_slots(&self) -> Vec<(String, Arc<InstanceSlot<S>>)> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            instances: self.instance_count().await,
            pushes: self.pushes.load(Ordering::Relaxed),
            pulls: self.pulls.load(Ordering::Relaxed),
            rejected_pushes: self.rejected_pushes.load(Ordering::Relaxed),
            steps_applied: self.steps_applied.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::backend::MemoryBackend;
    use crate::error::ErrorCode;
    use crate::protocol::GetDocumentRequest;
    use scribe_core::{apply_steps, TextDoc, TextStep};

    fn manager() -> Manager<TextStep> {
        Manager::in_memory(ManagerConfig::for_testing())
    }

    fn push(doc_name: &str, version: u64, steps: Vec<TextStep>, client_id: &str) -> PushEventsRequest<TextStep> {
        PushEventsRequest {
            doc_name: doc_name.into(),
            version,
            steps,
            client_id: client_id.into(),
        }
    }

    fn pull(doc_name: &str, version: u64, client_id: &str) -> PullEventsRequest {
        PullEventsRequest {
            doc_name: doc_name.into(),
            version,
            client_id: client_id.into(),
        }
    }

    #[tokio::test]
    async fn test_get_document_creates_instance() {
        let manager = manager();
        let doc = manager.get_document("notes").await.unwrap();
        assert_eq!(doc.doc, TextDoc::empty());
        assert_eq!(doc.version, 0);
        assert_eq!(doc.manager_id, manager.id());
        assert_eq!(manager.instance_count().await, 1);
    }

    #[tokio::test]
    async fn test_get_document_missing_without_create() {
        let config = ManagerConfig {
            create_missing: false,
            ..ManagerConfig::for_testing()
        };
        let manager: Manager<TextStep> = Manager::in_memory(config);
        let err = manager.get_document("notes").await.unwrap_err();
        assert_eq!(err.error_code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_push_and_pull_unknown_document() {
        let manager = manager();
        let err = manager
            .push_events(push("ghost", 0, vec![TextStep::insert(0, "a")], "alice"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::NotFound);
        let err = manager.pull_events(pull("ghost", 0, "alice")).await.unwrap_err();
        assert_eq!(err.error_code, ErrorCode::NotFound);
        assert_eq!(manager.stats().await.rejected_pushes, 1);
    }

    #[tokio::test]
    async fn test_push_then_pull_from_other_client() {
        let manager = manager();
        manager.get_document("notes").await.unwrap();
        manager
            .push_events(push("notes", 0, vec![TextStep::insert(0, "abc")], "alice"))
            .await
            .unwrap();
        manager
            .push_events(push("notes", 1, vec![TextStep::insert(1, "b"), TextStep::insert(2, "c")], "alice"))
            .await
            .unwrap();

        let pushed = manager
            .push_events(push("notes", 3, vec![TextStep::insert(0, "!")], "alice"))
            .await
            .unwrap();
        assert_eq!(pushed.version, 4);

        let pulled = manager.pull_events(pull("notes", 3, "bob")).await.unwrap();
        assert_eq!(pulled.version, 4);
        assert_eq!(pulled.steps.len(), 1);
        assert_eq!(pulled.steps[0].step, TextStep::insert(0, "!"));
        assert_eq!(pulled.steps[0].client_id, "alice");
    }

    #[tokio::test]
    async fn test_push_ahead_is_bad_request() {
        let manager = manager();
        manager.get_document("notes").await.unwrap();
        let err = manager
            .push_events(push("notes", 5, vec![TextStep::insert(0, "a")], "alice"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_trimmed_history_is_gone() {
        let config = ManagerConfig {
            max_step_history: 10,
            ..ManagerConfig::for_testing()
        };
        let manager: Manager<TextStep> = Manager::in_memory(config);
        manager.get_document("notes").await.unwrap();
        for v in 0..50 {
            manager
                .push_events(push("notes", v, vec![TextStep::insert(0, "x")], "alice"))
                .await
                .unwrap();
        }

        let err = manager
            .push_events(push("notes", 1, vec![TextStep::insert(0, "y")], "bob"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::Gone);
        let err = manager.pull_events(pull("notes", 39, "bob")).await.unwrap_err();
        assert_eq!(err.error_code, ErrorCode::Gone);
        assert_eq!(manager.pull_events(pull("notes", 40, "bob")).await.unwrap().steps.len(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_incompatible_pushes() {
        let manager = manager();
        manager.get_document("notes").await.unwrap();
        manager
            .push_events(push("notes", 0, vec![TextStep::insert(0, "abcdef")], "seed"))
            .await
            .unwrap();

        manager
            .push_events(push("notes", 1, vec![TextStep::delete(1, 5)], "alice"))
            .await
            .unwrap();
        let err = manager
            .push_events(push("notes", 1, vec![TextStep::insert(3, "x")], "bob"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::Conflict);

        let doc = manager.get_document("notes").await.unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.doc.as_str(), "af");
    }

    #[tokio::test]
    async fn test_concurrent_pushes_linearize() {
        let manager = Arc::new(manager());
        manager.get_document("notes").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let client = format!("client-{i}");
                loop {
                    let version = manager.get_document("notes").await.unwrap().version;
                    let pushed = manager
                        .push_events(push("notes", version, vec![TextStep::insert(0, "x")], &client))
                        .await;
                    if pushed.is_ok() {
                        break;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let doc = manager.get_document("notes").await.unwrap();
        assert_eq!(doc.version, 20);
        assert_eq!(doc.doc.len(), 20);

        let log = manager.pull_events(pull("notes", 0, "reader")).await.unwrap();
        let versions: Vec<u64> = log.steps.iter().map(|r| r.version).collect();
        assert_eq!(versions, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_pull_completes_document() {
        let manager = manager();
        manager.get_document("notes").await.unwrap();
        manager
            .push_events(push("notes", 0, vec![TextStep::insert(0, "hello")], "alice"))
            .await
            .unwrap();
        let at_v1 = manager.get_document("notes").await.unwrap();

        manager
            .push_events(push("notes", 1, vec![TextStep::insert(5, " world")], "alice"))
            .await
            .unwrap();
        manager
            .push_events(push("notes", 1, vec![TextStep::delete(0, 1)], "bob"))
            .await
            .unwrap();

        let pulled = manager.pull_events(pull("notes", at_v1.version, "carol")).await.unwrap();
        let steps: Vec<TextStep> = pulled.steps.into_iter().map(|r| r.step).collect();
        let rebuilt = apply_steps(&at_v1.doc, &steps).unwrap();
        let current = manager.get_document("notes").await.unwrap();
        assert_eq!(rebuilt, current.doc);
        assert_eq!(rebuilt.as_str(), "ello world");
    }

    #[tokio::test]
    async fn test_push_broadcasts_bump() {
        let manager = manager();
        manager.get_document("notes").await.unwrap();
        let mut bumps = manager.subscribe("notes").await;

        manager
            .push_events(push("notes", 0, vec![TextStep::insert(0, "a")], "alice"))
            .await
            .unwrap();
        let bump = bumps.recv().await.unwrap();
        assert_eq!(bump.version, 1);
        assert_eq!(bump.client_id, "alice");
    }

    #[tokio::test]
    async fn test_handle_wraps_errors() {
        let manager = manager();
        let response = manager
            .handle(CollabRequest::GetDocument(GetDocumentRequest {
                doc_name: "notes".into(),
            }))
            .await;
        assert!(matches!(response, CollabResponse::Ok(CollabReply::Document(_))));

        let response = manager
            .handle(CollabRequest::PullEvents(pull("notes", 9, "alice")))
            .await;
        match response {
            CollabResponse::Error(body) => assert_eq!(body.error_code, ErrorCode::BadRequest),
            other => panic!("expected error envelope, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_persists_after_debounce() {
        let manager = manager();
        manager.get_document("notes").await.unwrap();
        manager
            .push_events(push("notes", 0, vec![TextStep::insert(0, "saved")], "alice"))
            .await
            .unwrap();
        assert!(!manager.disk().pending_writes().is_settled());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let record = manager.disk().load("notes").unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.doc.as_str(), "saved");
        assert!(manager.disk().pending_writes().is_settled());
    }

    #[tokio::test]
    async fn test_evicted_instance_reloads_from_disk() {
        let config = ManagerConfig {
            idle_timeout: Duration::ZERO,
            ..ManagerConfig::for_testing()
        };
        let manager: Manager<TextStep> = Manager::in_memory(config);
        manager.get_document("notes").await.unwrap();
        manager
            .push_events(push("notes", 0, vec![TextStep::insert(0, "kept")], "alice"))
            .await
            .unwrap();

        assert_eq!(manager.evict_idle().await, 1);
        assert_eq!(manager.instance_count().await, 0);
        assert!(manager.disk().pending_writes().is_settled());

        let doc = manager.get_document("notes").await.unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.doc.as_str(), "kept");
        // The reloaded instance has no history before its load point.
        let err = manager.pull_events(pull("notes", 0, "bob")).await.unwrap_err();
        assert_eq!(err.error_code, ErrorCode::Gone);
        assert!(manager.pull_events(pull("notes", 1, "bob")).await.unwrap().steps.is_empty());
    }

    #[tokio::test]
    async fn test_evict_keeps_instance_when_flush_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let disk = Arc::new(Disk::new(backend.clone(), DiskConfig::default()));
        let config = ManagerConfig {
            idle_timeout: Duration::ZERO,
            ..ManagerConfig::for_testing()
        };
        let manager: Manager<TextStep> = Manager::new(config, disk);
        manager.get_document("notes").await.unwrap();

        backend.set_fail_writes(true);
        assert_eq!(manager.evict_idle().await, 0);
        assert_eq!(manager.instance_count().await, 1);

        backend.set_fail_writes(false);
        assert_eq!(manager.evict_idle().await, 1);
    }

    #[tokio::test]
    async fn test_close_instance_and_shutdown() {
        let manager = manager();
        manager.get_document("a").await.unwrap();
        manager.get_document("b").await.unwrap();
        manager
            .push_events(push("b", 0, vec![TextStep::insert(0, "b")], "alice"))
            .await
            .unwrap();

        assert!(manager.close_instance("a").await.unwrap());
        assert!(!manager.close_instance("a").await.unwrap());
        assert_eq!(manager.instance_count().await, 1);

        manager.shutdown().await.unwrap();
        assert_eq!(manager.instance_count().await, 0);
        assert!(manager.disk().pending_writes().is_settled());
        assert_eq!(manager.disk().load("b").unwrap().unwrap().doc.as_str(), "b");
        assert_eq!(manager.stats().await.evictions, 2);
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_are_refused() {
        let manager = manager();
        manager.get_document("notes").await.unwrap();
        manager
            .push_events(push("notes", 0, vec![TextStep::insert(0, "kept")], "alice"))
            .await
            .unwrap();
        manager.shutdown().await.unwrap();
        assert!(manager.is_closed());

        let err = manager
            .push_events(push("notes", 1, vec![TextStep::insert(0, "late")], "alice"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::Internal);
        let err = manager.get_document("fresh").await.unwrap_err();
        assert_eq!(err.error_code, ErrorCode::Internal);
        let err = manager.pull_events(pull("notes", 1, "bob")).await.unwrap_err();
        assert_eq!(err.error_code, ErrorCode::Internal);

        assert_eq!(manager.instance_count().await, 0);
        let record = manager.disk().load("notes").unwrap().unwrap();
        assert_eq!(record.doc.as_str(), "kept");
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_push_waiting_on_shutdown_is_refused() {
        let manager = Arc::new(manager());
        manager.get_document("notes").await.unwrap();

        // Hold the instance so the push queues behind shutdown's flush.
        let slot = manager.instances.read().await.get("notes").cloned().unwrap();
        let guard = slot.instance.clone().write_owned().await;

        let pusher = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .push_events(push("notes", 0, vec![TextStep::insert(0, "late")], "alice"))
                    .await
            })
        };
        let closer = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        closer.await.unwrap().unwrap();
        let pushed = pusher.await.unwrap();
        let stored = manager.disk().load("notes").unwrap().unwrap();
        match pushed {
            // Landed before the flush: it must be on disk.
            Ok(response) => assert_eq!(stored.version, response.version),
            Err(e) => {
                assert_eq!(e.error_code, ErrorCode::Internal);
                assert_eq!(stored.version, 0);
            }
        }
        assert_eq!(manager.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_evict_idle_drops_unobserved_rooms() {
        let manager = manager();
        drop(manager.subscribe("ghost").await);
        let watching = manager.subscribe("notes").await;
        assert_eq!(manager.room_count().await, 2);

        manager.evict_idle().await;
        assert_eq!(manager.room_count().await, 1);
        drop(watching);
        manager.evict_idle().await;
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_roster_tracks_clients() {
        let manager = manager();
        manager.get_document("notes").await.unwrap();
        manager.pull_events(pull("notes", 0, "bob")).await.unwrap();
        manager
            .set_client_data("notes", "alice", serde_json::json!({"name": "Alice"}))
            .await
            .unwrap();

        let clients = manager.clients("notes").await.unwrap();
        let ids: Vec<&str> = clients.iter().map(|c| c.client_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_distinct_managers_have_distinct_ids() {
        let a = manager();
        let b = manager();
        assert_ne!(a.id(), b.id());
    }
}
