//! WebSocket front end for a [`Manager`].
//!
//! ```text
//! WsTransport ──ClientFrame{id, request}──►┐
//!                                          ├── handle_connection ── Manager::handle
//! WsTransport ◄──ServerFrame::Response─────┘          │
//!             ◄──ServerFrame::Bump ◄── bump forwarders (one per document touched)
//! ```
//!
//! Requests on one connection are answered in order. A connection subscribes
//! to version bumps for every document it has sent a request for, unless the
//! document turned out not to exist. A frame
//! that does not decode is answered with `400` when its id can be recovered
//! and dropped otherwise.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use scribe_core::Step;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::disk::rocks::{RocksBackend, RocksConfig};
use crate::disk::{Disk, DiskConfig, DiskError};
use crate::error::{CollabError, ErrorCode};
use crate::manager::{Manager, ManagerConfig};
use crate::protocol::{ClientFrame, CollabResponse, ServerFrame, VersionBump};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// How often idle instances are evicted
    pub eviction_interval: Duration,
    /// Queue of outgoing bumps per connection
    pub bump_queue_capacity: usize,
    pub manager: ManagerConfig,
    pub disk: DiskConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            eviction_interval: Duration::from_secs(30),
            bump_queue_capacity: 256,
            manager: ManagerConfig::default(),
            disk: DiskConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub malformed_frames: u64,
    pub bumps_sent: u64,
    pub total_bytes: u64,
    pub evictions: u64,
}

/// The collaboration server.
pub struct CollabServer<S: Step> {
    config: ServerConfig,
    manager: Arc<Manager<S>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl<S: Step> CollabServer<S> {
    /// Create a server, opening RocksDB storage when a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, DiskError> {
        let disk = match &config.storage_path {
            Some(path) => {
                let backend = RocksBackend::open(RocksConfig {
                    path: path.clone(),
                    ..RocksConfig::default()
                })?;
                Disk::new(Arc::new(backend), config.disk.clone())
            }
            None => Disk::in_memory(config.disk.clone()),
        };
        let manager = Arc::new(Manager::new(config.manager.clone(), Arc::new(disk)));
        Ok(Self::with_manager(config, manager))
    }

    /// Serve an existing manager.
    pub fn with_manager(config: ServerConfig, manager: Arc<Manager<S>>) -> Self {
        Self {
            config,
            manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn manager(&self) -> &Arc<Manager<S>> {
        &self.manager
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!(
            "Collab server {} listening on {}",
            self.manager.id(),
            listener.local_addr()?
        );
        let _eviction = EvictionTask(self.spawn_eviction());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let manager = self.manager.clone();
            let stats = self.stats.clone();
            let capacity = self.config.bump_queue_capacity;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, manager, stats.clone(), capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }

    /// Persist every open document.
    pub async fn shutdown(&self) -> Result<(), CollabError> {
        log::info!("Collab server {} shutting down", self.manager.id());
        self.manager.shutdown().await
    }

    fn spawn_eviction(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let stats = self.stats.clone();
        let period = self.config.eviction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = manager.evict_idle().await;
                if evicted > 0 {
                    stats.write().await.evictions += evicted as u64;
                }
            }
        })
    }
}

struct EvictionTask(JoinHandle<()>);

impl Drop for EvictionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Forwards bumps from document rooms into one connection's queue.
struct BumpForwarders {
    tx: mpsc::Sender<VersionBump>,
    tasks: HashMap<String, JoinHandle<()>>,
}

impl BumpForwarders {
    fn new(tx: mpsc::Sender<VersionBump>) -> Self {
        Self {
            tx,
            tasks: HashMap::new(),
        }
    }

    /// Start forwarding bumps for `doc_name`. Returns `false` if already forwarding.
    async fn watch<S: Step>(&mut self, manager: &Manager<S>, doc_name: &str) -> bool {
        if self.tasks.contains_key(doc_name) {
            return false;
        }
        let mut rx = manager.subscribe(doc_name).await;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bump) => {
                        if tx.send(bump).await.is_err() {
                            break;
                        }
                    }
                    // The receiver resumes at the oldest retained bump, so the
                    // newest version is still forwarded.
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Bump forwarder lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.insert(doc_name.to_string(), task);
        true
    }

    fn unwatch(&mut self, doc_name: &str) {
        if let Some(task) = self.tasks.remove(doc_name) {
            task.abort();
        }
    }
}

impl Drop for BumpForwarders {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection<S: Step>(
    stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<Manager<S>>,
    stats: Arc<RwLock<ServerStats>>,
    bump_capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let (bump_tx, mut bump_rx) = mpsc::channel(bump_capacity);
    let mut forwarders = BumpForwarders::new(bump_tx);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stats.write().await.total_bytes += text.len() as u64;

                        let reply = match ClientFrame::<S>::decode(text.as_str()) {
                            Ok(frame) => {
                                let doc_name = frame.request.doc_name().to_string();
                                let watched = forwarders.watch(manager.as_ref(), &doc_name).await;
                                let response = manager.handle(frame.request).await;
                                if watched {
                                    if let CollabResponse::Error(body) = &response {
                                        if body.error_code == ErrorCode::NotFound {
                                            forwarders.unwatch(&doc_name);
                                        }
                                    }
                                }
                                {
                                    let mut s = stats.write().await;
                                    s.total_requests += 1;
                                    if matches!(response, CollabResponse::Error(_)) {
                                        s.failed_requests += 1;
                                    }
                                }
                                Some(ServerFrame::response(frame.id, &response)?)
                            }
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                stats.write().await.malformed_frames += 1;
                                match frame_id(&text) {
                                    Some(id) => {
                                        let response: CollabResponse<Value> =
                                            CollabResponse::from(Err(CollabError::bad_request(e.to_string())));
                                        Some(ServerFrame::response(id, &response)?)
                                    }
                                    None => None,
                                }
                            }
                        };

                        if let Some(reply) = reply {
                            ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            Some(bump) = bump_rx.recv() => {
                let frame = ServerFrame::Bump(bump);
                ws_sender.send(Message::Text(frame.encode()?.into())).await?;
                stats.write().await.bumps_sent += 1;
            }
        }
    }

    Ok(())
}

/// Best-effort recovery of the request id from a frame that failed to decode.
fn frame_id(text: &str) -> Option<u64> {
    serde_json::from_str::<Value>(text).ok()?.get("id")?.as_u64()
}
