//! How a sync client reaches a manager.
//!
//! Both transports speak the same JSON envelope, so the client sees identical
//! responses whether the manager lives in-process or behind a WebSocket:
//!
//! ```text
//! SyncClient ──► LocalTransport ──► Manager::handle ──► envelope (JSON) ──► parse_collab_response
//! SyncClient ──► WsTransport ──ClientFrame──► CollabServer ──ServerFrame──► parse_collab_response
//! ```
//!
//! Transport failures (timeouts, dropped connections, garbage frames) surface
//! as `500` errors tagged `from = "transport"`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use scribe_core::Step;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::CollabError;
use crate::manager::Manager;
use crate::protocol::{
    parse_collab_response, ClientFrame, CollabRequest, GetDocumentRequest, GetDocumentResponse,
    ProtocolError, PullEventsRequest, PullEventsResponse, PushEventsRequest, PushEventsResponse,
    ServerFrame, VersionBump,
};

/// The request surface as seen from a client.
#[async_trait]
pub trait CollabTransport<S: Step>: Send + Sync + 'static {
    async fn get_document(&self, doc_name: &str) -> Result<GetDocumentResponse<S::Doc>, CollabError>;

    async fn push_events(&self, request: PushEventsRequest<S>) -> Result<PushEventsResponse, CollabError>;

    async fn pull_events(&self, request: PullEventsRequest) -> Result<PullEventsResponse<S>, CollabError>;

    /// Version-bump notifications, if the transport delivers them. Receivers
    /// may see bumps for other documents and must filter by name.
    async fn subscribe(&self, doc_name: &str) -> Option<broadcast::Receiver<VersionBump>>;
}

#[async_trait]
impl<S: Step, T: CollabTransport<S>> CollabTransport<S> for Arc<T> {
    async fn get_document(&self, doc_name: &str) -> Result<GetDocumentResponse<S::Doc>, CollabError> {
        (**self).get_document(doc_name).await
    }

    async fn push_events(&self, request: PushEventsRequest<S>) -> Result<PushEventsResponse, CollabError> {
        (**self).push_events(request).await
    }

    async fn pull_events(&self, request: PullEventsRequest) -> Result<PullEventsResponse<S>, CollabError> {
        (**self).pull_events(request).await
    }

    async fn subscribe(&self, doc_name: &str) -> Option<broadcast::Receiver<VersionBump>> {
        (**self).subscribe(doc_name).await
    }
}

/// In-process transport over a shared [`Manager`].
pub struct LocalTransport<S: Step> {
    manager: Arc<Manager<S>>,
}

impl<S: Step> LocalTransport<S> {
    pub fn new(manager: Arc<Manager<S>>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<Manager<S>> {
        &self.manager
    }

    async fn request<T: DeserializeOwned>(&self, request: CollabRequest<S>) -> Result<T, CollabError> {
        let response = self.manager.handle(request).await;
        let value = serde_json::to_value(&response)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        parse_collab_response(value)
    }
}

impl<S: Step> Clone for LocalTransport<S> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

#[async_trait]
impl<S: Step> CollabTransport<S> for LocalTransport<S> {
    async fn get_document(&self, doc_name: &str) -> Result<GetDocumentResponse<S::Doc>, CollabError> {
        self.request(CollabRequest::GetDocument(GetDocumentRequest {
            doc_name: doc_name.to_string(),
        }))
        .await
    }

    async fn push_events(&self, request: PushEventsRequest<S>) -> Result<PushEventsResponse, CollabError> {
        self.request(CollabRequest::PushEvents(request)).await
    }

    async fn pull_events(&self, request: PullEventsRequest) -> Result<PullEventsResponse<S>, CollabError> {
        self.request(CollabRequest::PullEvents(request)).await
    }

    async fn subscribe(&self, doc_name: &str) -> Option<broadcast::Receiver<VersionBump>> {
        Some(self.manager.subscribe(doc_name).await)
    }
}

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Time allowed for a response before the request fails with `500`
    pub request_timeout: Duration,
    /// Outgoing frame queue length
    pub outgoing_capacity: usize,
    /// Bump channel capacity
    pub bump_capacity: usize,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            outgoing_capacity: 256,
            bump_capacity: 256,
        }
    }
}

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// WebSocket transport speaking [`ClientFrame`]/[`ServerFrame`] JSON text frames.
pub struct WsTransport<S: Step> {
    url: String,
    config: WsTransportConfig,
    next_id: AtomicU64,
    pending: PendingRequests,
    outgoing_tx: mpsc::Sender<String>,
    bumps: broadcast::Sender<VersionBump>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    _step: std::marker::PhantomData<fn() -> S>,
}

impl<S: Step> WsTransport<S> {
    /// Connect to a [`CollabServer`](crate::server::CollabServer).
    pub async fn connect(url: impl Into<String>, config: WsTransportConfig) -> Result<Self, ProtocolError> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            log::warn!("Failed to connect to {url}: {e}");
            ProtocolError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("Connected to collab server at {url}");

        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let (bumps, _) = broadcast::channel(config.bump_capacity);
        let connected = Arc::new(AtomicBool::new(true));

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(config.outgoing_capacity);
        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
            let _ = ws_writer.close().await;
        });

        // Reader task: route responses to their requests, bumps to subscribers
        let reader_pending = pending.clone();
        let reader_bumps = bumps.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerFrame::decode(text.as_str()) {
                        Ok(ServerFrame::Response { id, response }) => {
                            let waiter = match reader_pending.lock() {
                                Ok(mut pending) => pending.remove(&id),
                                Err(_) => None,
                            };
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(response);
                                }
                                None => log::debug!("Dropping response to abandoned request {id}"),
                            }
                        }
                        Ok(ServerFrame::Bump(bump)) => {
                            let _ = reader_bumps.send(bump);
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail every outstanding request
            reader_connected.store(false, Ordering::SeqCst);
            if let Ok(mut pending) = reader_pending.lock() {
                pending.clear();
            }
            log::info!("Collab connection closed");
        });

        Ok(Self {
            url,
            config,
            next_id: AtomicU64::new(1),
            pending,
            outgoing_tx,
            bumps,
            connected,
            tasks: vec![writer, reader],
            _step: std::marker::PhantomData,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request<T: DeserializeOwned>(&self, request: CollabRequest<S>) -> Result<T, CollabError> {
        if !self.is_connected() {
            return Err(ProtocolError::ConnectionClosed.into());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = ClientFrame { id, request }.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| CollabError::internal("request table poisoned").from_origin("transport"))?
            .insert(id, tx);

        if self.outgoing_tx.send(text).await.is_err() {
            self.forget(id);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(value)) => parse_collab_response(value),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.forget(id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

impl<S: Step> Drop for WsTransport<S> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl<S: Step> CollabTransport<S> for WsTransport<S> {
    async fn get_document(&self, doc_name: &str) -> Result<GetDocumentResponse<S::Doc>, CollabError> {
        self.request(CollabRequest::GetDocument(GetDocumentRequest {
            doc_name: doc_name.to_string(),
        }))
        .await
    }

    async fn push_events(&self, request: PushEventsRequest<S>) -> Result<PushEventsResponse, CollabError> {
        self.request(CollabRequest::PushEvents(request)).await
    }

    async fn pull_events(&self, request: PullEventsRequest) -> Result<PullEventsResponse<S>, CollabError> {
        self.request(CollabRequest::PullEvents(request)).await
    }

    async fn subscribe(&self, _doc_name: &str) -> Option<broadcast::Receiver<VersionBump>> {
        // The server forwards bumps for documents this connection has touched.
        Some(self.bumps.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::manager::ManagerConfig;
    use scribe_core::{Document, TextDoc, TextStep};

    fn local() -> LocalTransport<TextStep> {
        LocalTransport::new(Arc::new(Manager::in_memory(ManagerConfig::for_testing())))
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let transport = local();
        let doc = transport.get_document("notes").await.unwrap();
        assert_eq!(doc.doc, TextDoc::empty());
        assert_eq!(doc.manager_id, transport.manager().id());

        let pushed = transport
            .push_events(PushEventsRequest {
                doc_name: "notes".into(),
                version: 0,
                steps: vec![TextStep::insert(0, "hi")],
                client_id: "alice".into(),
            })
            .await
            .unwrap();
        assert_eq!(pushed.version, 1);

        let pulled = transport
            .pull_events(PullEventsRequest {
                doc_name: "notes".into(),
                version: 0,
                client_id: "bob".into(),
            })
            .await
            .unwrap();
        assert_eq!(pulled.steps.len(), 1);
        assert_eq!(pulled.steps[0].step, TextStep::insert(0, "hi"));
    }

    #[tokio::test]
    async fn test_local_error_codes_survive_envelope() {
        let transport = local();
        let err = transport
            .pull_events(PullEventsRequest {
                doc_name: "ghost".into(),
                version: 0,
                client_id: "bob".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::NotFound);
        assert_eq!(err.from.as_deref(), Some("manager"));
    }

    #[tokio::test]
    async fn test_local_subscribe_receives_bumps() {
        let transport = local();
        transport.get_document("notes").await.unwrap();
        let mut bumps = transport.subscribe("notes").await.unwrap();
        transport
            .push_events(PushEventsRequest {
                doc_name: "notes".into(),
                version: 0,
                steps: vec![TextStep::insert(0, "x")],
                client_id: "alice".into(),
            })
            .await
            .unwrap();
        assert_eq!(bumps.recv().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_ws_connect_refused() {
        let result = WsTransport::<TextStep>::connect("ws://127.0.0.1:1", WsTransportConfig::default()).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
