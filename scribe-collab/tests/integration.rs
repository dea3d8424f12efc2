//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full request/response and bump pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_collab::client::{ClientConfig, ClientState, SyncClient, SyncHandle};
use scribe_collab::error::ErrorCode;
use scribe_collab::manager::{Manager, ManagerConfig};
use scribe_collab::protocol::{parse_collab_response, PushEventsRequest, PushEventsResponse, ServerFrame};
use scribe_collab::server::{CollabServer, ServerConfig};
use scribe_collab::transport::{CollabTransport, WsTransport, WsTransportConfig};
use scribe_core::{TextDoc, TextStep};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Start a server on a free port, return its URL and manager.
async fn start_test_server(config: ManagerConfig) -> (String, Arc<Manager<TextStep>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let manager = Arc::new(Manager::in_memory(config));
    let server = CollabServer::with_manager(ServerConfig::default(), manager.clone());
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), manager)
}

async fn connect(url: &str) -> WsTransport<TextStep> {
    WsTransport::connect(url, WsTransportConfig::default()).await.unwrap()
}

async fn wait_until_synced(handles: &[&SyncHandle<TextStep>], manager: &Manager<TextStep>, doc_name: &str) -> TextDoc {
    let result = timeout(Duration::from_secs(5), async {
        loop {
            let server = manager.get_document(doc_name).await.unwrap();
            let synced = handles.iter().all(|h| {
                let snapshot = h.snapshot();
                snapshot.pending == 0 && snapshot.version == Some(server.version) && snapshot.doc == server.doc
            });
            if synced {
                return server.doc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    result.expect("clients did not converge")
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _manager) = start_test_server(ManagerConfig::for_testing()).await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_request_round_trip_over_websocket() {
    let (url, manager) = start_test_server(ManagerConfig::for_testing()).await;
    let transport = connect(&url).await;

    let doc = transport.get_document("notes").await.unwrap();
    assert_eq!(doc.version, 0);
    assert_eq!(doc.manager_id, manager.id());

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

    let stale = transport
        .push_events(PushEventsRequest {
            doc_name: "notes".into(),
            version: 7,
            steps: vec![TextStep::insert(0, "x")],
            client_id: "alice".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(stale.error_code, ErrorCode::BadRequest);
}

#[tokio::test]
async fn test_unknown_document_is_not_found() {
    let config = ManagerConfig {
        create_missing: false,
        ..ManagerConfig::for_testing()
    };
    let (url, _manager) = start_test_server(config).await;
    let transport = connect(&url).await;

    let err = transport.get_document("ghost").await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::NotFound);
    assert!(transport.is_connected());
}

#[tokio::test]
async fn test_malformed_frame_gets_bad_request() {
    let (url, _manager) = start_test_server(ManagerConfig::for_testing()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Text(r#"{"id": 5, "request": {"type": "Bogus"}}"#.into()))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = reply else {
        panic!("expected a text frame, got {reply:?}");
    };
    match ServerFrame::decode(text.as_str()).unwrap() {
        ServerFrame::Response { id, response } => {
            assert_eq!(id, 5);
            let err = parse_collab_response::<PushEventsResponse>(response).unwrap_err();
            assert_eq!(err.error_code, ErrorCode::BadRequest);
        }
        other => panic!("expected a response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bumps_reach_other_connections() {
    let (url, _manager) = start_test_server(ManagerConfig::for_testing()).await;
    let watcher = connect(&url).await;
    let writer = connect(&url).await;

    let mut bumps = watcher.subscribe("notes").await.unwrap();
    watcher.get_document("notes").await.unwrap();

    writer
        .push_events(PushEventsRequest {
            doc_name: "notes".into(),
            version: 0,
            steps: vec![TextStep::insert(0, "a"), TextStep::insert(1, "b")],
            client_id: "bob".into(),
        })
        .await
        .unwrap();

    let bump = timeout(Duration::from_secs(2), bumps.recv()).await.unwrap().unwrap();
    assert_eq!(bump.doc_name, "notes");
    assert_eq!(bump.version, 2);
    assert_eq!(bump.client_id, "bob");
}

#[tokio::test]
async fn test_two_clients_converge_over_websocket() {
    let (url, manager) = start_test_server(ManagerConfig::for_testing()).await;

    let alice = SyncClient::spawn(connect(&url).await, ClientConfig::for_testing("notes").with_client_id("alice"));
    let bob = SyncClient::spawn(connect(&url).await, ClientConfig::for_testing("notes").with_client_id("bob"));
    alice.wait_for_status(|s| *s == ClientState::Ready).await;
    bob.wait_for_status(|s| *s == ClientState::Ready).await;

    for _ in 0..5 {
        alice.apply_local(vec![TextStep::insert(0, "A")]).unwrap();
        bob.apply_local(vec![TextStep::insert(0, "B")]).unwrap();
    }

    let doc = wait_until_synced(&[&alice, &bob], &manager, "notes").await;
    assert_eq!(doc.len(), 10);
    assert_eq!(doc.as_str().matches('A').count(), 5);
    assert_eq!(doc.as_str().matches('B').count(), 5);
}

#[tokio::test]
async fn test_server_stats_count_requests() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server: Arc<CollabServer<TextStep>> = Arc::new(CollabServer::new(ServerConfig::default()).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    let transport = connect(&format!("ws://127.0.0.1:{port}")).await;
    transport.get_document("notes").await.unwrap();
    let _ = transport
        .push_events(PushEventsRequest {
            doc_name: "notes".into(),
            version: 3,
            steps: vec![TextStep::insert(0, "x")],
            client_id: "alice".into(),
        })
        .await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.failed_requests, 1);
}
