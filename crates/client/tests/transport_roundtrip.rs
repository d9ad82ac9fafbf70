use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use draftsync_client::transport::{
    ChannelConnector, HttpSyncApi, SyncApi, TransportError, WsChannelConnector,
};
use draftsync_common::protocol::channel::{ClientFrame, PresenceMember, ServerFrame, Whisper};
use draftsync_common::types::{SaveRequest, SaveResponse};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use url::Url;
use uuid::Uuid;

const TOKEN: &str = "test-token";

#[derive(Clone, Default)]
struct StubState {
    saves: Arc<Mutex<Vec<Value>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok())
        == Some(format!("Bearer {TOKEN}").as_str())
}

fn envelope(status: StatusCode, code: &str, message: &str) -> Response {
    let body = json!({
        "error": {
            "code": code,
            "message": message,
            "retryable": false,
            "request_id": "stub",
            "details": {}
        }
    });
    (status, Json(body)).into_response()
}

async fn save(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return envelope(StatusCode::UNAUTHORIZED, "AUTH_INVALID_TOKEN", "missing token");
    }
    let snapshot_created = body["updateCount"].as_u64().unwrap_or(0) >= 50;
    state.saves.lock().expect("saves lock").push(body);
    Json(json!({ "snapshotCreated": snapshot_created })).into_response()
}

async fn restore(Path(_id): Path<Uuid>) -> Response {
    envelope(StatusCode::NOT_FOUND, "VERSION_NOT_FOUND", "version not found")
}

async fn channel(headers: HeaderMap, Path(id): Path<Uuid>, ws: WebSocketUpgrade) -> Response {
    if !authorized(&headers) {
        return envelope(StatusCode::UNAUTHORIZED, "AUTH_INVALID_TOKEN", "missing token");
    }
    ws.on_upgrade(move |socket| echo_channel(socket, id))
}

// Sends the roster, then reflects every whisper back stamped as "Stub".
async fn echo_channel(mut socket: WebSocket, document_id: Uuid) {
    let stub = PresenceMember { id: Uuid::nil(), name: "Stub".to_string() };
    let here = ServerFrame::Here { document_id, members: vec![stub.clone()] };
    let raw = serde_json::to_string(&here).expect("frame serializes");
    if socket.send(Message::Text(raw.into())).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(ClientFrame::Whisper { whisper }) = serde_json::from_str(text.as_str()) else {
            continue;
        };
        let reply = ServerFrame::Whisper { whisper: whisper.stamped(&stub) };
        let raw = serde_json::to_string(&reply).expect("frame serializes");
        if socket.send(Message::Text(raw.into())).await.is_err() {
            return;
        }
    }
}

async fn spawn_stub() -> (SocketAddr, StubState) {
    let state = StubState::default();
    let app = Router::new()
        .route("/v1/documents/{id}/save", post(save))
        .route("/v1/documents/{id}/restore", post(restore))
        .route("/v1/documents/{id}/channel", get(channel))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub relay should run");
    });
    (addr, state)
}

fn base_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("http://{addr}")).expect("base url")
}

#[tokio::test]
async fn save_posts_camel_case_body_with_bearer_token() {
    let (addr, state) = spawn_stub().await;
    let api = HttpSyncApi::new(base_url(addr), TOKEN);

    let response = api
        .save_update(Uuid::new_v4(), SaveRequest { content: "AQID".to_string(), update_count: 50 })
        .await
        .expect("save should succeed");

    assert_eq!(response, SaveResponse { snapshot_created: true });
    let saves = state.saves.lock().expect("saves lock").clone();
    assert_eq!(saves, vec![json!({ "content": "AQID", "updateCount": 50 })]);
}

#[tokio::test]
async fn error_envelopes_become_rejections() {
    let (addr, _state) = spawn_stub().await;

    let anonymous = HttpSyncApi::new(base_url(addr), "wrong-token");
    let error = anonymous
        .save_update(Uuid::new_v4(), SaveRequest { content: "AA==".to_string(), update_count: 1 })
        .await
        .expect_err("save without a valid token should fail");
    assert!(matches!(
        &error,
        TransportError::Rejected { status: 401, code, .. } if code == "AUTH_INVALID_TOKEN"
    ));

    let api = HttpSyncApi::new(base_url(addr), TOKEN);
    let error = api
        .restore_version(Uuid::new_v4(), 4)
        .await
        .expect_err("restore of a missing version should fail");
    assert!(matches!(
        &error,
        TransportError::Rejected { status: 404, code, .. } if code == "VERSION_NOT_FOUND"
    ));
    assert!(error.is_permanent());
}

#[tokio::test]
async fn channel_connector_joins_and_exchanges_frames() {
    let (addr, _state) = spawn_stub().await;
    let connector = WsChannelConnector::new(base_url(addr), TOKEN);
    let document_id = Uuid::new_v4();

    let mut link = connector.join(document_id).await.expect("join should succeed");

    let here = timeout(Duration::from_secs(5), link.recv())
        .await
        .expect("roster should arrive")
        .expect("channel open");
    assert!(matches!(here, ServerFrame::Here { document_id: id, .. } if id == document_id));

    let me = PresenceMember { id: Uuid::new_v4(), name: "Ada".to_string() };
    link.send(ClientFrame::Whisper { whisper: Whisper::update(&[1, 2, 3], &me) })
        .await
        .expect("whisper should send");

    let echoed = timeout(Duration::from_secs(5), link.recv())
        .await
        .expect("echo should arrive")
        .expect("channel open");
    let ServerFrame::Whisper { whisper } = echoed else {
        panic!("expected whisper, got {echoed:?}");
    };
    assert!(whisper.is_from(Uuid::nil()));
    assert_eq!(whisper.decode_content().expect("content"), vec![1, 2, 3]);
}

#[tokio::test]
async fn refused_channel_upgrade_is_permanent() {
    let (addr, _state) = spawn_stub().await;
    let connector = WsChannelConnector::new(base_url(addr), "wrong-token");

    let error = connector.join(Uuid::new_v4()).await.expect_err("join should be refused");
    assert!(matches!(error, TransportError::Rejected { status: 401, .. }));
    assert!(error.is_permanent());
}
