// Presence channel transport: one WebSocket per (connection, document).

use crate::{
    auth::{jwt::JwtAccessTokenService, middleware::authenticate_headers},
    error::{
        current_request_id, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, RelayError,
    },
    presence::{ChannelAccess, ChannelError, PresenceHub},
    sync::service::{SyncService, MAX_CONTENT_BYTES},
};
use axum::{
    extract::{
        rejection::PathRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use draftsync_common::protocol::channel::{ClientFrame, ServerFrame, Whisper};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, warn};
use uuid::Uuid;

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
/// Fits a whisper carrying the largest savable state: 4 MiB base64-encoded plus the JSON envelope.
pub const MAX_FRAME_BYTES: usize = 6 * 1024 * 1024;

#[derive(Clone)]
struct ChannelRouterState {
    jwt_service: Arc<JwtAccessTokenService>,
    sync: SyncService,
}

pub fn router(jwt_service: Arc<JwtAccessTokenService>, sync: SyncService) -> Router {
    Router::new()
        .route("/v1/documents/{document_id}/channel", get(channel_upgrade))
        .with_state(ChannelRouterState { jwt_service, sync })
}

async fn channel_upgrade(
    path: Result<Path<Uuid>, PathRejection>,
    State(state): State<ChannelRouterState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> impl IntoResponse {
    let user = match authenticate_headers(&state.jwt_service, &headers) {
        Ok(user) => user,
        Err(error) => return error.into_response(),
    };
    let document_id = match path {
        Ok(Path(document_id)) => document_id,
        Err(rejection) => {
            return RelayError::new(ErrorCode::ValidationFailed, rejection.body_text())
                .into_response();
        }
    };

    // Rejected callers never reach the hub, so they never appear in a roster.
    let access = match state.sync.authorize_channel(document_id, &user).await {
        Ok(access) => access,
        Err(error) => {
            let error = ChannelError::from(error);
            debug!(%error, document_id = %document_id, "channel join refused");
            return error.to_relay_error().into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let presence = state.sync.presence().clone();
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(presence, document_id, access, socket))
                .await;
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatEvent {
    SendPing,
    PongOverdue,
}

/// Server-side liveness check: a ping every interval, and a deadline armed by
/// the first unanswered ping that only a pong clears.
struct Heartbeat {
    ticks: Interval,
    timeout: Duration,
    pong_deadline: Option<Instant>,
}

impl Heartbeat {
    fn new(interval: Duration, timeout: Duration) -> Self {
        let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { ticks, timeout, pong_deadline: None }
    }

    /// Cancel safe: state changes only once a tick has completed.
    async fn next(&mut self) -> HeartbeatEvent {
        let deadline = self.pong_deadline;
        tokio::select! {
            _ = self.ticks.tick() => {
                if self.pong_deadline.is_none() {
                    self.pong_deadline = Some(Instant::now() + self.timeout);
                }
                HeartbeatEvent::SendPing
            }
            () = pong_overdue(deadline) => HeartbeatEvent::PongOverdue,
        }
    }

    fn pong_received(&mut self) {
        self.pong_deadline = None;
    }
}

async fn pong_overdue(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn handle_socket(
    presence: PresenceHub,
    document_id: Uuid,
    access: ChannelAccess,
    mut socket: WebSocket,
) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerFrame>();
    let connection_id = presence.join(document_id, access.member.clone(), outbound_sender).await;

    let mut heartbeat = Heartbeat::new(
        Duration::from_millis(HEARTBEAT_INTERVAL_MS),
        Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
    );

    loop {
        tokio::select! {
            event = heartbeat.next() => match event {
                HeartbeatEvent::SendPing => {
                    if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                HeartbeatEvent::PongOverdue => {
                    warn!(
                        document_id = %document_id,
                        connection_id = %connection_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
            },
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if let Err(error) =
                            handle_client_frame(&presence, document_id, connection_id, &access, &raw_message).await
                        {
                            debug!(error = %error, connection_id = %connection_id, "rejected channel frame");
                            if send_frame(&mut socket, &error.to_frame()).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => heartbeat.pong_received(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        debug!(%error, connection_id = %connection_id, "channel read failed");
                        break;
                    }
                }
            }
        }
    }

    presence.leave(document_id, connection_id).await;
}

async fn handle_client_frame(
    presence: &PresenceHub,
    document_id: Uuid,
    connection_id: Uuid,
    access: &ChannelAccess,
    raw_message: &str,
) -> Result<(), ChannelError> {
    let frame = serde_json::from_str::<ClientFrame>(raw_message)
        .map_err(|error| ChannelError::InvalidFrame(error.to_string()))?;

    match frame {
        ClientFrame::Whisper { whisper } => {
            match &whisper {
                Whisper::Restore { .. } => return Err(ChannelError::RestoreFromClient),
                Whisper::Update { .. } if !access.can_edit => return Err(ChannelError::ReadOnly),
                Whisper::Update { .. } => {}
            }
            let content = whisper
                .decode_content()
                .map_err(|error| ChannelError::InvalidFrame(error.to_string()))?;
            if content.len() > MAX_CONTENT_BYTES {
                return Err(ChannelError::InvalidFrame(format!(
                    "whisper content is {} bytes; limit is {MAX_CONTENT_BYTES}",
                    content.len()
                )));
            }
            let delivered = presence.whisper(document_id, connection_id, whisper).await?;
            debug!(delivered, connection_id = %connection_id, "whisper relayed");
            Ok(())
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), ()> {
    let encoded = serde_json::to_string(frame).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::{
        router, Heartbeat, HeartbeatEvent, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS,
        MAX_CONTENT_BYTES, MAX_FRAME_BYTES,
    };
    use crate::{
        auth::jwt::JwtAccessTokenService,
        presence::PresenceHub,
        store::{DocumentStore, SharePermission},
        sync::{
            clock::SystemClock,
            service::SyncService,
            snapshot::{SnapshotPolicy, SnapshotPolicyEngine},
            ttl_store::MemoryTtlStore,
        },
    };
    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Request, StatusCode},
    };
    use draftsync_common::protocol::channel::{ClientFrame, PresenceMember, ServerFrame, Whisper};
    use futures_util::{SinkExt, StreamExt};
    use std::{sync::Arc, time::Duration};
    use tokio::{
        net::TcpListener,
        time::{timeout, Instant},
    };
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{client::IntoClientRequest, Message as WsFrame},
        MaybeTlsStream, WebSocketStream,
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "draftsync_test_secret_that_is_definitely_long_enough";

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    struct Fixture {
        jwt_service: Arc<JwtAccessTokenService>,
        store: DocumentStore,
        sync: SyncService,
        owner: Uuid,
        document_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"));
        let store = DocumentStore::memory();
        let clock = Arc::new(SystemClock);
        let policy = SnapshotPolicyEngine::new(
            SnapshotPolicy { update_threshold: 50, interval: Duration::from_secs(10) },
            Arc::new(MemoryTtlStore::new(Duration::from_secs(3600), clock.clone())),
            clock,
        );
        let sync = SyncService::new(store.clone(), policy, PresenceHub::new(), 10);

        let owner = Uuid::new_v4();
        store.upsert_user(owner, "Owner").await.expect("owner should insert");
        let document_id =
            store.create_document(owner, "Channel test").await.expect("document should insert").id;

        Fixture { jwt_service, store, sync, owner, document_id }
    }

    async fn collaborator(fixture: &Fixture, name: &str, permission: SharePermission) -> Uuid {
        let user_id = Uuid::new_v4();
        fixture.store.upsert_user(user_id, name).await.expect("collaborator should insert");
        fixture
            .store
            .grant_share(fixture.document_id, user_id, permission)
            .await
            .expect("share should insert");
        user_id
    }

    async fn serve(fixture: &Fixture) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let app = router(fixture.jwt_service.clone(), fixture.sync.clone());
        let server_task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("relay websocket server should run");
        });
        (addr, server_task)
    }

    fn bearer(fixture: &Fixture, user_id: Uuid, name: &str) -> String {
        let token = fixture
            .jwt_service
            .issue_access_token(user_id, name)
            .expect("access token should be created");
        format!("Bearer {token}")
    }

    async fn connect(addr: std::net::SocketAddr, document_id: Uuid, authorization: &str) -> ClientSocket {
        let mut request = format!("ws://{addr}/v1/documents/{document_id}/channel")
            .into_client_request()
            .expect("request should build");
        request
            .headers_mut()
            .insert(AUTHORIZATION, authorization.parse().expect("header should parse"));
        let (socket, _) = connect_async(request).await.expect("websocket should connect");
        socket
    }

    async fn ws_send(socket: &mut ClientSocket, frame: &ClientFrame) {
        let raw = serde_json::to_string(frame).expect("frame should serialize");
        socket.send(WsFrame::Text(raw.into())).await.expect("frame should send");
    }

    async fn ws_recv(socket: &mut ClientSocket) -> ServerFrame {
        loop {
            let next = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket frame");
            let frame =
                next.expect("websocket should remain open").expect("websocket frame should decode");

            match frame {
                WsFrame::Text(payload) => {
                    return serde_json::from_str::<ServerFrame>(&payload)
                        .expect("text frame should decode as server frame");
                }
                WsFrame::Ping(payload) => {
                    socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
                }
                WsFrame::Close(_) => panic!("websocket closed unexpectedly"),
                WsFrame::Binary(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn upgrade_without_bearer_token_is_unauthorized() {
        let fixture = fixture().await;
        let app = router(fixture.jwt_service.clone(), fixture.sync.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/documents/{}/channel", fixture.document_id))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upgrade_for_stranger_is_forbidden_and_unknown_document_is_not_found() {
        let fixture = fixture().await;
        let stranger = bearer(&fixture, Uuid::new_v4(), "Stranger");
        let owner = bearer(&fixture, fixture.owner, "Owner");

        for (document_id, authorization, expected) in [
            (fixture.document_id, stranger, StatusCode::FORBIDDEN),
            (Uuid::new_v4(), owner, StatusCode::NOT_FOUND),
        ] {
            let app = router(fixture.jwt_service.clone(), fixture.sync.clone());
            let response = app
                .oneshot(
                    Request::builder()
                        .uri(format!("/v1/documents/{document_id}/channel"))
                        .header(AUTHORIZATION, authorization)
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("router should respond");
            assert_eq!(response.status(), expected);
        }
        assert!(fixture.sync.presence().members(fixture.document_id).await.is_empty());
    }

    #[tokio::test]
    async fn malformed_document_id_is_a_validation_error() {
        let fixture = fixture().await;
        let app = router(fixture.jwt_service.clone(), fixture.sync.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/documents/not-a-uuid/channel")
                    .header(AUTHORIZATION, bearer(&fixture, fixture.owner, "Owner"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("router should respond");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let body: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn members_see_presence_and_whispers_without_self_echo() {
        let fixture = fixture().await;
        let editor = Uuid::new_v4();
        fixture.store.upsert_user(editor, "Editor").await.expect("editor should insert");
        fixture
            .store
            .grant_share(fixture.document_id, editor, SharePermission::Edit)
            .await
            .expect("share should insert");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let app = router(fixture.jwt_service.clone(), fixture.sync.clone());
        let server_task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("relay websocket server should run");
        });

        let owner_member = PresenceMember { id: fixture.owner, name: "Owner".to_string() };
        let editor_member = PresenceMember { id: editor, name: "Editor".to_string() };

        let mut owner_socket =
            connect(addr, fixture.document_id, &bearer(&fixture, fixture.owner, "Owner")).await;
        match ws_recv(&mut owner_socket).await {
            ServerFrame::Here { members, .. } => assert_eq!(members, vec![owner_member.clone()]),
            other => panic!("expected here frame, got {other:?}"),
        }

        let mut editor_socket =
            connect(addr, fixture.document_id, &bearer(&fixture, editor, "Editor")).await;
        match ws_recv(&mut editor_socket).await {
            ServerFrame::Here { members, .. } => {
                assert_eq!(members, vec![editor_member.clone(), owner_member.clone()]);
            }
            other => panic!("expected here frame, got {other:?}"),
        }
        assert_eq!(
            ws_recv(&mut owner_socket).await,
            ServerFrame::Joining { member: editor_member.clone() }
        );

        let spoofed = PresenceMember { id: Uuid::new_v4(), name: "Mallory".to_string() };
        ws_send(
            &mut owner_socket,
            &ClientFrame::Whisper { whisper: Whisper::update(&[1, 2, 3], &spoofed) },
        )
        .await;
        match ws_recv(&mut editor_socket).await {
            ServerFrame::Whisper { whisper } => {
                assert_eq!(whisper.sender(), owner_member);
                assert_eq!(whisper.decode_content().expect("content should decode"), vec![1, 2, 3]);
            }
            other => panic!("expected whisper frame, got {other:?}"),
        }

        editor_socket.close(None).await.expect("close should send");
        assert_eq!(ws_recv(&mut owner_socket).await, ServerFrame::Leaving { member: editor_member });

        server_task.abort();
    }

    #[tokio::test]
    async fn malformed_frame_yields_error_frame_and_keeps_connection_open() {
        let fixture = fixture().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let app = router(fixture.jwt_service.clone(), fixture.sync.clone());
        let server_task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("relay websocket server should run");
        });

        let mut socket =
            connect(addr, fixture.document_id, &bearer(&fixture, fixture.owner, "Owner")).await;
        let _here = ws_recv(&mut socket).await;

        socket.send(WsFrame::Text("{\"type\":\"bogus\"}".to_string().into())).await.expect("frame should send");
        match ws_recv(&mut socket).await {
            ServerFrame::Error { code, retryable, .. } => {
                assert_eq!(code, "VALIDATION_FAILED");
                assert!(!retryable);
            }
            other => panic!("expected error frame, got {other:?}"),
        }

        socket
            .send(WsFrame::Text(
                "{\"type\":\"whisper\",\"whisper\":{\"kind\":\"update\",\"content\":\"%%%\",\"userId\":\"00000000-0000-0000-0000-000000000000\",\"userName\":\"x\"}}".to_string().into(),
            ))
            .await
            .expect("frame should send");
        assert!(matches!(ws_recv(&mut socket).await, ServerFrame::Error { .. }));

        server_task.abort();
    }

    #[tokio::test]
    async fn restore_is_pushed_to_connected_members() {
        let fixture = fixture().await;
        let owner = crate::auth::middleware::AuthenticatedUser {
            user_id: fixture.owner,
            display_name: "Owner".to_string(),
        };
        fixture
            .sync
            .save_update(fixture.document_id, &owner, vec![7, 7], 50)
            .await
            .expect("save should snapshot");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let app = router(fixture.jwt_service.clone(), fixture.sync.clone());
        let server_task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("relay websocket server should run");
        });

        let mut socket =
            connect(addr, fixture.document_id, &bearer(&fixture, fixture.owner, "Owner")).await;
        let _here = ws_recv(&mut socket).await;

        fixture.sync.restore_to_version(fixture.document_id, &owner, 1).await.expect("restore");
        match ws_recv(&mut socket).await {
            ServerFrame::Whisper { whisper: Whisper::Restore { version_number, user_id, .. } } => {
                assert_eq!(version_number, 1);
                assert_eq!(user_id, fixture.owner);
            }
            other => panic!("expected restore whisper, got {other:?}"),
        }

        server_task.abort();
    }

    #[tokio::test]
    async fn view_only_member_cannot_push_restore_or_update_to_peers() {
        let fixture = fixture().await;
        let viewer = collaborator(&fixture, "Viewer", SharePermission::View).await;
        let (addr, server_task) = serve(&fixture).await;

        let mut owner_socket =
            connect(addr, fixture.document_id, &bearer(&fixture, fixture.owner, "Owner")).await;
        let _here = ws_recv(&mut owner_socket).await;
        let mut viewer_socket =
            connect(addr, fixture.document_id, &bearer(&fixture, viewer, "Viewer")).await;
        let _here = ws_recv(&mut viewer_socket).await;
        let viewer_member = PresenceMember { id: viewer, name: "Viewer".to_string() };
        assert_eq!(
            ws_recv(&mut owner_socket).await,
            ServerFrame::Joining { member: viewer_member.clone() }
        );

        let forged_restore = Whisper::restore(&[6, 6, 6], 1, &viewer_member);
        ws_send(&mut viewer_socket, &ClientFrame::Whisper { whisper: forged_restore }).await;
        match ws_recv(&mut viewer_socket).await {
            ServerFrame::Error { code, .. } => assert_eq!(code, "VALIDATION_FAILED"),
            other => panic!("expected error frame, got {other:?}"),
        }

        let update = Whisper::update(&[6, 6, 6], &viewer_member);
        ws_send(&mut viewer_socket, &ClientFrame::Whisper { whisper: update }).await;
        match ws_recv(&mut viewer_socket).await {
            ServerFrame::Error { code, .. } => assert_eq!(code, "AUTH_FORBIDDEN"),
            other => panic!("expected error frame, got {other:?}"),
        }

        // Frames from one connection are handled in order, so anything relayed
        // would reach the owner before the viewer's departure.
        viewer_socket.close(None).await.expect("close should send");
        assert_eq!(ws_recv(&mut owner_socket).await, ServerFrame::Leaving { member: viewer_member });

        server_task.abort();
    }

    #[tokio::test]
    async fn updates_larger_than_one_mebibyte_are_relayed() {
        let fixture = fixture().await;
        let editor = collaborator(&fixture, "Editor", SharePermission::Edit).await;
        let (addr, server_task) = serve(&fixture).await;

        let mut owner_socket =
            connect(addr, fixture.document_id, &bearer(&fixture, fixture.owner, "Owner")).await;
        let _here = ws_recv(&mut owner_socket).await;
        let mut editor_socket =
            connect(addr, fixture.document_id, &bearer(&fixture, editor, "Editor")).await;
        let _here = ws_recv(&mut editor_socket).await;
        let _joining = ws_recv(&mut owner_socket).await;

        let content = vec![0x5a; 1_500_000];
        let owner_member = PresenceMember { id: fixture.owner, name: "Owner".to_string() };
        ws_send(
            &mut owner_socket,
            &ClientFrame::Whisper { whisper: Whisper::update(&content, &owner_member) },
        )
        .await;

        match ws_recv(&mut editor_socket).await {
            ServerFrame::Whisper { whisper } => {
                assert_eq!(whisper.decode_content().expect("content should decode"), content);
            }
            other => panic!("expected whisper frame, got {other:?}"),
        }

        server_task.abort();
    }

    #[test]
    fn largest_savable_state_fits_in_one_frame() {
        let sender = PresenceMember { id: Uuid::new_v4(), name: "n".repeat(256) };
        let frame = ServerFrame::Whisper {
            whisper: Whisper::update(&vec![0xff; MAX_CONTENT_BYTES], &sender),
        };
        let encoded = serde_json::to_string(&frame).expect("frame should serialize");
        assert!(encoded.len() <= MAX_FRAME_BYTES, "{} > {MAX_FRAME_BYTES}", encoded.len());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_is_detected_ten_seconds_after_the_ping() {
        let started = Instant::now();
        let mut heartbeat = Heartbeat::new(
            Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        );

        assert_eq!(heartbeat.next().await, HeartbeatEvent::SendPing);
        let pinged_at = started.elapsed();
        assert!(pinged_at >= Duration::from_secs(15) && pinged_at < Duration::from_secs(16));

        assert_eq!(heartbeat.next().await, HeartbeatEvent::PongOverdue);
        let closed_at = started.elapsed();
        assert!(closed_at >= Duration::from_secs(25) && closed_at < Duration::from_secs(26));
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_the_connection_alive() {
        let started = Instant::now();
        let mut heartbeat = Heartbeat::new(
            Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        );

        for round in 1..=3u64 {
            assert_eq!(heartbeat.next().await, HeartbeatEvent::SendPing);
            tokio::time::sleep(Duration::from_secs(2)).await;
            heartbeat.pong_received();
            assert!(started.elapsed() >= Duration::from_secs(15 * round));
        }
        assert_eq!(heartbeat.next().await, HeartbeatEvent::SendPing);
        assert!(started.elapsed() < Duration::from_secs(61));
    }

    #[test]
    fn heartbeat_and_frame_limits_match_channel_contract() {
        assert_eq!(HEARTBEAT_INTERVAL_MS, 15_000);
        assert_eq!(HEARTBEAT_TIMEOUT_MS, 10_000);
        assert!(HEARTBEAT_TIMEOUT_MS < HEARTBEAT_INTERVAL_MS);
        assert_eq!(MAX_FRAME_BYTES, 6_291_456);
    }
}
