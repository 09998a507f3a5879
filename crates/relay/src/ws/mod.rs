// WebSocket transport: one task per connection, JSON text frames, room
// fan-out through the per-connection outbound channels held by the session.

pub mod handler;
pub mod protocol;

use std::{sync::Arc, time::Duration};

use axum::{routing::get, Router};

use crate::auth::gate::AccessGate;
use crate::sync::SessionRegistry;

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: usize = 262_144;
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WsState {
    pub gate: AccessGate,
    pub registry: Arc<SessionRegistry>,
    pub join_timeout: Duration,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/v1/ws", get(handler::ws_upgrade)).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{gate::DEFAULT_ROLE_REVALIDATE_AFTER, jwt::JwtAccessTokenService};
    use crate::permissions::PermissionResolver;
    use crate::storage::{MemorySnapshotBackend, StorageAdapter, StorageConfig};
    use crate::sync::replica::{tests::text_update, ReplicaDoc, CONTENT_TEXT};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use futures_util::{SinkExt, StreamExt};
    use tandem_common::protocol::ws::WsMessage;
    use tandem_common::types::{DocumentId, Role};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout, Instant};
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{
            client::IntoClientRequest, http::HeaderValue, protocol::frame::coding::CloseCode,
            Message as WsFrame,
        },
        MaybeTlsStream, WebSocketStream,
    };
    use uuid::Uuid;

    const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    struct Relay {
        url: String,
        tokens: Arc<JwtAccessTokenService>,
        permissions: PermissionResolver,
        registry: Arc<SessionRegistry>,
        backend: Arc<MemorySnapshotBackend>,
        doc_id: DocumentId,
        project_id: Uuid,
    }

    impl Relay {
        async fn start() -> Self {
            Self::start_with(DEFAULT_ROLE_REVALIDATE_AFTER).await
        }

        async fn start_with(revalidate_after: Duration) -> Self {
            let tokens = Arc::new(
                JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"),
            );
            let permissions = PermissionResolver::in_memory();
            let backend = Arc::new(MemorySnapshotBackend::default());
            let registry = Arc::new(SessionRegistry::new(StorageAdapter::new(
                backend.clone(),
                StorageConfig::default(),
            )));
            let doc_id = DocumentId::parse(format!("tab.{}", Uuid::new_v4())).unwrap();
            let project_id = Uuid::new_v4();
            permissions.assign_document(doc_id.clone(), project_id).await;

            let app = router(WsState {
                gate: AccessGate::new(Arc::clone(&tokens), permissions.clone(), revalidate_after),
                registry: Arc::clone(&registry),
                join_timeout: DEFAULT_JOIN_TIMEOUT,
            });
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
            let addr = listener.local_addr().expect("listener should expose local address");
            tokio::spawn(async move {
                axum::serve(listener, app).await.expect("relay should serve");
            });

            Self {
                url: format!("ws://{addr}/v1/ws"),
                tokens,
                permissions,
                registry,
                backend,
                doc_id,
                project_id,
            }
        }

        async fn user(&self, role: Role) -> String {
            let user_id = Uuid::new_v4();
            self.permissions.grant(self.project_id, user_id, role).await;
            self.tokens.issue_access_token(user_id).expect("token should issue")
        }

        async fn connect(&self) -> ClientSocket {
            let (socket, _) = connect_async(self.url.as_str()).await.expect("websocket should connect");
            socket
        }

        /// Connects, joins and returns the socket with its connection id.
        async fn join(&self, token: &str) -> (ClientSocket, Uuid, String) {
            let mut socket = self.connect().await;
            ws_send(&mut socket, &join_frame(&self.doc_id, token)).await;
            match ws_recv(&mut socket).await {
                WsMessage::SyncFull { connection_id, state_b64, .. } => {
                    (socket, connection_id, decode_text(&state_b64))
                }
                other => panic!("expected sync_full, got {other:?}"),
            }
        }
    }

    fn join_frame(doc_id: &DocumentId, token: &str) -> WsMessage {
        WsMessage::Join {
            doc_id: doc_id.clone(),
            token: token.to_string(),
            protocol_version: None,
            state_vector_b64: None,
        }
    }

    fn decode_text(state_b64: &str) -> String {
        let replica = ReplicaDoc::new();
        replica.apply_update(&STANDARD.decode(state_b64).unwrap()).unwrap();
        replica.text_projection(CONTENT_TEXT)
    }

    fn update_frame(bytes: &[u8]) -> WsMessage {
        WsMessage::Update { update_b64: STANDARD.encode(bytes), origin: None }
    }

    async fn ws_send(socket: &mut ClientSocket, message: &WsMessage) {
        let raw = serde_json::to_string(message).expect("ws message should serialize");
        socket.send(WsFrame::Text(raw.into())).await.expect("ws message should send");
    }

    async fn ws_recv(socket: &mut ClientSocket) -> WsMessage {
        loop {
            let next = timeout(std::time::Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket frame");
            let frame =
                next.expect("websocket should remain open").expect("websocket frame should decode");

            match frame {
                WsFrame::Text(payload) => {
                    return serde_json::from_str::<WsMessage>(&payload)
                        .expect("text frame should decode as ws message");
                }
                WsFrame::Ping(payload) => {
                    socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
                }
                WsFrame::Close(frame) => panic!("websocket closed unexpectedly: {frame:?}"),
                WsFrame::Binary(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => {}
            }
        }
    }

    /// Drains the socket until the server closes it; returns the close code
    /// if the server sent one.
    async fn ws_closed(socket: &mut ClientSocket) -> Option<CloseCode> {
        loop {
            let next = timeout(std::time::Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket close");
            match next {
                Some(Ok(WsFrame::Close(frame))) => return frame.map(|frame| frame.code),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    async fn assert_silent(socket: &mut ClientSocket) {
        let next = timeout(std::time::Duration::from_millis(200), socket.next()).await;
        assert!(next.is_err(), "expected no frame, got {next:?}");
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_text(relay: &Relay, expected: &str) {
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if let Some(session) = relay.registry.session(&relay.doc_id) {
                if session.text_projection().await == expected {
                    return;
                }
            }
            assert!(Instant::now() < deadline, "document never reached {expected:?}");
            sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn update_fans_out_to_every_other_member_without_echo() {
        let relay = Relay::start().await;
        let (mut a, a_id, _) = relay.join(&relay.user(Role::Editor).await).await;
        let (mut b, b_id, _) = relay.join(&relay.user(Role::Editor).await).await;
        let (mut c, _, _) = relay.join(&relay.user(Role::Editor).await).await;

        let update = text_update(41, "hello room");
        ws_send(&mut a, &update_frame(&update)).await;

        for peer in [&mut b, &mut c] {
            match ws_recv(peer).await {
                WsMessage::Update { update_b64, origin } => {
                    assert_eq!(origin, Some(a_id));
                    assert_eq!(STANDARD.decode(update_b64).unwrap(), update);
                }
                other => panic!("expected update, got {other:?}"),
            }
        }

        // Anything echoed to A would be queued ahead of B's presence.
        ws_send(
            &mut b,
            &WsMessage::PresenceUpdate { connection_id: None, fields: serde_json::json!({"name": "B"}) },
        )
        .await;
        match ws_recv(&mut a).await {
            WsMessage::PresenceUpdate { connection_id, .. } => assert_eq!(connection_id, Some(b_id)),
            other => panic!("expected presence_update, got {other:?}"),
        }

        let session = relay.registry.session(&relay.doc_id).expect("session should be live");
        assert_eq!(session.text_projection().await, "hello room");
    }

    #[tokio::test]
    async fn viewer_update_is_refused_with_read_only_and_state_is_unchanged() {
        let relay = Relay::start().await;
        let (mut editor, _, _) = relay.join(&relay.user(Role::Editor).await).await;
        ws_send(&mut editor, &update_frame(&text_update(5, "base"))).await;
        wait_for_text(&relay, "base").await;

        let (mut viewer, _, synced) = relay.join(&relay.user(Role::Viewer).await).await;
        assert_eq!(synced, "base");
        let session = relay.registry.session(&relay.doc_id).expect("session should be live");
        let before = session.full_state().await;

        ws_send(&mut viewer, &update_frame(&text_update(6, "vandal"))).await;

        assert_eq!(
            ws_recv(&mut viewer).await,
            WsMessage::Error {
                code: "READ_ONLY".to_string(),
                message: "read-only".to_string(),
                retryable: false,
            }
        );
        assert_eq!(session.full_state().await, before);
        assert_silent(&mut editor).await;
    }

    #[tokio::test]
    async fn unauthorized_connect_is_rejected_and_never_joins_the_room() {
        let relay = Relay::start().await;
        let outsider = relay.tokens.issue_access_token(Uuid::new_v4()).unwrap();

        let mut socket = relay.connect().await;
        ws_send(&mut socket, &join_frame(&relay.doc_id, &outsider)).await;
        match ws_recv(&mut socket).await {
            WsMessage::Reject { code, .. } => assert_eq!(code, "AUTH_FORBIDDEN"),
            other => panic!("expected reject, got {other:?}"),
        }
        assert_eq!(ws_closed(&mut socket).await, Some(CloseCode::Policy));

        let mut socket = relay.connect().await;
        ws_send(&mut socket, &join_frame(&relay.doc_id, "not-a-jwt")).await;
        match ws_recv(&mut socket).await {
            WsMessage::Reject { code, .. } => assert_eq!(code, "AUTH_INVALID_TOKEN"),
            other => panic!("expected reject, got {other:?}"),
        }

        assert_eq!(relay.registry.session_count(), 0);
        assert_eq!(relay.registry.connection_count(&relay.doc_id).await, 0);
    }

    #[tokio::test]
    async fn rejoin_after_last_leave_reloads_persisted_state() {
        let relay = Relay::start().await;
        let token = relay.user(Role::Editor).await;

        let (mut socket, _, synced) = relay.join(&token).await;
        assert_eq!(synced, "");
        ws_send(&mut socket, &update_frame(&text_update(9, "update A"))).await;
        ws_send(&mut socket, &WsMessage::Leave).await;

        let registry = Arc::clone(&relay.registry);
        wait_until(|| registry.session_count() == 0).await;
        assert!(relay.backend.get(&relay.doc_id).await.is_some(), "teardown should flush");

        let (_socket, _, synced) = relay.join(&token).await;
        assert_eq!(synced, "update A");
    }

    #[tokio::test]
    async fn presence_is_relayed_and_cleared_on_leave() {
        let relay = Relay::start().await;
        let (mut a, a_id, _) = relay.join(&relay.user(Role::Viewer).await).await;
        let (mut b, _, _) = relay.join(&relay.user(Role::Editor).await).await;

        ws_send(
            &mut a,
            &WsMessage::PresenceUpdate {
                connection_id: None,
                fields: serde_json::json!({"name": "Ada", "cursor": {"index": 3}}),
            },
        )
        .await;
        match ws_recv(&mut b).await {
            WsMessage::PresenceUpdate { connection_id, fields } => {
                assert_eq!(connection_id, Some(a_id));
                assert_eq!(fields["name"], "Ada");
            }
            other => panic!("expected presence_update, got {other:?}"),
        }

        // Non-object fields are dropped silently.
        ws_send(&mut a, &WsMessage::PresenceUpdate { connection_id: None, fields: serde_json::json!(7) })
            .await;
        ws_send(&mut a, &WsMessage::Leave).await;

        assert_eq!(ws_recv(&mut b).await, WsMessage::PresenceLeft { connection_id: a_id });
    }

    #[tokio::test]
    async fn late_joiner_receives_current_presence() {
        let relay = Relay::start().await;
        let (mut a, a_id, _) = relay.join(&relay.user(Role::Editor).await).await;
        let (mut b, _, _) = relay.join(&relay.user(Role::Editor).await).await;
        ws_send(
            &mut a,
            &WsMessage::PresenceUpdate { connection_id: None, fields: serde_json::json!({"color": "#f00"}) },
        )
        .await;
        let _ = ws_recv(&mut b).await;

        let mut c = relay.connect().await;
        ws_send(&mut c, &join_frame(&relay.doc_id, &relay.user(Role::Viewer).await)).await;
        match ws_recv(&mut c).await {
            WsMessage::SyncFull { peers, role, .. } => {
                assert_eq!(role, Role::Viewer);
                assert_eq!(peers.len(), 2);
                let a_peer = peers.iter().find(|peer| peer.connection_id == a_id).unwrap();
                assert_eq!(a_peer.fields["color"], "#f00");
            }
            other => panic!("expected sync_full, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_protocol_version_is_rejected_with_upgrade_required() {
        let relay = Relay::start().await;
        let token = relay.user(Role::Editor).await;

        let mut socket = relay.connect().await;
        ws_send(
            &mut socket,
            &WsMessage::Join {
                doc_id: relay.doc_id.clone(),
                token,
                protocol_version: Some("tandem-sync.v99".into()),
                state_vector_b64: None,
            },
        )
        .await;

        match ws_recv(&mut socket).await {
            WsMessage::Reject { code, reason } => {
                assert_eq!(code, "UPGRADE_REQUIRED");
                assert!(reason.contains("tandem-sync.v99"));
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert_eq!(relay.registry.session_count(), 0);
    }

    #[tokio::test]
    async fn first_frame_must_be_join() {
        let relay = Relay::start().await;
        let mut socket = relay.connect().await;
        ws_send(&mut socket, &WsMessage::Leave).await;

        match ws_recv(&mut socket).await {
            WsMessage::Reject { code, .. } => assert_eq!(code, "SYNC_JOIN_REQUIRED"),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bearer_header_is_used_when_join_token_is_empty() {
        let relay = Relay::start().await;
        let token = relay.user(Role::Editor).await;

        let mut request = relay.url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("authorization", HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        let (mut socket, _) = connect_async(request).await.expect("websocket should connect");

        ws_send(&mut socket, &join_frame(&relay.doc_id, "")).await;
        match ws_recv(&mut socket).await {
            WsMessage::SyncFull { role, .. } => assert_eq!(role, Role::Editor),
            other => panic!("expected sync_full, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn revoked_member_is_disconnected_on_next_update() {
        let relay = Relay::start_with(Duration::ZERO).await;
        let user_id = Uuid::new_v4();
        relay.permissions.grant(relay.project_id, user_id, Role::Editor).await;
        let token = relay.tokens.issue_access_token(user_id).unwrap();
        let (mut socket, _, _) = relay.join(&token).await;

        relay.permissions.revoke(relay.project_id, user_id).await;
        ws_send(&mut socket, &update_frame(&text_update(3, "too late"))).await;

        match ws_recv(&mut socket).await {
            WsMessage::Error { code, .. } => assert_eq!(code, "AUTH_REVOKED"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(ws_closed(&mut socket).await, Some(CloseCode::Policy));

        let registry = Arc::clone(&relay.registry);
        wait_until(|| registry.session_count() == 0).await;
    }

    #[tokio::test]
    async fn undecodable_update_is_dropped_and_connection_stays_open() {
        let relay = Relay::start().await;
        let (mut a, _, _) = relay.join(&relay.user(Role::Editor).await).await;
        let (mut b, _, _) = relay.join(&relay.user(Role::Editor).await).await;

        ws_send(&mut a, &WsMessage::Update { update_b64: "%%%".into(), origin: None }).await;
        ws_send(&mut a, &update_frame(b"not a valid update")).await;
        ws_send(&mut a, &update_frame(&text_update(12, "still here"))).await;

        match ws_recv(&mut b).await {
            WsMessage::Update { update_b64, .. } => assert_eq!(decode_text(&update_b64), "still here"),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_connection() {
        let relay = Relay::start().await;
        let (mut socket, _, _) = relay.join(&relay.user(Role::Editor).await).await;

        let oversized = "a".repeat(MAX_FRAME_BYTES + 1);
        let _ = socket.send(WsFrame::Text(oversized.into())).await;

        if let Some(code) = ws_closed(&mut socket).await {
            assert_eq!(code, CloseCode::Size);
        }
        let registry = Arc::clone(&relay.registry);
        wait_until(|| registry.session_count() == 0).await;
    }

    #[test]
    fn heartbeat_timeout_is_less_than_interval() {
        assert_eq!(HEARTBEAT_INTERVAL_MS, 15_000);
        assert_eq!(HEARTBEAT_TIMEOUT_MS, 10_000);
        assert!(HEARTBEAT_TIMEOUT_MS < HEARTBEAT_INTERVAL_MS);
    }
}
