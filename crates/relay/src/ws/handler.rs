use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use tandem_common::protocol::ws::WsMessage;
use tokio::{
    sync::mpsc,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::protocol as ws_protocol;
use super::{WsState, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_FRAME_BYTES};
use crate::auth::gate::{bearer_token, AccessGate, GateError, MutationDecision, Principal};
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope, ErrorCode};
use crate::metrics;
use crate::protocol;
use crate::sync::{DocumentSession, Member, UpdateOutcome};

pub async fn ws_upgrade(
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    let bearer = bearer_token(&headers);

    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            let span = info_span!("relay.ws.connection", request_id = %request_id);
            with_request_id_scope(request_id, handle_socket(state, bearer, socket))
                .instrument(span)
                .await;
        },
    )
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

fn close_code_for(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::ShuttingDown => close_code::AWAY,
        ErrorCode::InternalError => close_code::ERROR,
        _ => close_code::POLICY,
    }
}

async fn close_with(socket: &mut WebSocket, code: ErrorCode) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code_for(code),
            reason: code.as_str().to_string().into(),
        })))
        .await;
}

async fn reject_and_close(socket: &mut WebSocket, code: ErrorCode, reason: impl Into<String>) {
    metrics::record_ws_frame("join", true);
    let _ = ws_protocol::send_ws_message(socket, &code.ws_reject(reason)).await;
    close_with(socket, code).await;
}

struct Joined {
    principal: Principal,
    session: Arc<DocumentSession>,
    connection_id: Uuid,
    outbound_receiver: mpsc::UnboundedReceiver<WsMessage>,
}

async fn handle_socket(state: WsState, bearer: Option<String>, mut socket: WebSocket) {
    let Some(joined) = accept_join(&state, bearer, &mut socket).await else {
        return;
    };
    let Joined { mut principal, session, connection_id, mut outbound_receiver } = joined;
    let doc_id = principal.doc_id.clone();
    let user_id = principal.user_id;

    run_connection(
        &state.gate,
        &session,
        &mut principal,
        connection_id,
        &mut outbound_receiver,
        &mut socket,
    )
    .instrument(info_span!(
        "relay.ws.session",
        doc_id = %doc_id,
        connection_id = %connection_id,
        user_id = %user_id
    ))
    .await;

    state.registry.release(&doc_id, connection_id).await;
    info!(doc_id = %doc_id, connection_id = %connection_id, "connection closed");
}

/// Reads the `join` frame, authenticates it and adds the connection to the
/// room. On any refusal the socket has been sent a `reject` and closed, and
/// the connection was never part of a room.
async fn accept_join(
    state: &WsState,
    bearer: Option<String>,
    socket: &mut WebSocket,
) -> Option<Joined> {
    let raw = match timeout(state.join_timeout, socket.recv()).await {
        Err(_) => {
            reject_and_close(socket, ErrorCode::JoinRequired, "join frame not received in time")
                .await;
            return None;
        }
        Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return None,
        Ok(Some(Err(error))) => {
            if is_frame_size_violation(&error) {
                close_frame_too_large(socket).await;
            }
            return None;
        }
        Ok(Some(Ok(Message::Text(raw)))) => raw,
        Ok(Some(Ok(_))) => {
            reject_and_close(socket, ErrorCode::JoinRequired, ErrorCode::JoinRequired.default_message())
                .await;
            return None;
        }
    };

    if raw.len() > MAX_FRAME_BYTES {
        close_frame_too_large(socket).await;
        return None;
    }

    let Ok(WsMessage::Join { doc_id, token, protocol_version, state_vector_b64 }) =
        ws_protocol::decode_message(&raw)
    else {
        reject_and_close(socket, ErrorCode::JoinRequired, ErrorCode::JoinRequired.default_message())
            .await;
        return None;
    };

    if let Err(upgrade_error) = protocol::negotiate(protocol_version.as_deref()) {
        reject_and_close(socket, upgrade_error.code(), upgrade_error.message()).await;
        return None;
    }

    let token = if token.trim().is_empty() { bearer.unwrap_or_default() } else { token };
    let principal = match state.gate.authenticate_connect(&token, &doc_id).await {
        Ok(principal) => principal,
        Err(gate_error) => {
            match &gate_error {
                GateError::Lookup(source) => {
                    error!(doc_id = %doc_id, error = ?source, "permission lookup failed on join");
                }
                _ => info!(doc_id = %doc_id, reason = %gate_error, "join refused"),
            }
            reject_and_close(socket, gate_error.code(), gate_error.to_string()).await;
            return None;
        }
    };

    if !state.gate.authorize_read(&principal) {
        reject_and_close(socket, ErrorCode::AuthForbidden, ErrorCode::AuthForbidden.default_message())
            .await;
        return None;
    }

    let state_vector = match state_vector_b64.as_deref().map(|encoded| STANDARD.decode(encoded)) {
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(decode_error)) => {
            debug!(doc_id = %doc_id, error = %decode_error, "ignoring undecodable state vector on join");
            None
        }
        None => None,
    };

    let connection_id = Uuid::new_v4();
    let (outbound, outbound_receiver) = mpsc::unbounded_channel();
    let member =
        Member { connection_id, user_id: principal.user_id, role: principal.role, outbound };

    let session = match state.registry.acquire(&doc_id, member, state_vector.as_deref()).await {
        Ok(session) => session,
        Err(registry_error) => {
            reject_and_close(socket, ErrorCode::ShuttingDown, registry_error.to_string()).await;
            return None;
        }
    };

    metrics::record_ws_frame("join", false);
    info!(
        doc_id = %doc_id,
        connection_id = %connection_id,
        user_id = %principal.user_id,
        role = %principal.role,
        "connection joined"
    );

    Some(Joined { principal, session, connection_id, outbound_receiver })
}

async fn pong_overdue(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_connection(
    gate: &AccessGate,
    session: &DocumentSession,
    principal: &mut Principal,
    connection_id: Uuid,
    outbound_receiver: &mut mpsc::UnboundedReceiver<WsMessage>,
    socket: &mut WebSocket,
) {
    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS of a ping.
    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + heartbeat_timeout);
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = pong_overdue(pong_deadline) => {
                warn!("heartbeat timeout, disconnecting");
                break;
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if ws_protocol::send_ws_message(socket, &outbound_message).await.is_err() {
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
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(socket).await;
                            break;
                        }

                        let inbound = match ws_protocol::decode_message(&raw_message) {
                            Ok(message) => message,
                            Err(decode_error) => {
                                metrics::record_ws_frame("invalid", true);
                                debug!(error = %decode_error, "invalid websocket frame payload");
                                let reply = ErrorCode::MalformedPayload
                                    .ws_error("invalid websocket frame payload");
                                if ws_protocol::send_ws_message(socket, &reply).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        match handle_frame(gate, session, principal, connection_id, inbound).await {
                            FrameAction::Continue => {}
                            FrameAction::Reply(reply) => {
                                if ws_protocol::send_ws_message(socket, &reply).await.is_err() {
                                    break;
                                }
                            }
                            FrameAction::Close(code) => {
                                let _ = ws_protocol::send_ws_message(
                                    socket,
                                    &code.ws_error(code.default_message()),
                                )
                                .await;
                                close_with(socket, code).await;
                                break;
                            }
                            FrameAction::Leave => {
                                let _ = socket.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        metrics::record_ws_frame("binary", true);
                        let reply = ErrorCode::MalformedPayload
                            .ws_error("binary frames are not supported; send JSON text frames");
                        if ws_protocol::send_ws_message(socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        pong_deadline = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }
}

enum FrameAction {
    Continue,
    Reply(WsMessage),
    /// Send an error frame with this code, then close the socket.
    Close(ErrorCode),
    Leave,
}

async fn handle_frame(
    gate: &AccessGate,
    session: &DocumentSession,
    principal: &mut Principal,
    connection_id: Uuid,
    inbound: WsMessage,
) -> FrameAction {
    let kind = ws_protocol::frame_kind(&inbound);

    let action = match inbound {
        WsMessage::Update { update_b64, .. } => {
            handle_update(gate, session, principal, connection_id, &update_b64).await
        }
        WsMessage::PresenceUpdate { fields, .. } => {
            handle_presence(gate, session, principal, connection_id, fields).await
        }
        WsMessage::Leave => FrameAction::Leave,
        WsMessage::Join { .. } => FrameAction::Reply(
            ErrorCode::ValidationFailed.ws_error("connection already joined a document"),
        ),
        WsMessage::SyncFull { .. }
        | WsMessage::Reject { .. }
        | WsMessage::PresenceLeft { .. }
        | WsMessage::Error { .. } => FrameAction::Reply(
            ErrorCode::MalformedPayload.ws_error(format!("{kind} frames are sent by the server only")),
        ),
    };

    let is_error = matches!(
        action,
        FrameAction::Close(_) | FrameAction::Reply(WsMessage::Error { .. })
    );
    metrics::record_ws_frame(kind, is_error);
    action
}

async fn handle_update(
    gate: &AccessGate,
    session: &DocumentSession,
    principal: &mut Principal,
    connection_id: Uuid,
    update_b64: &str,
) -> FrameAction {
    let role_before = principal.role;
    let decision = match gate.authorize_mutation(principal).await {
        Ok(decision) => decision,
        Err(gate_error) => {
            error!(error = ?gate_error, "role revalidation failed; update not applied");
            return FrameAction::Reply(
                ErrorCode::InternalError.ws_error("permission check failed; retry the update"),
            );
        }
    };
    if principal.role != role_before {
        session.set_role(connection_id, principal.role).await;
    }

    match decision {
        MutationDecision::Allow => {}
        MutationDecision::Deny => {
            metrics::record_update_outcome(UpdateOutcome::RejectedUnauthorized.as_str());
            return FrameAction::Reply(read_only());
        }
        MutationDecision::Revoked => return FrameAction::Close(ErrorCode::AuthRevoked),
    }

    let update_bytes = match STANDARD.decode(update_b64) {
        Ok(bytes) => bytes,
        Err(decode_error) => {
            warn!(error = %decode_error, "dropping update with invalid base64 payload");
            metrics::record_update_outcome(UpdateOutcome::RejectedMalformed.as_str());
            return FrameAction::Continue;
        }
    };

    let outcome = session.apply_update(connection_id, &update_bytes).await;
    metrics::record_update_outcome(outcome.as_str());

    match outcome {
        UpdateOutcome::Applied { broadcast_to } => {
            debug!(update_bytes = update_bytes.len(), broadcast_to, "update applied");
            FrameAction::Continue
        }
        UpdateOutcome::NoOp | UpdateOutcome::RejectedMalformed => FrameAction::Continue,
        UpdateOutcome::RejectedUnauthorized => FrameAction::Reply(read_only()),
        UpdateOutcome::UnknownConnection => {
            warn!("update from a connection no longer in the room");
            FrameAction::Leave
        }
    }
}

async fn handle_presence(
    gate: &AccessGate,
    session: &DocumentSession,
    principal: &Principal,
    connection_id: Uuid,
    fields: Value,
) -> FrameAction {
    if !gate.authorize_read(principal) {
        return FrameAction::Reply(
            ErrorCode::AuthForbidden.ws_error(ErrorCode::AuthForbidden.default_message()),
        );
    }

    match fields {
        Value::Object(fields) => {
            session.update_presence(connection_id, fields).await;
        }
        _ => debug!("dropping presence update whose fields are not an object"),
    }
    FrameAction::Continue
}

fn read_only() -> WsMessage {
    ErrorCode::ReadOnly.ws_error(ErrorCode::ReadOnly.default_message())
}
