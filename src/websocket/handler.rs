use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::protocol::{close_code, ClientMessage, OutboundMessage, ServerMessage};
use crate::ratelimit::{RateLimitContext, RateLimitDecision, RuleAction};
use crate::registry::ConnectionHandle;
use crate::server::AppState;

const CHANNEL_BUFFER_SIZE: usize = 64;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler. Authentication happens after the upgrade so
/// failures can be reported as a structured frame before closing.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let token = extract_token(&query, &headers);
    let client_info = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    ws.on_upgrade(move |socket| handle_socket(socket, state, token, addr, client_info))
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    None
}

/// Send one frame and a close frame directly on an unregistered socket.
async fn reject_socket(socket: WebSocket, frame: ServerMessage, code: u16, reason: &str) {
    let (mut ws_sender, _) = socket.split();
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }
    let _ = ws_sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Handle an established WebSocket connection
#[tracing::instrument(name = "ws.connection", skip_all, fields(remote_addr = %addr, otel.kind = "server"))]
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    token: Option<String>,
    addr: SocketAddr,
    client_info: Option<String>,
) {
    // No token means anonymous; a presented token must validate.
    let identity = match token {
        None => None,
        Some(token) => match state.jwt_validator.as_deref() {
            Some(validator) => match validator.validate(&token) {
                Ok(claims) => Some(claims.identity().to_string()),
                Err(e) => {
                    tracing::warn!(error = %e, "JWT validation failed");
                    reject_socket(
                        socket,
                        ServerMessage::auth_error("AUTH_FAILED", "Invalid authentication token"),
                        close_code::AUTH_FAILURE,
                        "authentication failed",
                    )
                    .await;
                    return;
                }
            },
            None => {
                reject_socket(
                    socket,
                    ServerMessage::auth_error("AUTH_DISABLED", "Token authentication is not configured"),
                    close_code::AUTH_FAILURE,
                    "authentication not configured",
                )
                .await;
                return;
            }
        },
    };

    let connection_start = std::time::Instant::now();
    let (tx, rx) = mpsc::channel::<OutboundMessage>(CHANNEL_BUFFER_SIZE);

    let handle = match state.registry.register(
        identity,
        Some(addr.ip().to_string()),
        client_info,
        tx,
    ) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(error = %e, "Connection rejected at capacity gate");
            reject_socket(
                socket,
                ServerMessage::error("CAPACITY_EXCEEDED", e.to_string()),
                close_code::CAPACITY,
                "server at capacity",
            )
            .await;
            return;
        }
    };
    let connection_id = handle.id;

    crate::metrics::WS_CONNECTIONS_OPENED.inc();

    tracing::info!(
        connection_id = %connection_id,
        identity = handle.identity.as_deref().unwrap_or("anonymous"),
        "WebSocket connection established"
    );

    let (ws_sender, mut ws_receiver) = socket.split();

    // Writer task: the single writer for this socket, preserving
    // per-connection order. A Close instruction ends it; so does channel
    // closure once the connection has been unregistered.
    let send_task = tokio::spawn(run_writer(rx, ws_sender, Arc::downgrade(&handle)));

    // Read loop: every frame passes the rate limiter before dispatch.
    let state_clone = state.clone();
    let handle_clone = handle.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &state_clone, &handle_clone).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
        }
        _ = recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
        }
    }

    state.registry.unregister(connection_id);
    crate::metrics::WS_CONNECTIONS_CLOSED.inc();

    tracing::info!(
        connection_id = %connection_id,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}

/// Drain the outbound channel into the socket. Holds only a weak
/// reference to the connection, so once the read side has unregistered
/// and released its handles the channel closes and this loop ends with
/// it; a strong reference here would keep the sender alive forever.
async fn run_writer<S>(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut sink: S,
    handle: Weak<ConnectionHandle>,
) where
    S: Sink<Message> + Unpin,
{
    while let Some(msg) = rx.recv().await {
        if let OutboundMessage::Close { code, reason } = msg {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            break;
        }

        let text = match msg.to_json() {
            Ok(Some(t)) => t,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                continue;
            }
        };

        let bytes = text.len();
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
        if let Some(conn) = handle.upgrade() {
            conn.record_outbound(bytes);
        }
    }
}

/// Process a received WebSocket message.
/// Returns false if the connection should be closed.
async fn process_message(msg: Message, state: &AppState, handle: &Arc<ConnectionHandle>) -> bool {
    match msg {
        Message::Text(text) => {
            handle.update_activity();
            handle.record_inbound(text.len());

            // The limiter sees every text frame, malformed ones included;
            // a flood of garbage spends budget like any other traffic.
            let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
            let channel = parsed.as_ref().ok().and_then(message_channel);
            match check_rate_limit(channel, state, handle).await {
                RateGate::Pass => {}
                RateGate::Drop => return true,
                RateGate::Close => return false,
            }

            match parsed {
                Ok(client_msg) => handle_client_message(client_msg, state, handle).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client message");
                    let _ = handle
                        .send(ServerMessage::error("INVALID_MESSAGE", e.to_string()))
                        .await;
                }
            }
            true
        }
        Message::Binary(_) => {
            let _ = handle
                .send(ServerMessage::error(
                    "UNSUPPORTED_FORMAT",
                    "Binary messages are not supported",
                ))
                .await;
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            handle.update_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

/// The channel a message addresses, for channel-scoped rules.
fn message_channel(msg: &ClientMessage) -> Option<&str> {
    match msg {
        ClientMessage::Subscribe { channel }
        | ClientMessage::Unsubscribe { channel }
        | ClientMessage::PublishChannel { channel, .. } => Some(channel.as_str()),
        _ => None,
    }
}

/// Outcome of the per-frame rate limit gate.
enum RateGate {
    Pass,
    /// Rejected: the frame is dropped, the connection stays open.
    Drop,
    /// Rejected by a disconnect-action rule: close the connection.
    Close,
}

/// Run the rate limiter for one inbound frame. A rejected frame never
/// reaches dispatch; the client gets the limiter's reply instead.
async fn check_rate_limit(
    channel: Option<&str>,
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
) -> RateGate {
    let decision = state.limiter.check(&RateLimitContext {
        connection_id: handle.id,
        identity: handle.identity.as_deref(),
        ip: handle.remote_addr.as_deref(),
        channel,
    });

    match decision {
        RateLimitDecision::Allowed => RateGate::Pass,
        RateLimitDecision::Rejected {
            rule_id,
            action,
            retry_after_seconds,
        } => {
            tracing::debug!(
                connection_id = %handle.id,
                rule_id = %rule_id,
                action = ?action,
                "Message rejected by rate limiter"
            );

            match action {
                RuleAction::Throttle | RuleAction::Block => {
                    let frame = match retry_after_seconds {
                        Some(retry) => ServerMessage::error_with_retry(
                            "RATE_LIMITED",
                            "Message rate limit exceeded",
                            retry,
                        ),
                        None => ServerMessage::error("RATE_LIMITED", "Message rate limit exceeded"),
                    };
                    let _ = handle.send(frame).await;
                    RateGate::Drop
                }
                RuleAction::Disconnect => {
                    let _ = handle
                        .send_preserialized(OutboundMessage::Close {
                            code: close_code::RATE_LIMITED,
                            reason: "rate limit exceeded".to_string(),
                        })
                        .await;
                    RateGate::Close
                }
            }
        }
    }
}

/// Handle a parsed client message
#[tracing::instrument(
    name = "ws.message",
    skip(state, handle),
    fields(connection_id = %handle.id, message_type = ?msg)
)]
async fn handle_client_message(msg: ClientMessage, state: &AppState, handle: &Arc<ConnectionHandle>) {
    match msg {
        ClientMessage::Ping => {
            crate::metrics::record_ws_message("ping");
            let _ = handle.send(ServerMessage::pong()).await;
        }
        ClientMessage::Subscribe { channel } => {
            crate::metrics::record_ws_message("subscribe");
            if let Err(e) = state.channels.subscribe_to_channel(handle.id, &channel).await {
                let _ = handle
                    .send(ServerMessage::error("SUBSCRIBE_FAILED", e.to_string()))
                    .await;
            }
        }
        ClientMessage::Unsubscribe { channel } => {
            crate::metrics::record_ws_message("unsubscribe");
            if let Err(e) = state
                .channels
                .unsubscribe_from_channel(handle.id, &channel)
                .await
            {
                let _ = handle
                    .send(ServerMessage::error("UNSUBSCRIBE_FAILED", e.to_string()))
                    .await;
            }
        }
        ClientMessage::JoinRoom { room } => {
            crate::metrics::record_ws_message("join_room");
            if let Err(e) = state.channels.join_room(handle.id, &room).await {
                let _ = handle
                    .send(ServerMessage::error("JOIN_FAILED", e.to_string()))
                    .await;
            }
        }
        ClientMessage::LeaveRoom { room } => {
            crate::metrics::record_ws_message("leave_room");
            if let Err(e) = state.channels.leave_room(handle.id, &room).await {
                let _ = handle
                    .send(ServerMessage::error("LEAVE_FAILED", e.to_string()))
                    .await;
            }
        }
        ClientMessage::PublishChannel { channel, payload } => {
            crate::metrics::record_ws_message("publish_channel");
            if let Err(e) = state.channels.publish_to_channel(&channel, payload).await {
                let _ = handle
                    .send(ServerMessage::error("PUBLISH_FAILED", e.to_string()))
                    .await;
            }
        }
        ClientMessage::PublishRoom { room, payload } => {
            crate::metrics::record_ws_message("publish_room");
            if let Err(e) = state.channels.publish_to_room(&room, payload).await {
                let _ = handle
                    .send(ServerMessage::error("PUBLISH_FAILED", e.to_string()))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bus::LocalBus;
    use crate::config::Settings;
    use crate::ratelimit::{RateLimitRule, RuleScope};
    use crate::registry::{ConnectionLimits, ConnectionRegistry};

    fn test_state(rules: Vec<RateLimitRule>) -> AppState {
        let mut settings = Settings {
            server: Default::default(),
            jwt: Default::default(),
            bus: Default::default(),
            realtime: Default::default(),
            ratelimit: Default::default(),
            otel: Default::default(),
        };
        settings.ratelimit.rules = rules;
        AppState::new(settings, Arc::new(LocalBus::new())).unwrap()
    }

    fn rule(limit: u32, action: RuleAction) -> RateLimitRule {
        RateLimitRule {
            id: "per-user".to_string(),
            scope: RuleScope::User,
            target: None,
            limit,
            window_seconds: 60,
            action,
            enabled: true,
        }
    }

    fn ws_text(s: &str) -> Message {
        Message::Text(s.to_string().into())
    }

    #[tokio::test]
    async fn test_writer_ends_once_connection_is_released() {
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits::default()));
        let (tx, rx) = mpsc::channel(8);
        let handle = registry
            .register(Some("u1".to_string()), None, None, tx)
            .unwrap();

        let (sink, _frames) = futures::channel::mpsc::unbounded();
        let writer = tokio::spawn(run_writer(rx, sink, Arc::downgrade(&handle)));

        // The read side is done: unregister and drop the last strong handle.
        registry.unregister(handle.id);
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should exit once the connection is released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_writer_records_outbound_counters() {
        let registry = Arc::new(ConnectionRegistry::new(ConnectionLimits::default()));
        let (tx, rx) = mpsc::channel(8);
        let handle = registry
            .register(Some("u1".to_string()), None, None, tx)
            .unwrap();

        let (sink, mut frames) = futures::channel::mpsc::unbounded();
        let writer = tokio::spawn(run_writer(rx, sink, Arc::downgrade(&handle)));

        handle.send(ServerMessage::pong()).await.unwrap();
        handle
            .send_preserialized(OutboundMessage::Close {
                code: close_code::ADMIN_CLOSE,
                reason: "done".to_string(),
            })
            .await
            .unwrap();
        writer.await.unwrap();

        use std::sync::atomic::Ordering;
        assert_eq!(handle.messages_sent.load(Ordering::Relaxed), 1);
        assert!(handle.bytes_sent.load(Ordering::Relaxed) > 0);
        assert!(matches!(frames.try_next(), Ok(Some(Message::Text(_)))));
        assert!(matches!(frames.try_next(), Ok(Some(Message::Close(_)))));
    }

    #[tokio::test]
    async fn test_malformed_frames_consume_rate_limit_budget() {
        let state = test_state(vec![rule(1, RuleAction::Throttle)]);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = state
            .registry
            .register(Some("u1".to_string()), None, None, tx)
            .unwrap();

        // The first garbage frame spends the only token and gets a parse error.
        assert!(process_message(ws_text("not json"), &state, &handle).await);
        match rx.try_recv().unwrap() {
            OutboundMessage::Raw(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, "INVALID_MESSAGE");
            }
            other => panic!("expected parse error frame, got {:?}", other),
        }

        // The second is rejected by the limiter before any parse reply.
        assert!(process_message(ws_text("still not json"), &state, &handle).await);
        match rx.try_recv().unwrap() {
            OutboundMessage::Raw(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, "RATE_LIMITED");
            }
            other => panic!("expected rate limit frame, got {:?}", other),
        }
        // The dropped frame produced no parse reply.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_throttled_message_is_not_dispatched() {
        let state = test_state(vec![rule(1, RuleAction::Throttle)]);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = state
            .registry
            .register(Some("u1".to_string()), None, None, tx)
            .unwrap();

        assert!(process_message(ws_text(r#"{"type":"ping"}"#), &state, &handle).await);
        match rx.try_recv().unwrap() {
            OutboundMessage::Raw(ServerMessage::Pong { .. }) => {}
            other => panic!("expected pong, got {:?}", other),
        }

        // A second ping is over the limit: the client gets the limiter's
        // reply and no pong.
        assert!(process_message(ws_text(r#"{"type":"ping"}"#), &state, &handle).await);
        match rx.try_recv().unwrap() {
            OutboundMessage::Raw(ServerMessage::Error { code, .. }) => {
                assert_eq!(code, "RATE_LIMITED");
            }
            other => panic!("expected rate limit frame, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_rule_applies_to_malformed_flood() {
        let state = test_state(vec![rule(1, RuleAction::Disconnect)]);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = state
            .registry
            .register(Some("u1".to_string()), None, None, tx)
            .unwrap();

        assert!(process_message(ws_text("not json"), &state, &handle).await);
        let _ = rx.try_recv();

        // Over the limit with a disconnect-action rule: the connection must
        // close even though the frame never parsed.
        assert!(!process_message(ws_text("not json"), &state, &handle).await);
        match rx.try_recv().unwrap() {
            OutboundMessage::Close { code, .. } => assert_eq!(code, close_code::RATE_LIMITED),
            other => panic!("expected close instruction, got {:?}", other),
        }
    }
}
