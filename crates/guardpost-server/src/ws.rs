//! Realtime connections.
//!
//! One task per socket: it forwards gateway events to the client, feeds
//! client events to the facade, and pings on an interval. A connection that
//! sends nothing (not even a pong) for the heartbeat timeout is closed, and
//! its presence released.

use std::net::SocketAddr;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use guardpost_shared::protocol::{ClientEvent, ServerEvent};
use guardpost_shared::Participant;

use crate::api::AppState;
use crate::error::ServerError;
use crate::gateway::{ConnectionHandle, ConnectionId};
use crate::identity::AuthUser;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    AuthUser(user): AuthUser,
) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state, user, peer))
}

async fn run_connection(socket: WebSocket, state: AppState, user: Participant, peer: SocketAddr) {
    let (sender, receiver) = socket.split();
    let handle = state.gateway.register(user.user_id.clone()).await;

    info!(connection = handle.id, user = %handle.user_id, peer = %peer, "Realtime connection opened");

    serve_connection(&state, &user, handle, receiver, sender).await;
}

/// Pump one registered connection until the client leaves, the gateway
/// evicts it, or it stays silent past the heartbeat timeout. Always ends
/// by unregistering, which releases the connection's presence.
async fn serve_connection<R, S, E>(
    state: &AppState,
    user: &Participant,
    mut handle: ConnectionHandle,
    mut inbound: R,
    mut outbound: S,
) where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    S: Sink<WsMessage> + Unpin,
    E: std::fmt::Display,
{
    let connection = handle.id;
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let mut ping = tokio::time::interval(state.config.heartbeat_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            frame = inbound.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        last_inbound = Instant::now();
                        match frame {
                            WsMessage::Text(text) => {
                                handle_client_event(state, connection, user, &text).await;
                            }
                            WsMessage::Close(_) => break,
                            // Pongs only refresh the heartbeat; pings are answered by axum.
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        debug!(connection, error = %e, "Socket read failed");
                        break;
                    }
                    None => break,
                }
            }
            event = handle.events.recv() => {
                // The gateway drops our sender when it evicts this connection.
                let Some(event) = event else { break };
                match event.to_text() {
                    Ok(text) => {
                        if outbound.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(connection, event = event.name(), error = %e, "Failed to encode event"),
                }
            }
            _ = ping.tick() => {
                if last_inbound.elapsed() > heartbeat_timeout {
                    info!(connection, user = %user.user_id, "Heartbeat timeout");
                    break;
                }
                if outbound.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.gateway.unregister(connection).await;
    let _ = outbound.close().await;

    info!(connection, user = %user.user_id, "Realtime connection closed");
}

/// Apply one inbound client frame. Rejections go back to this connection
/// as `error` events; they never close it.
pub(crate) async fn handle_client_event(
    state: &AppState,
    connection: ConnectionId,
    user: &Participant,
    text: &str,
) {
    let result = match ClientEvent::from_text(text) {
        Ok(event) => apply_client_event(state, connection, user, event).await,
        Err(e) => Err(ServerError::BadRequest(format!("Malformed event: {e}"))),
    };

    if let Err(err) = result {
        debug!(connection, user = %user.user_id, error = %err, "Client event rejected");
        state
            .gateway
            .send_to(connection, ServerEvent::error(err.client_message()))
            .await;
    }
}

async fn apply_client_event(
    state: &AppState,
    connection: ConnectionId,
    user: &Participant,
    event: ClientEvent,
) -> Result<(), ServerError> {
    match event {
        ClientEvent::UserOnline(user_id) => {
            if user_id != user.user_id {
                return Err(ServerError::Forbidden(
                    "userOnline must name the authenticated user".into(),
                ));
            }
            state.gateway.announce_presence(connection).await;
            Ok(())
        }
        ClientEvent::JoinConversation(conversation_id) => {
            state
                .facade
                .join_conversation(connection, user, conversation_id)
                .await
        }
        ClientEvent::MarkSeen(request) => {
            if request.user_id != user.user_id {
                return Err(ServerError::Forbidden(
                    "mark_seen must name the authenticated user".into(),
                ));
            }
            state
                .facade
                .mark_seen(user, request.conversation_id)
                .await
                .map(|_| ())
        }
    }
}
