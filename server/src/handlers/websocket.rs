//! WebSocket handler for match notifications and call signaling

use std::collections::HashMap;
use std::hash::Hash;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    error::AppError,
    models::*,
    signaling::authorize_signal,
    subscriptions::Subscription,
    AppState,
};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump a subscription into this connection's outbound channel.
fn forward<K, T>(
    mut subscription: Subscription<K, T>,
    tx: mpsc::UnboundedSender<WsServerMessage>,
    wrap: fn(T) -> WsServerMessage,
) -> JoinHandle<()>
where
    K: Eq + Hash + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = subscription.recv().await {
            if tx.send(wrap(item)).is_err() {
                break;
            }
        }
    })
}

/// Per-connection state, populated once the client authenticates.
struct Connection {
    user_id: Option<String>,
    /// Match and session-status forwarders
    feeds: Vec<JoinHandle<()>>,
    /// Signal forwarders keyed by call session id
    calls: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    fn close(&mut self) {
        for feed in self.feeds.drain(..) {
            feed.abort();
        }
        for (_, call) in self.calls.drain() {
            call.abort();
        }
    }
}

fn send_error(tx: &mpsc::UnboundedSender<WsServerMessage>, err: &AppError) {
    let _ = tx.send(WsServerMessage::error(err.code(), err.to_string()));
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<WsServerMessage>();

    // Task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut conn = Connection {
        user_id: None,
        feeds: Vec::new(),
        calls: HashMap::new(),
    };

    let max_signal_bytes = (state.config.limits.max_signal_size_kb * 1024) as usize;

    while let Some(result) = ws_receiver.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
        };

        let client_msg = match serde_json::from_str::<WsClientMessage>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Failed to parse WebSocket message: {}", e);
                let _ = tx.send(WsServerMessage::error(
                    "PARSE_ERROR",
                    format!("Invalid message format: {}", e),
                ));
                continue;
            }
        };

        match client_msg {
            WsClientMessage::Authenticate { token } => {
                if conn.user_id.is_some() {
                    let _ = tx.send(WsServerMessage::error(
                        "ALREADY_AUTHENTICATED",
                        "Connection is already authenticated",
                    ));
                    continue;
                }

                match state.storage.validate_guest_session(&token).await {
                    Ok(Some(session)) => {
                        let user_id = session.user_id;
                        conn.feeds.push(forward(
                            state.matching.subscribe(&user_id),
                            tx.clone(),
                            WsServerMessage::MatchFound,
                        ));
                        conn.feeds.push(forward(
                            state.registry.subscribe(&user_id),
                            tx.clone(),
                            WsServerMessage::CallStatus,
                        ));

                        let _ = tx.send(WsServerMessage::Authenticated {
                            user_id: user_id.clone(),
                        });
                        tracing::info!("WebSocket authenticated: user={}", user_id);
                        conn.user_id = Some(user_id);
                    }
                    Ok(None) => {
                        let _ = tx.send(WsServerMessage::error(
                            "AUTH_FAILED",
                            "Invalid or expired token",
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Token validation failed: {:?}", e);
                        let _ = tx.send(WsServerMessage::error("AUTH_FAILED", "Token validation failed"));
                    }
                }
            }

            WsClientMessage::Ping => {
                let _ = tx.send(WsServerMessage::Pong);
            }

            other => {
                let Some(user_id) = conn.user_id.clone() else {
                    send_error(&tx, &AppError::Unauthorized);
                    continue;
                };
                if let Err(e) = handle_call_message(&state, &mut conn, &tx, &user_id, other, max_signal_bytes).await {
                    send_error(&tx, &e);
                }
            }
        }
    }

    // Cleanup: dropping the forwarders drops their subscriptions
    if let Some(user_id) = &conn.user_id {
        tracing::info!("WebSocket closed: user={}", user_id);
    }
    conn.close();
    send_task.abort();
}

async fn handle_call_message(
    state: &AppState,
    conn: &mut Connection,
    tx: &mpsc::UnboundedSender<WsServerMessage>,
    user_id: &str,
    msg: WsClientMessage,
    max_signal_bytes: usize,
) -> Result<(), AppError> {
    match msg {
        WsClientMessage::JoinCall { call_session_id } => {
            let session = state.registry.get(&call_session_id).await?;
            if !session.is_participant(user_id) {
                return Err(AppError::Forbidden);
            }

            if !conn.calls.contains_key(&call_session_id) {
                let handle = forward(
                    state.relay.subscribe(user_id, &call_session_id),
                    tx.clone(),
                    WsServerMessage::Signal,
                );
                conn.calls.insert(call_session_id.clone(), handle);
                tracing::debug!("User {} joined signaling for {}", user_id, call_session_id);
            }

            let _ = tx.send(WsServerMessage::Joined { call_session_id });
        }

        WsClientMessage::LeaveCall { call_session_id } => {
            if let Some(handle) = conn.calls.remove(&call_session_id) {
                handle.abort();
                tracing::debug!("User {} left signaling for {}", user_id, call_session_id);
            }
        }

        WsClientMessage::Signal(signal) => {
            let session = state.registry.get(&signal.call_session_id).await?;
            authorize_signal(&session, user_id, &signal, max_signal_bytes)?;
            state.relay.send(signal);
        }

        WsClientMessage::Authenticate { .. } | WsClientMessage::Ping => {}
    }

    Ok(())
}
