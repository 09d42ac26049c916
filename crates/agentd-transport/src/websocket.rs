//! WebSocket event channel: one bidirectional stream per connection.

use std::sync::Arc;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use agentd_events::{EventId, SessionId};

use crate::manager::{Attached, ConnectError, ConnectionManager, ConnectionRequest};
use crate::protocol::{ClientEnvelope, ServerEnvelope};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub manager: Arc<ConnectionManager>,
}

/// Channel-open query parameters. Reconnection is driven by the
/// client-supplied `last_event_id`.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub last_event_id: Option<EventId>,
    #[serde(default)]
    pub attempt: Option<u32>,
}

/// WebSocket upgrade handler. Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: WsState, query: WsQuery) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending envelopes to the client.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEnvelope>();
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("failed to serialize envelope: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Bind to a session: resume when the client names one, otherwise wait
    // for its opening Start envelope.
    let established = if let Some(session_id) = query.session_id {
        state
            .manager
            .reconnect(
                &query.user_id,
                session_id,
                query.last_event_id,
                query.attempt.unwrap_or(0),
            )
            .await
    } else {
        wait_for_start(&mut receiver, &state, &query.user_id).await
    };

    let Attached { connection, session, replay } = match established {
        Ok(attached) => attached,
        Err(e) => {
            let _ = tx.send(rejection(&e));
            // Let the sender drain the rejection before the socket drops.
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };
    let connection_id = connection.connection_id;

    let _ = tx.send(ServerEnvelope::Connected {
        session_id: session.id(),
        connection_id,
    });

    // Forward the replay stream (history, then live) to the client.
    let event_tx = tx.clone();
    let mut events = replay.events;
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if event_tx.send(ServerEnvelope::Event { event }).is_err() {
                break;
            }
        }
    });

    // Handle incoming envelopes until the transport closes.
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(%connection_id, "websocket error: {e}");
                break;
            }
        };

        let envelope: ClientEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%connection_id, "invalid client envelope: {e}");
                let _ = tx.send(ServerEnvelope::Error { message: format!("invalid message: {e}") });
                continue;
            }
        };

        match envelope {
            ClientEnvelope::Ping => {
                state.manager.heartbeat(connection_id).await;
                let _ = tx.send(ServerEnvelope::Pong);
            }
            ClientEnvelope::Start { .. } => {
                let _ = tx.send(ServerEnvelope::Error {
                    message: "connection is already bound to a session".to_string(),
                });
            }
            ClientEnvelope::UserMessage { content } => {
                if let Err(e) = session.post_user_message(content) {
                    report(&tx, &session, &e);
                }
            }
            ClientEnvelope::Pause => {
                if let Err(e) = session.pause() {
                    report(&tx, &session, &e);
                }
            }
            ClientEnvelope::Resume => {
                if let Err(e) = session.resume() {
                    report(&tx, &session, &e);
                }
            }
            ClientEnvelope::Confirm { approve } => {
                if let Err(e) = session.confirm(approve) {
                    report(&tx, &session, &e);
                }
            }
            ClientEnvelope::Stop => {
                session.stop().await;
            }
        }
    }

    // The transport is gone; the session stays alive for the grace window.
    state.manager.on_disconnect(connection_id).await;
    event_task.abort();
    send_task.abort();
    tracing::debug!(%connection_id, "websocket closed");
}

/// Read envelopes until the opening `Start`, then admit the connection.
async fn wait_for_start(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    state: &WsState,
    user_id: &str,
) -> Result<Attached, ConnectError> {
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        };
        match serde_json::from_str::<ClientEnvelope>(&text) {
            Ok(ClientEnvelope::Start { intent }) => {
                return state
                    .manager
                    .accept(ConnectionRequest {
                        user_id: user_id.to_string(),
                        task: agentd_session::TaskSpec::new(intent),
                    })
                    .await;
            }
            Ok(other) => {
                tracing::debug!("ignoring {other:?} before session start");
            }
            Err(e) => {
                tracing::warn!("invalid client envelope before start: {e}");
            }
        }
    }
    Err(ConnectError::HandshakeFailed)
}

/// Answer a failed session operation in-band and count it against the
/// session.
fn report(
    tx: &mpsc::UnboundedSender<ServerEnvelope>,
    session: &agentd_session::Session,
    error: &agentd_session::SessionError,
) {
    session.note_error();
    let _ = tx.send(ServerEnvelope::Error { message: error.to_string() });
}

fn rejection(error: &ConnectError) -> ServerEnvelope {
    ServerEnvelope::Rejected {
        code: error.code().to_string(),
        message: error.to_string(),
        retry_after_secs: error.retry_after().map(|d| d.as_secs()),
    }
}

/// Create the event-channel router.
///
/// # Example
/// ```ignore
/// let app = axum::Router::new().merge(create_ws_router(manager));
/// ```
#[must_use]
pub fn create_ws_router(manager: Arc<ConnectionManager>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState { manager })
}
