//! WebSocket handling

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, OutboundMessage};
use crate::session_command::{DetachCause, SessionCommand};
use crate::state::SessionRegistry;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// A missing identity is treated as the empty identity.
    #[serde(default)]
    pub identity: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params.identity, state))
}

/// Pump one socket: frames in go to the identity's actor, frames out come
/// from the actor through the connection's outbound channel.
async fn handle_socket(socket: WebSocket, identity: String, state: Arc<SessionRegistry>) {
    let conn_id = state.next_connection_id();
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        identity = %identity,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                OutboundMessage::Close { reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: Utf8Bytes::from_static(reason),
                        })))
                        .await;
                    break;
                }
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let actor = state.get_or_spawn(&identity);
    actor
        .send(SessionCommand::Attach {
            connection: Connection::new(conn_id, outbound_tx.clone()),
        })
        .await;

    let mut cause = DetachCause::Closed;
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                actor
                    .send(SessionCommand::Inbound {
                        connection_id: conn_id,
                        text: text.as_str().to_owned(),
                    })
                    .await;
            }
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                cause = DetachCause::Error(e.to_string());
                break;
            }
        }
    }

    actor
        .send(SessionCommand::Detach {
            connection_id: conn_id,
            cause,
        })
        .await;
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        identity = %identity,
        "WebSocket connection closed"
    );
    send_task.abort();
}
