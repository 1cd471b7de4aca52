//! The live transport binding held by a session actor.
//!
//! A `Connection` is the actor's side of one WebSocket: frames go into the
//! outbound channel and the socket task writes them out.

use bytes::Bytes;
use platewise_protocol::ServerMessage;
use tokio::sync::mpsc;
use tracing::debug;

/// Frames queued for the socket writer.
#[derive(Debug)]
pub enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
    /// Send a normal-closure close frame and stop writing.
    Close { reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    id: u64,
    outbound: mpsc::Sender<OutboundMessage>,
    state: ConnectionState,
}

impl Connection {
    pub fn new(id: u64, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id,
            outbound,
            state: ConnectionState::Open,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && !self.outbound.is_closed()
    }

    /// Queue a frame. Returns false (and marks the connection closed) if the
    /// socket writer is gone.
    pub async fn send(&mut self, message: ServerMessage) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        if self.outbound.send(OutboundMessage::Json(message)).await.is_err() {
            debug!(
                component = "connection",
                event = "connection.send_failed",
                connection_id = self.id,
                "Outbound channel closed"
            );
            self.state = ConnectionState::Closed;
            return false;
        }
        true
    }

    pub async fn close(&mut self, reason: &'static str) {
        if self.state != ConnectionState::Open {
            return;
        }
        self.state = ConnectionState::Closing;
        let _ = self.outbound.send(OutboundMessage::Close { reason }).await;
    }

    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Sender for work that pushes frames outside the actor's own calls.
    pub fn sender(&self) -> Option<mpsc::Sender<OutboundMessage>> {
        self.is_open().then(|| self.outbound.clone())
    }
}
