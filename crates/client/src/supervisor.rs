//! Connection supervisor: one logical connection with reconnect-on-close.
//!
//! Every connection attempt gets a generation number. Callbacks from a
//! socket whose generation is no longer current are ignored, so a late close
//! from an old socket can never schedule a retry over a newer one.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use platewise_protocol::ClientFrame;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::message::{parse_frame, ReceivedMessage};
use crate::policy::{ReconnectPolicy, RetryState};

pub type MessageCallback = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("endpoint must be a ws:// or wss:// URL, got {0:?}")]
    InvalidEndpoint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Open,
}

struct State {
    phase: Phase,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    retry: RetryState,
    /// Set by `shutdown`, cleared by `connect`. Checked before every retry.
    shutdown: bool,
    retry_timer: Option<JoinHandle<()>>,
}

struct Inner {
    url: String,
    policy: ReconnectPolicy,
    on_message: MessageCallback,
    state: Mutex<State>,
}

/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    pub fn new(
        endpoint: &str,
        identity: &str,
        on_message: MessageCallback,
    ) -> Result<Self, ClientError> {
        Self::with_policy(endpoint, identity, ReconnectPolicy::default(), on_message)
    }

    pub fn with_policy(
        endpoint: &str,
        identity: &str,
        policy: ReconnectPolicy,
        on_message: MessageCallback,
    ) -> Result<Self, ClientError> {
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(ClientError::InvalidEndpoint(endpoint.to_string()));
        }
        let separator = if endpoint.contains('?') { '&' } else { '?' };
        let url = format!(
            "{endpoint}{separator}identity={}",
            urlencoding::encode(identity)
        );

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                policy,
                on_message,
                state: Mutex::new(State {
                    phase: Phase::Disconnected,
                    generation: 0,
                    outbound: None,
                    retry: RetryState::default(),
                    shutdown: false,
                    retry_timer: None,
                }),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Start connecting. No-op while an attempt is in flight or a connection
    /// is open. A pending retry is replaced by an immediate attempt.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut state = self.inner.lock();
        state.shutdown = false;
        if state.phase != Phase::Disconnected {
            debug!(
                component = "client",
                event = "client.connect.skipped",
                phase = ?state.phase,
                "Connect ignored; connection already active"
            );
            return;
        }
        if let Some(timer) = state.retry_timer.take() {
            timer.abort();
        }
        self.inner.start_attempt(&mut state);
    }

    /// Queue `{content, timestamp}`. Returns false when no connection is open.
    pub fn send(&self, content: &str) -> bool {
        let state = self.inner.lock();
        let Some(outbound) = state.outbound.as_ref().filter(|_| state.phase == Phase::Open) else {
            return false;
        };
        match serde_json::to_string(&ClientFrame::new(content)) {
            Ok(json) => outbound.send(WsMessage::Text(json.into())).is_ok(),
            Err(_) => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().phase == Phase::Open
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().retry.attempts()
    }

    pub fn has_pending_retry(&self) -> bool {
        self.inner
            .lock()
            .retry_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Stop for good: no retry can fire after this returns. The open socket,
    /// if any, is closed with a normal-closure code.
    pub fn shutdown(&self) {
        let outbound = {
            let mut state = self.inner.lock();
            state.shutdown = true;
            if let Some(timer) = state.retry_timer.take() {
                timer.abort();
            }
            state.phase = Phase::Disconnected;
            state.outbound.take()
        };

        if let Some(outbound) = outbound {
            let _ = outbound.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client shutdown".into(),
            })));
        }
        info!(
            component = "client",
            event = "client.shutdown",
            "Supervisor shut down"
        );
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_attempt(self: &Arc<Self>, state: &mut State) {
        state.phase = Phase::Connecting;
        state.generation += 1;
        let generation = state.generation;
        debug!(
            component = "client",
            event = "client.connect.attempt",
            generation,
            attempt = state.retry.attempts(),
            "Connecting"
        );
        tokio::spawn(Arc::clone(self).run(generation));
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let socket = match connect_async(self.url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!(
                    component = "client",
                    event = "client.connect.failed",
                    generation,
                    error = %e,
                    "Connection attempt failed"
                );
                self.on_closed(generation);
                return;
            }
        };
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        let accepted = {
            let mut state = self.lock();
            if state.generation != generation || state.shutdown {
                false
            } else {
                state.phase = Phase::Open;
                state.retry.on_open();
                state.outbound = Some(outbound_tx);
                true
            }
        };
        if !accepted {
            let _ = ws_tx
                .send(WsMessage::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "stale attempt".into(),
                })))
                .await;
            return;
        }
        info!(
            component = "client",
            event = "client.connected",
            generation,
            "Connected"
        );

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if ws_tx.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    if let Some(message) = parse_frame(text.as_str()) {
                        (self.on_message)(message);
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    debug!(
                        component = "client",
                        event = "client.close_frame",
                        generation,
                        frame = ?frame,
                        "Server closed the connection"
                    );
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        component = "client",
                        event = "client.transport_error",
                        generation,
                        error = %e,
                        "Transport error"
                    );
                    break;
                }
            }
        }

        writer.abort();
        self.on_closed(generation);
    }

    fn on_closed(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.phase = Phase::Disconnected;
        state.outbound = None;
        if state.shutdown {
            return;
        }

        match state.retry.on_close(&self.policy) {
            Some(delay) => {
                info!(
                    component = "client",
                    event = "client.retry.scheduled",
                    attempt = state.retry.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect scheduled"
                );
                let inner = Arc::clone(self);
                state.retry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.retry_now();
                }));
            }
            None => warn!(
                component = "client",
                event = "client.retry.exhausted",
                attempts = state.retry.attempts(),
                "Reconnect attempts exhausted; call connect() to try again"
            ),
        }
    }

    fn retry_now(self: &Arc<Self>) {
        let mut state = self.lock();
        state.retry_timer = None;
        if state.shutdown || state.phase != Phase::Disconnected {
            return;
        }
        self.start_attempt(&mut state);
    }
}
