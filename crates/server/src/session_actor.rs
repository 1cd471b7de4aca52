//! Session actor: one per identity, processes commands sequentially.
//!
//! Each actor runs as an independent tokio task and exclusively owns its
//! identity's live connection, record store and scheduled-task store.
//! Frames, closes, alarm sweeps and API calls all arrive on one mpsc
//! channel, so nothing for an identity ever runs concurrently. Lock-free
//! reads go through `ArcSwap`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::{FutureExt, StreamExt};
use platewise_protocol::{now_millis, ClientFrame, Message, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::alarm::Alarm;
use crate::connection::Connection;
use crate::db::{Db, StoreError};
use crate::generation::{TextGenerator, TextStream};
use crate::handlers::{
    panic_detail, ConversationHandler, Dispatched, HandlerChain, HandlerOutcome, TurnContext,
    HANDLER_APOLOGY, NO_HANDLER_TEXT,
};
use crate::nutrition::NutritionScorer;
use crate::profile::Profile;
use crate::reminders::ReminderRunner;
use crate::scheduler::ScheduledTaskStore;
use crate::session_command::{DetachCause, SessionCommand};
use crate::store::IdentityStateStore;

pub const WELCOME_TEXT: &str =
    "Connected to Platewise. Describe a meal, ask for suggestions, or type /help.";
pub const SUPERSEDED_TEXT: &str =
    "This session was opened from another connection; closing this one.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorPhase {
    /// No connection bound.
    Idle,
    Connected,
    /// A turn is in flight.
    Dispatching,
    /// The actor loop has exited.
    Closed,
}

#[derive(Debug, Clone)]
pub struct ActorSnapshot {
    pub identity: String,
    pub phase: ActorPhase,
    pub connection_id: Option<u64>,
    pub turns: u64,
    pub alarm_at: Option<u64>,
    /// When the actor last finished a command.
    pub last_active: u64,
}

/// Shared collaborators every actor is built with.
#[derive(Clone)]
pub struct ActorDeps {
    pub db: Db,
    pub generator: Arc<dyn TextGenerator>,
    pub scorer: Arc<dyn NutritionScorer>,
    pub chain: Arc<HandlerChain>,
    pub streaming: bool,
}

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    pub identity: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<ActorSnapshot>>,
}

impl SessionActorHandle {
    pub fn spawn(identity: impl Into<String>, deps: ActorDeps) -> SessionActorHandle {
        let identity = identity.into();
        let (command_tx, command_rx) = mpsc::channel(256);
        let snapshot = Arc::new(ArcSwap::from_pointee(ActorSnapshot {
            identity: identity.clone(),
            phase: ActorPhase::Idle,
            connection_id: None,
            turns: 0,
            alarm_at: None,
            last_active: now_millis(),
        }));

        let actor = SessionActor {
            store: IdentityStateStore::new(deps.db.clone(), identity.clone()),
            tasks: ScheduledTaskStore::new(
                deps.db.clone(),
                identity.clone(),
                Alarm::new(command_tx.downgrade()),
            ),
            identity: identity.clone(),
            deps,
            connection: None,
            phase: ActorPhase::Idle,
            turns: 0,
            snapshot: Arc::clone(&snapshot),
        };
        tokio::spawn(actor.run(command_rx));

        SessionActorHandle {
            identity,
            command_tx,
            snapshot,
        }
    }

    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: SessionCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "session_actor",
                identity = %self.identity,
                "Actor channel closed, command dropped"
            );
        }
    }

    /// Send a query built around a oneshot reply and await the answer.
    /// `None` if the actor is gone.
    pub async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(build(reply_tx)).await;
        reply_rx.await.ok()
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<ActorSnapshot> {
        self.snapshot.load_full()
    }

    /// A handle whose actor has already exited.
    #[cfg(test)]
    pub(crate) fn exited(identity: &str) -> SessionActorHandle {
        let (command_tx, _) = mpsc::channel(1);
        SessionActorHandle {
            identity: identity.to_string(),
            command_tx,
            snapshot: Arc::new(ArcSwap::from_pointee(ActorSnapshot {
                identity: identity.to_string(),
                phase: ActorPhase::Closed,
                connection_id: None,
                turns: 0,
                alarm_at: None,
                last_active: now_millis(),
            })),
        }
    }

    /// False once the actor loop has exited, for whatever reason.
    pub fn is_alive(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Whether the registry can drop this handle: no connection, nothing
    /// queued, quiet since `cutoff`, and no clone held outside the caller.
    /// The loop ends once the last sender is dropped.
    pub fn is_evictable(&self, cutoff: u64) -> bool {
        if !self.is_alive() {
            return true;
        }
        // One count for the actor, one for this handle.
        let unshared = Arc::strong_count(&self.snapshot) <= 2;
        let snap = self.snapshot.load();
        unshared
            && snap.phase == ActorPhase::Idle
            && snap.alarm_at.is_none()
            && snap.last_active <= cutoff
    }
}

struct SessionActor {
    identity: String,
    deps: ActorDeps,
    store: IdentityStateStore,
    tasks: ScheduledTaskStore,
    connection: Option<Connection>,
    phase: ActorPhase,
    turns: u64,
    snapshot: Arc<ArcSwap<ActorSnapshot>>,
}

impl SessionActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        self.start().await;
        self.publish();

        while let Some(cmd) = command_rx.recv().await {
            // Keep the future on the heap; turns can be deep.
            Box::pin(self.handle(cmd)).await;
            self.publish();
        }

        self.phase = ActorPhase::Closed;
        self.publish();
        debug!(
            component = "session_actor",
            event = "actor.stopped",
            identity = %self.identity,
            "Session actor stopped"
        );
    }

    /// Settle tasks a previous process left running and arm the alarm for
    /// whatever is queued. Overdue tasks fire right away.
    async fn start(&mut self) {
        if let Err(e) = self.tasks.recover_interrupted().await {
            warn!(
                component = "session_actor",
                event = "actor.recover_failed",
                identity = %self.identity,
                error = %e,
                "Failed to recover interrupted tasks"
            );
        }
        match self.tasks.rearm().await {
            Ok(next_due) => debug!(
                component = "session_actor",
                event = "actor.started",
                identity = %self.identity,
                next_due = ?next_due,
                "Session actor started"
            ),
            Err(e) => warn!(
                component = "session_actor",
                event = "actor.rearm_failed",
                identity = %self.identity,
                error = %e,
                "Failed to arm alarm"
            ),
        }
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        debug!(
            component = "session_actor",
            event = "actor.command",
            identity = %self.identity,
            command = cmd.kind(),
            "Handling command"
        );
        match cmd {
            SessionCommand::Attach { connection } => self.attach(connection).await,
            SessionCommand::Inbound {
                connection_id,
                text,
            } => self.inbound(connection_id, text).await,
            SessionCommand::Detach {
                connection_id,
                cause,
            } => self.detach(connection_id, cause),
            SessionCommand::Alarm => self.sweep().await,

            SessionCommand::ScheduleTask {
                task_name,
                payload,
                due_at,
                reply,
            } => {
                let _ = reply.send(self.tasks.schedule(&task_name, payload, due_at).await);
            }
            SessionCommand::TaskStatus { task_id, reply } => {
                let _ = reply.send(self.tasks.status(&task_id).await);
            }
            SessionCommand::CancelTask { task_id, reply } => {
                let _ = reply.send(self.tasks.cancel(&task_id).await);
            }
            SessionCommand::RetryTask { task_id, reply } => {
                let runner = self.reminder_runner();
                let _ = reply.send(self.tasks.retry(&task_id, &runner).await);
            }

            SessionCommand::GetProfile { reply } => {
                let _ = reply.send(self.store.load_or_create::<Profile>().await);
            }
            SessionCommand::UpdateGoals { goals, reply } => {
                let result = async {
                    let mut profile: Profile = self.store.load_or_create().await?;
                    profile.update_goals(goals);
                    self.store.store(&profile).await?;
                    Ok::<_, StoreError>(profile)
                }
                .await;
                let _ = reply.send(result);
            }
            SessionCommand::ListRecords {
                prefix,
                limit,
                reply,
            } => {
                let _ = reply.send(self.store.list(&prefix, limit).await);
            }
            SessionCommand::DeleteRecord { key, reply } => {
                let _ = reply.send(self.store.delete(&key).await);
            }
        }
    }

    async fn attach(&mut self, connection: Connection) {
        if let Some(mut previous) = self.connection.take() {
            info!(
                component = "session_actor",
                event = "connection.superseded",
                identity = %self.identity,
                previous_connection_id = previous.id(),
                connection_id = connection.id(),
                "Connection superseded"
            );
            previous.send(ServerMessage::system(SUPERSEDED_TEXT)).await;
            previous.close("superseded").await;
        }

        info!(
            component = "session_actor",
            event = "connection.attached",
            identity = %self.identity,
            connection_id = connection.id(),
            "Connection attached"
        );
        self.connection = Some(connection);
        self.phase = ActorPhase::Connected;
        self.emit(ServerMessage::system(WELCOME_TEXT)).await;
    }

    fn detach(&mut self, connection_id: u64, cause: DetachCause) {
        let is_current = self
            .connection
            .as_ref()
            .is_some_and(|c| c.id() == connection_id);
        if !is_current {
            debug!(
                component = "session_actor",
                event = "connection.detach_ignored",
                identity = %self.identity,
                connection_id,
                "Detach for a connection that is no longer bound"
            );
            return;
        }

        match &cause {
            DetachCause::Closed => info!(
                component = "session_actor",
                event = "connection.detached",
                identity = %self.identity,
                connection_id,
                "Connection closed"
            ),
            DetachCause::Error(error) => warn!(
                component = "session_actor",
                event = "connection.errored",
                identity = %self.identity,
                connection_id,
                error = %error,
                "Connection errored"
            ),
        }
        if let Some(mut connection) = self.connection.take() {
            connection.mark_closed();
        }
        self.phase = ActorPhase::Idle;
    }

    async fn inbound(&mut self, connection_id: u64, text: String) {
        if self.connection.as_ref().map(Connection::id) != Some(connection_id) {
            debug!(
                component = "session_actor",
                event = "frame.stale_connection",
                identity = %self.identity,
                connection_id,
                "Dropping frame from an unbound connection"
            );
            return;
        }

        let message = inbound_message(&text);
        self.phase = ActorPhase::Dispatching;
        self.publish();

        let ctx = self.turn_context();
        let chain = Arc::clone(&self.deps.chain);
        match chain.dispatch(&message, &ctx).await {
            Dispatched::Handled(HandlerOutcome::Reply(reply)) => {
                self.emit(ServerMessage::message(&reply)).await;
            }
            Dispatched::Handled(HandlerOutcome::Stream(stream)) => {
                self.stream_reply(stream).await;
            }
            Dispatched::Failed { apology } => {
                self.emit(ServerMessage::message(&apology)).await;
            }
            Dispatched::Unhandled => {
                self.emit(ServerMessage::error(NO_HANDLER_TEXT)).await;
            }
        }

        self.turns += 1;
        self.phase = if self.connection.is_some() {
            ActorPhase::Connected
        } else {
            ActorPhase::Idle
        };
    }

    /// Relay a handler's stream as start/chunk/end frames, then persist the
    /// full text. A dropped connection only stops delivery; the stream is
    /// still drained so the reply is saved. A chunk that errors or panics
    /// ends the turn without persisting anything.
    async fn stream_reply(&mut self, mut stream: TextStream) {
        self.emit(ServerMessage::stream_start()).await;

        let mut full = String::new();
        loop {
            let polled = AssertUnwindSafe(stream.next()).catch_unwind().await;
            let failure = match polled {
                Ok(None) => break,
                Ok(Some(Ok(text))) => {
                    full.push_str(&text);
                    self.emit(ServerMessage::stream_chunk(text)).await;
                    continue;
                }
                Ok(Some(Err(e))) => {
                    warn!(
                        component = "session_actor",
                        event = "stream.failed",
                        identity = %self.identity,
                        error = %e,
                        "Stream failed mid-reply; not persisting"
                    );
                    format!("The reply was interrupted: {e}")
                }
                Err(panic) => {
                    let detail = panic_detail(panic.as_ref());
                    error!(
                        component = "session_actor",
                        event = "stream.panicked",
                        identity = %self.identity,
                        panic = %detail,
                        "Stream panicked mid-reply; not persisting"
                    );
                    format!("{HANDLER_APOLOGY} ({detail})")
                }
            };
            self.emit(ServerMessage::stream_end()).await;
            self.emit(ServerMessage::error(failure)).await;
            return;
        }

        self.emit(ServerMessage::stream_end()).await;
        if let Err(e) = ConversationHandler::complete_stream(&self.store, full).await {
            warn!(
                component = "session_actor",
                event = "stream.persist_failed",
                identity = %self.identity,
                error = %e,
                "Failed to persist streamed reply"
            );
        }
    }

    async fn sweep(&mut self) {
        let runner = self.reminder_runner();
        match self.tasks.sweep(&runner).await {
            Ok(report) => {
                if !report.completed.is_empty() || !report.failed.is_empty() {
                    info!(
                        component = "session_actor",
                        event = "alarm.swept",
                        identity = %self.identity,
                        completed = report.completed.len(),
                        failed = report.failed.len(),
                        next_due = ?report.next_due,
                        "Swept due tasks"
                    );
                }
            }
            Err(e) => warn!(
                component = "session_actor",
                event = "alarm.sweep_failed",
                identity = %self.identity,
                error = %e,
                "Sweep failed"
            ),
        }
    }

    fn reminder_runner(&self) -> ReminderRunner {
        ReminderRunner::new(
            self.store.clone(),
            Arc::clone(&self.deps.scorer),
            self.connection.as_ref().and_then(Connection::sender),
        )
    }

    fn turn_context(&self) -> TurnContext {
        TurnContext {
            store: self.store.clone(),
            generator: Arc::clone(&self.deps.generator),
            scorer: Arc::clone(&self.deps.scorer),
            streaming: self.deps.streaming,
        }
    }

    /// Send to the bound connection, if any. Delivery failures are not errors.
    async fn emit(&mut self, message: ServerMessage) {
        if let Some(connection) = self.connection.as_mut() {
            connection.send(message).await;
        }
    }

    fn publish(&self) {
        self.snapshot.store(Arc::new(ActorSnapshot {
            identity: self.identity.clone(),
            phase: self.phase,
            connection_id: self.connection.as_ref().map(Connection::id),
            turns: self.turns,
            alarm_at: self.tasks.alarm_at(),
            last_active: now_millis(),
        }));
    }
}

/// Structured frames carry the content; anything else is taken verbatim.
/// The server stamps the time either way.
fn inbound_message(text: &str) -> Message {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => Message::user(frame.content),
        Err(_) => Message::user(text),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use platewise_protocol::MessageRole;
    use serde_json::json;

    use super::*;
    use crate::connection::OutboundMessage;
    use crate::conversation::ConversationContext;
    use crate::generation::testing::ScriptedGenerator;
    use crate::handlers::{CommandHandler, Handler};
    use crate::nutrition::KeywordScorer;
    use crate::scheduler::{TaskError, TaskState};

    fn deps(db: Db, generator: ScriptedGenerator, streaming: bool) -> ActorDeps {
        ActorDeps {
            db,
            generator: Arc::new(generator),
            scorer: Arc::new(KeywordScorer),
            chain: Arc::new(HandlerChain::standard()),
            streaming,
        }
    }

    async fn attach(actor: &SessionActorHandle, id: u64) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(32);
        actor
            .send(SessionCommand::Attach {
                connection: Connection::new(id, tx),
            })
            .await;
        rx
    }

    async fn next_json(rx: &mut mpsc::Receiver<OutboundMessage>) -> ServerMessage {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(OutboundMessage::Json(message))) => message,
            other => panic!("expected JSON frame, got {other:?}"),
        }
    }

    /// Round-trip a query so every earlier command has been handled and published.
    async fn settle(actor: &SessionActorHandle) {
        actor
            .request(|reply| SessionCommand::ListRecords {
                prefix: String::new(),
                limit: 1,
                reply,
            })
            .await
            .unwrap()
            .unwrap();
    }

    async fn inbound(actor: &SessionActorHandle, connection_id: u64, text: &str) {
        actor
            .send(SessionCommand::Inbound {
                connection_id,
                text: text.to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn attach_sends_welcome_and_analyze_replies_as_assistant() {
        let db = Db::open_in_memory().unwrap();
        let actor = SessionActorHandle::spawn("u1", deps(db, ScriptedGenerator::replying(&["x"]), false));
        let mut rx = attach(&actor, 1).await;

        assert!(matches!(
            next_json(&mut rx).await,
            ServerMessage::System { content, .. } if content == WELCOME_TEXT
        ));

        inbound(&actor, 1, r#"{"content":"analyze oatmeal with berries","timestamp":1}"#).await;
        match next_json(&mut rx).await {
            ServerMessage::Message { role, content, .. } => {
                assert_eq!(role, MessageRole::Assistant);
                assert!(content.contains("210 kcal"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        settle(&actor).await;
        let snap = actor.snapshot();
        assert_eq!(snap.phase, ActorPhase::Connected);
        assert_eq!(snap.turns, 1);
        assert_eq!(snap.connection_id, Some(1));
    }

    #[tokio::test]
    async fn raw_text_frames_are_treated_as_user_content() {
        let db = Db::open_in_memory().unwrap();
        let generator = ScriptedGenerator::replying(&["Sure."]);
        let actor = SessionActorHandle::spawn("u1", deps(db.clone(), generator, false));
        let mut rx = attach(&actor, 1).await;
        next_json(&mut rx).await;

        inbound(&actor, 1, "not json at all").await;
        next_json(&mut rx).await;

        let store = IdentityStateStore::new(db, "u1");
        let context: ConversationContext = store.load().await.unwrap().unwrap();
        assert_eq!(context.messages[0].content, "not json at all");
        assert_eq!(context.messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn streaming_turn_emits_start_chunks_end_and_persists() {
        let db = Db::open_in_memory().unwrap();
        let generator = ScriptedGenerator::replying(&["Try ", "lentils."]);
        let actor = SessionActorHandle::spawn("u1", deps(db.clone(), generator, true));
        let mut rx = attach(&actor, 1).await;
        next_json(&mut rx).await;

        inbound(&actor, 1, "what's a good dinner?").await;
        assert!(matches!(next_json(&mut rx).await, ServerMessage::StreamStart { .. }));
        assert!(matches!(
            next_json(&mut rx).await,
            ServerMessage::StreamChunk { content, .. } if content == "Try "
        ));
        assert!(matches!(
            next_json(&mut rx).await,
            ServerMessage::StreamChunk { content, .. } if content == "lentils."
        ));
        assert!(matches!(next_json(&mut rx).await, ServerMessage::StreamEnd { .. }));

        // The next command only runs after the streamed reply is persisted.
        settle(&actor).await;
        let store = IdentityStateStore::new(db, "u1");
        let context: ConversationContext = store.load().await.unwrap().unwrap();
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[1].content, "Try lentils.");
    }

    #[tokio::test]
    async fn stream_error_mid_reply_ends_stream_and_keeps_only_user_message() {
        let db = Db::open_in_memory().unwrap();
        let generator = ScriptedGenerator::breaking_after(&["par"], "upstream reset");
        let actor = SessionActorHandle::spawn("u1", deps(db.clone(), generator, true));
        let mut rx = attach(&actor, 1).await;
        next_json(&mut rx).await;

        inbound(&actor, 1, "dinner ideas?").await;
        assert!(matches!(next_json(&mut rx).await, ServerMessage::StreamStart { .. }));
        assert!(matches!(
            next_json(&mut rx).await,
            ServerMessage::StreamChunk { content, .. } if content == "par"
        ));
        assert!(matches!(next_json(&mut rx).await, ServerMessage::StreamEnd { .. }));
        assert!(matches!(
            next_json(&mut rx).await,
            ServerMessage::Error { content, .. } if content.contains("upstream reset")
        ));

        settle(&actor).await;
        let store = IdentityStateStore::new(db, "u1");
        let context: ConversationContext = store.load().await.unwrap().unwrap();
        assert_eq!(context.messages.len(), 1);
        assert_eq!(context.messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn panicking_stream_is_contained_and_actor_keeps_serving() {
        let db = Db::open_in_memory().unwrap();
        let generator = ScriptedGenerator::panicking_after(&["par"], "decoder bug");
        let actor = SessionActorHandle::spawn("u1", deps(db.clone(), generator, true));
        let mut rx = attach(&actor, 1).await;
        next_json(&mut rx).await;

        inbound(&actor, 1, "dinner ideas?").await;
        assert!(matches!(next_json(&mut rx).await, ServerMessage::StreamStart { .. }));
        assert!(matches!(next_json(&mut rx).await, ServerMessage::StreamChunk { .. }));
        assert!(matches!(next_json(&mut rx).await, ServerMessage::StreamEnd { .. }));
        match next_json(&mut rx).await {
            ServerMessage::Error { content, .. } => {
                assert!(content.starts_with(HANDLER_APOLOGY));
                assert!(content.contains("decoder bug"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        inbound(&actor, 1, "/help").await;
        assert!(matches!(next_json(&mut rx).await, ServerMessage::Message { .. }));
        assert!(actor.is_alive());

        let store = IdentityStateStore::new(db, "u1");
        let context: ConversationContext = store.load().await.unwrap().unwrap();
        assert_eq!(context.messages.len(), 1);
    }

    #[tokio::test]
    async fn second_connection_supersedes_first() {
        let db = Db::open_in_memory().unwrap();
        let actor = SessionActorHandle::spawn("u1", deps(db, ScriptedGenerator::replying(&["x"]), false));
        let mut first = attach(&actor, 1).await;
        next_json(&mut first).await;

        let mut second = attach(&actor, 2).await;
        assert!(matches!(
            next_json(&mut first).await,
            ServerMessage::System { content, .. } if content == SUPERSEDED_TEXT
        ));
        assert!(matches!(
            first.recv().await,
            Some(OutboundMessage::Close { reason: "superseded" })
        ));
        next_json(&mut second).await;

        // A late detach from the old socket leaves the new binding alone.
        actor
            .send(SessionCommand::Detach {
                connection_id: 1,
                cause: DetachCause::Closed,
            })
            .await;
        inbound(&actor, 1, "/help").await;
        inbound(&actor, 2, "/help").await;
        assert!(matches!(next_json(&mut second).await, ServerMessage::Message { .. }));
        settle(&actor).await;
        assert_eq!(actor.snapshot().connection_id, Some(2));
        assert_eq!(actor.snapshot().turns, 1);
    }

    #[tokio::test]
    async fn detach_returns_to_idle_and_keeps_state() {
        let db = Db::open_in_memory().unwrap();
        let actor = SessionActorHandle::spawn("u1", deps(db, ScriptedGenerator::replying(&["x"]), false));
        let mut rx = attach(&actor, 1).await;
        next_json(&mut rx).await;
        inbound(&actor, 1, "/goals calories 1800").await;
        next_json(&mut rx).await;

        actor
            .send(SessionCommand::Detach {
                connection_id: 1,
                cause: DetachCause::Error("reset by peer".into()),
            })
            .await;
        let profile = actor
            .request(|reply| SessionCommand::GetProfile { reply })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.goals.daily_calories, Some(1800));
        assert_eq!(actor.snapshot().phase, ActorPhase::Idle);
        assert_eq!(actor.snapshot().connection_id, None);
    }

    #[tokio::test]
    async fn chain_without_match_sends_error_frame() {
        let db = Db::open_in_memory().unwrap();
        let mut deps = deps(db, ScriptedGenerator::replying(&["x"]), false);
        deps.chain = Arc::new(HandlerChain::new(vec![Handler::Command(CommandHandler)]));
        let actor = SessionActorHandle::spawn("u1", deps);
        let mut rx = attach(&actor, 1).await;
        next_json(&mut rx).await;

        inbound(&actor, 1, "hello").await;
        assert!(matches!(
            next_json(&mut rx).await,
            ServerMessage::Error { content, .. } if content == NO_HANDLER_TEXT
        ));
    }

    #[tokio::test]
    async fn overdue_task_fires_without_a_connection() {
        let db = Db::open_in_memory().unwrap();
        let actor = SessionActorHandle::spawn(
            "u1",
            deps(db.clone(), ScriptedGenerator::replying(&["x"]), false),
        );

        let task_id = actor
            .request(|reply| SessionCommand::ScheduleTask {
                task_name: "meal-reminder".into(),
                payload: json!({"meal": "breakfast"}),
                due_at: now_millis() - 1000,
                reply,
            })
            .await
            .unwrap()
            .unwrap();

        let mut state = TaskState::Pending;
        for _ in 0..50 {
            state = actor
                .request(|reply| SessionCommand::TaskStatus {
                    task_id: task_id.clone(),
                    reply,
                })
                .await
                .unwrap()
                .unwrap()
                .state;
            if state == TaskState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, TaskState::Completed);

        let store = IdentityStateStore::new(db, "u1");
        let context: ConversationContext = store.load().await.unwrap().unwrap();
        assert_eq!(context.messages[0].id, format!("task-{task_id}"));
    }

    #[tokio::test]
    async fn cancel_completed_task_is_a_conflict() {
        let db = Db::open_in_memory().unwrap();
        let actor = SessionActorHandle::spawn("u1", deps(db, ScriptedGenerator::replying(&["x"]), false));
        let task_id = actor
            .request(|reply| SessionCommand::ScheduleTask {
                task_name: "goal-check-in".into(),
                payload: json!({}),
                due_at: now_millis() - 1000,
                reply,
            })
            .await
            .unwrap()
            .unwrap();
        actor.send(SessionCommand::Alarm).await;

        let result = actor
            .request(|reply| SessionCommand::CancelTask {
                task_id: task_id.clone(),
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(result, Err(TaskError::StateConflict { .. })));
    }

    #[tokio::test]
    async fn restarted_actor_rehydrates_alarm_from_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platewise.db");
        let due = now_millis() + 3_600_000;
        {
            let db = Db::open(&path).unwrap();
            let actor =
                SessionActorHandle::spawn("u1", deps(db, ScriptedGenerator::replying(&["x"]), false));
            actor
                .request(|reply| SessionCommand::ScheduleTask {
                    task_name: "daily-summary".into(),
                    payload: json!({}),
                    due_at: due,
                    reply,
                })
                .await
                .unwrap()
                .unwrap();
        }

        let db = Db::open(&path).unwrap();
        let actor = SessionActorHandle::spawn("u1", deps(db, ScriptedGenerator::replying(&["x"]), false));
        settle(&actor).await;
        assert_eq!(actor.snapshot().alarm_at, Some(due));
    }

    #[tokio::test]
    async fn handler_failure_keeps_connection_usable() {
        let db = Db::open_in_memory().unwrap();
        // A record from a newer build makes profile loading fail.
        let store = IdentityStateStore::new(db.clone(), "u1");
        store.save("profile", 99, "{}".into()).await.unwrap();

        let actor = SessionActorHandle::spawn("u1", deps(db, ScriptedGenerator::replying(&["x"]), false));
        let mut rx = attach(&actor, 1).await;
        next_json(&mut rx).await;

        inbound(&actor, 1, "/analyze toast").await;
        match next_json(&mut rx).await {
            ServerMessage::Message { role, content, .. } => {
                assert_eq!(role, MessageRole::Assistant);
                assert!(content.starts_with(HANDLER_APOLOGY));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        inbound(&actor, 1, "/help").await;
        assert!(matches!(next_json(&mut rx).await, ServerMessage::Message { .. }));
    }
}
