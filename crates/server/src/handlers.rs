//! Handler chain for inbound user messages.
//!
//! Handlers are a closed set evaluated in registration order. The first one
//! whose `can_handle` returns true produces the sole response; the rest are
//! never consulted. Errors and panics from matching or handling are caught
//! here and turned into an apology, so a bad turn never takes the
//! connection down.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use platewise_protocol::Message;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::command::{is_command, parse_command, CommandType, ParsedCommand};
use crate::conversation::ConversationContext;
use crate::db::StoreError;
use crate::generation::{TextGenerator, TextStream};
use crate::nutrition::{MealAnalysis, NutritionScorer};
use crate::profile::{Goals, MealEntry, Profile};
use crate::store::IdentityStateStore;

pub const NO_HANDLER_TEXT: &str = "No handler available for that message.";
pub const UNKNOWN_COMMAND_TEXT: &str = "Unknown command. Type /help to see what I can do.";
pub const GENERATION_APOLOGY: &str =
    "Sorry, I couldn't come up with a reply just now. Please try again in a moment.";
pub const HANDLER_APOLOGY: &str = "Sorry, something went wrong while handling that.";

/// Number of context messages handed to the text generator.
pub const CONTEXT_WINDOW: usize = 10;

pub const HELP_TEXT: &str = "Commands:
/analyze <meal>     estimate nutrition for a meal and log it
/recommend [hint]   suggest what to eat next
/goals <targets>    e.g. /goals calories 2000 protein 120 vegetarian
/history [n]        show your last n logged meals
/help               this list
Anything else is a conversation with your coach.";

/// Everything a handler may touch during one turn.
#[derive(Clone)]
pub struct TurnContext {
    pub store: IdentityStateStore,
    pub generator: Arc<dyn TextGenerator>,
    pub scorer: Arc<dyn NutritionScorer>,
    /// Prefer incremental output where a handler supports it.
    pub streaming: bool,
}

pub enum HandlerOutcome {
    Reply(Message),
    /// Incremental reply; the caller persists it via
    /// [`ConversationHandler::complete_stream`] once the stream finishes.
    Stream(TextStream),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("Invalid command payload: {0}")]
    InvalidPayload(String),
}

/// Result of walking the chain.
pub enum Dispatched {
    Handled(HandlerOutcome),
    /// Matching or handling failed; send the apology, keep the connection.
    Failed { apology: Message },
    /// No handler claimed the message.
    Unhandled,
}

pub enum Handler {
    Command(CommandHandler),
    Conversation(ConversationHandler),
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Handler::Command(_) => "command",
            Handler::Conversation(_) => "conversation",
        }
    }

    pub fn can_handle(&self, message: &Message) -> bool {
        match self {
            Handler::Command(h) => h.can_handle(message),
            Handler::Conversation(h) => h.can_handle(message),
        }
    }

    pub async fn handle(
        &self,
        message: &Message,
        ctx: &TurnContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        match self {
            Handler::Command(h) => h.handle(message, ctx).await.map(HandlerOutcome::Reply),
            Handler::Conversation(h) => h.handle(message, ctx).await,
        }
    }
}

pub struct HandlerChain {
    handlers: Vec<Handler>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Handler>) -> Self {
        Self { handlers }
    }

    /// Command matcher ahead of the conversational fallback.
    pub fn standard() -> Self {
        Self::new(vec![
            Handler::Command(CommandHandler),
            Handler::Conversation(ConversationHandler),
        ])
    }

    pub async fn dispatch(&self, message: &Message, ctx: &TurnContext) -> Dispatched {
        let attempt = AssertUnwindSafe(async {
            let Some(handler) = self.handlers.iter().find(|h| h.can_handle(message)) else {
                return Ok(None);
            };
            debug!(
                component = "dispatch",
                event = "dispatch.matched",
                identity = %ctx.store.identity(),
                handler = handler.name(),
                message_id = %message.id,
                "Handler matched"
            );
            handler.handle(message, ctx).await.map(Some)
        })
        .catch_unwind()
        .await;

        match attempt {
            Ok(Ok(Some(outcome))) => Dispatched::Handled(outcome),
            Ok(Ok(None)) => Dispatched::Unhandled,
            Ok(Err(e)) => {
                warn!(
                    component = "dispatch",
                    event = "dispatch.handler_failed",
                    identity = %ctx.store.identity(),
                    error = %e,
                    "Handler failed"
                );
                Dispatched::Failed {
                    apology: apology(&e.to_string()),
                }
            }
            Err(panic) => {
                let detail = panic_detail(panic.as_ref());
                error!(
                    component = "dispatch",
                    event = "dispatch.handler_panicked",
                    identity = %ctx.store.identity(),
                    panic = %detail,
                    "Handler panicked"
                );
                Dispatched::Failed {
                    apology: apology(&detail),
                }
            }
        }
    }
}

fn apology(detail: &str) -> Message {
    Message::assistant(format!("{HANDLER_APOLOGY} ({detail})"))
}

pub(crate) fn panic_detail(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unexpected panic".to_string()
    }
}

// -- Command handler --

pub struct CommandHandler;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzePayload {
    #[serde(default)]
    meal_description: String,
}

#[derive(Deserialize)]
struct RecommendPayload {
    #[serde(default)]
    hint: Option<String>,
}

#[derive(Deserialize)]
struct HistoryPayload {
    limit: usize,
}

fn payload<T: DeserializeOwned>(command: &ParsedCommand) -> Result<T, HandlerError> {
    serde_json::from_value(command.payload.clone()).map_err(|e| {
        HandlerError::InvalidPayload(format!("{}: {e}", command.command_type.as_str()))
    })
}

impl CommandHandler {
    pub fn can_handle(&self, message: &Message) -> bool {
        is_command(&message.content)
    }

    pub async fn handle(&self, message: &Message, ctx: &TurnContext) -> Result<Message, HandlerError> {
        let Some(command) = parse_command(&message.content) else {
            return Ok(Message::assistant(UNKNOWN_COMMAND_TEXT));
        };
        debug!(
            component = "dispatch",
            event = "command.parsed",
            identity = %ctx.store.identity(),
            command = command.command_type.as_str(),
            "Parsed command"
        );

        let text = match &command.command_type {
            CommandType::AnalyzeMeal => {
                let p: AnalyzePayload = payload(&command)?;
                analyze_meal(ctx, p.meal_description.trim()).await?
            }
            CommandType::Recommend => {
                let p: RecommendPayload = payload(&command)?;
                recommend(ctx, p.hint.as_deref()).await?
            }
            CommandType::SetGoals => {
                let goals: Goals = payload(&command)?;
                set_goals(ctx, goals).await?
            }
            CommandType::GetHistory => {
                let p: HistoryPayload = payload(&command)?;
                history(ctx, p.limit).await?
            }
            CommandType::Help => HELP_TEXT.to_string(),
            CommandType::Unknown(_) => UNKNOWN_COMMAND_TEXT.to_string(),
        };
        Ok(Message::assistant(text))
    }
}

async fn analyze_meal(ctx: &TurnContext, description: &str) -> Result<String, HandlerError> {
    if description.is_empty() {
        return Ok("Tell me what you ate, e.g. /analyze oatmeal with berries".into());
    }

    let mut profile: Profile = ctx.store.load_or_create().await?;
    let analysis = ctx.scorer.analyze(description, &profile.goals);
    let text = describe_analysis(description, &analysis);
    profile.record_meal(MealEntry::new(description, Some(analysis)));
    ctx.store.store(&profile).await?;
    Ok(text)
}

fn describe_analysis(description: &str, analysis: &MealAnalysis) -> String {
    let mut text = format!(
        "{description}: about {} kcal, {} g protein, {} g carbs, {} g fat. Score {}/100.",
        analysis.calories,
        analysis.protein_grams,
        analysis.carbs_grams,
        analysis.fat_grams,
        analysis.score
    );
    for note in &analysis.notes {
        text.push('\n');
        text.push_str(note);
    }
    text
}

async fn recommend(ctx: &TurnContext, hint: Option<&str>) -> Result<String, HandlerError> {
    let profile: Profile = ctx.store.load_or_create().await?;
    let recs = ctx.scorer.recommend(&profile, hint);
    if recs.is_empty() {
        return Ok("I don't have a suggestion right now. Log a few meals first.".into());
    }

    let lines: Vec<String> = recs
        .iter()
        .map(|r| format!("- {}: {}", r.title, r.reason))
        .collect();
    Ok(format!("Here's what I'd suggest:\n{}", lines.join("\n")))
}

async fn set_goals(ctx: &TurnContext, goals: Goals) -> Result<String, HandlerError> {
    if goals.is_empty() {
        return Ok(
            "I couldn't find any goals in that. Try: /goals calories 2000 protein 120 vegetarian"
                .into(),
        );
    }

    let mut profile: Profile = ctx.store.load_or_create().await?;
    profile.update_goals(goals);
    ctx.store.store(&profile).await?;
    Ok(format!("Goals updated: {}.", profile.goals.describe()))
}

async fn history(ctx: &TurnContext, limit: usize) -> Result<String, HandlerError> {
    let profile: Profile = ctx.store.load_or_create().await?;
    let entries = profile.recent_history(limit);
    if entries.is_empty() {
        return Ok("No meals logged yet.".into());
    }

    let lines: Vec<String> = entries
        .iter()
        .map(|entry| match &entry.analysis {
            Some(a) => format!("- {} ({} kcal)", entry.description, a.calories),
            None => format!("- {}", entry.description),
        })
        .collect();
    Ok(format!("Your last {} meals:\n{}", entries.len(), lines.join("\n")))
}

// -- Conversational fallback --

pub struct ConversationHandler;

impl ConversationHandler {
    /// Claims everything; registration order keeps commands away from it.
    pub fn can_handle(&self, _message: &Message) -> bool {
        true
    }

    pub async fn handle(
        &self,
        message: &Message,
        ctx: &TurnContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        let mut context: ConversationContext = ctx.store.load_or_create().await?;
        context.push(message.clone());
        ctx.store.store(&context).await?;

        let profile: Profile = ctx.store.load_or_create().await?;
        let prompt = system_prompt(&profile.goals);
        let history = context.recent(CONTEXT_WINDOW);

        if ctx.streaming {
            let started = ctx.generator.stream_generate(&prompt, history).await;
            return match started {
                Ok(stream) => Ok(HandlerOutcome::Stream(stream)),
                Err(e) => {
                    log_generation_failure(ctx, &e);
                    Ok(HandlerOutcome::Reply(Message::assistant(GENERATION_APOLOGY)))
                }
            };
        }

        let generated = ctx.generator.generate(&prompt, history).await;
        match generated {
            Ok(text) => {
                let reply = Message::assistant(text);
                context.push(reply.clone());
                ctx.store.store(&context).await?;
                Ok(HandlerOutcome::Reply(reply))
            }
            Err(e) => {
                log_generation_failure(ctx, &e);
                Ok(HandlerOutcome::Reply(Message::assistant(GENERATION_APOLOGY)))
            }
        }
    }

    /// Persist the full text of a finished stream as one assistant message.
    pub async fn complete_stream(
        store: &IdentityStateStore,
        text: String,
    ) -> Result<Message, HandlerError> {
        let mut context: ConversationContext = store.load_or_create().await?;
        let reply = Message::assistant(text);
        context.push(reply.clone());
        store.store(&context).await?;
        Ok(reply)
    }
}

fn log_generation_failure(ctx: &TurnContext, e: &crate::generation::GenerationError) {
    warn!(
        component = "dispatch",
        event = "generation.failed",
        identity = %ctx.store.identity(),
        error = %e,
        "Text generation failed"
    );
}

fn system_prompt(goals: &Goals) -> String {
    format!(
        "You are Platewise, a friendly nutrition coach. Keep answers short and practical. \
         The user's current goals: {}.",
        goals.describe()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::generation::testing::ScriptedGenerator;
    use crate::generation::GenerationError;
    use crate::nutrition::KeywordScorer;
    use async_trait::async_trait;
    use futures::StreamExt;
    use platewise_protocol::MessageRole;

    fn turn_ctx(generator: Arc<dyn TextGenerator>, streaming: bool) -> TurnContext {
        TurnContext {
            store: IdentityStateStore::new(Db::open_in_memory().unwrap(), "u1"),
            generator,
            scorer: Arc::new(KeywordScorer),
            streaming,
        }
    }

    fn expect_reply(dispatched: Dispatched) -> Message {
        match dispatched {
            Dispatched::Handled(HandlerOutcome::Reply(message)) => message,
            Dispatched::Handled(HandlerOutcome::Stream(_)) => panic!("expected reply, got stream"),
            Dispatched::Failed { apology } => panic!("handler failed: {}", apology.content),
            Dispatched::Unhandled => panic!("unhandled"),
        }
    }

    #[tokio::test]
    async fn analyze_command_logs_meal_and_skips_generator() {
        let generator = Arc::new(ScriptedGenerator::replying(&["should not be used"]));
        let ctx = turn_ctx(generator.clone(), false);
        let chain = HandlerChain::standard();

        let reply = expect_reply(
            chain
                .dispatch(&Message::user("analyze oatmeal with berries"), &ctx)
                .await,
        );

        assert_eq!(reply.role, MessageRole::Assistant);
        assert!(reply.content.contains("210 kcal"), "{}", reply.content);
        assert!(generator.calls.lock().unwrap().is_empty());

        let profile: Profile = ctx.store.load().await.unwrap().unwrap();
        assert_eq!(profile.history.len(), 1);
        assert_eq!(profile.history[0].description, "oatmeal with berries");
        // Command turns stay out of the conversation context.
        assert!(ctx.store.load::<ConversationContext>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prefixed_command_never_reaches_fallback() {
        let generator = Arc::new(ScriptedGenerator::replying(&["chat"]));
        let ctx = turn_ctx(generator.clone(), false);

        let reply = expect_reply(
            HandlerChain::standard()
                .dispatch(&Message::user("/help tell me something"), &ctx)
                .await,
        );
        assert_eq!(reply.content, HELP_TEXT);
        assert!(generator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_gets_fixed_reply() {
        let ctx = turn_ctx(Arc::new(ScriptedGenerator::replying(&["x"])), false);
        let reply = expect_reply(
            HandlerChain::standard()
                .dispatch(&Message::user("/juggle"), &ctx)
                .await,
        );
        assert_eq!(reply.content, UNKNOWN_COMMAND_TEXT);
    }

    #[tokio::test]
    async fn set_goals_then_history_round_trip() {
        let ctx = turn_ctx(Arc::new(ScriptedGenerator::replying(&["x"])), false);
        let chain = HandlerChain::standard();

        let reply = expect_reply(
            chain
                .dispatch(&Message::user("/goals calories 2100 protein 130"), &ctx)
                .await,
        );
        assert_eq!(reply.content, "Goals updated: 2100 kcal/day, 130 g protein.");

        let reply = expect_reply(chain.dispatch(&Message::user("show history"), &ctx).await);
        assert_eq!(reply.content, "No meals logged yet.");

        chain
            .dispatch(&Message::user("/analyze salmon and rice"), &ctx)
            .await;
        let reply = expect_reply(chain.dispatch(&Message::user("/history"), &ctx).await);
        assert!(reply.content.contains("salmon and rice (480 kcal)"), "{}", reply.content);
    }

    #[tokio::test]
    async fn conversation_uses_recent_context_and_goals() {
        let generator = Arc::new(ScriptedGenerator::replying(&["Drink water."]));
        let ctx = turn_ctx(generator.clone(), false);
        let mut profile: Profile = ctx.store.load_or_create().await.unwrap();
        profile.update_goals(Goals {
            daily_calories: Some(1900),
            ..Default::default()
        });
        ctx.store.store(&profile).await.unwrap();

        let chain = HandlerChain::standard();
        for i in 0..7 {
            chain
                .dispatch(&Message::user(format!("question {i}")), &ctx)
                .await;
        }

        {
            let calls = generator.calls.lock().unwrap();
            let (prompt, history) = calls.last().unwrap();
            assert!(prompt.contains("1900 kcal/day"));
            assert_eq!(history.len(), CONTEXT_WINDOW);
            assert_eq!(history.last().unwrap().content, "question 6");
        }

        let context: ConversationContext = ctx.store.load().await.unwrap().unwrap();
        assert_eq!(context.messages.len(), 14);
        assert_eq!(context.messages[13].content, "Drink water.");
    }

    #[tokio::test]
    async fn generation_failure_becomes_apology_and_keeps_user_message() {
        let ctx = turn_ctx(Arc::new(ScriptedGenerator::failing("boom")), false);
        let reply = expect_reply(
            HandlerChain::standard()
                .dispatch(&Message::user("hello"), &ctx)
                .await,
        );
        assert_eq!(reply.content, GENERATION_APOLOGY);

        let context: ConversationContext = ctx.store.load().await.unwrap().unwrap();
        assert_eq!(context.messages.len(), 1);
        assert_eq!(context.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn streaming_returns_chunks_and_persists_on_completion() {
        let ctx = turn_ctx(Arc::new(ScriptedGenerator::replying(&["Eat ", "greens"])), true);
        let dispatched = HandlerChain::standard()
            .dispatch(&Message::user("what now?"), &ctx)
            .await;
        let Dispatched::Handled(HandlerOutcome::Stream(stream)) = dispatched else {
            panic!("expected stream");
        };

        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.concat(), "Eat greens");

        let reply = ConversationHandler::complete_stream(&ctx.store, chunks.concat())
            .await
            .unwrap();
        let context: ConversationContext = ctx.store.load().await.unwrap().unwrap();
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[1].id, reply.id);
    }

    struct PanickingGenerator;

    #[async_trait]
    impl TextGenerator for PanickingGenerator {
        async fn generate(&self, _: &str, _: &[Message]) -> Result<String, GenerationError> {
            panic!("generator exploded");
        }

        async fn stream_generate(&self, _: &str, _: &[Message]) -> Result<TextStream, GenerationError> {
            panic!("generator exploded");
        }
    }

    #[tokio::test]
    async fn panic_in_handler_becomes_apology_with_detail() {
        let ctx = turn_ctx(Arc::new(PanickingGenerator), false);
        let dispatched = HandlerChain::standard()
            .dispatch(&Message::user("hi"), &ctx)
            .await;

        let Dispatched::Failed { apology } = dispatched else {
            panic!("expected failure");
        };
        assert_eq!(apology.role, MessageRole::Assistant);
        assert!(apology.content.starts_with(HANDLER_APOLOGY));
        assert!(apology.content.contains("generator exploded"));
    }

    #[tokio::test]
    async fn chain_without_fallback_reports_unhandled() {
        let ctx = turn_ctx(Arc::new(ScriptedGenerator::replying(&["x"])), false);
        let chain = HandlerChain::new(vec![Handler::Command(CommandHandler)]);
        assert!(matches!(
            chain.dispatch(&Message::user("just chatting"), &ctx).await,
            Dispatched::Unhandled
        ));
    }
}
