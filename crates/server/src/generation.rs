//! Text generation via an OpenAI-compatible chat completions API.
//!
//! The conversational handler only sees the [`TextGenerator`] trait. No
//! timeout is applied to calls; a hung request stalls only the identity
//! that issued it.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use platewise_protocol::{Message, MessageRole};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::config::GenerationConfig;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Text generation is not configured (set OPENAI_API_KEY)")]
    NotConfigured,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Empty response from model")]
    EmptyResponse,

    #[error("Malformed stream event: {0}")]
    Stream(String),
}

/// Lazy, finite, non-restartable sequence of text chunks.
pub type TextStream = BoxStream<'static, Result<String, GenerationError>>;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// `prompt` is the system instruction; `history` is the conversation tail, oldest first.
    async fn generate(&self, prompt: &str, history: &[Message]) -> Result<String, GenerationError>;

    async fn stream_generate(
        &self,
        prompt: &str,
        history: &[Message],
    ) -> Result<TextStream, GenerationError>;
}

/// Stand-in used when no API key is available.
pub struct Unconfigured;

#[async_trait]
impl TextGenerator for Unconfigured {
    async fn generate(&self, _: &str, _: &[Message]) -> Result<String, GenerationError> {
        Err(GenerationError::NotConfigured)
    }

    async fn stream_generate(&self, _: &str, _: &[Message]) -> Result<TextStream, GenerationError> {
        Err(GenerationError::NotConfigured)
    }
}

pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiGenerator {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, GenerationError> {
        let resp = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, prompt: &str, history: &[Message]) -> Result<String, GenerationError> {
        let body = request_body(&self.model, prompt, history, false);
        let json: Value = self.post(&body).await?.json().await?;
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();

        if text.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(text)
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        history: &[Message],
    ) -> Result<TextStream, GenerationError> {
        let body = request_body(&self.model, prompt, history, true);
        let resp = self.post(&body).await?;
        Ok(sse_text_stream(resp.bytes_stream()).boxed())
    }
}

/// Pick the generator for this process.
pub fn from_config(config: &GenerationConfig) -> std::sync::Arc<dyn TextGenerator> {
    match config.api_key.clone().filter(|k| !k.is_empty()) {
        Some(key) => std::sync::Arc::new(OpenAiGenerator::new(
            key,
            config.model.clone(),
            config.base_url.clone(),
        )),
        None => {
            warn!(
                component = "generation",
                event = "generation.unconfigured",
                "No OPENAI_API_KEY set; conversational replies will fall back to an apology"
            );
            std::sync::Arc::new(Unconfigured)
        }
    }
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

fn request_body(model: &str, prompt: &str, history: &[Message], stream: bool) -> Value {
    let mut messages = vec![json!({"role": "system", "content": prompt})];
    messages.extend(
        history
            .iter()
            .map(|m| json!({"role": role_name(m.role), "content": m.content})),
    );

    json!({
        "model": model,
        "temperature": 0.6,
        "max_tokens": 600,
        "stream": stream,
        "messages": messages,
    })
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Text(String),
    Done,
    Skip,
}

/// Interpret one line of a chat-completions event stream.
fn parse_sse_line(line: &str) -> Result<SseLine, GenerationError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        // Blank keep-alives, comments and `event:` lines carry no text.
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let event: Value =
        serde_json::from_str(data).map_err(|e| GenerationError::Stream(e.to_string()))?;
    match event["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Ok(SseLine::Text(text.to_string())),
        _ => Ok(SseLine::Skip),
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

struct SseState {
    bytes: ByteStream,
    buffer: Vec<u8>,
    finished: bool,
}

impl SseState {
    /// Pop the next complete line, if the buffer holds one.
    fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

fn sse_text_stream<S>(bytes: S) -> impl Stream<Item = Result<String, GenerationError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(line) = state.next_line() {
                match parse_sse_line(&line) {
                    Ok(SseLine::Text(text)) => return Some((Ok(text), state)),
                    Ok(SseLine::Skip) => continue,
                    Ok(SseLine::Done) => return None,
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(GenerationError::Http(e)), state));
                }
                None => {
                    // Flush a final unterminated line.
                    state.finished = true;
                    if state.buffer.is_empty() {
                        return None;
                    }
                    let line = String::from_utf8_lossy(&state.buffer).into_owned();
                    state.buffer.clear();
                    return match parse_sse_line(&line) {
                        Ok(SseLine::Text(text)) => Some((Ok(text), state)),
                        Ok(_) => None,
                        Err(e) => Some((Err(e), state)),
                    };
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::task::Poll;

    use super::*;

    /// What a scripted stream does after its last chunk.
    enum Tail {
        End,
        Fail(String),
        Panic(String),
    }

    /// Generator with a canned answer that records what it was asked.
    pub struct ScriptedGenerator {
        reply: Result<Vec<String>, String>,
        tail: Tail,
        pub calls: Mutex<Vec<(String, Vec<Message>)>>,
    }

    impl ScriptedGenerator {
        /// Replies with `chunks` (concatenated for `generate`).
        pub fn replying(chunks: &[&str]) -> Self {
            Self {
                reply: Ok(chunks.iter().map(|c| c.to_string()).collect()),
                tail: Tail::End,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Streams `chunks`, then yields an error.
        pub fn breaking_after(chunks: &[&str], error: &str) -> Self {
            Self {
                tail: Tail::Fail(error.to_string()),
                ..Self::replying(chunks)
            }
        }

        /// Streams `chunks`, then panics on the next poll.
        pub fn panicking_after(chunks: &[&str], message: &str) -> Self {
            Self {
                tail: Tail::Panic(message.to_string()),
                ..Self::replying(chunks)
            }
        }

        pub fn failing(error: &str) -> Self {
            Self {
                reply: Err(error.to_string()),
                tail: Tail::End,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, prompt: &str, history: &[Message]) {
            self.calls
                .lock()
                .unwrap()
                .push((prompt.to_string(), history.to_vec()));
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str, history: &[Message]) -> Result<String, GenerationError> {
            self.record(prompt, history);
            match &self.reply {
                Ok(chunks) => Ok(chunks.concat()),
                Err(e) => Err(GenerationError::Stream(e.clone())),
            }
        }

        async fn stream_generate(
            &self,
            prompt: &str,
            history: &[Message],
        ) -> Result<TextStream, GenerationError> {
            self.record(prompt, history);
            match &self.reply {
                Ok(chunks) => {
                    let mut items: Vec<Result<String, GenerationError>> =
                        chunks.iter().cloned().map(Ok).collect();
                    match &self.tail {
                        Tail::End => Ok(stream::iter(items).boxed()),
                        Tail::Fail(e) => {
                            items.push(Err(GenerationError::Stream(e.clone())));
                            Ok(stream::iter(items).boxed())
                        }
                        Tail::Panic(message) => {
                            let message = message.clone();
                            let exploding = stream::poll_fn(
                                move |_| -> Poll<Option<Result<String, GenerationError>>> {
                                    panic!("{message}")
                                },
                            );
                            Ok(stream::iter(items).chain(exploding).boxed())
                        }
                    }
                }
                Err(e) => Err(GenerationError::Stream(e.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseLine::Text("Hel".into()));
    }

    #[test]
    fn skips_role_only_and_blank_lines() {
        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(role_only).unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
    }

    #[test]
    fn recognizes_done_marker() {
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
    }

    #[test]
    fn rejects_malformed_event() {
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[tokio::test]
    async fn stream_reassembles_lines_split_across_chunks() {
        let raw = [
            "data: {\"choices\":[{\"delta\":{\"content\":\"Eat \"}}]}\n\ndata: {\"cho",
            "ices\":[{\"delta\":{\"content\":\"more greens\"}}]}\n\n",
            "data: [DONE]\n\n",
        ];
        let bytes = stream::iter(
            raw.into_iter()
                .map(|s| Ok::<_, reqwest::Error>(Bytes::from_static(s.as_bytes())))
                .collect::<Vec<_>>(),
        );

        let chunks: Vec<String> = sse_text_stream(bytes)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["Eat ", "more greens"]);
    }

    #[test]
    fn request_body_prepends_system_prompt() {
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let body = request_body("m", "be helpful", &history, true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn unconfigured_generator_errors() {
        let err = Unconfigured.generate("p", &[]).await.unwrap_err();
        assert!(matches!(err, GenerationError::NotConfigured));
    }
}
