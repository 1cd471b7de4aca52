//! Bounded conversation context for one identity.

use platewise_protocol::{now_millis, Message};
use serde::{Deserialize, Serialize};

use crate::store::Record;

/// Context capacity; the oldest messages are evicted first.
pub const MAX_MESSAGES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    /// Most recent last.
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub session_started_at: u64,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            session_started_at: now_millis(),
        }
    }

    /// Append a message, evicting the oldest past [`MAX_MESSAGES`].
    ///
    /// Stored timestamps never decrease: a message stamped earlier than the
    /// current tail is clamped to the tail's timestamp.
    pub fn push(&mut self, mut message: Message) {
        if let Some(last) = self.messages.last() {
            message.created_at = message.created_at.max(last.created_at);
        }
        self.messages.push(message);
        if self.messages.len() > MAX_MESSAGES {
            let excess = self.messages.len() - MAX_MESSAGES;
            self.messages.drain(..excess);
        }
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Record for ConversationContext {
    const KEY: &'static str = "conversation";
    const SCHEMA_VERSION: u32 = 1;

    fn create() -> Self {
        ConversationContext::new()
    }
}
