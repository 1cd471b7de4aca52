//! Server → Client frames

use serde::{Deserialize, Serialize};

use crate::now_millis;
use crate::types::{Message, MessageRole};

/// Frames sent from server to client, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A completed turn response
    Message {
        role: MessageRole,
        content: String,
        #[serde(rename = "messageId")]
        message_id: String,
        timestamp: u64,
    },
    /// Connection-level notice
    System { content: String, timestamp: u64 },
    /// Non-fatal processing error
    Error { content: String, timestamp: u64 },

    // Incremental responses
    StreamStart { timestamp: u64 },
    StreamChunk { content: String, timestamp: u64 },
    StreamEnd { timestamp: u64 },
}

impl ServerMessage {
    pub fn message(message: &Message) -> Self {
        ServerMessage::Message {
            role: message.role,
            content: message.content.clone(),
            message_id: message.id.clone(),
            timestamp: message.created_at,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        ServerMessage::System {
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        ServerMessage::Error {
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    pub fn stream_start() -> Self {
        ServerMessage::StreamStart {
            timestamp: now_millis(),
        }
    }

    pub fn stream_chunk(content: impl Into<String>) -> Self {
        ServerMessage::StreamChunk {
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    pub fn stream_end() -> Self {
        ServerMessage::StreamEnd {
            timestamp: now_millis(),
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            ServerMessage::Message { timestamp, .. }
            | ServerMessage::System { timestamp, .. }
            | ServerMessage::Error { timestamp, .. }
            | ServerMessage::StreamStart { timestamp }
            | ServerMessage::StreamChunk { timestamp, .. }
            | ServerMessage::StreamEnd { timestamp } => *timestamp,
        }
    }
}
