//! Inbound frames as the application sees them.

use platewise_protocol::{MessageRole, ServerMessage};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Message,
    System,
    Error,
    StreamStart,
    StreamChunk,
    StreamEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub kind: FrameKind,
    /// Set for `message` frames only.
    pub role: Option<MessageRole>,
    /// Empty for stream start/end.
    pub content: String,
    pub message_id: Option<String>,
    pub timestamp: u64,
}

impl From<ServerMessage> for ReceivedMessage {
    fn from(frame: ServerMessage) -> Self {
        let timestamp = frame.timestamp();
        let (kind, role, content, message_id) = match frame {
            ServerMessage::Message {
                role,
                content,
                message_id,
                ..
            } => (FrameKind::Message, Some(role), content, Some(message_id)),
            ServerMessage::System { content, .. } => (FrameKind::System, None, content, None),
            ServerMessage::Error { content, .. } => (FrameKind::Error, None, content, None),
            ServerMessage::StreamStart { .. } => (FrameKind::StreamStart, None, String::new(), None),
            ServerMessage::StreamChunk { content, .. } => {
                (FrameKind::StreamChunk, None, content, None)
            }
            ServerMessage::StreamEnd { .. } => (FrameKind::StreamEnd, None, String::new(), None),
        };
        Self {
            kind,
            role,
            content,
            message_id,
            timestamp,
        }
    }
}

/// Parse a text frame. Anything that isn't a known envelope is logged and
/// dropped.
pub fn parse_frame(text: &str) -> Option<ReceivedMessage> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(frame) => Some(frame.into()),
        Err(e) => {
            debug!(
                component = "client",
                event = "client.frame.unparseable",
                error = %e,
                bytes = text.len(),
                "Dropping unparseable frame"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_frame_keeps_role_and_id() {
        let parsed = parse_frame(
            r#"{"type":"message","role":"assistant","content":"Nice.","messageId":"m1","timestamp":5}"#,
        )
        .unwrap();
        assert_eq!(parsed.kind, FrameKind::Message);
        assert_eq!(parsed.role, Some(MessageRole::Assistant));
        assert_eq!(parsed.message_id.as_deref(), Some("m1"));
        assert_eq!(parsed.timestamp, 5);
    }

    #[test]
    fn unknown_or_broken_frames_are_dropped() {
        assert!(parse_frame(r#"{"type":"typing","timestamp":1}"#).is_none());
        assert!(parse_frame("{not json").is_none());
    }

    #[test]
    fn stream_end_has_no_content() {
        let parsed = parse_frame(r#"{"type":"stream_end","timestamp":9}"#).unwrap();
        assert_eq!(parsed.kind, FrameKind::StreamEnd);
        assert!(parsed.content.is_empty());
    }
}
