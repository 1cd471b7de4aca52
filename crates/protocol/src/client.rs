//! Client → Server frames

use serde::{Deserialize, Serialize};

use crate::now_millis;

/// The only frame a client sends: a chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub content: String,
    #[serde(default)]
    pub timestamp: u64,
}

impl ClientFrame {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ClientFrame;

    #[test]
    fn deserializes_frame_without_timestamp() {
        let parsed: ClientFrame =
            serde_json::from_str(r#"{"content":"show history"}"#).expect("parse frame");
        assert_eq!(parsed.content, "show history");
        assert_eq!(parsed.timestamp, 0);
    }

    #[test]
    fn serializes_content_and_timestamp_only() {
        let frame = ClientFrame {
            content: "hi".into(),
            timestamp: 42,
        };
        let value = serde_json::to_value(&frame).expect("serialize frame");
        assert_eq!(value, serde_json::json!({"content": "hi", "timestamp": 42}));
    }
}
