//! Remote generation backends.
//!
//! A backend turns one [`TurnRequest`] into a channel of [`GenerationEvent`]s. Connection
//! failures are returned as `Err`; failures after the first byte arrive as
//! [`GenerationEvent::Failed`] and end the channel.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CoreResult;
use crate::shared::{Message, Role};

pub mod gemini;
pub mod mock;

pub use gemini::GeminiService;
pub use mock::{MockReply, MockService};

/// Inline binary payload (base64 on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    /// Raw bytes, base64-encoded here.
    pub fn inline(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.into(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
        }
    }
}

/// One turn of remote conversation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part::text(text)],
        }
    }

    /// Text-only view of a stored message.
    pub fn from_message(msg: &Message) -> Self {
        let role = match msg.role {
            Role::User => "user",
            Role::Model => "model",
        };
        Self {
            role: role.to_string(),
            parts: vec![Part::text(msg.text.clone())],
        }
    }
}

/// A grounding source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub url: String,
    pub title: String,
}

impl Citation {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Text(String),
    /// Grounding metadata as last reported by the backend; replaces any earlier list.
    Grounding(Vec<Citation>),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub system_instruction: String,
    /// Prior turns, oldest first.
    pub history: Vec<Content>,
    pub input: Content,
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Start one streamed turn.
    async fn stream_turn(&self, request: TurnRequest) -> CoreResult<mpsc::Receiver<GenerationEvent>>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_serialize_in_wire_shape() {
        let v = serde_json::to_value(Content::user(vec![Part::inline("audio/webm", b"ab"), Part::text("hi")])).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "role": "user",
                "parts": [
                    { "inlineData": { "mimeType": "audio/webm", "data": "YWI=" } },
                    { "text": "hi" }
                ]
            })
        );
    }
}
