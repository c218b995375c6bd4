//! Agent request/response types
//!
//! These model an OpenAI-compatible chat completions wire format, which is
//! what routed providers speak. Content is either plain text or multi-modal
//! parts (text + image data-URLs).

use serde::{Deserialize, Serialize};

/// Message role in a chat conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Message content - plain text or multi-modal parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text content if this is a plain-text message
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(text),
            MessageContent::Parts(_) => None,
        }
    }

    /// Concatenated text across all parts (or the plain text)
    pub fn text_lossy(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Whether any part carries a base64 data-URL image
    pub fn has_base64_image(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.contains("data:image/"),
            MessageContent::Parts(parts) => parts.iter().any(|p| match p {
                ContentPart::ImageUrl { image_url } => image_url.url.starts_with("data:"),
                ContentPart::Text { .. } => false,
            }),
        }
    }
}

/// One part of a multi-modal message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

/// A native tool call returned by the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeToolCall {
    pub id: String,
    pub function: NativeFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeFunction {
    pub name: String,
    /// JSON-encoded arguments string, as on the wire
    pub arguments: String,
}

/// Everything needed for one agent call
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// System prompt (rendered instructions + prompt-form tool block)
    pub system: String,
    /// Fresh user content for this turn, if any
    pub user: Option<String>,
    /// Prior context messages in order
    pub context: Vec<ChatMessage>,
    /// Native tool schemas (empty when using the prompt-form protocol)
    pub tools: Vec<serde_json::Value>,
    /// Model identifier
    pub model: String,
}

/// Response from one agent call
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub content: String,
    pub tool_calls: Vec<NativeToolCall>,
    /// Provider request id, used for deferred cost lookup
    pub request_id: Option<String>,
    pub model: String,
    pub provider: Option<String>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub cost: Option<f64>,
    pub duration_ms: Option<f64>,
    pub full_request: Option<serde_json::Value>,
    pub full_response: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_part_serialization() {
        let part = ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "data:image/png;base64,AAAA".to_string(),
            },
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "image_url");
        assert_eq!(json["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_text_lossy_over_parts() {
        let msg = ChatMessage::user_parts(vec![
            ContentPart::Text {
                text: "look at this".to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".to_string(),
                },
            },
        ]);
        assert_eq!(msg.content.text_lossy(), "look at this");
        assert!(msg.content.has_base64_image());
    }

    #[test]
    fn test_message_content_untagged_round_trip() {
        let text: MessageContent = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(text.as_text(), Some("hello"));

        let parts: MessageContent =
            serde_json::from_str(r#"[{"type":"text","text":"hi"}]"#).unwrap();
        assert!(parts.as_text().is_none());
        assert_eq!(parts.text_lossy(), "hi");
    }
}
