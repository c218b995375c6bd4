//! Agent client module
//!
//! The engine consumes language models through the [`Agent`] trait; the
//! shipped implementation speaks the OpenAI-compatible wire format used by
//! routed providers. [`MockAgent`] replays scripted responses for tests.

mod client;
mod error;
pub mod mock;
mod openrouter;
mod types;

pub use client::Agent;
pub use error::AgentError;
pub use mock::{MockAgent, text_response};
pub use openrouter::{GenerationCostLookup, OpenRouterAgent};
pub use types::{
    AgentRequest, AgentResponse, ChatMessage, ContentPart, ImageUrl, MessageContent, NativeFunction, NativeToolCall,
    Role,
};
