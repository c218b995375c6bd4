//! Mock agent for tests
//!
//! Replays scripted responses in sequence. Kept public (not test-gated) so
//! scenario tests and downstream consumers can drive cascades without a
//! network.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::client::Agent;
use super::error::AgentError;
use super::types::{AgentRequest, AgentResponse};

/// Scripted agent returning predefined responses in order
pub struct MockAgent {
    responses: Vec<AgentResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<AgentRequest>>,
    context_limit: usize,
}

impl MockAgent {
    pub fn new(responses: Vec<AgentResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            context_limit: 128_000,
        }
    }

    /// Convenience constructor from plain text replies
    pub fn from_texts(texts: Vec<&str>) -> Self {
        Self::new(texts.into_iter().map(text_response).collect())
    }

    /// Override the advertised context window (for filter tests)
    pub fn with_context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    /// How many calls have been made
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests seen so far, in order
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Build a plain-text mock response
pub fn text_response(text: &str) -> AgentResponse {
    AgentResponse {
        content: text.to_string(),
        model: "mock-model".to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.responses
            .get(idx)
            .cloned()
            .ok_or_else(|| AgentError::InvalidResponse("No more mock responses".to_string()))
    }

    fn context_limit(&self, _model: &str) -> usize {
        self.context_limit
    }
}
