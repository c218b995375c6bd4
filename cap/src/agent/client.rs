//! Agent trait definition

use async_trait::async_trait;

use super::error::AgentError;
use super::types::{AgentRequest, AgentResponse};

/// Stateless agent client - each call is independent
///
/// The engine owns all conversation state; a request carries the full
/// context it needs. Implementations surface errors with enough detail for
/// the infrastructure retry loop to classify them.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Send one completion request and wait for the full response
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse, AgentError>;

    /// Context window size in tokens for a model this client serves
    ///
    /// Used by the sounding runner to filter models whose window cannot fit
    /// the assembled request. The default is a conservative common floor.
    fn context_limit(&self, _model: &str) -> usize {
        128_000
    }
}
