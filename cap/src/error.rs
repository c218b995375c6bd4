//! Cascade error taxonomy
//!
//! Every failure a runner can hit maps to one variant; all of them are
//! observable both in `Echo::errors` and as error rows in the unified log.
//! Retries and wards stay local to the phase; unrecovered failures terminate
//! the phase and set the cascade status to `error`.

use thiserror::Error;

/// Errors raised during cascade execution
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Provider error in phase '{phase}': {message}")]
    Provider { phase: String, message: String },

    #[error("Tool call parse error: {0}")]
    Parse(String),

    #[error("Output schema validation failed: {0}")]
    Schema(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Required extraction pattern not found: {0}")]
    Extraction(String),

    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Checkpoint '{0}' timed out")]
    CheckpointTimeout(String),

    #[error("Token budget exceeded: {current} > {limit}")]
    BudgetExceeded { current: usize, limit: usize },

    #[error("Phase '{phase}' blocked by ward '{ward}': {reason}")]
    BlockedByWard {
        phase: String,
        ward: String,
        reason: String,
    },

    #[error("Cancellation requested for session {0}")]
    Cancelled(String),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Store error: {0}")]
    Store(#[from] unilog::StoreError),

    #[error("Template render error: {0}")]
    Template(String),
}

impl CascadeError {
    /// Short stable name used in error rows and `Echo::errors`
    pub fn kind(&self) -> &'static str {
        match self {
            CascadeError::Config(_) => "config",
            CascadeError::Provider { .. } => "provider",
            CascadeError::Parse(_) => "parse",
            CascadeError::Schema(_) => "schema",
            CascadeError::Validation(_) => "validation",
            CascadeError::Extraction(_) => "extraction",
            CascadeError::Tool { .. } => "tool",
            CascadeError::CheckpointTimeout(_) => "checkpoint_timeout",
            CascadeError::BudgetExceeded { .. } => "budget_exceeded",
            CascadeError::BlockedByWard { .. } => "blocked_by_ward",
            CascadeError::Cancelled(_) => "cancelled",
            CascadeError::Infrastructure(_) => "infrastructure",
            CascadeError::Store(_) => "store",
            CascadeError::Template(_) => "template",
        }
    }

    /// Cancellation overrides retries; nothing else does at this level
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CascadeError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, CascadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(CascadeError::Config("x".into()).kind(), "config");
        assert_eq!(
            CascadeError::BudgetExceeded { current: 10, limit: 5 }.kind(),
            "budget_exceeded"
        );
        assert_eq!(CascadeError::Cancelled("s".into()).kind(), "cancelled");
    }

    #[test]
    fn test_cancellation_flag() {
        assert!(CascadeError::Cancelled("s".into()).is_cancellation());
        assert!(!CascadeError::Parse("bad".into()).is_cancellation());
    }
}
