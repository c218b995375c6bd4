//! Storage error types

use thiserror::Error;

/// Errors from the session store and unified log
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Illegal status transition for {session_id}: {from} -> {to}")]
    IllegalTransition {
        session_id: String,
        from: String,
        to: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
