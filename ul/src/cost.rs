//! Deferred cost attribution
//!
//! Providers that route requests (OpenRouter-style) expose real cost and
//! native token counts only a few seconds after a generation completes. Rows
//! that need cost data wait in a pending buffer; a background worker looks the
//! cost up by `request_id` and merges it before the row is written.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resolved cost data for one generation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostData {
    pub cost: Option<f64>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub provider: Option<String>,
}

/// Published on the event channel after a successful resolution so UI layers
/// can reconcile rows they already rendered without cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostUpdate {
    pub trace_id: String,
    pub session_id: String,
    pub phase_name: Option<String>,
    pub cascade_id: Option<String>,
    pub sounding_index: Option<i64>,
    pub request_id: Option<String>,
    pub cost: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

/// Events surfaced by the unified log to whoever is listening
///
/// The log never blocks on listeners; the engine bridges these onto its
/// event bus.
#[derive(Debug, Clone)]
pub enum LogEvent {
    CostUpdate(CostUpdate),
    /// A flush failed; rows were retained and will be retried
    WriteError(String),
}

/// Listener callback for [`LogEvent`]s
pub type LogListener = std::sync::Arc<dyn Fn(LogEvent) + Send + Sync>;

/// Provider-side cost lookup keyed by request id
///
/// Implementations retry internally on "not ready yet" responses; the
/// schedule below is the conventional one.
#[async_trait]
pub trait CostLookup: Send + Sync {
    async fn lookup(&self, request_id: &str) -> Option<CostData>;
}

/// Retry delays between lookup attempts: immediate, then 1s, 2s, 3s
pub const LOOKUP_BACKOFF: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
];

/// A lookup that never resolves; used when no provider endpoint is configured
pub struct NoCostLookup;

#[async_trait]
impl CostLookup for NoCostLookup {
    async fn lookup(&self, _request_id: &str) -> Option<CostData> {
        None
    }
}
