//! Mega-table row schema for the unified log
//!
//! Every observable event in a cascade run lands as one row in a single wide
//! table: agent messages, tool calls, tool results, validations, evaluations,
//! lifecycle markers and errors. Column names are part of the export contract
//! and must not be renamed.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced this row, semantically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticActor {
    MainAgent,
    SoundingAgent,
    ReforgeAgent,
    Evaluator,
    Quartermaster,
    Validator,
    Mutator,
    Aggregator,
    Human,
    Framework,
}

impl SemanticActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticActor::MainAgent => "main_agent",
            SemanticActor::SoundingAgent => "sounding_agent",
            SemanticActor::ReforgeAgent => "reforge_agent",
            SemanticActor::Evaluator => "evaluator",
            SemanticActor::Quartermaster => "quartermaster",
            SemanticActor::Validator => "validator",
            SemanticActor::Mutator => "mutator",
            SemanticActor::Aggregator => "aggregator",
            SemanticActor::Human => "human",
            SemanticActor::Framework => "framework",
        }
    }
}

/// What role this row plays in the execution flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticPurpose {
    Instructions,
    TaskInput,
    ContextInjection,
    ToolRequest,
    ToolResponse,
    Continuation,
    Refinement,
    ValidationInput,
    ValidationOutput,
    EvaluationInput,
    EvaluationOutput,
    WinnerSelection,
    Lifecycle,
    Error,
    Generation,
}

impl SemanticPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticPurpose::Instructions => "instructions",
            SemanticPurpose::TaskInput => "task_input",
            SemanticPurpose::ContextInjection => "context_injection",
            SemanticPurpose::ToolRequest => "tool_request",
            SemanticPurpose::ToolResponse => "tool_response",
            SemanticPurpose::Continuation => "continuation",
            SemanticPurpose::Refinement => "refinement",
            SemanticPurpose::ValidationInput => "validation_input",
            SemanticPurpose::ValidationOutput => "validation_output",
            SemanticPurpose::EvaluationInput => "evaluation_input",
            SemanticPurpose::EvaluationOutput => "evaluation_output",
            SemanticPurpose::WinnerSelection => "winner_selection",
            SemanticPurpose::Lifecycle => "lifecycle",
            SemanticPurpose::Error => "error",
            SemanticPurpose::Generation => "generation",
        }
    }
}

/// One row of the unified mega-table
///
/// Most columns are nullable; a row carries only what its event knows.
/// `session_id` and `trace_id` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRow {
    // Core identification
    pub timestamp: f64,
    pub timestamp_iso: String,
    pub session_id: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub parent_message_id: Option<String>,

    // Message classification
    pub node_type: String,
    pub role: Option<String>,
    pub depth: i64,

    // Execution context
    pub sounding_index: Option<i64>,
    pub is_winner: Option<bool>,
    pub reforge_step: Option<i64>,
    pub attempt_number: Option<i64>,
    pub turn_number: Option<i64>,
    pub mutation_applied: Option<String>,
    pub mutation_type: Option<String>,
    pub mutation_template: Option<String>,
    pub species_hash: Option<String>,

    // Cascade context
    pub cascade_id: Option<String>,
    pub cascade_file: Option<String>,
    pub cascade_json: Option<String>,
    pub phase_name: Option<String>,
    pub phase_json: Option<String>,

    // LLM provider data
    pub model: Option<String>,
    pub model_requested: Option<String>,
    pub request_id: Option<String>,
    pub provider: Option<String>,

    // Performance metrics
    pub duration_ms: Option<f64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost: Option<f64>,

    // Content (JSON blobs for complete reconstruction)
    pub content_json: Option<String>,
    pub full_request_json: Option<String>,
    pub full_response_json: Option<String>,
    pub tool_calls_json: Option<String>,

    // Images
    pub images_json: Option<String>,
    pub has_images: bool,
    pub has_base64: bool,

    // Semantics
    pub semantic_actor: Option<String>,
    pub semantic_purpose: Option<String>,

    // Extras
    pub is_callout: bool,
    pub callout_name: Option<String>,
    pub metadata_json: Option<String>,
}

impl LogRow {
    /// Create a row with a fresh trace id and the current wall-clock
    pub fn new(session_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let now = Utc::now();
        let timestamp = now.timestamp_micros() as f64 / 1_000_000.0;
        let iso = DateTime::<Local>::from(now).to_rfc3339();

        Self {
            timestamp,
            timestamp_iso: iso,
            session_id: session_id.into(),
            trace_id: Uuid::new_v4().to_string(),
            parent_id: None,
            parent_session_id: None,
            parent_message_id: None,
            node_type: node_type.into(),
            role: None,
            depth: 0,
            sounding_index: None,
            is_winner: None,
            reforge_step: None,
            attempt_number: None,
            turn_number: None,
            mutation_applied: None,
            mutation_type: None,
            mutation_template: None,
            species_hash: None,
            cascade_id: None,
            cascade_file: None,
            cascade_json: None,
            phase_name: None,
            phase_json: None,
            model: None,
            model_requested: None,
            request_id: None,
            provider: None,
            duration_ms: None,
            tokens_in: None,
            tokens_out: None,
            total_tokens: None,
            cost: None,
            content_json: None,
            full_request_json: None,
            full_response_json: None,
            tool_calls_json: None,
            images_json: None,
            has_images: false,
            has_base64: false,
            semantic_actor: None,
            semantic_purpose: None,
            is_callout: false,
            callout_name: None,
            metadata_json: None,
        }
    }

    /// Serialize any value into `content_json`, falling back to its Debug form
    pub fn with_content<T: Serialize + std::fmt::Debug>(mut self, content: &T) -> Self {
        self.content_json = Some(safe_json(content));
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_semantics(mut self, actor: SemanticActor, purpose: SemanticPurpose) -> Self {
        self.semantic_actor = Some(actor.as_str().to_string());
        self.semantic_purpose = Some(purpose.as_str().to_string());
        self
    }

    /// Recompute `total_tokens` from the in/out counts
    pub fn recompute_total_tokens(&mut self) {
        self.total_tokens = match (self.tokens_in, self.tokens_out) {
            (Some(i), Some(o)) => Some(i + o),
            (Some(i), None) => Some(i),
            (None, Some(o)) => Some(o),
            (None, None) => None,
        };
    }
}

/// Serialize to a JSON string, never panicking on odd values
pub fn safe_json<T: Serialize + std::fmt::Debug>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
}

/// Filter for read-only queries against the unified log
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub session_id: Option<String>,
    pub cascade_id: Option<String>,
    pub phase_name: Option<String>,
    pub node_type: Option<String>,
    pub role: Option<String>,
    pub sounding_index: Option<i64>,
    pub is_winner: Option<bool>,
    pub species_hash: Option<String>,
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_row_has_trace_id_and_timestamp() {
        let row = LogRow::new("sess-1", "message");
        assert_eq!(row.session_id, "sess-1");
        assert_eq!(row.node_type, "message");
        assert!(!row.trace_id.is_empty());
        assert!(row.timestamp > 0.0);
        assert!(row.parent_id.is_none());
    }

    #[test]
    fn test_distinct_trace_ids() {
        let a = LogRow::new("s", "message");
        let b = LogRow::new("s", "message");
        assert_ne!(a.trace_id, b.trace_id);
    }

    #[test]
    fn test_recompute_total_tokens() {
        let mut row = LogRow::new("s", "message");
        row.tokens_in = Some(100);
        row.tokens_out = Some(25);
        row.recompute_total_tokens();
        assert_eq!(row.total_tokens, Some(125));

        row.tokens_out = None;
        row.recompute_total_tokens();
        assert_eq!(row.total_tokens, Some(100));
    }

    #[test]
    fn test_semantics_round_trip() {
        let row = LogRow::new("s", "message")
            .with_semantics(SemanticActor::SoundingAgent, SemanticPurpose::Generation);
        assert_eq!(row.semantic_actor.as_deref(), Some("sounding_agent"));
        assert_eq!(row.semantic_purpose.as_deref(), Some("generation"));
    }

    #[test]
    fn test_safe_json_serializes_values() {
        assert_eq!(safe_json(&serde_json::json!({"x": 1})), r#"{"x":1}"#);
        assert_eq!(safe_json(&"hello"), r#""hello""#);
    }
}
