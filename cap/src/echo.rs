//! Echo - live per-session state
//!
//! One Echo per running session: state map, message history, phase lineage
//! and the error list. An Echo is owned by exactly one runner at a time;
//! sounding workers receive a cloned snapshot and only the winner's changes
//! are merged back. Every recorded message is forwarded to the unified log
//! with the semantic context (sounding index, reforge step, mutation) the
//! runner has set on this instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use unilog::{LogRow, SemanticActor, SemanticPurpose, UnifiedLog, safe_json};

use crate::agent::MessageContent;

/// One message in the echo history
#[derive(Debug, Clone)]
pub struct EchoMessage {
    pub role: String,
    pub content: MessageContent,
    pub node_type: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
    /// Phase that produced the message; filled by `record` when unset
    pub phase: Option<String>,
    /// Turn within the phase, for last-turn context filters
    pub turn: Option<i64>,
}

/// One completed phase in lineage order
#[derive(Debug, Clone)]
pub struct LineageEntry {
    pub phase: String,
    pub output: String,
    pub trace_id: String,
}

/// One recorded error
#[derive(Debug, Clone)]
pub struct EchoError {
    pub phase: String,
    pub kind: String,
    pub message: String,
    pub metadata: Option<Value>,
}

/// Observer callback invoked on every recorded message
pub type Observer = Arc<dyn Fn(&EchoMessage) + Send + Sync>;

/// Live session state, single-writer within a runner
#[derive(Clone)]
pub struct Echo {
    pub session_id: String,
    pub cascade_id: String,
    pub cascade_file: Option<String>,
    pub parent_session_id: Option<String>,
    pub depth: i64,

    pub state: BTreeMap<String, Value>,
    pub history: Vec<EchoMessage>,
    pub lineage: Vec<LineageEntry>,
    pub errors: Vec<EchoError>,

    // Current runner context, threaded into every log row
    pub current_phase: Option<String>,
    pub current_phase_json: Option<String>,
    pub current_species_hash: Option<String>,
    pub sounding_index: Option<i64>,
    pub reforge_step: Option<i64>,
    pub mutation_applied: Option<String>,
    pub mutation_type: Option<String>,
    pub mutation_template: Option<String>,
    pub attempt_number: Option<i64>,
    pub turn_number: Option<i64>,

    observers: Vec<Observer>,
    log: UnifiedLog,
}

impl Echo {
    pub fn new(session_id: impl Into<String>, cascade_id: impl Into<String>, log: UnifiedLog) -> Self {
        Self {
            session_id: session_id.into(),
            cascade_id: cascade_id.into(),
            cascade_file: None,
            parent_session_id: None,
            depth: 0,
            state: BTreeMap::new(),
            history: Vec::new(),
            lineage: Vec::new(),
            errors: Vec::new(),
            current_phase: None,
            current_phase_json: None,
            current_species_hash: None,
            sounding_index: None,
            reforge_step: None,
            mutation_applied: None,
            mutation_type: None,
            mutation_template: None,
            attempt_number: None,
            turn_number: None,
            observers: Vec::new(),
            log: UnifiedLog::clone(&log),
        }
    }

    /// Immutable snapshot for a sounding worker
    ///
    /// The clone shares the unified log handle and session id, so the
    /// worker's rows land in the same session; its state and history merge
    /// back only if it wins.
    pub fn snapshot(&self) -> Echo {
        self.clone()
    }

    /// Unified log handle shared by this session
    pub fn log_handle(&self) -> &UnifiedLog {
        &self.log
    }

    /// Subscribe to recorded messages (UI streaming)
    pub fn add_observer(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    // === State ===

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn state_json(&self) -> Value {
        serde_json::to_value(&self.state).unwrap_or(Value::Null)
    }

    /// Outputs of completed phases keyed by phase name
    pub fn outputs_json(&self) -> Value {
        let map: BTreeMap<&str, &str> = self
            .lineage
            .iter()
            .map(|entry| (entry.phase.as_str(), entry.output.as_str()))
            .collect();
        serde_json::to_value(map).unwrap_or(Value::Null)
    }

    // === Lineage ===

    pub fn add_lineage(&mut self, phase: impl Into<String>, output: impl Into<String>, trace_id: impl Into<String>) {
        self.lineage.push(LineageEntry {
            phase: phase.into(),
            output: output.into(),
            trace_id: trace_id.into(),
        });
    }

    /// Most recent output of a phase, if it completed
    pub fn output_of(&self, phase: &str) -> Option<&str> {
        self.lineage
            .iter()
            .rev()
            .find(|entry| entry.phase == phase)
            .map(|entry| entry.output.as_str())
    }

    // === Logging ===

    /// A log row pre-seeded with this session's full execution context
    ///
    /// Runners fill in message-specific fields and hand the row back via
    /// [`Echo::record`] or [`Echo::log_event`].
    pub fn log_row(&self, node_type: &str) -> LogRow {
        let mut row = LogRow::new(&self.session_id, node_type);
        row.parent_session_id = self.parent_session_id.clone();
        row.depth = self.depth;
        row.cascade_id = Some(self.cascade_id.clone());
        row.cascade_file = self.cascade_file.clone();
        row.phase_name = self.current_phase.clone();
        row.phase_json = self.current_phase_json.clone();
        row.species_hash = self.current_species_hash.clone();
        row.sounding_index = self.sounding_index;
        row.reforge_step = self.reforge_step;
        row.mutation_applied = self.mutation_applied.clone();
        row.mutation_type = self.mutation_type.clone();
        row.mutation_template = self.mutation_template.clone();
        row.attempt_number = self.attempt_number;
        row.turn_number = self.turn_number;
        row.semantic_actor = Some(self.default_actor().as_str().to_string());
        row
    }

    /// The actor implied by the current runner context
    pub fn default_actor(&self) -> SemanticActor {
        if self.reforge_step.is_some() {
            SemanticActor::ReforgeAgent
        } else if self.sounding_index.is_some() {
            SemanticActor::SoundingAgent
        } else {
            SemanticActor::MainAgent
        }
    }

    /// Record a message: history, observers, unified log
    ///
    /// The row should come from [`Echo::log_row`] so the execution context
    /// is already attached. Pass `skip_unified_log` when the row was already
    /// written through another path.
    pub fn record(&mut self, mut message: EchoMessage, mut row: LogRow, skip_unified_log: bool) {
        if message.phase.is_none() {
            message.phase = self.current_phase.clone();
        }
        if message.turn.is_none() {
            message.turn = self.turn_number;
        }
        row.role = Some(message.role.clone());
        row.trace_id = message.trace_id.clone();
        row.parent_id = message.parent_id.clone();
        if row.content_json.is_none() {
            row.content_json = Some(safe_json(&message.content));
        }
        row.has_base64 = message.content.has_base64_image();

        for observer in &self.observers {
            observer(&message);
        }
        self.history.push(message);

        if !skip_unified_log {
            self.log.log(row);
        }
    }

    /// Write a non-history row (lifecycle, validation, evaluation)
    pub fn log_event(&self, row: LogRow) {
        self.log.log(row);
    }

    /// Write an error row without touching the error list
    ///
    /// Used for recovered failures (retried attempts, transient provider
    /// errors): they are observable in the log but do not poison the
    /// cascade's final status.
    pub fn log_error_row(&self, phase: &str, kind: &str, message: &str) {
        let mut row = self.log_row("error");
        row.semantic_actor = Some(SemanticActor::Framework.as_str().to_string());
        row.semantic_purpose = Some(SemanticPurpose::Error.as_str().to_string());
        row.content_json = Some(safe_json(&serde_json::json!({
            "phase": phase,
            "type": kind,
            "message": message,
            "recovered": true,
        })));
        self.log.log(row);
    }

    /// Record an error: error list plus an error row in the log
    pub fn add_error(
        &mut self,
        phase: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
        metadata: Option<Value>,
    ) {
        let error = EchoError {
            phase: phase.into(),
            kind: kind.into(),
            message: message.into(),
            metadata,
        };
        debug!(phase = %error.phase, kind = %error.kind, "Echo error recorded");

        let mut row = self.log_row("error");
        row.semantic_actor = Some(SemanticActor::Framework.as_str().to_string());
        row.semantic_purpose = Some(SemanticPurpose::Error.as_str().to_string());
        row.content_json = Some(safe_json(&serde_json::json!({
            "phase": error.phase,
            "type": error.kind,
            "message": error.message,
        })));
        row.metadata_json = error.metadata.as_ref().map(|m| m.to_string());
        self.log.log(row);

        self.errors.push(error);
    }

    /// Merge a winning sounding clone back into this parent echo
    ///
    /// Appends the winner's history suffix (messages past the shared
    /// snapshot length) and overlays its state.
    pub fn merge_winner(&mut self, winner: &Echo, snapshot_history_len: usize) {
        for message in winner.history.iter().skip(snapshot_history_len) {
            self.history.push(message.clone());
        }
        for (key, value) in &winner.state {
            self.state.insert(key.clone(), value.clone());
        }
        for entry in winner.lineage.iter() {
            if !self
                .lineage
                .iter()
                .any(|e| e.phase == entry.phase && e.trace_id == entry.trace_id)
            {
                self.lineage.push(entry.clone());
            }
        }
    }
}

impl std::fmt::Debug for Echo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Echo")
            .field("session_id", &self.session_id)
            .field("cascade_id", &self.cascade_id)
            .field("history_len", &self.history.len())
            .field("lineage_len", &self.lineage.len())
            .field("errors", &self.errors.len())
            .field("current_phase", &self.current_phase)
            .field("sounding_index", &self.sounding_index)
            .finish()
    }
}

/// Final immutable view returned from `run_cascade`
#[derive(Debug, Clone)]
pub struct EchoSnapshot {
    pub session_id: String,
    pub cascade_id: String,
    pub state: BTreeMap<String, Value>,
    pub lineage: Vec<LineageEntry>,
    pub errors: Vec<EchoError>,
    /// Final phase output, if any phase completed
    pub final_output: Option<String>,
}

impl From<&Echo> for EchoSnapshot {
    fn from(echo: &Echo) -> Self {
        Self {
            session_id: echo.session_id.clone(),
            cascade_id: echo.cascade_id.clone(),
            state: echo.state.clone(),
            lineage: echo.lineage.clone(),
            errors: echo.errors.clone(),
            final_output: echo.lineage.last().map(|entry| entry.output.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn echo() -> Echo {
        let log = UnifiedLog::open_in_memory().unwrap();
        Echo::new("sess-1", "flow", log)
    }

    fn message(role: &str, text: &str) -> EchoMessage {
        EchoMessage {
            role: role.to_string(),
            content: MessageContent::Text(text.to_string()),
            node_type: "message".to_string(),
            trace_id: Uuid::new_v4().to_string(),
            parent_id: None,
            phase: None,
            turn: None,
        }
    }

    #[tokio::test]
    async fn test_record_appends_history_and_logs() {
        let mut echo = echo();
        let row = echo.log_row("message");
        echo.record(message("user", "hello"), row, false);

        assert_eq!(echo.history.len(), 1);
        echo.log_handle().flush().await;
        let rows = echo
            .log_handle()
            .query(&unilog::LogFilter::session("sess-1"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].role.as_deref(), Some("user"));
        assert_eq!(rows[0].cascade_id.as_deref(), Some("flow"));
    }

    #[tokio::test]
    async fn test_skip_unified_log() {
        let mut echo = echo();
        let row = echo.log_row("message");
        echo.record(message("user", "hello"), row, true);

        echo.log_handle().flush().await;
        let rows = echo
            .log_handle()
            .query(&unilog::LogFilter::session("sess-1"))
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(echo.history.len(), 1);
    }

    #[tokio::test]
    async fn test_log_row_carries_sounding_context() {
        let mut echo = echo();
        echo.current_phase = Some("draft".to_string());
        echo.sounding_index = Some(2);
        echo.mutation_type = Some("approach".to_string());

        let row = echo.log_row("message");
        assert_eq!(row.phase_name.as_deref(), Some("draft"));
        assert_eq!(row.sounding_index, Some(2));
        assert_eq!(row.mutation_type.as_deref(), Some("approach"));
        assert_eq!(row.semantic_actor.as_deref(), Some("sounding_agent"));
    }

    #[test]
    fn test_default_actor_precedence() {
        let mut echo = echo();
        assert_eq!(echo.default_actor(), SemanticActor::MainAgent);
        echo.sounding_index = Some(0);
        assert_eq!(echo.default_actor(), SemanticActor::SoundingAgent);
        echo.reforge_step = Some(1);
        assert_eq!(echo.default_actor(), SemanticActor::ReforgeAgent);
    }

    #[test]
    fn test_lineage_and_outputs() {
        let mut echo = echo();
        echo.add_lineage("a", "first output", "t1");
        echo.add_lineage("b", "second output", "t2");

        assert_eq!(echo.output_of("a"), Some("first output"));
        assert_eq!(echo.output_of("missing"), None);
        let outputs = echo.outputs_json();
        assert_eq!(outputs["b"], "second output");
    }

    #[tokio::test]
    async fn test_add_error_records_row() {
        let mut echo = echo();
        echo.current_phase = Some("draft".to_string());
        echo.add_error("draft", "validation", "output rejected", None);

        assert_eq!(echo.errors.len(), 1);
        echo.log_handle().flush().await;
        let mut filter = unilog::LogFilter::session("sess-1");
        filter.node_type = Some("error".to_string());
        let rows = echo.log_handle().query(&filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].semantic_purpose.as_deref(), Some("error"));
    }

    #[test]
    fn test_observers_see_messages() {
        let mut echo = echo();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        echo.add_observer(Arc::new(move |msg| {
            sink.lock().unwrap().push(msg.role.clone());
        }));

        let row = echo.log_row("message");
        echo.record(message("assistant", "hi"), row, true);
        assert_eq!(seen.lock().unwrap().as_slice(), ["assistant"]);
    }

    #[test]
    fn test_merge_winner_takes_suffix_and_state() {
        let mut parent = echo();
        let row = parent.log_row("message");
        parent.record(message("user", "shared"), row, true);

        let snapshot_len = parent.history.len();
        let mut clone = parent.snapshot();
        let row = clone.log_row("message");
        clone.record(message("assistant", "winner output"), row, true);
        clone.set_state("score", serde_json::json!(0.9));

        parent.merge_winner(&clone, snapshot_len);
        assert_eq!(parent.history.len(), 2);
        assert_eq!(parent.get_state("score"), Some(&serde_json::json!(0.9)));
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let mut parent = echo();
        parent.set_state("k", serde_json::json!(1));
        let mut snap = parent.snapshot();
        snap.set_state("k", serde_json::json!(2));
        assert_eq!(parent.get_state("k"), Some(&serde_json::json!(1)));
    }
}
