//! Checkpoint manager - suspension records for human-in-the-loop gates
//!
//! A runner creates a checkpoint record, then blocks polling for a response.
//! A UI layer lists pending records and posts responses to the same id; the
//! engine renders nothing, it only produces the structured ui_spec and
//! consumes the structured response. Timeouts and cancellation both surface
//! as `None`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why execution is suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointType {
    PhaseInput,
    Decision,
    SoundingEval,
    Audible,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::PhaseInput => "PHASE_INPUT",
            CheckpointType::Decision => "DECISION",
            CheckpointType::SoundingEval => "SOUNDING_EVAL",
            CheckpointType::Audible => "AUDIBLE",
        }
    }
}

/// One section of a checkpoint UI
///
/// The engine describes what it needs; the UI decides how to render it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UiSection {
    /// preview | text | choice | card_grid | image
    pub kind: String,
    /// Name under which the response value is posted back
    pub input_name: Option<String>,
    pub label: Option<String>,
    pub content: Option<String>,
    pub options: Vec<UiOption>,
    pub required: bool,
    pub multiline: bool,
    /// single | multiple
    pub selection_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UiOption {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
}

/// A suspension record delivered to the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub session_id: String,
    pub cascade_id: String,
    pub phase: String,
    pub checkpoint_type: CheckpointType,
    pub ui_spec: Vec<UiSection>,
    pub phase_output: Option<String>,
    pub sounding_outputs: Option<Vec<String>>,
    pub sounding_metadata: Option<Value>,
    pub timeout_seconds: Option<u64>,
    pub trace_context: Option<Value>,
    pub created_at: i64,
}

impl CheckpointRecord {
    pub fn new(
        session_id: impl Into<String>,
        cascade_id: impl Into<String>,
        phase: impl Into<String>,
        checkpoint_type: CheckpointType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            cascade_id: cascade_id.into(),
            phase: phase.into(),
            checkpoint_type,
            ui_spec: Vec::new(),
            phase_output: None,
            sounding_outputs: None,
            sounding_metadata: None,
            timeout_seconds: None,
            trace_context: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

enum CheckpointState {
    Pending(CheckpointRecord),
    Responded(Value),
}

/// Probe consulted while waiting; true aborts the wait
pub type CancelProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// In-process checkpoint store
///
/// Cheap to clone; the UI layer and runners share one instance.
#[derive(Clone)]
pub struct CheckpointManager {
    states: Arc<Mutex<HashMap<String, CheckpointState>>>,
    poll_interval: Duration,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Shorter poll interval for tests
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Register a suspension record, returning its id
    pub fn create(&self, record: CheckpointRecord) -> String {
        let id = record.id.clone();
        info!(
            checkpoint_id = %id,
            session_id = %record.session_id,
            checkpoint_type = record.checkpoint_type.as_str(),
            "Checkpoint created"
        );
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), CheckpointState::Pending(record));
        id
    }

    /// Pending records, optionally filtered by session
    pub fn pending(&self, session_id: Option<&str>) -> Vec<CheckpointRecord> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .values()
            .filter_map(|state| match state {
                CheckpointState::Pending(record) => Some(record.clone()),
                CheckpointState::Responded(_) => None,
            })
            .filter(|record| session_id.is_none_or(|s| record.session_id == s))
            .collect()
    }

    /// Fetch one record by id, pending or not
    pub fn get(&self, id: &str) -> Option<CheckpointRecord> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        match states.get(id) {
            Some(CheckpointState::Pending(record)) => Some(record.clone()),
            _ => None,
        }
    }

    /// Post a response to a pending checkpoint (called by the UI layer)
    pub fn post_response(&self, id: &str, response: Value) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        match states.get(id) {
            Some(CheckpointState::Pending(_)) => {
                states.insert(id.to_string(), CheckpointState::Responded(response));
                debug!(checkpoint_id = id, "Checkpoint response posted");
                true
            }
            _ => false,
        }
    }

    /// Block until a response arrives, the timeout passes, or cancellation
    ///
    /// Timeout and cancellation both return `None`; the record is removed
    /// either way.
    pub async fn wait_for_response(
        &self,
        id: &str,
        timeout: Option<Duration>,
        cancel: Option<CancelProbe>,
    ) -> Option<Value> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            {
                let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(CheckpointState::Responded(_)) = states.get(id) {
                    if let Some(CheckpointState::Responded(value)) = states.remove(id) {
                        return Some(value);
                    }
                }
            }

            if let Some(probe) = &cancel
                && probe()
            {
                warn!(checkpoint_id = id, "Checkpoint wait cancelled");
                self.states.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
                return None;
            }

            if let Some(deadline) = deadline
                && tokio::time::Instant::now() >= deadline
            {
                warn!(checkpoint_id = id, "Checkpoint timed out");
                self.states.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
                return None;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> CheckpointManager {
        CheckpointManager::new().with_poll_interval(Duration::from_millis(10))
    }

    fn record() -> CheckpointRecord {
        CheckpointRecord::new("sess-1", "flow", "draft", CheckpointType::Decision)
    }

    #[tokio::test]
    async fn test_response_resolves_wait() {
        let mgr = manager();
        let id = mgr.create(record());

        let waiter = {
            let mgr = mgr.clone();
            let id = id.clone();
            tokio::spawn(async move { mgr.wait_for_response(&id, Some(Duration::from_secs(5)), None).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(mgr.post_response(&id, json!({"decision_choice": "yes"})));

        let response = waiter.await.unwrap();
        assert_eq!(response.unwrap()["decision_choice"], "yes");
    }

    #[tokio::test]
    async fn test_timeout_returns_none() {
        let mgr = manager();
        let id = mgr.create(record());
        let response = mgr
            .wait_for_response(&id, Some(Duration::from_millis(50)), None)
            .await;
        assert!(response.is_none());
        // Record is gone after timeout
        assert!(mgr.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_returns_none() {
        let mgr = manager();
        let id = mgr.create(record());
        let cancel: CancelProbe = Arc::new(|| true);
        let response = mgr.wait_for_response(&id, None, Some(cancel)).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_pending_filter_by_session() {
        let mgr = manager();
        mgr.create(record());
        let mut other = record();
        other.session_id = "sess-2".to_string();
        other.id = Uuid::new_v4().to_string();
        mgr.create(other);

        assert_eq!(mgr.pending(Some("sess-1")).len(), 1);
        assert_eq!(mgr.pending(None).len(), 2);
    }

    #[tokio::test]
    async fn test_post_response_unknown_id() {
        let mgr = manager();
        assert!(!mgr.post_response("nope", json!({})));
    }

    #[test]
    fn test_checkpoint_type_names() {
        assert_eq!(CheckpointType::SoundingEval.as_str(), "SOUNDING_EVAL");
        assert_eq!(CheckpointType::PhaseInput.as_str(), "PHASE_INPUT");
    }
}
