//! Progress reporter - phase-stage progress derived from runner activity
//!
//! A thin emitter handle bound to one session; runners call the typed
//! methods and subscribers see `phase_progress` (and sounding lifecycle)
//! events on the bus. Cheap to clone.

use std::sync::Arc;

use crate::events::{CascadeEvent, EventBus};

/// Emitter handle for one session's progress
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<EventBus>,
    session_id: String,
}

impl ProgressReporter {
    pub fn new(bus: Arc<EventBus>, session_id: impl Into<String>) -> Self {
        Self {
            bus,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn progress(&self, phase: &str, stage: &str, turn: Option<usize>, attempt: Option<usize>, detail: Option<String>) {
        self.bus.publish(CascadeEvent::PhaseProgress {
            session_id: self.session_id.clone(),
            phase_name: phase.to_string(),
            stage: stage.to_string(),
            turn,
            attempt,
            detail,
        });
    }

    /// A phase is starting
    pub fn phase_started(&self, phase: &str) {
        self.progress(phase, "phase_start", None, None, None);
    }

    /// A turn of the attempt loop is starting
    pub fn turn(&self, phase: &str, turn: usize, attempt: usize) {
        self.progress(phase, "turn", Some(turn), Some(attempt), None);
    }

    /// A ward is being evaluated
    pub fn ward(&self, phase: &str, ward: &str) {
        self.progress(phase, "ward", None, None, Some(ward.to_string()));
    }

    /// A tool is executing
    pub fn tool(&self, phase: &str, tool: &str) {
        self.progress(phase, "tool", None, None, Some(tool.to_string()));
    }

    /// The phase finished (successfully or not)
    pub fn phase_finished(&self, phase: &str, success: bool) {
        self.progress(
            phase,
            if success { "phase_complete" } else { "phase_failed" },
            None,
            None,
            None,
        );
    }

    pub fn sounding_start(&self, phase: &str, index: usize, model: &str, mutation_type: Option<String>) {
        self.bus.publish(CascadeEvent::SoundingStart {
            session_id: self.session_id.clone(),
            phase_name: phase.to_string(),
            sounding_index: index,
            model: model.to_string(),
            mutation_type,
        });
    }

    pub fn sounding_complete(&self, phase: &str, index: usize, success: bool, output_preview: &str) {
        let preview: String = output_preview.chars().take(200).collect();
        self.bus.publish(CascadeEvent::SoundingComplete {
            session_id: self.session_id.clone(),
            phase_name: phase.to_string(),
            sounding_index: index,
            success,
            output_preview: preview,
        });
    }

    pub fn sounding_winner(&self, phase: &str, winner_indices: Vec<usize>, evaluation_mode: &str) {
        self.bus.publish(CascadeEvent::SoundingWinner {
            session_id: self.session_id.clone(),
            phase_name: phase.to_string(),
            winner_indices,
            evaluation_mode: evaluation_mode.to_string(),
        });
    }

    pub fn models_filtered(&self, phase: &str, removed: Vec<String>, estimated_tokens: usize) {
        self.bus.publish(CascadeEvent::ModelsFiltered {
            session_id: self.session_id.clone(),
            phase_name: phase.to_string(),
            removed,
            estimated_tokens,
        });
    }

    pub fn budget_enforced(&self, phase: &str, strategy: &str, dropped_messages: usize) {
        self.bus.publish(CascadeEvent::BudgetEnforced {
            session_id: self.session_id.clone(),
            phase_name: phase.to_string(),
            strategy: strategy.to_string(),
            dropped_messages,
        });
    }

    pub fn phase_error(&self, phase: &str, kind: &str, message: &str) {
        self.bus.publish(CascadeEvent::PhaseError {
            session_id: self.session_id.clone(),
            phase_name: phase.to_string(),
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_event_bus;

    #[tokio::test]
    async fn test_turn_progress_event() {
        let bus = create_event_bus();
        let mut rx = bus.subscribe();
        let reporter = ProgressReporter::new(Arc::clone(&bus), "sess-1");

        reporter.turn("draft", 2, 0);

        match rx.recv().await.unwrap() {
            CascadeEvent::PhaseProgress {
                session_id,
                phase_name,
                stage,
                turn,
                attempt,
                ..
            } => {
                assert_eq!(session_id, "sess-1");
                assert_eq!(phase_name, "draft");
                assert_eq!(stage, "turn");
                assert_eq!(turn, Some(2));
                assert_eq!(attempt, Some(0));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sounding_lifecycle_events() {
        let bus = create_event_bus();
        let mut rx = bus.subscribe();
        let reporter = ProgressReporter::new(Arc::clone(&bus), "sess-1");

        reporter.sounding_start("draft", 0, "m1", None);
        reporter.sounding_complete("draft", 0, true, "a long output that should be previewed");
        reporter.sounding_winner("draft", vec![0], "llm");

        assert_eq!(rx.recv().await.unwrap().event_type(), "sounding_start");
        assert_eq!(rx.recv().await.unwrap().event_type(), "sounding_complete");
        match rx.recv().await.unwrap() {
            CascadeEvent::SoundingWinner { winner_indices, .. } => {
                assert_eq!(winner_indices, vec![0]);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_preview_truncated() {
        let bus = create_event_bus();
        let mut rx = bus.subscribe();
        let reporter = ProgressReporter::new(Arc::clone(&bus), "sess-1");

        let long = "x".repeat(1000);
        reporter.sounding_complete("draft", 1, false, &long);

        match rx.recv().await.unwrap() {
            CascadeEvent::SoundingComplete { output_preview, .. } => {
                assert_eq!(output_preview.len(), 200);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }
}
