//! Event Bus - in-process pub/sub for cascade activity
//!
//! Built on a tokio broadcast channel: publishers never block, subscribers
//! receive events in publish order, and a subscriber that falls behind the
//! bounded queue is lagged (it drops the oldest events with a warning and
//! keeps going). Consumers include progress reporters, UIs and tests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use unilog::CostUpdate;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// The vocabulary of observable cascade activity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CascadeEvent {
    // === Sounding lifecycle ===
    SoundingStart {
        session_id: String,
        phase_name: String,
        sounding_index: usize,
        model: String,
        mutation_type: Option<String>,
    },
    SoundingComplete {
        session_id: String,
        phase_name: String,
        sounding_index: usize,
        success: bool,
        output_preview: String,
    },
    SoundingWinner {
        session_id: String,
        phase_name: String,
        winner_indices: Vec<usize>,
        evaluation_mode: String,
    },

    // === Model management ===
    ModelsFiltered {
        session_id: String,
        phase_name: String,
        removed: Vec<String>,
        estimated_tokens: usize,
    },

    // === Cost attribution ===
    CostUpdate {
        session_id: String,
        trace_id: String,
        phase_name: Option<String>,
        sounding_index: Option<i64>,
        cost: f64,
        tokens_in: i64,
        tokens_out: i64,
    },

    // === Phase progress ===
    PhaseProgress {
        session_id: String,
        phase_name: String,
        stage: String,
        turn: Option<usize>,
        attempt: Option<usize>,
        detail: Option<String>,
    },

    // === Checkpoints ===
    CheckpointCreated {
        session_id: String,
        checkpoint_id: String,
        checkpoint_type: String,
    },
    CheckpointResolved {
        session_id: String,
        checkpoint_id: String,
        timed_out: bool,
    },

    // === Budget enforcement ===
    BudgetEnforced {
        session_id: String,
        phase_name: String,
        strategy: String,
        dropped_messages: usize,
    },

    // === Errors ===
    LogError {
        message: String,
    },
    PhaseError {
        session_id: String,
        phase_name: String,
        kind: String,
        message: String,
    },
}

impl CascadeEvent {
    /// Stable topic name for subscribers that filter by type
    pub fn event_type(&self) -> &'static str {
        match self {
            CascadeEvent::SoundingStart { .. } => "sounding_start",
            CascadeEvent::SoundingComplete { .. } => "sounding_complete",
            CascadeEvent::SoundingWinner { .. } => "sounding_winner",
            CascadeEvent::ModelsFiltered { .. } => "models_filtered",
            CascadeEvent::CostUpdate { .. } => "cost_update",
            CascadeEvent::PhaseProgress { .. } => "phase_progress",
            CascadeEvent::CheckpointCreated { .. } => "checkpoint_created",
            CascadeEvent::CheckpointResolved { .. } => "checkpoint_resolved",
            CascadeEvent::BudgetEnforced { .. } => "budget_enforced",
            CascadeEvent::LogError { .. } => "log_error",
            CascadeEvent::PhaseError { .. } => "phase_error",
        }
    }

    /// Session this event belongs to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            CascadeEvent::SoundingStart { session_id, .. }
            | CascadeEvent::SoundingComplete { session_id, .. }
            | CascadeEvent::SoundingWinner { session_id, .. }
            | CascadeEvent::ModelsFiltered { session_id, .. }
            | CascadeEvent::CostUpdate { session_id, .. }
            | CascadeEvent::PhaseProgress { session_id, .. }
            | CascadeEvent::CheckpointCreated { session_id, .. }
            | CascadeEvent::CheckpointResolved { session_id, .. }
            | CascadeEvent::BudgetEnforced { session_id, .. }
            | CascadeEvent::PhaseError { session_id, .. } => Some(session_id),
            CascadeEvent::LogError { .. } => None,
        }
    }
}

impl From<CostUpdate> for CascadeEvent {
    fn from(update: CostUpdate) -> Self {
        CascadeEvent::CostUpdate {
            session_id: update.session_id,
            trace_id: update.trace_id,
            phase_name: update.phase_name,
            sounding_index: update.sounding_index,
            cost: update.cost,
            tokens_in: update.tokens_in,
            tokens_out: update.tokens_out,
        }
    }
}

/// Central event bus for cascade activity
pub struct EventBus {
    tx: broadcast::Sender<CascadeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Publish an event to all subscribers
    ///
    /// Fire-and-forget: no subscribers is fine, and a full channel lags the
    /// slowest subscriber rather than blocking the publisher.
    pub fn publish(&self, event: CascadeEvent) {
        debug!(event_type = event.event_type(), "EventBus::publish");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<CascadeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();

        bus.publish(CascadeEvent::SoundingStart {
            session_id: "s1".to_string(),
            phase_name: "draft".to_string(),
            sounding_index: 0,
            model: "m".to_string(),
            mutation_type: None,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "sounding_start");
        assert_eq!(event.session_id(), Some("s1"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(100);
        bus.publish(CascadeEvent::LogError {
            message: "disk full".to_string(),
        });
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(CascadeEvent::PhaseProgress {
                session_id: "s1".to_string(),
                phase_name: "draft".to_string(),
                stage: "turn".to_string(),
                turn: Some(i),
                attempt: Some(0),
                detail: None,
            });
        }

        for i in 0..5 {
            match rx.recv().await.unwrap() {
                CascadeEvent::PhaseProgress { turn, .. } => assert_eq!(turn, Some(i)),
                other => panic!("Unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_continues() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for _ in 0..10 {
            bus.publish(CascadeEvent::LogError {
                message: "x".to_string(),
            });
        }

        // Oldest events were dropped, but the subscriber keeps receiving
        match rx.recv().await {
            Ok(event) => assert_eq!(event.event_type(), "log_error"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                assert!(n > 0);
                let event = rx.recv().await.unwrap();
                assert_eq!(event.event_type(), "log_error");
            }
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_cost_update_conversion() {
        let update = CostUpdate {
            trace_id: "t1".to_string(),
            session_id: "s1".to_string(),
            phase_name: Some("draft".to_string()),
            cascade_id: None,
            sounding_index: Some(2),
            request_id: None,
            cost: 0.05,
            tokens_in: 100,
            tokens_out: 50,
        };
        let event: CascadeEvent = update.into();
        assert_eq!(event.event_type(), "cost_update");
        assert_eq!(event.session_id(), Some("s1"));
    }
}
