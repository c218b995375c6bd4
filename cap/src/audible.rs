//! Audible signals - mid-phase user interjections
//!
//! An audible lets a user interject between turns without killing the
//! phase: the runner polls the signal source after each turn and, when a
//! signal is present, opens a checkpoint carrying the current output. The
//! source is pluggable; the crate ships the in-process one, external
//! processes can bridge their own (an HTTP poller, a file watcher).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Source of audible signals for sessions
pub trait AudibleSource: Send + Sync {
    /// Take the next pending signal for a session, if any
    ///
    /// The optional string is a user note shown in the checkpoint.
    fn take_signal(&self, session_id: &str) -> Option<String>;
}

/// In-process audible source
///
/// UIs raise signals by session id; runners drain them between turns.
#[derive(Clone, Default)]
pub struct LocalAudibleSource {
    signals: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl LocalAudibleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an audible for a session
    pub fn raise(&self, session_id: &str, note: impl Into<String>) {
        debug!(session_id, "Audible raised");
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .push_back(note.into());
    }
}

impl AudibleSource for LocalAudibleSource {
    fn take_signal(&self, session_id: &str) -> Option<String> {
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(session_id)?
            .pop_front()
    }
}

/// A source that never signals; the default when audibles are unused
pub struct NoAudibleSource;

impl AudibleSource for NoAudibleSource {
    fn take_signal(&self, _session_id: &str) -> Option<String> {
        None
    }
}
