//! Harness - the shared services every runner needs
//!
//! One harness per process: agent client, tool registry, durable stores,
//! event bus, checkpoints, audible source, config, template engine and the
//! tool cache. Runners hold it behind an `Arc` and thread explicit
//! snapshots (Echo clones) to their workers.

use std::sync::{Arc, Mutex};

use unilog::{LogEvent, SessionStore, UnifiedLog};

use crate::agent::Agent;
use crate::audible::{AudibleSource, NoAudibleSource};
use crate::cache::ToolCache;
use crate::cascade::config::ToolCachingConfig;
use crate::checkpoint::CheckpointManager;
use crate::config::CapstanConfig;
use crate::events::{CascadeEvent, EventBus};
use crate::prompts::PromptEngine;
use crate::tackle::{MemoryBank, ToolRegistry, register_memory_tools};

/// Initialize tracing with the conventional env-filter setup
///
/// Embedding applications call this once at startup; `RUST_LOG` controls
/// verbosity. Safe to call when a subscriber is already installed.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Process-wide execution services
pub struct Harness {
    pub agent: Arc<dyn Agent>,
    pub registry: ToolRegistry,
    pub sessions: SessionStore,
    pub log: UnifiedLog,
    pub bus: Arc<EventBus>,
    pub checkpoints: CheckpointManager,
    pub audibles: Arc<dyn AudibleSource>,
    pub config: CapstanConfig,
    pub prompts: PromptEngine,
    pub cache: Mutex<ToolCache>,
    pub memory: MemoryBank,
}

impl Harness {
    pub fn builder(agent: Arc<dyn Agent>) -> HarnessBuilder {
        HarnessBuilder {
            agent,
            registry: None,
            sessions: None,
            log: None,
            bus: None,
            checkpoints: None,
            audibles: None,
            config: None,
            caching: None,
        }
    }
}

/// Builder wiring the harness together
pub struct HarnessBuilder {
    agent: Arc<dyn Agent>,
    registry: Option<ToolRegistry>,
    sessions: Option<SessionStore>,
    log: Option<UnifiedLog>,
    bus: Option<Arc<EventBus>>,
    checkpoints: Option<CheckpointManager>,
    audibles: Option<Arc<dyn AudibleSource>>,
    config: Option<CapstanConfig>,
    caching: Option<ToolCachingConfig>,
}

impl HarnessBuilder {
    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn log(mut self, log: UnifiedLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn audibles(mut self, audibles: Arc<dyn AudibleSource>) -> Self {
        self.audibles = Some(audibles);
        self
    }

    pub fn config(mut self, config: CapstanConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn tool_caching(mut self, caching: ToolCachingConfig) -> Self {
        self.caching = Some(caching);
        self
    }

    /// Assemble the harness
    ///
    /// Defaults: in-memory stores, a fresh bus, no audible source, default
    /// config, and the memory-bank tools registered on the registry. The
    /// unified log's events are bridged onto the bus.
    pub fn build(self) -> eyre::Result<Arc<Harness>> {
        let config = self.config.unwrap_or_default();
        let sessions = match self.sessions {
            Some(sessions) => sessions,
            None => SessionStore::open_in_memory()?,
        };
        let log = match self.log {
            Some(log) => log,
            None => UnifiedLog::open_in_memory()?,
        };
        let bus = self.bus.unwrap_or_else(|| Arc::new(EventBus::with_default_capacity()));

        // Cost updates and write errors from the log surface as bus events
        let bridge_bus = Arc::clone(&bus);
        log.set_listener(Arc::new(move |event| match event {
            LogEvent::CostUpdate(update) => bridge_bus.publish(update.into()),
            LogEvent::WriteError(message) => bridge_bus.publish(CascadeEvent::LogError { message }),
        }));

        let memory = MemoryBank::new();
        let mut registry = self.registry.unwrap_or_default();
        register_memory_tools(&mut registry, memory.clone());

        let cache = ToolCache::new(self.caching.unwrap_or_default());

        Ok(Arc::new(Harness {
            agent: self.agent,
            registry,
            sessions,
            log,
            bus,
            checkpoints: self.checkpoints.unwrap_or_default(),
            audibles: self.audibles.unwrap_or_else(|| Arc::new(NoAudibleSource)),
            config,
            prompts: PromptEngine::new(),
            cache: Mutex::new(cache),
            memory,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;

    #[tokio::test]
    async fn test_builder_defaults() {
        let harness = Harness::builder(Arc::new(MockAgent::from_texts(vec![])))
            .build()
            .unwrap();
        // Memory-bank tools are always present
        assert!(harness.registry.get_tool("remember").is_some());
        assert!(harness.registry.get_tool("recall").is_some());
    }

    #[tokio::test]
    async fn test_log_events_bridge_to_bus() {
        let harness = Harness::builder(Arc::new(MockAgent::from_texts(vec![])))
            .build()
            .unwrap();
        let mut rx = harness.bus.subscribe();

        // Simulate what the log does on a failed flush
        harness.log.set_listener({
            let bus = Arc::clone(&harness.bus);
            Arc::new(move |event| {
                if let LogEvent::WriteError(message) = event {
                    bus.publish(CascadeEvent::LogError { message });
                }
            })
        });
        harness.bus.publish(CascadeEvent::LogError {
            message: "test".to_string(),
        });
        assert_eq!(rx.recv().await.unwrap().event_type(), "log_error");
    }
}
