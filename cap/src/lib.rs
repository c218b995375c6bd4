//! Capstan - a declarative cascade orchestrator for LLM-driven workflows
//!
//! A *cascade* is a directed graph of *phases* declared in JSON or YAML.
//! Each phase instructs a language model, optionally invokes tools, may fan
//! out into parallel *sounding* attempts that are evaluated for a winner,
//! may spawn sub-cascades, and transitions to a successor statically or
//! dynamically. Capstan owns the execution contract: message flow,
//! concurrency, validation, retries, durability and telemetry.
//!
//! # Modules
//!
//! - [`cascade`] - the declarative model, loader, species hash and the
//!   top-level runner
//! - [`phase`] - single-phase execution: turns, tools, wards, extraction
//! - [`sounding`] - parallel attempts, evaluators, Pareto selection, reforge
//! - [`agent`] - the model client trait, wire client and test mock
//! - [`tackle`] - the tool system: registry, manifest, quartermaster
//! - [`echo`] - live per-session state feeding the unified log
//! - [`context`] - declared context propagation between phases
//! - [`checkpoint`] - human-in-the-loop suspension records
//! - [`events`] - in-process pub/sub of cascade activity
//!
//! Durable storage (the unified mega-table log and the session store) lives
//! in the `unilog` crate.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use capstan::agent::OpenRouterAgent;
//! use capstan::cascade::{load_cascade, run_cascade};
//! use capstan::runtime::Harness;
//!
//! # async fn example() -> eyre::Result<()> {
//! let config = capstan::config::CapstanConfig::load(None)?;
//! let agent = Arc::new(OpenRouterAgent::from_config(&config.provider)?);
//! let harness = Harness::builder(agent).config(config).build()?;
//!
//! let cascade = load_cascade("flows/blog_flow.json")?;
//! let snapshot = run_cascade(harness, cascade, "write about tides", None).await?;
//! println!("{:?}", snapshot.final_output);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod audible;
pub mod budget;
pub mod cache;
pub mod cascade;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod echo;
pub mod error;
pub mod events;
pub mod graph;
pub mod images;
pub mod parser;
pub mod phase;
pub mod progress;
pub mod prompts;
pub mod runtime;
pub mod sounding;
pub mod tackle;
pub mod validate;

// Re-export commonly used types
pub use agent::{Agent, AgentError, AgentRequest, AgentResponse, ChatMessage, MockAgent, OpenRouterAgent};
pub use audible::{AudibleSource, LocalAudibleSource};
pub use cascade::{CascadeConfig, CascadeRunner, PhaseConfig, RunOptions, load_cascade, run_cascade, species_hash};
pub use checkpoint::{CheckpointManager, CheckpointRecord, CheckpointType};
pub use config::CapstanConfig;
pub use echo::{Echo, EchoSnapshot};
pub use error::CascadeError;
pub use events::{CascadeEvent, EventBus, create_event_bus};
pub use parser::{ParsedToolCall, ToolCallParser};
pub use phase::{PhaseOutcome, PhaseRunner};
pub use progress::ProgressReporter;
pub use runtime::{Harness, init_tracing};
pub use sounding::SoundingRunner;
pub use tackle::{Tool, ToolDescriptor, ToolRegistry};
pub use validate::{ValidationResult, Validator};
