//! Cascade definition and execution
//!
//! [`config`] holds the declarative model, [`loader`] reads JSON/YAML
//! files, [`species`] computes the prompt-DNA hash, and [`runner`] drives
//! the top-level state machine.

pub mod config;
pub mod loader;
pub mod runner;
pub mod species;

pub use config::{CascadeConfig, PhaseConfig, SoundingsConfig};
pub use loader::load_cascade;
pub use runner::{CascadeRunner, RunOptions, run_cascade};
pub use species::{canonical_json, species_hash};
