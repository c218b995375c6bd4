//! Phase execution
//!
//! [`runner`] drives a single phase's contract; [`mutation`] varies prompts
//! for sounding attempts; [`extraction`] captures structured output into
//! state.

pub mod extraction;
pub mod mutation;
pub mod runner;

pub use extraction::{extract_output, has_pattern};
pub use mutation::{AppliedMutation, rewrite_prompt, select_template};
pub use runner::{PhaseOutcome, PhaseRunOptions, PhaseRunner};
