//! Soundings - parallel attempts, evaluation, reforge
//!
//! A sounding takes N parallel readings of the same phase; the evaluator
//! decides which one was the true depth.

pub mod evaluator;
pub mod pareto;
pub mod runner;

pub use evaluator::{EvalCandidate, EvalDecision};
pub use pareto::{ParetoCandidate, pareto_frontier, select_from_frontier};
pub use runner::SoundingRunner;
