//! Unilog - durable storage for cascade runs
//!
//! Two stores on SQLite:
//!
//! - [`UnifiedLog`] - an append-only mega-table capturing every message, tool
//!   call, validation, evaluation and lifecycle event of a run, with
//!   two-stage buffering and deferred provider cost attribution.
//! - [`SessionStore`] - one durable record per session with status,
//!   heartbeat and a cooperative cancel flag that propagates to descendants.
//!
//! Consumers include the execution engine, UIs and offline analyzers; column
//! names on the mega-table are part of the export contract.

pub mod cost;
pub mod error;
pub mod log;
pub mod row;
pub mod session;

pub use cost::{CostData, CostLookup, CostUpdate, LogEvent, LogListener, NoCostLookup};
pub use error::{Result, StoreError};
pub use log::{LogConfig, UnifiedLog};
pub use row::{LogFilter, LogRow, SemanticActor, SemanticPurpose, safe_json};
pub use session::{SessionFilter, SessionRecord, SessionStatus, SessionStore};
