//! Durable session records with status, heartbeat and cancel flag
//!
//! One row per cascade run. Child sessions (sub-cascades, cascade-level
//! soundings) reference their parent via `parent_session_id`, which is how
//! `request_cancel` reaches descendants.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Queued,
    Running,
    Blocked,
    Completed,
    Error,
    Cancelled,
    Orphaned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Running => "running",
            SessionStatus::Blocked => "blocked",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Orphaned => "orphaned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(SessionStatus::Queued),
            "running" => Some(SessionStatus::Running),
            "blocked" => Some(SessionStatus::Blocked),
            "completed" => Some(SessionStatus::Completed),
            "error" => Some(SessionStatus::Error),
            "cancelled" => Some(SessionStatus::Cancelled),
            "orphaned" => Some(SessionStatus::Orphaned),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Error | SessionStatus::Cancelled
        )
    }

    /// Whether a transition from `self` to `to` is legal
    ///
    /// Same-status transitions are idempotent no-ops and always legal.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        if *self == to {
            return true;
        }
        match self {
            SessionStatus::Queued => matches!(
                to,
                SessionStatus::Running | SessionStatus::Cancelled | SessionStatus::Error
            ),
            SessionStatus::Running => matches!(
                to,
                SessionStatus::Blocked
                    | SessionStatus::Completed
                    | SessionStatus::Error
                    | SessionStatus::Cancelled
                    | SessionStatus::Orphaned
            ),
            SessionStatus::Blocked => matches!(
                to,
                SessionStatus::Running
                    | SessionStatus::Completed
                    | SessionStatus::Error
                    | SessionStatus::Cancelled
                    | SessionStatus::Orphaned
            ),
            SessionStatus::Orphaned => matches!(
                to,
                SessionStatus::Running | SessionStatus::Error | SessionStatus::Cancelled
            ),
            // Terminal states reject everything except the idempotent case above
            SessionStatus::Completed | SessionStatus::Error | SessionStatus::Cancelled => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One durable session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub cascade_id: String,
    pub parent_session_id: Option<String>,
    pub depth: i64,
    pub status: SessionStatus,
    pub current_phase: Option<String>,
    /// Unix millis of the last heartbeat write
    pub heartbeat_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub metadata_json: Option<String>,
}

/// Filter for `SessionStore::list`
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub cascade_id: Option<String>,
    pub limit: Option<usize>,
}

/// Durable mapping `session_id -> SessionRecord` on SQLite
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open (or create) the session store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    /// In-memory store for tests and ephemeral runs
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id        TEXT PRIMARY KEY,
                cascade_id        TEXT NOT NULL,
                parent_session_id TEXT,
                depth             INTEGER NOT NULL DEFAULT 0,
                status            TEXT NOT NULL,
                current_phase     TEXT,
                heartbeat_at      INTEGER NOT NULL,
                created_at        INTEGER NOT NULL,
                updated_at        INTEGER NOT NULL,
                error_message     TEXT,
                cancel_requested  INTEGER NOT NULL DEFAULT 0,
                metadata_json     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);",
        )?;
        debug!("SessionStore initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new session record in `queued` status
    ///
    /// Fails with `AlreadyExists` if the id is taken.
    pub fn create(
        &self,
        session_id: &str,
        cascade_id: &str,
        parent_session_id: Option<&str>,
        depth: i64,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let metadata_json = metadata.map(|m| m.to_string());
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        let existing: Option<String> = conn
            .query_row(
                "SELECT session_id FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::AlreadyExists(session_id.to_string()));
        }

        conn.execute(
            "INSERT INTO sessions (session_id, cascade_id, parent_session_id, depth, status,
                                   heartbeat_at, created_at, updated_at, cancel_requested, metadata_json)
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?5, ?5, 0, ?6)",
            params![session_id, cascade_id, parent_session_id, depth, now, metadata_json],
        )?;
        info!(session_id, cascade_id, depth, "Session created");
        Ok(())
    }

    /// Transition a session's status, optionally updating phase and error
    ///
    /// Idempotent for same-status calls; rejects illegal transitions such as
    /// `completed -> running`.
    pub fn status(
        &self,
        session_id: &str,
        status: SessionStatus,
        current_phase: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        let current: String = conn
            .query_row(
                "SELECT status FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        let from = SessionStatus::parse(&current).unwrap_or(SessionStatus::Error);
        if !from.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                session_id: session_id.to_string(),
                from: from.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }

        conn.execute(
            "UPDATE sessions
             SET status = ?2,
                 current_phase = COALESCE(?3, current_phase),
                 error_message = COALESCE(?4, error_message),
                 updated_at = ?5
             WHERE session_id = ?1",
            params![session_id, status.as_str(), current_phase, error_message, now],
        )?;
        debug!(session_id, from = %from, to = %status, "Session status updated");
        Ok(())
    }

    /// Write `heartbeat_at = now()` for the session
    pub fn heartbeat(&self, session_id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn.execute(
            "UPDATE sessions SET heartbeat_at = ?2 WHERE session_id = ?1",
            params![session_id, now],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Set `cancel_requested` for the session and all its descendants
    pub fn request_cancel(&self, session_id: &str, reason: Option<&str>) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        // Walk the tree breadth-first; parent linkage is a plain column
        let mut pending = vec![session_id.to_string()];
        let mut all = Vec::new();
        while let Some(id) = pending.pop() {
            let mut stmt = conn.prepare("SELECT session_id FROM sessions WHERE parent_session_id = ?1")?;
            let children: Vec<String> = stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            pending.extend(children);
            all.push(id);
        }

        for id in &all {
            conn.execute(
                "UPDATE sessions
                 SET cancel_requested = 1,
                     error_message = COALESCE(?2, error_message),
                     updated_at = ?3
                 WHERE session_id = ?1",
                params![id, reason, now],
            )?;
        }
        warn!(session_id, descendants = all.len() - 1, "Cancellation requested");
        Ok(())
    }

    /// Whether cancellation has been requested for the session
    ///
    /// Unknown sessions report `false`; runners consult this between phases
    /// and turns and must not fail because a record is missing.
    pub fn is_cancelled(&self, session_id: &str) -> bool {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT cancel_requested FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .ok()
        .flatten()
        .map(|v| v != 0)
        .unwrap_or(false)
    }

    /// Fetch a session record
    pub fn get(&self, session_id: &str) -> Result<SessionRecord> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT session_id, cascade_id, parent_session_id, depth, status, current_phase,
                    heartbeat_at, created_at, updated_at, error_message, cancel_requested, metadata_json
             FROM sessions WHERE session_id = ?1",
            params![session_id],
            Self::map_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    /// List sessions matching the filter, most recently updated first
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>> {
        let mut sql = String::from(
            "SELECT session_id, cascade_id, parent_session_id, depth, status, current_phase,
                    heartbeat_at, created_at, updated_at, error_message, cancel_requested, metadata_json
             FROM sessions WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(cascade_id) = &filter.cascade_id {
            sql.push_str(" AND cascade_id = ?");
            args.push(Box::new(cascade_id.clone()));
        }
        sql.push_str(" ORDER BY updated_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
        let status_str: String = row.get(4)?;
        Ok(SessionRecord {
            session_id: row.get(0)?,
            cascade_id: row.get(1)?,
            parent_session_id: row.get(2)?,
            depth: row.get(3)?,
            status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Error),
            current_phase: row.get(5)?,
            heartbeat_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            error_message: row.get(9)?,
            cancel_requested: row.get::<_, i64>(10)? != 0,
            metadata_json: row.get(11)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let s = store();
        s.create("sess-1", "blog_flow", None, 0, None).unwrap();
        let rec = s.get("sess-1").unwrap();
        assert_eq!(rec.cascade_id, "blog_flow");
        assert_eq!(rec.status, SessionStatus::Queued);
        assert!(!rec.cancel_requested);
    }

    #[test]
    fn test_create_duplicate_fails() {
        let s = store();
        s.create("sess-1", "a", None, 0, None).unwrap();
        let err = s.create("sess-1", "a", None, 0, None).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn test_status_transitions() {
        let s = store();
        s.create("sess-1", "a", None, 0, None).unwrap();
        s.status("sess-1", SessionStatus::Running, Some("draft"), None).unwrap();
        s.status("sess-1", SessionStatus::Blocked, None, None).unwrap();
        s.status("sess-1", SessionStatus::Running, None, None).unwrap();
        s.status("sess-1", SessionStatus::Completed, None, None).unwrap();

        let rec = s.get("sess-1").unwrap();
        assert_eq!(rec.status, SessionStatus::Completed);
        assert_eq!(rec.current_phase.as_deref(), Some("draft"));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let s = store();
        s.create("sess-1", "a", None, 0, None).unwrap();
        s.status("sess-1", SessionStatus::Running, None, None).unwrap();
        s.status("sess-1", SessionStatus::Completed, None, None).unwrap();

        let err = s
            .status("sess-1", SessionStatus::Running, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn test_same_status_is_idempotent() {
        let s = store();
        s.create("sess-1", "a", None, 0, None).unwrap();
        s.status("sess-1", SessionStatus::Running, None, None).unwrap();
        s.status("sess-1", SessionStatus::Running, None, None).unwrap();
    }

    #[test]
    fn test_heartbeat_updates() {
        let s = store();
        s.create("sess-1", "a", None, 0, None).unwrap();
        let before = s.get("sess-1").unwrap().heartbeat_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.heartbeat("sess-1").unwrap();
        let after = s.get("sess-1").unwrap().heartbeat_at;
        assert!(after >= before);
    }

    #[test]
    fn test_cancel_cascades_to_descendants() {
        let s = store();
        s.create("root", "a", None, 0, None).unwrap();
        s.create("child", "a", Some("root"), 1, None).unwrap();
        s.create("grandchild", "a", Some("child"), 2, None).unwrap();
        s.create("other", "a", None, 0, None).unwrap();

        s.request_cancel("root", Some("user abort")).unwrap();

        assert!(s.is_cancelled("root"));
        assert!(s.is_cancelled("child"));
        assert!(s.is_cancelled("grandchild"));
        assert!(!s.is_cancelled("other"));
    }

    #[test]
    fn test_is_cancelled_unknown_session() {
        let s = store();
        assert!(!s.is_cancelled("nope"));
    }

    #[test]
    fn test_list_filters() {
        let s = store();
        s.create("s1", "a", None, 0, None).unwrap();
        s.create("s2", "b", None, 0, None).unwrap();
        s.status("s2", SessionStatus::Running, None, None).unwrap();

        let running = s
            .list(&SessionFilter {
                status: Some(SessionStatus::Running),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].session_id, "s2");

        let by_cascade = s
            .list(&SessionFilter {
                cascade_id: Some("a".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_cascade.len(), 1);
        assert_eq!(by_cascade[0].session_id, "s1");
    }
}
