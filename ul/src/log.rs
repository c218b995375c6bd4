//! Unified mega-table log with two-stage buffering and deferred cost
//!
//! Rows that need provider cost data (assistant rows carrying a
//! `request_id`) wait in a pending buffer; everything else goes straight to
//! the ready buffer. A background worker ages pending rows, looks up their
//! cost, publishes a `cost_update` event and moves them to ready. A single
//! writer drains the ready buffer to SQLite in batches.
//!
//! Flush failures never lose data: rows are retained and the error is
//! surfaced as a `LogEvent::WriteError`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rusqlite::{Connection, params};
use tracing::{debug, error, info, warn};

use crate::cost::{CostLookup, CostUpdate, LOOKUP_BACKOFF, LogEvent, LogListener, NoCostLookup};
use crate::error::Result;
use crate::row::{LogFilter, LogRow};

/// Flush when the ready buffer reaches this many rows
pub const BUFFER_LIMIT: usize = 100;
/// ... or when this long has passed since the last write
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Minimum row age before the first cost lookup (providers lag a few seconds)
pub const COST_FETCH_DELAY: Duration = Duration::from_secs(3);
/// Give up waiting for cost after this long; the row is written without it
pub const COST_MAX_WAIT: Duration = Duration::from_secs(15);
/// Worker wake interval
const WORKER_TICK: Duration = Duration::from_millis(500);

/// Tuning knobs for the log buffers
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub buffer_limit: usize,
    pub flush_interval: Duration,
    pub cost_fetch_delay: Duration,
    pub cost_max_wait: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_limit: BUFFER_LIMIT,
            flush_interval: FLUSH_INTERVAL,
            cost_fetch_delay: COST_FETCH_DELAY,
            cost_max_wait: COST_MAX_WAIT,
        }
    }
}

/// A row parked while its cost is resolved
struct PendingRow {
    row: LogRow,
    request_id: String,
    queued_at: Instant,
}

struct Inner {
    conn: Mutex<Connection>,
    ready: Mutex<Vec<LogRow>>,
    pending: Mutex<Vec<PendingRow>>,
    last_write: Mutex<Instant>,
    listener: Mutex<Option<LogListener>>,
    lookup: Arc<dyn CostLookup>,
    config: LogConfig,
    running: AtomicBool,
}

/// Append-only event sink for all cascade activity
///
/// Cheap to clone; all clones share the same buffers and connection. The
/// background cost worker exits when the last handle drops, and remaining
/// buffered rows are written (without cost) on drop.
#[derive(Clone)]
pub struct UnifiedLog {
    inner: Arc<Inner>,
}

impl UnifiedLog {
    /// Open (or create) the log at the given path with default tuning
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_lookup(Connection::open(path.as_ref())?, Arc::new(NoCostLookup), LogConfig::default())
    }

    /// In-memory log for tests and ephemeral runs
    pub fn open_in_memory() -> Result<Self> {
        Self::with_lookup(Connection::open_in_memory()?, Arc::new(NoCostLookup), LogConfig::default())
    }

    /// Open with a provider cost lookup and custom tuning
    pub fn open_with(
        path: impl AsRef<Path>,
        lookup: Arc<dyn CostLookup>,
        config: LogConfig,
    ) -> Result<Self> {
        Self::with_lookup(Connection::open(path.as_ref())?, lookup, config)
    }

    /// In-memory log with a cost lookup, for tests
    pub fn open_in_memory_with(lookup: Arc<dyn CostLookup>, config: LogConfig) -> Result<Self> {
        Self::with_lookup(Connection::open_in_memory()?, lookup, config)
    }

    fn with_lookup(conn: Connection, lookup: Arc<dyn CostLookup>, config: LogConfig) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let inner = Arc::new(Inner {
            conn: Mutex::new(conn),
            ready: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            last_write: Mutex::new(Instant::now()),
            listener: Mutex::new(None),
            lookup,
            config,
            running: AtomicBool::new(true),
        });

        // The worker holds a weak reference so the log can shut down when the
        // last user handle drops. Without a runtime (sync callers, tests)
        // there is no background resolution; flush() still resolves
        // synchronously.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&inner);
            handle.spawn(cost_worker(weak));
        }

        debug!("UnifiedLog initialized");
        Ok(Self { inner })
    }

    /// Register the single event listener (cost updates, write errors)
    pub fn set_listener(&self, listener: LogListener) {
        *self.inner.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Enqueue one row; never blocks on I/O or cost lookups
    ///
    /// Assistant rows that carry a `request_id` but no cost wait in the
    /// pending buffer for the background worker; all other rows are ready
    /// immediately.
    pub fn log(&self, mut row: LogRow) {
        row.recompute_total_tokens();

        let needs_deferred_cost =
            row.request_id.is_some() && row.cost.is_none() && row.role.as_deref() == Some("assistant");

        if needs_deferred_cost {
            let request_id = row.request_id.clone().unwrap_or_default();
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.push(PendingRow {
                row,
                request_id,
                queued_at: Instant::now(),
            });
            return;
        }

        let should_flush = {
            let mut ready = self.inner.ready.lock().unwrap_or_else(|e| e.into_inner());
            ready.push(row);
            let last = *self.inner.last_write.lock().unwrap_or_else(|e| e.into_inner());
            ready.len() >= self.inner.config.buffer_limit || last.elapsed() >= self.inner.config.flush_interval
        };

        if should_flush {
            self.inner.write_ready();
        }
    }

    /// Drain both buffers, resolving remaining pending costs synchronously
    ///
    /// Used at phase and cascade boundaries and on shutdown so the durable
    /// view catches up with execution.
    pub async fn flush(&self) {
        let pending: Vec<PendingRow> = {
            let mut guard = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };

        for mut item in pending {
            if let Some(data) = resolve_with_backoff(&*self.inner.lookup, &item.request_id).await {
                merge_cost(&mut item.row, &data);
                self.inner.publish_cost_update(&item.row);
            }
            self.inner
                .ready
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(item.row);
        }

        self.inner.write_ready();
    }

    /// Stop the background worker and flush everything
    pub async fn close(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.flush().await;
        info!("UnifiedLog closed");
    }

    /// Read-only query against the written rows
    ///
    /// Buffered rows are not visible until a flush; callers that need an
    /// up-to-date view flush first.
    pub fn query(&self, filter: &LogFilter) -> Result<Vec<LogRow>> {
        let mut sql = String::from("SELECT * FROM unified_logs WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(v) = &filter.session_id {
            sql.push_str(" AND session_id = ?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = &filter.cascade_id {
            sql.push_str(" AND cascade_id = ?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = &filter.phase_name {
            sql.push_str(" AND phase_name = ?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = &filter.node_type {
            sql.push_str(" AND node_type = ?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = &filter.role {
            sql.push_str(" AND role = ?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = filter.sounding_index {
            sql.push_str(" AND sounding_index = ?");
            args.push(Box::new(v));
        }
        if let Some(v) = filter.is_winner {
            sql.push_str(" AND is_winner = ?");
            args.push(Box::new(v));
        }
        if let Some(v) = &filter.species_hash {
            sql.push_str(" AND species_hash = ?");
            args.push(Box::new(v.clone()));
        }
        sql.push_str(" ORDER BY timestamp");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Mark the winning sounding group for a phase
    ///
    /// Sets `is_winner = true` on every row of the winning indices and
    /// `false` on every other sounding row of the phase, in both the durable
    /// table and the in-flight buffers. Idempotent: repeating the call yields
    /// the same state.
    pub fn mark_winners(&self, session_id: &str, phase_name: &str, winner_indices: &[i64]) -> Result<()> {
        let matches = |row: &LogRow| {
            row.session_id == session_id
                && row.phase_name.as_deref() == Some(phase_name)
                && row.sounding_index.is_some()
        };
        let is_winning = |row: &LogRow| {
            row.sounding_index
                .map(|i| winner_indices.contains(&i))
                .unwrap_or(false)
        };

        {
            let mut ready = self.inner.ready.lock().unwrap_or_else(|e| e.into_inner());
            for row in ready.iter_mut().filter(|r| matches(r)) {
                row.is_winner = Some(is_winning(row));
            }
        }
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            for item in pending.iter_mut() {
                if matches(&item.row) {
                    item.row.is_winner = Some(is_winning(&item.row));
                }
            }
        }

        let placeholders = winner_indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "UPDATE unified_logs
             SET is_winner = CASE WHEN sounding_index IN ({}) THEN 1 ELSE 0 END
             WHERE session_id = ?1 AND phase_name = ?2 AND sounding_index IS NOT NULL",
            if placeholders.is_empty() { "-1".to_string() } else { placeholders }
        );
        let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(&sql, params![session_id, phase_name])?;
        debug!(session_id, phase_name, ?winner_indices, "Winners marked");
        Ok(())
    }

    /// Prior winning rewrites for a species, newest first
    ///
    /// Feeds the rewrite mutator with examples of prompts that won before
    /// for phases sharing the same DNA.
    pub fn winning_rewrites(&self, species_hash: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT mutation_applied FROM unified_logs
             WHERE species_hash = ?1 AND is_winner = 1 AND mutation_type IN ('rewrite', 'rewrite_free')
               AND mutation_applied IS NOT NULL
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![species_hash, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Cost breakdown for all runs of a cascade: (session_id, phase_name, total_cost, total_tokens, rows)
    pub fn cascade_costs(&self, cascade_id: &str) -> Result<Vec<(String, String, f64, i64, i64)>> {
        let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT session_id, phase_name, SUM(cost), SUM(total_tokens), COUNT(*)
             FROM unified_logs
             WHERE cascade_id = ?1 AND cost IS NOT NULL AND phase_name IS NOT NULL
             GROUP BY session_id, phase_name
             ORDER BY session_id, phase_name",
        )?;
        let rows = stmt
            .query_map(params![cascade_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    row.get(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Per-sounding totals for one phase: (sounding_index, is_winner, total_cost, total_tokens, rows)
    pub fn soundings_analysis(
        &self,
        session_id: &str,
        phase_name: &str,
    ) -> Result<Vec<(i64, Option<bool>, f64, i64, i64)>> {
        let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT sounding_index, MAX(is_winner), SUM(cost), SUM(total_tokens), COUNT(*)
             FROM unified_logs
             WHERE session_id = ?1 AND phase_name = ?2 AND sounding_index IS NOT NULL
             GROUP BY sounding_index
             ORDER BY sounding_index",
        )?;
        let rows = stmt
            .query_map(params![session_id, phase_name], |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, Option<i64>>(1)?.map(|v| v != 0),
                    row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    row.get(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Usage stats grouped by model: (model, provider, total_cost, calls)
    pub fn model_usage_stats(&self) -> Result<Vec<(String, Option<String>, f64, i64)>> {
        let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT model, provider, SUM(cost), COUNT(*)
             FROM unified_logs
             WHERE cost IS NOT NULL AND model IS NOT NULL
             GROUP BY model, provider
             ORDER BY SUM(cost) DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    row.get(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of rows parked waiting for cost (test/observability hook)
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Inner {
    /// Drain the ready buffer into SQLite; retains rows on failure
    fn write_ready(&self) {
        let rows: Vec<LogRow> = {
            let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
            ready.drain(..).collect()
        };
        if rows.is_empty() {
            return;
        }

        let count = rows.len();
        let result = self.insert_rows(&rows);
        match result {
            Ok(()) => {
                *self.last_write.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                debug!(count, "Flushed rows to unified log");
            }
            Err(e) => {
                error!(error = %e, count, "Log flush failed; retaining rows");
                let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
                // Put the failed batch back ahead of anything logged since
                let mut retained = rows;
                retained.extend(ready.drain(..));
                *ready = retained;
                self.publish(LogEvent::WriteError(e.to_string()));
            }
        }
    }

    fn insert_rows(&self, rows: &[LogRow]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_SQL)?;
            for row in rows {
                stmt.execute(params![
                    row.timestamp,
                    row.timestamp_iso,
                    row.session_id,
                    row.trace_id,
                    row.parent_id,
                    row.parent_session_id,
                    row.parent_message_id,
                    row.node_type,
                    row.role,
                    row.depth,
                    row.sounding_index,
                    row.is_winner,
                    row.reforge_step,
                    row.attempt_number,
                    row.turn_number,
                    row.mutation_applied,
                    row.mutation_type,
                    row.mutation_template,
                    row.species_hash,
                    row.cascade_id,
                    row.cascade_file,
                    row.cascade_json,
                    row.phase_name,
                    row.phase_json,
                    row.model,
                    row.model_requested,
                    row.request_id,
                    row.provider,
                    row.duration_ms,
                    row.tokens_in,
                    row.tokens_out,
                    row.total_tokens,
                    row.cost,
                    row.content_json,
                    row.full_request_json,
                    row.full_response_json,
                    row.tool_calls_json,
                    row.images_json,
                    row.has_images,
                    row.has_base64,
                    row.semantic_actor,
                    row.semantic_purpose,
                    row.is_callout,
                    row.callout_name,
                    row.metadata_json,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn publish(&self, event: LogEvent) {
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(listener) = listener.as_ref() {
            listener(event);
        }
    }

    fn publish_cost_update(&self, row: &LogRow) {
        let Some(cost) = row.cost else { return };
        self.publish(LogEvent::CostUpdate(CostUpdate {
            trace_id: row.trace_id.clone(),
            session_id: row.session_id.clone(),
            phase_name: row.phase_name.clone(),
            cascade_id: row.cascade_id.clone(),
            sounding_index: row.sounding_index,
            request_id: row.request_id.clone(),
            cost,
            tokens_in: row.tokens_in.unwrap_or(0),
            tokens_out: row.tokens_out.unwrap_or(0),
        }));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last-chance write of whatever is still buffered; pending rows go
        // out without cost.
        let pending: Vec<PendingRow> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        {
            let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
            ready.extend(pending.into_iter().map(|p| p.row));
        }
        self.write_ready();
    }
}

/// Background worker: ages pending rows, resolves cost, flushes on schedule
async fn cost_worker(inner: Weak<Inner>) {
    let mut tick = tokio::time::interval(WORKER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tick.tick().await;

        let Some(inner) = inner.upgrade() else {
            debug!("Cost worker exiting: log dropped");
            return;
        };
        if !inner.running.load(Ordering::SeqCst) {
            debug!("Cost worker exiting: log closed");
            return;
        }

        // Pull out rows old enough for a lookup (or too old to keep waiting)
        let now = Instant::now();
        let ready_for_lookup: Vec<PendingRow> = {
            let mut pending = inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let mut take = Vec::new();
            let mut keep = Vec::new();
            for item in pending.drain(..) {
                let age = now.duration_since(item.queued_at);
                if age >= inner.config.cost_fetch_delay || age >= inner.config.cost_max_wait {
                    take.push(item);
                } else {
                    keep.push(item);
                }
            }
            *pending = keep;
            take
        };

        for mut item in ready_for_lookup {
            let expired = now.duration_since(item.queued_at) >= inner.config.cost_max_wait;
            if !expired {
                if let Some(data) = resolve_with_backoff(&*inner.lookup, &item.request_id).await {
                    merge_cost(&mut item.row, &data);
                    inner.publish_cost_update(&item.row);
                } else {
                    warn!(request_id = %item.request_id, "Cost lookup exhausted retries; writing without cost");
                }
            }
            inner.ready.lock().unwrap_or_else(|e| e.into_inner()).push(item.row);
        }

        // Time/size based flush of the ready buffer
        let should_flush = {
            let ready = inner.ready.lock().unwrap_or_else(|e| e.into_inner());
            let last = *inner.last_write.lock().unwrap_or_else(|e| e.into_inner());
            !ready.is_empty()
                && (ready.len() >= inner.config.buffer_limit || last.elapsed() >= inner.config.flush_interval)
        };
        if should_flush {
            inner.write_ready();
        }
    }
}

/// Run the lookup through the standard backoff schedule
async fn resolve_with_backoff(lookup: &dyn CostLookup, request_id: &str) -> Option<crate::cost::CostData> {
    for delay in LOOKUP_BACKOFF {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(data) = lookup.lookup(request_id).await {
            return Some(data);
        }
    }
    None
}

fn merge_cost(row: &mut LogRow, data: &crate::cost::CostData) {
    row.cost = data.cost;
    row.tokens_in = Some(data.tokens_in);
    row.tokens_out = Some(data.tokens_out);
    if let Some(provider) = &data.provider {
        row.provider = Some(provider.clone());
    }
    row.recompute_total_tokens();
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRow> {
    Ok(LogRow {
        timestamp: row.get("timestamp")?,
        timestamp_iso: row.get("timestamp_iso")?,
        session_id: row.get("session_id")?,
        trace_id: row.get("trace_id")?,
        parent_id: row.get("parent_id")?,
        parent_session_id: row.get("parent_session_id")?,
        parent_message_id: row.get("parent_message_id")?,
        node_type: row.get("node_type")?,
        role: row.get("role")?,
        depth: row.get("depth")?,
        sounding_index: row.get("sounding_index")?,
        is_winner: row.get::<_, Option<i64>>("is_winner")?.map(|v| v != 0),
        reforge_step: row.get("reforge_step")?,
        attempt_number: row.get("attempt_number")?,
        turn_number: row.get("turn_number")?,
        mutation_applied: row.get("mutation_applied")?,
        mutation_type: row.get("mutation_type")?,
        mutation_template: row.get("mutation_template")?,
        species_hash: row.get("species_hash")?,
        cascade_id: row.get("cascade_id")?,
        cascade_file: row.get("cascade_file")?,
        cascade_json: row.get("cascade_json")?,
        phase_name: row.get("phase_name")?,
        phase_json: row.get("phase_json")?,
        model: row.get("model")?,
        model_requested: row.get("model_requested")?,
        request_id: row.get("request_id")?,
        provider: row.get("provider")?,
        duration_ms: row.get("duration_ms")?,
        tokens_in: row.get("tokens_in")?,
        tokens_out: row.get("tokens_out")?,
        total_tokens: row.get("total_tokens")?,
        cost: row.get("cost")?,
        content_json: row.get("content_json")?,
        full_request_json: row.get("full_request_json")?,
        full_response_json: row.get("full_response_json")?,
        tool_calls_json: row.get("tool_calls_json")?,
        images_json: row.get("images_json")?,
        has_images: row.get::<_, i64>("has_images")? != 0,
        has_base64: row.get::<_, i64>("has_base64")? != 0,
        semantic_actor: row.get("semantic_actor")?,
        semantic_purpose: row.get("semantic_purpose")?,
        is_callout: row.get::<_, i64>("is_callout")? != 0,
        callout_name: row.get("callout_name")?,
        metadata_json: row.get("metadata_json")?,
    })
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS unified_logs (
    timestamp          REAL NOT NULL,
    timestamp_iso      TEXT NOT NULL,
    session_id         TEXT NOT NULL,
    trace_id           TEXT NOT NULL,
    parent_id          TEXT,
    parent_session_id  TEXT,
    parent_message_id  TEXT,
    node_type          TEXT NOT NULL,
    role               TEXT,
    depth              INTEGER NOT NULL DEFAULT 0,
    sounding_index     INTEGER,
    is_winner          INTEGER,
    reforge_step       INTEGER,
    attempt_number     INTEGER,
    turn_number        INTEGER,
    mutation_applied   TEXT,
    mutation_type      TEXT,
    mutation_template  TEXT,
    species_hash       TEXT,
    cascade_id         TEXT,
    cascade_file       TEXT,
    cascade_json       TEXT,
    phase_name         TEXT,
    phase_json         TEXT,
    model              TEXT,
    model_requested    TEXT,
    request_id         TEXT,
    provider           TEXT,
    duration_ms        REAL,
    tokens_in          INTEGER,
    tokens_out         INTEGER,
    total_tokens       INTEGER,
    cost               REAL,
    content_json       TEXT,
    full_request_json  TEXT,
    full_response_json TEXT,
    tool_calls_json    TEXT,
    images_json        TEXT,
    has_images         INTEGER NOT NULL DEFAULT 0,
    has_base64         INTEGER NOT NULL DEFAULT 0,
    semantic_actor     TEXT,
    semantic_purpose   TEXT,
    is_callout         INTEGER NOT NULL DEFAULT 0,
    callout_name       TEXT,
    metadata_json      TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_session ON unified_logs(session_id);
CREATE INDEX IF NOT EXISTS idx_logs_trace ON unified_logs(trace_id);
CREATE INDEX IF NOT EXISTS idx_logs_species ON unified_logs(cascade_id, phase_name, species_hash, is_winner, timestamp);
";

const INSERT_SQL: &str = "INSERT INTO unified_logs (
    timestamp, timestamp_iso, session_id, trace_id, parent_id, parent_session_id, parent_message_id,
    node_type, role, depth, sounding_index, is_winner, reforge_step, attempt_number, turn_number,
    mutation_applied, mutation_type, mutation_template, species_hash,
    cascade_id, cascade_file, cascade_json, phase_name, phase_json,
    model, model_requested, request_id, provider,
    duration_ms, tokens_in, tokens_out, total_tokens, cost,
    content_json, full_request_json, full_response_json, tool_calls_json,
    images_json, has_images, has_base64, semantic_actor, semantic_purpose,
    is_callout, callout_name, metadata_json
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
    ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37, ?38,
    ?39, ?40, ?41, ?42, ?43, ?44, ?45
)";
