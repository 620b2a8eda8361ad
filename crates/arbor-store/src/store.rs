//! SQLite-backed trace storage.

use crate::schema::{SCHEMA, SPAN_COLUMNS, TRACE_COLUMNS};
use arbor_core::{
    AssemblyState, DetachReason, Span, SpanKind, SpanRecord, SpanStatus, TraceError, TraceFilter,
    TraceRecord, TraceSummary,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, InterruptHandle, OpenFlags, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Errors from trace store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(rusqlite::Error),
    #[error("Lock error")]
    Lock,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Statement interrupted")]
    Interrupted,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::OperationInterrupted) => StoreError::Interrupted,
            _ => StoreError::Database(e),
        }
    }
}

impl From<StoreError> for TraceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Interrupted => TraceError::Cancelled,
            other => TraceError::StoreUnavailable(other.to_string()),
        }
    }
}

/// A span with its direct children, read in one snapshot.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub span: SpanRecord,
    /// Direct children with their own child counts, ordered by start offset.
    pub children: Vec<(SpanRecord, u32)>,
}

/// Cancels a single trace query.
///
/// The interrupt is armed only while the query holds its connection, so a
/// cancel that lands before the statement starts or after it finishes never
/// reaches another caller's statement.
#[derive(Clone, Default)]
pub struct QueryCancel(Arc<Mutex<CancelSlot>>);

#[derive(Default)]
struct CancelSlot {
    cancelled: bool,
    handle: Option<InterruptHandle>,
}

impl QueryCancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the query now if it is running, or before it starts otherwise.
    pub fn cancel(&self) {
        let Ok(mut slot) = self.0.lock() else {
            return;
        };
        slot.cancelled = true;
        if let Some(handle) = slot.handle.take() {
            handle.interrupt();
        }
    }

    fn arm(&self, conn: &Connection) -> Result<(), StoreError> {
        let mut slot = self.0.lock().map_err(|_| StoreError::Lock)?;
        if slot.cancelled {
            return Err(StoreError::Interrupted);
        }
        slot.handle = Some(conn.get_interrupt_handle());
        Ok(())
    }

    fn disarm(&self) {
        if let Ok(mut slot) = self.0.lock() {
            slot.handle = None;
        }
    }
}

/// SQLite-backed trace storage.
///
/// File-backed stores run in WAL mode. Tree reads share one read-only
/// connection and every trace query opens its own, so neither waits on the
/// writer. In-memory stores share one connection for everything.
pub struct TraceStore {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    /// Database file for per-query connections; `None` when in memory.
    path: Option<PathBuf>,
}

impl TraceStore {
    /// Opens (or creates) a trace store at the given database path.
    ///
    /// The path `:memory:` gives the same store as [`in_memory`](Self::in_memory).
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.as_os_str() == ":memory:" {
            tracing::info!("Trace store opened in memory");
            return Self::in_memory();
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(path)?;
        writer.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;
        writer.execute_batch(SCHEMA)?;

        let reader = open_reader(path)?;

        tracing::info!(path = %path.display(), journal_mode = %mode, "Trace store opened");
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory trace store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            writer: Mutex::new(conn),
            reader: None,
            path: None,
        })
    }

    fn write_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.writer.lock().map_err(|_| StoreError::Lock)
    }

    fn read_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.reader
            .as_ref()
            .unwrap_or(&self.writer)
            .lock()
            .map_err(|_| StoreError::Lock)
    }

    /// Cheap liveness check: the database answers and carries the trace schema.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.write_conn()?;
        conn.query_row("SELECT EXISTS (SELECT 1 FROM traces)", [], |row| {
            row.get::<_, bool>(0)
        })?;
        Ok(())
    }

    /// Writes a trace row and the given spans in one transaction.
    ///
    /// Spans are upserted by id. A span id already owned by a different trace
    /// is left untouched.
    pub fn put(&self, trace: &TraceRecord, spans: &[SpanRecord]) -> Result<(), StoreError> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            &format!(
                r#"INSERT INTO traces ({TRACE_COLUMNS})
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                   ON CONFLICT(trace_id) DO UPDATE SET
                   name = excluded.name, root_span_id = excluded.root_span_id,
                   request_time = excluded.request_time, updated_at = excluded.updated_at,
                   status = excluded.status, total_duration = excluded.total_duration,
                   span_count = excluded.span_count, user_id = excluded.user_id,
                   session_id = excluded.session_id, tags = excluded.tags,
                   assembly = excluded.assembly, rollup = excluded.rollup,
                   warnings = excluded.warnings"#
            ),
            params![
                trace.id,
                trace.name,
                trace.root_span_id,
                trace.created_at,
                trace.request_time,
                trace.updated_at,
                trace.status.as_str(),
                trace.total_duration,
                trace.span_count,
                trace.user_id,
                trace.session_id,
                serde_json::to_string(&trace.tags)?,
                trace.assembly.as_str(),
                serde_json::to_string(&trace.rollup)?,
                serde_json::to_string(&trace.warnings)?,
            ],
        )?;

        tx.execute("DELETE FROM trace_tags WHERE trace_id = ?1", params![trace.id])?;
        for tag in &trace.tags {
            tx.execute(
                "INSERT INTO trace_tags (trace_id, tag) VALUES (?1, ?2)",
                params![trace.id, tag],
            )?;
        }

        {
            let mut stmt = tx.prepare_cached(&format!(
                r#"INSERT INTO spans ({SPAN_COLUMNS})
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                   ON CONFLICT(span_id) DO UPDATE SET
                   parent_id = excluded.parent_id, tree_parent_id = excluded.tree_parent_id,
                   name = excluded.name, kind = excluded.kind,
                   start_offset = excluded.start_offset, duration = excluded.duration,
                   status = excluded.status, inputs = excluded.inputs,
                   outputs = excluded.outputs, metadata = excluded.metadata,
                   detached = excluded.detached, rollup = excluded.rollup
                   WHERE spans.trace_id = excluded.trace_id"#
            ))?;

            for record in spans {
                let span = &record.span;
                let written = stmt.execute(params![
                    span.id,
                    span.trace_id,
                    span.parent_id,
                    record.tree_parent_id,
                    span.name,
                    span.kind.as_str(),
                    span.start_offset,
                    span.duration,
                    span.status.as_str(),
                    serde_json::to_string(&span.inputs)?,
                    serde_json::to_string(&span.outputs)?,
                    serde_json::to_string(&span.metadata)?,
                    record.detached.map(|r| r.as_str()),
                    serde_json::to_string(&record.rollup)?,
                ])?;
                if written == 0 {
                    tracing::warn!(
                        span_id = %span.id,
                        trace_id = %span.trace_id,
                        "Span id owned by another trace, not written"
                    );
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Retrieves a trace by ID.
    pub fn get_trace(&self, trace_id: &str) -> Result<Option<TraceRecord>, StoreError> {
        let conn = self.read_conn()?;

        let result = conn.query_row(
            &format!("SELECT {TRACE_COLUMNS} FROM traces WHERE trace_id = ?1"),
            params![trace_id],
            trace_from_row,
        );

        match result {
            Ok(trace) => Ok(Some(trace)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Gets all spans for a trace, ordered by start offset then id.
    pub fn get_spans(&self, trace_id: &str) -> Result<Vec<SpanRecord>, StoreError> {
        let conn = self.read_conn()?;
        select_spans(&conn, trace_id)
    }

    /// Reads a trace and all its spans from one snapshot.
    pub fn get_trace_tree(
        &self,
        trace_id: &str,
    ) -> Result<Option<(TraceRecord, Vec<SpanRecord>)>, StoreError> {
        let mut conn = self.read_conn()?;
        let tx = conn.transaction()?;

        let trace = tx
            .query_row(
                &format!("SELECT {TRACE_COLUMNS} FROM traces WHERE trace_id = ?1"),
                params![trace_id],
                trace_from_row,
            )
            .optional()?;
        let Some(trace) = trace else {
            return Ok(None);
        };
        let spans = select_spans(&tx, trace_id)?;

        tx.commit()?;
        Ok(Some((trace, spans)))
    }

    /// Gets a single span, scoped to its trace.
    pub fn get_span(&self, trace_id: &str, span_id: &str) -> Result<Option<SpanRecord>, StoreError> {
        let conn = self.read_conn()?;
        let span = conn
            .query_row(
                &format!("SELECT {SPAN_COLUMNS} FROM spans WHERE trace_id = ?1 AND span_id = ?2"),
                params![trace_id, span_id],
                span_from_row,
            )
            .optional()?;
        Ok(span)
    }

    /// Reads a span plus its direct children (with their child counts) in one snapshot.
    pub fn get_node(&self, trace_id: &str, span_id: &str) -> Result<Option<NodeSnapshot>, StoreError> {
        let mut conn = self.read_conn()?;
        let tx = conn.transaction()?;

        let span = tx
            .query_row(
                &format!("SELECT {SPAN_COLUMNS} FROM spans WHERE trace_id = ?1 AND span_id = ?2"),
                params![trace_id, span_id],
                span_from_row,
            )
            .optional()?;
        let Some(span) = span else {
            return Ok(None);
        };

        let children = {
            let mut stmt = tx.prepare(&format!(
                r#"SELECT {SPAN_COLUMNS} FROM spans
                   WHERE trace_id = ?1 AND tree_parent_id = ?2
                   ORDER BY start_offset, span_id"#
            ))?;
            let rows = stmt.query_map(params![trace_id, span_id], span_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let counts: HashMap<String, u32> = {
            let mut stmt = tx.prepare(
                r#"SELECT tree_parent_id, COUNT(*) FROM spans
                   WHERE trace_id = ?1 AND tree_parent_id IN
                   (SELECT span_id FROM spans WHERE trace_id = ?1 AND tree_parent_id = ?2)
                   GROUP BY tree_parent_id"#,
            )?;
            let rows = stmt.query_map(params![trace_id, span_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        tx.commit()?;

        let children = children
            .into_iter()
            .map(|child| {
                let count = counts.get(child.id()).copied().unwrap_or(0);
                (child, count)
            })
            .collect();
        Ok(Some(NodeSnapshot { span, children }))
    }

    /// Returns the trace that owns a span id, if any.
    ///
    /// Runs on the writer connection, so admission never queues behind reads.
    pub fn span_owner(&self, span_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.write_conn()?;
        let owner = conn
            .query_row(
                "SELECT trace_id FROM spans WHERE span_id = ?1",
                params![span_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    pub fn trace_exists(&self, trace_id: &str) -> Result<bool, StoreError> {
        let conn = self.read_conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM traces WHERE trace_id = ?1",
                params![trace_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Lists trace summaries matching the filter, newest request first.
    ///
    /// Returns the requested window and the total match count, both read from
    /// the same snapshot. File-backed stores run each query on its own
    /// connection; `cancel` interrupts only this query.
    pub fn query_traces(
        &self,
        filter: &TraceFilter,
        offset: u64,
        limit: u32,
        cancel: &QueryCancel,
    ) -> Result<(Vec<TraceSummary>, u64), StoreError> {
        match &self.path {
            Some(path) => {
                let mut conn = open_reader(path)?;
                run_query(&mut conn, filter, offset, limit, cancel)
            }
            None => {
                let mut conn = self.write_conn()?;
                run_query(&mut conn, filter, offset, limit, cancel)
            }
        }
    }

    /// Gets aggregate metrics for the dashboard.
    pub fn get_metrics_summary(&self) -> Result<MetricsSummary, StoreError> {
        let conn = self.read_conn()?;

        let mut stmt = conn.prepare(
            r#"SELECT
               COUNT(*),
               COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN assembly = 'assembling' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(span_count), 0),
               COALESCE(AVG(total_duration), 0.0)
               FROM traces"#,
        )?;

        let summary = stmt.query_row([], |row| {
            Ok(MetricsSummary {
                total_traces: row.get(0)?,
                error_traces: row.get(1)?,
                pending_traces: row.get(2)?,
                assembling_traces: row.get(3)?,
                total_spans: row.get(4)?,
                avg_duration: row.get(5)?,
            })
        })?;

        Ok(summary)
    }
}

/// Aggregate metrics summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_traces: u64,
    pub error_traces: u64,
    pub pending_traces: u64,
    pub assembling_traces: u64,
    pub total_spans: u64,
    /// Mean trace duration, in seconds.
    pub avg_duration: f64,
}

fn run_query(
    conn: &mut Connection,
    filter: &TraceFilter,
    offset: u64,
    limit: u32,
    cancel: &QueryCancel,
) -> Result<(Vec<TraceSummary>, u64), StoreError> {
    cancel.arm(conn)?;
    let result = select_traces(conn, filter, offset, limit);
    cancel.disarm();
    result
}

fn select_traces(
    conn: &mut Connection,
    filter: &TraceFilter,
    offset: u64,
    limit: u32,
) -> Result<(Vec<TraceSummary>, u64), StoreError> {
    let (where_sql, params_vec) = filter_clause(filter);
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let tx = conn.transaction()?;

    let total: u64 = tx.query_row(
        &format!("SELECT COUNT(*) FROM traces WHERE 1=1{where_sql}"),
        params_refs.as_slice(),
        |row| row.get(0),
    )?;

    let items = {
        let mut stmt = tx.prepare(&format!(
            r#"SELECT trace_id, name, status, total_duration, request_time, user_id,
               span_count, assembly
               FROM traces WHERE 1=1{where_sql}
               ORDER BY request_time DESC, trace_id ASC
               LIMIT {limit} OFFSET {offset}"#
        ))?;
        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            Ok(TraceSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                status: status_col(row, 2)?,
                total_duration: row.get(3)?,
                request_time: row.get(4)?,
                user_id: row.get(5)?,
                span_count: row.get(6)?,
                assembly: AssemblyState::from_str(&row.get::<_, String>(7)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    tx.commit()?;
    Ok((items, total))
}

fn open_reader(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn filter_clause(filter: &TraceFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut sql = String::new();
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(from) = filter.from {
        sql.push_str(" AND request_time >= ?");
        params_vec.push(Box::new(from));
    }

    if let Some(to) = filter.to {
        sql.push_str(" AND request_time < ?");
        params_vec.push(Box::new(to));
    }

    if !filter.statuses.is_empty() {
        let marks = vec!["?"; filter.statuses.len()].join(", ");
        sql.push_str(&format!(" AND status IN ({marks})"));
        for status in &filter.statuses {
            params_vec.push(Box::new(status.as_str()));
        }
    }

    if let Some(text) = filter.text.as_deref().filter(|t| !t.is_empty()) {
        sql.push_str(" AND instr(lower(name), lower(?)) > 0");
        params_vec.push(Box::new(text.to_string()));
    }

    if let Some(ref user_id) = filter.user_id {
        sql.push_str(" AND user_id = ?");
        params_vec.push(Box::new(user_id.clone()));
    }

    if let Some(ref session_id) = filter.session_id {
        sql.push_str(" AND session_id = ?");
        params_vec.push(Box::new(session_id.clone()));
    }

    if let Some(ref tag) = filter.tag {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM trace_tags tt WHERE tt.trace_id = traces.trace_id AND tt.tag = ?)",
        );
        params_vec.push(Box::new(tag.clone()));
    }

    if filter.complete_only {
        sql.push_str(" AND assembly = 'complete'");
    }

    (sql, params_vec)
}

fn select_spans(conn: &Connection, trace_id: &str) -> Result<Vec<SpanRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        r#"SELECT {SPAN_COLUMNS} FROM spans WHERE trace_id = ?1
           ORDER BY start_offset, span_id"#
    ))?;

    let rows = stmt.query_map(params![trace_id], span_from_row)?;

    let mut spans = Vec::new();
    for row in rows {
        spans.push(row?);
    }

    Ok(spans)
}

fn trace_from_row(row: &Row<'_>) -> rusqlite::Result<TraceRecord> {
    Ok(TraceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        root_span_id: row.get(2)?,
        created_at: row.get(3)?,
        request_time: row.get(4)?,
        updated_at: row.get(5)?,
        status: status_col(row, 6)?,
        total_duration: row.get(7)?,
        span_count: row.get(8)?,
        user_id: row.get(9)?,
        session_id: row.get(10)?,
        tags: json_col(row, 11)?,
        assembly: AssemblyState::from_str(&row.get::<_, String>(12)?),
        rollup: json_col(row, 13)?,
        warnings: json_col(row, 14)?,
    })
}

fn span_from_row(row: &Row<'_>) -> rusqlite::Result<SpanRecord> {
    let kind: String = row.get(5)?;
    let detached: Option<String> = row.get(12)?;

    Ok(SpanRecord {
        span: Span {
            id: row.get(0)?,
            trace_id: row.get(1)?,
            parent_id: row.get(2)?,
            name: row.get(4)?,
            kind: SpanKind::from_stored(&kind),
            start_offset: row.get(6)?,
            duration: row.get(7)?,
            status: status_col(row, 8)?,
            inputs: json_col(row, 9)?,
            outputs: json_col(row, 10)?,
            metadata: json_col(row, 11)?,
        },
        tree_parent_id: row.get(3)?,
        detached: detached.as_deref().and_then(DetachReason::parse),
        rollup: json_col(row, 13)?,
    })
}

fn status_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<SpanStatus> {
    let raw: String = row.get(idx)?;
    SpanStatus::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown status `{raw}`").into(),
        )
    })
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{AssemblyAnomaly, NodeRollup, Payload};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn trace(id: &str, request_time: i64, status: SpanStatus) -> TraceRecord {
        TraceRecord {
            id: id.to_string(),
            name: format!("Agent run {id}"),
            root_span_id: Some(format!("{id}-root")),
            created_at: 1_700_000_000_000,
            request_time,
            updated_at: 1_700_000_000_000,
            status,
            total_duration: 4.25,
            span_count: 1,
            user_id: Some("user-1".to_string()),
            session_id: None,
            tags: BTreeSet::new(),
            assembly: AssemblyState::Complete,
            rollup: Default::default(),
            warnings: Vec::new(),
        }
    }

    fn span(trace_id: &str, id: &str, parent: Option<&str>, start_offset: f64) -> SpanRecord {
        let span = Span {
            id: id.to_string(),
            trace_id: trace_id.to_string(),
            parent_id: parent.map(String::from),
            name: format!("step {id}"),
            kind: SpanKind::Llm,
            start_offset,
            duration: 0.5,
            status: SpanStatus::Success,
            inputs: serde_json::from_value(json!({ "prompt": "Hi", "temperature": 0.2 })).unwrap(),
            outputs: Payload::new(),
            metadata: serde_json::from_value(json!({ "tokens": 12 })).unwrap(),
        };
        let rollup = NodeRollup::of(&span);
        SpanRecord {
            span,
            tree_parent_id: parent.map(String::from),
            detached: None,
            rollup,
        }
    }

    #[test]
    fn test_trace_store_crud() {
        let store = TraceStore::in_memory().unwrap();

        let mut record = trace("trace-1", 1_700_000_000_500, SpanStatus::Success);
        record.tags = BTreeSet::from(["prod".to_string(), "rag".to_string()]);
        record.warnings.push(AssemblyAnomaly::SyntheticRoot {
            span_id: "trace-1-root".into(),
        });
        store
            .put(&record, &[span("trace-1", "trace-1-root", None, 0.0)])
            .unwrap();

        let retrieved = store.get_trace("trace-1").unwrap().unwrap();
        assert_eq!(retrieved, record);
        assert!(store.get_trace("missing").unwrap().is_none());
        assert!(store.trace_exists("trace-1").unwrap());

        let spans = store.get_spans("trace-1").unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span.inputs["prompt"], "Hi");
        assert_eq!(spans[0].rollup.metrics["tokens"], 12.0);
    }

    #[test]
    fn test_put_updates_existing_rows() {
        let store = TraceStore::in_memory().unwrap();
        let mut record = trace("t", 10, SpanStatus::Pending);
        let mut root = span("t", "a", None, 0.0);
        root.span.status = SpanStatus::Pending;
        store.put(&record, &[root.clone()]).unwrap();

        root.span.status = SpanStatus::Error;
        record.status = SpanStatus::Error;
        store.put(&record, &[root]).unwrap();

        assert_eq!(store.get_trace("t").unwrap().unwrap().status, SpanStatus::Error);
        let spans = store.get_spans("t").unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span.status, SpanStatus::Error);
    }

    #[test]
    fn test_span_id_owned_by_other_trace_is_not_overwritten() {
        let store = TraceStore::in_memory().unwrap();
        store
            .put(&trace("t1", 10, SpanStatus::Success), &[span("t1", "shared", None, 0.0)])
            .unwrap();
        store
            .put(&trace("t2", 20, SpanStatus::Success), &[span("t2", "shared", None, 0.0)])
            .unwrap();

        assert_eq!(store.span_owner("shared").unwrap().as_deref(), Some("t1"));
        assert!(store.get_spans("t2").unwrap().is_empty());
    }

    #[test]
    fn test_get_spans_ordered_by_offset_then_id() {
        let store = TraceStore::in_memory().unwrap();
        store
            .put(
                &trace("t", 10, SpanStatus::Success),
                &[
                    span("t", "c", Some("a"), 1.0),
                    span("t", "b", Some("a"), 1.0),
                    span("t", "a", None, 0.0),
                ],
            )
            .unwrap();

        let ids: Vec<_> = store
            .get_spans("t")
            .unwrap()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_get_node_children_with_counts() {
        let store = TraceStore::in_memory().unwrap();
        store
            .put(
                &trace("t", 10, SpanStatus::Success),
                &[
                    span("t", "a", None, 0.0),
                    span("t", "b", Some("a"), 0.1),
                    span("t", "c", Some("a"), 0.2),
                    span("t", "d", Some("b"), 0.3),
                    span("t", "e", Some("b"), 0.4),
                ],
            )
            .unwrap();

        let node = store.get_node("t", "a").unwrap().unwrap();
        assert_eq!(node.span.id(), "a");
        let children: Vec<_> = node
            .children
            .iter()
            .map(|(c, n)| (c.id().to_string(), *n))
            .collect();
        assert_eq!(children, vec![("b".to_string(), 2), ("c".to_string(), 0)]);

        assert!(store.get_node("t", "zzz").unwrap().is_none());
        assert!(store.get_node("other", "a").unwrap().is_none());
    }

    #[test]
    fn test_query_filters_and_order() {
        let store = TraceStore::in_memory().unwrap();
        for i in 0..6 {
            let status = if i % 2 == 0 { SpanStatus::Error } else { SpanStatus::Success };
            let mut record = trace(&format!("t{i}"), 1_000 + (i / 2) as i64, status);
            if i == 5 {
                record.name = "Retrieval Pipeline".into();
                record.user_id = Some("user-2".into());
                record.tags = BTreeSet::from(["beta".to_string()]);
            }
            store.put(&record, &[]).unwrap();
        }

        let cancel = QueryCancel::new();
        let (all, total) = store.query_traces(&TraceFilter::default(), 0, 10, &cancel).unwrap();
        assert_eq!(total, 6);
        let ids: Vec<_> = all.iter().map(|t| t.id.as_str()).collect();
        // request_time desc, ties by id asc
        assert_eq!(ids, vec!["t4", "t5", "t2", "t3", "t0", "t1"]);

        let errors = TraceFilter::default().with_statuses([SpanStatus::Error]);
        let (items, total) = store.query_traces(&errors, 0, 10, &cancel).unwrap();
        assert_eq!(total, 3);
        assert!(items.iter().all(|t| t.status == SpanStatus::Error));

        let ranged = TraceFilter::default().with_range(Some(1_001), Some(1_002));
        let (items, _) = store.query_traces(&ranged, 0, 10, &cancel).unwrap();
        let ids: Vec<_> = items.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3"]);

        let text = TraceFilter::default().with_text("retrieval");
        let (items, total) = store.query_traces(&text, 0, 10, &cancel).unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].id, "t5");

        let (_, total) = store
            .query_traces(&TraceFilter::default().with_user("user-2"), 0, 10, &cancel)
            .unwrap();
        assert_eq!(total, 1);

        let tagged = TraceFilter {
            tag: Some("beta".into()),
            ..Default::default()
        };
        assert_eq!(store.query_traces(&tagged, 0, 10, &cancel).unwrap().1, 1);

        let (page, total) = store
            .query_traces(&TraceFilter::default(), 4, 10, &cancel)
            .unwrap();
        assert_eq!(total, 6);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_cancelled_query_is_interrupted_and_store_stays_usable() {
        let store = TraceStore::in_memory().unwrap();
        store.put(&trace("t", 10, SpanStatus::Success), &[]).unwrap();

        let cancel = QueryCancel::new();
        cancel.cancel();
        let err = store
            .query_traces(&TraceFilter::default(), 0, 10, &cancel)
            .unwrap_err();
        assert!(matches!(err, StoreError::Interrupted));
        assert!(matches!(TraceError::from(err), TraceError::Cancelled));

        let (_, total) = store
            .query_traces(&TraceFilter::default(), 0, 10, &QueryCancel::new())
            .unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_cancel_after_query_leaves_other_statements_alone() {
        let store = TraceStore::in_memory().unwrap();
        let cancel = QueryCancel::new();
        store
            .query_traces(&TraceFilter::default(), 0, 10, &cancel)
            .unwrap();
        cancel.cancel();

        // Same connection: a stale interrupt would abort these.
        store
            .put(&trace("t", 10, SpanStatus::Success), &[span("t", "a", None, 0.0)])
            .unwrap();
        assert_eq!(store.span_owner("a").unwrap().as_deref(), Some("t"));
    }

    #[test]
    fn test_metrics_summary() {
        let store = TraceStore::in_memory().unwrap();
        store.put(&trace("a", 1, SpanStatus::Error), &[]).unwrap();
        let mut assembling = trace("b", 2, SpanStatus::Pending);
        assembling.assembly = AssemblyState::Assembling;
        assembling.total_duration = 0.75;
        store.put(&assembling, &[]).unwrap();

        let summary = store.get_metrics_summary().unwrap();
        assert_eq!(summary.total_traces, 2);
        assert_eq!(summary.error_traces, 1);
        assert_eq!(summary.pending_traces, 1);
        assert_eq!(summary.assembling_traces, 1);
        assert!((summary.avg_duration - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_memory_path_opens_one_shared_database() {
        let store = TraceStore::new(":memory:").unwrap();
        store.ping().unwrap();
        store
            .put(&trace("t", 10, SpanStatus::Success), &[span("t", "a", None, 0.0)])
            .unwrap();

        assert_eq!(store.span_owner("a").unwrap().as_deref(), Some("t"));
        assert_eq!(store.get_spans("t").unwrap().len(), 1);
        let (_, total) = store
            .query_traces(&TraceFilter::default(), 0, 10, &QueryCancel::new())
            .unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_file_backed_reader_sees_committed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("traces.db");
        let store = TraceStore::new(&path).unwrap();

        store
            .put(&trace("t", 10, SpanStatus::Success), &[span("t", "a", None, 0.0)])
            .unwrap();
        store.ping().unwrap();

        let (tree_trace, spans) = store.get_trace_tree("t").unwrap().unwrap();
        assert_eq!(tree_trace.id, "t");
        assert_eq!(spans.len(), 1);
        let (items, total) = store
            .query_traces(&TraceFilter::default(), 0, 10, &QueryCancel::new())
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].id, "t");
        drop(store);

        let reopened = TraceStore::new(&path).unwrap();
        assert!(reopened.get_trace("t").unwrap().is_some());
    }
}
