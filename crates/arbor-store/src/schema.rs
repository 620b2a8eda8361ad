pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS traces (
    trace_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    root_span_id TEXT,
    created_at INTEGER NOT NULL,
    request_time INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    total_duration REAL NOT NULL,
    span_count INTEGER NOT NULL,
    user_id TEXT,
    session_id TEXT,
    tags TEXT NOT NULL,
    assembly TEXT NOT NULL,
    rollup TEXT NOT NULL,
    warnings TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trace_tags (
    trace_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (trace_id, tag),
    FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE TABLE IF NOT EXISTS spans (
    span_id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    parent_id TEXT,
    tree_parent_id TEXT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    start_offset REAL NOT NULL,
    duration REAL NOT NULL,
    status TEXT NOT NULL,
    inputs TEXT NOT NULL,
    outputs TEXT NOT NULL,
    metadata TEXT NOT NULL,
    detached TEXT,
    rollup TEXT NOT NULL,
    FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE INDEX IF NOT EXISTS idx_traces_request_time ON traces(request_time DESC, trace_id);
CREATE INDEX IF NOT EXISTS idx_traces_created_at ON traces(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_traces_status ON traces(status, request_time DESC);
CREATE INDEX IF NOT EXISTS idx_traces_user ON traces(user_id, request_time DESC);
CREATE INDEX IF NOT EXISTS idx_traces_session ON traces(session_id);
CREATE INDEX IF NOT EXISTS idx_traces_name ON traces(name COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_trace_tags_tag ON trace_tags(tag);
CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id, start_offset);
CREATE INDEX IF NOT EXISTS idx_spans_tree_parent ON spans(trace_id, tree_parent_id);
"#;

pub(crate) const TRACE_COLUMNS: &str = "trace_id, name, root_span_id, created_at, request_time, \
     updated_at, status, total_duration, span_count, user_id, session_id, tags, assembly, rollup, \
     warnings";

pub(crate) const SPAN_COLUMNS: &str = "span_id, trace_id, parent_id, tree_parent_id, name, kind, \
     start_offset, duration, status, inputs, outputs, metadata, detached, rollup";
