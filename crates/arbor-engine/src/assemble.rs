//! Per-trace tree assembly from spans arriving in any order.
//!
//! A [`TraceAssembly`] owns every span of one trace and decides where each
//! span hangs. Spans whose declared parent has not arrived wait in a pending
//! set keyed by that parent. When the parent arrives they link to it. Spans
//! that cannot link (cycles, second roots, parents that never come) are
//! detached under the root and recorded as anomalies. Nothing is dropped.

use crate::aggregate::{TraceRollup, TreeView};
use arbor_config::AssemblyConfig;
use arbor_core::{
    keys, AssemblyAnomaly, AssemblyState, DetachReason, NodeRollup, Payload, Span, SpanKind,
    SpanRecord, SpanStatus, TraceRecord,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const SYNTHETIC_ROOT_NAME: &str = "(missing root)";
const OVERRUN_EPSILON: f64 = 1e-9;

/// Where a span currently hangs.
#[derive(Debug, Clone, PartialEq)]
enum Link {
    Root,
    Child(String),
    Detached(DetachReason),
    /// Declared parent has not arrived yet.
    Waiting(String),
}

/// What admission did with a single span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SpanOutcome {
    /// Linked as the root or under its declared parent.
    Linked,
    /// Parent not seen yet.
    Waiting,
    Detached { reason: DetachReason },
    /// Identical copy of a span already held.
    Unchanged,
    /// Content replaced; position in the tree kept.
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanAssembly {
    pub span_id: String,
    #[serde(flatten)]
    pub outcome: SpanOutcome,
}

/// Result of admitting one batch into a trace.
#[derive(Debug, Clone, Serialize)]
pub struct AssemblyReport {
    pub trace_id: String,
    pub spans: Vec<SpanAssembly>,
    /// Root present and no span waiting on a parent.
    pub connected: bool,
    pub complete: bool,
}

/// Assembly state of one trace.
#[derive(Debug)]
pub struct TraceAssembly {
    trace_id: String,
    spans: HashMap<String, Span>,
    /// Arrival order, for deterministic output.
    order: Vec<String>,
    links: HashMap<String, Link>,
    root: Option<String>,
    /// Children keyed by the missing parent they declared.
    waiting: HashMap<String, Vec<String>>,
    anomalies: Vec<AssemblyAnomaly>,
    state: AssemblyState,
    created_at: i64,
    first_admit: Instant,
    last_admit: Instant,
    dirty: bool,
}

impl TraceAssembly {
    pub fn new(trace_id: impl Into<String>, now: Instant, created_at: i64) -> Self {
        Self {
            trace_id: trace_id.into(),
            spans: HashMap::new(),
            order: Vec::new(),
            links: HashMap::new(),
            root: None,
            waiting: HashMap::new(),
            anomalies: Vec::new(),
            state: AssemblyState::Assembling,
            created_at,
            first_admit: now,
            last_admit: now,
            dirty: false,
        }
    }

    /// Rebuilds assembly state from a committed trace.
    ///
    /// Timers restart relative to `now`, except that the assembly timeout
    /// keeps counting from the trace's original creation time.
    pub fn restore(trace: TraceRecord, records: Vec<SpanRecord>, now: Instant, now_ms: i64) -> Self {
        let elapsed = Duration::from_millis(now_ms.saturating_sub(trace.created_at).max(0) as u64);
        let mut assembly = Self::new(trace.id, now, trace.created_at);
        assembly.first_admit = now.checked_sub(elapsed).unwrap_or(now);
        assembly.state = trace.assembly;
        assembly.root = trace.root_span_id;
        assembly.anomalies = trace
            .warnings
            .into_iter()
            .filter(|w| !matches!(w, AssemblyAnomaly::WindowOverrun { .. }))
            .collect();

        for record in records {
            let mut span = record.span;
            for key in keys::ASSEMBLY {
                span.metadata.remove(*key);
            }
            let id = span.id.clone();
            let link = match (&record.detached, &record.tree_parent_id, &span.parent_id) {
                (Some(reason), _, _) => Link::Detached(*reason),
                (None, Some(parent), _) => Link::Child(parent.clone()),
                (None, None, Some(declared)) => {
                    assembly
                        .waiting
                        .entry(declared.clone())
                        .or_default()
                        .push(id.clone());
                    Link::Waiting(declared.clone())
                }
                (None, None, None) => Link::Root,
            };
            assembly.links.insert(id.clone(), link);
            assembly.order.push(id.clone());
            assembly.spans.insert(id, span);
        }

        if assembly.root.is_none() {
            assembly.root = assembly
                .order
                .iter()
                .find(|id| assembly.links.get(*id) == Some(&Link::Root))
                .cloned();
        }
        assembly
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == AssemblyState::Complete
    }

    /// Root present and every span reachable from it.
    pub fn is_connected(&self) -> bool {
        self.root.is_some() && self.waiting.is_empty()
    }

    /// True when state changed since the last [`mark_clean`](Self::mark_clean).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn anomalies(&self) -> &[AssemblyAnomaly] {
        &self.anomalies
    }

    /// Admits a batch of validated spans belonging to this trace.
    ///
    /// Re-admitting an identical span is a no-op. A span with a known id but
    /// different content replaces the stored content and keeps its place in
    /// the tree.
    pub fn admit(&mut self, spans: Vec<Span>, now: Instant) -> AssemblyReport {
        let mut outcomes: Vec<(String, Option<SpanOutcome>)> = Vec::with_capacity(spans.len());
        let mut changed = false;

        for mut span in spans {
            let id = span.id.clone();
            match self.spans.get_mut(&id) {
                Some(existing) if *existing == span => {
                    outcomes.push((id, Some(SpanOutcome::Unchanged)));
                }
                Some(existing) => {
                    if existing.parent_id != span.parent_id {
                        warn!(
                            trace_id = %self.trace_id,
                            span_id = %id,
                            "Span update changed its parent; keeping assembled position"
                        );
                        span.parent_id = existing.parent_id.clone();
                        if *existing == span {
                            outcomes.push((id, Some(SpanOutcome::Unchanged)));
                            continue;
                        }
                    }
                    *existing = span;
                    changed = true;
                    outcomes.push((id, Some(SpanOutcome::Updated)));
                }
                None => {
                    self.spans.insert(id.clone(), span);
                    self.order.push(id.clone());
                    self.link(&id);
                    changed = true;
                    outcomes.push((id, None));
                }
            }
        }

        if changed {
            self.last_admit = now;
            self.dirty = true;
        }

        // Outcomes of new spans are read after the whole batch has linked, so
        // a child that arrived before its parent in the same batch reports Linked.
        let spans = outcomes
            .into_iter()
            .map(|(span_id, outcome)| {
                let outcome = outcome.unwrap_or_else(|| self.outcome_of(&span_id));
                SpanAssembly { span_id, outcome }
            })
            .collect();

        AssemblyReport {
            trace_id: self.trace_id.clone(),
            spans,
            connected: self.is_connected(),
            complete: self.is_complete(),
        }
    }

    fn outcome_of(&self, span_id: &str) -> SpanOutcome {
        match self.links.get(span_id) {
            Some(Link::Detached(reason)) => SpanOutcome::Detached { reason: *reason },
            Some(Link::Waiting(_)) => SpanOutcome::Waiting,
            _ => SpanOutcome::Linked,
        }
    }

    fn link(&mut self, id: &str) {
        let declared = self.spans.get(id).and_then(|s| s.parent_id.clone());
        let link = match declared {
            None if self.root.is_none() => {
                self.root = Some(id.to_string());
                Link::Root
            }
            None => self.detach(id, None, DetachReason::DuplicateRoot),
            Some(parent) if !self.spans.contains_key(&parent) => {
                if self.is_complete() {
                    self.detach(id, Some(&parent), DetachReason::MissingParent)
                } else {
                    self.waiting
                        .entry(parent.clone())
                        .or_default()
                        .push(id.to_string());
                    Link::Waiting(parent)
                }
            }
            Some(parent) => {
                if self.closes_cycle(id, &parent) {
                    self.detach(id, Some(&parent), DetachReason::Cycle)
                } else {
                    Link::Child(parent)
                }
            }
        };
        self.links.insert(id.to_string(), link);

        if let Some(children) = self.waiting.remove(id) {
            for child in children {
                let link = if self.closes_cycle(&child, id) {
                    self.detach(&child, Some(id), DetachReason::Cycle)
                } else {
                    Link::Child(id.to_string())
                };
                self.links.insert(child, link);
            }
        }
    }

    /// True if hanging `id` under `parent` would make `id` its own ancestor.
    fn closes_cycle(&self, id: &str, parent: &str) -> bool {
        let mut current = parent;
        loop {
            if current == id {
                return true;
            }
            match self.links.get(current) {
                Some(Link::Child(next)) => current = next.as_str(),
                _ => return false,
            }
        }
    }

    fn detach(&mut self, id: &str, declared_parent: Option<&str>, reason: DetachReason) -> Link {
        warn!(
            trace_id = %self.trace_id,
            span_id = %id,
            declared_parent = ?declared_parent,
            reason = reason.as_str(),
            "Span detached under trace root"
        );
        self.anomalies.push(AssemblyAnomaly::Detached {
            span_id: id.to_string(),
            declared_parent: declared_parent.map(str::to_string),
            reason,
        });
        self.dirty = true;
        Link::Detached(reason)
    }

    /// Earliest instant at which [`on_timer`](Self::on_timer) may change state.
    pub fn next_deadline(&self, config: &AssemblyConfig) -> Option<Instant> {
        if self.is_complete() {
            return None;
        }
        let timeout = self.first_admit + config.assembly_timeout();
        if self.is_connected() {
            Some(timeout.min(self.last_admit + config.quiescence()))
        } else {
            Some(timeout)
        }
    }

    /// Advances the lifecycle. Returns true when the trace became complete.
    ///
    /// A connected trace completes once no span has arrived for the
    /// quiescence window. Any trace completes at the assembly timeout: a
    /// missing root is synthesized and spans still waiting are detached.
    pub fn on_timer(&mut self, now: Instant, config: &AssemblyConfig) -> bool {
        if self.is_complete() {
            return false;
        }
        if now >= self.first_admit + config.assembly_timeout() {
            self.force_connect();
            self.complete();
            return true;
        }
        if self.is_connected() && now >= self.last_admit + config.quiescence() {
            self.complete();
            return true;
        }
        false
    }

    fn complete(&mut self) {
        self.state = AssemblyState::Complete;
        self.dirty = true;
        debug!(trace_id = %self.trace_id, spans = self.spans.len(), "Trace assembly complete");
    }

    fn force_connect(&mut self) {
        if self.root.is_none() {
            self.synthesize_root();
        }

        let mut orphans: Vec<(String, String)> = self
            .waiting
            .drain()
            .flat_map(|(parent, children)| children.into_iter().map(move |c| (c, parent.clone())))
            .collect();
        orphans.sort();
        for (child, parent) in orphans {
            let link = self.detach(&child, Some(&parent), DetachReason::MissingParent);
            self.links.insert(child, link);
        }
    }

    fn synthesize_root(&mut self) {
        let mut id = format!("{}/synthetic-root", self.trace_id);
        while self.spans.contains_key(&id) {
            id.push('_');
        }
        let end = self.spans.values().map(Span::window_end).fold(0.0, f64::max);
        let metadata = BTreeMap::from([(keys::SYNTHETIC.to_string(), Value::Bool(true))]);

        warn!(trace_id = %self.trace_id, span_id = %id, "No root span arrived; synthesizing one");
        self.spans.insert(
            id.clone(),
            Span {
                id: id.clone(),
                trace_id: self.trace_id.clone(),
                parent_id: None,
                name: SYNTHETIC_ROOT_NAME.to_string(),
                kind: SpanKind::System,
                start_offset: 0.0,
                duration: end,
                status: SpanStatus::Success,
                inputs: Payload::new(),
                outputs: Payload::new(),
                metadata,
            },
        );
        self.order.push(id.clone());
        self.links.insert(id.clone(), Link::Root);
        self.anomalies
            .push(AssemblyAnomaly::SyntheticRoot { span_id: id.clone() });
        self.root = Some(id);
        self.dirty = true;
    }

    /// Parent of a span in the assembled tree.
    fn tree_parent(&self, id: &str) -> Option<&str> {
        match self.links.get(id)? {
            Link::Root | Link::Waiting(_) => None,
            Link::Child(parent) => Some(parent.as_str()),
            Link::Detached(_) => self.root.as_deref().filter(|root| *root != id),
        }
    }

    /// Borrowed tree shape for aggregation.
    pub fn view(&self) -> TreeView<'_> {
        let mut tops: Vec<&str> = self.root.iter().map(String::as_str).collect();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in &self.order {
            if self.root.as_deref() == Some(id.as_str()) {
                continue;
            }
            match self.tree_parent(id) {
                Some(parent) => children.entry(parent).or_default().push(id),
                None => tops.push(id),
            }
        }

        for list in children.values_mut() {
            list.sort_by(|a, b| {
                let (sa, sb) = (&self.spans[*a], &self.spans[*b]);
                sa.start_offset.total_cmp(&sb.start_offset).then_with(|| a.cmp(b))
            });
        }

        TreeView {
            root: self.root.as_deref(),
            tops,
            spans: &self.spans,
            children,
        }
    }

    /// Span records in arrival order, annotated with their assembled position.
    pub fn records(&self, rollup: &TraceRollup) -> Vec<SpanRecord> {
        self.order
            .iter()
            .filter_map(|id| self.spans.get(id))
            .map(|span| {
                let detached = match self.links.get(&span.id) {
                    Some(Link::Detached(reason)) => Some(*reason),
                    _ => None,
                };
                let mut span = span.clone();
                if let Some(reason) = detached {
                    span.metadata
                        .insert(keys::DETACHED.to_string(), Value::Bool(true));
                    span.metadata.insert(
                        keys::DETACHED_REASON.to_string(),
                        Value::String(reason.as_str().to_string()),
                    );
                }
                let rollup = rollup
                    .nodes
                    .get(&span.id)
                    .cloned()
                    .unwrap_or_else(|| NodeRollup::of(&span));
                SpanRecord {
                    tree_parent_id: self.tree_parent(&span.id).map(str::to_string),
                    detached,
                    rollup,
                    span,
                }
            })
            .collect()
    }

    /// Trace-level record. Attributes come from the root, or the earliest
    /// arrival while no root exists.
    pub fn trace_record(&self, rollup: &TraceRollup, now_ms: i64) -> TraceRecord {
        let source = self
            .root
            .as_ref()
            .or_else(|| self.order.first())
            .and_then(|id| self.spans.get(id));

        let tags: BTreeSet<String> = source
            .and_then(|s| s.meta_str(keys::TAGS))
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        TraceRecord {
            id: self.trace_id.clone(),
            name: source
                .map(|s| s.name.clone())
                .unwrap_or_else(|| self.trace_id.clone()),
            root_span_id: self.root.clone(),
            created_at: self.created_at,
            request_time: source
                .and_then(|s| s.meta_i64(keys::REQUEST_TIME))
                .unwrap_or(self.created_at),
            updated_at: now_ms,
            status: rollup.status,
            total_duration: rollup.total_duration,
            span_count: rollup.span_count,
            user_id: source.and_then(|s| s.meta_id(keys::USER_ID)),
            session_id: source.and_then(|s| s.meta_id(keys::SESSION_ID)),
            tags,
            assembly: self.state,
            rollup: rollup.metrics.clone(),
            warnings: self.warnings(),
        }
    }

    /// Recorded anomalies plus window overruns of linked children.
    pub fn warnings(&self) -> Vec<AssemblyAnomaly> {
        let mut warnings = self.anomalies.clone();
        for id in &self.order {
            let Some(Link::Child(parent_id)) = self.links.get(id) else {
                continue;
            };
            let (Some(child), Some(parent)) = (self.spans.get(id), self.spans.get(parent_id)) else {
                continue;
            };
            let overrun = (parent.start_offset - child.start_offset)
                .max(child.window_end() - parent.window_end())
                .max(0.0);
            if overrun > OVERRUN_EPSILON {
                warnings.push(AssemblyAnomaly::WindowOverrun {
                    span_id: id.clone(),
                    parent_id: parent_id.clone(),
                    overrun,
                });
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;

    fn span(id: &str, parent: Option<&str>, start: f64, duration: f64) -> Span {
        Span {
            id: id.into(),
            trace_id: "t".into(),
            parent_id: parent.map(Into::into),
            name: id.into(),
            kind: SpanKind::Step,
            start_offset: start,
            duration,
            status: SpanStatus::Success,
            inputs: Payload::new(),
            outputs: Payload::new(),
            metadata: BTreeMap::new(),
        }
    }

    fn config() -> AssemblyConfig {
        AssemblyConfig::default()
            .with_quiescence_ms(100)
            .with_assembly_timeout_ms(1_000)
    }

    fn assembly() -> (TraceAssembly, Instant) {
        let now = Instant::now();
        (TraceAssembly::new("t", now, 1_000), now)
    }

    fn outcome(report: &AssemblyReport, id: &str) -> SpanOutcome {
        report
            .spans
            .iter()
            .find(|s| s.span_id == id)
            .map(|s| s.outcome)
            .unwrap()
    }

    fn tree_parent_of(records: &[SpanRecord], id: &str) -> Option<String> {
        records
            .iter()
            .find(|r| r.id() == id)
            .and_then(|r| r.tree_parent_id.clone())
    }

    #[test]
    fn test_children_before_parent_link_in_any_order() {
        let (mut a, now) = assembly();
        let report = a.admit(vec![span("c", Some("b"), 2.0, 1.0)], now);
        assert_eq!(outcome(&report, "c"), SpanOutcome::Waiting);
        assert!(!report.connected);

        a.admit(vec![span("b", Some("a"), 1.0, 2.0)], now);
        let report = a.admit(vec![span("a", None, 0.0, 4.0)], now);
        assert!(report.connected);

        let records = a.records(&aggregate(&a.view()));
        assert_eq!(tree_parent_of(&records, "c").as_deref(), Some("b"));
        assert_eq!(tree_parent_of(&records, "b").as_deref(), Some("a"));
        assert!(a.anomalies().is_empty());
    }

    #[test]
    fn test_same_batch_out_of_order_reports_linked() {
        let (mut a, now) = assembly();
        let report = a.admit(
            vec![span("b", Some("a"), 0.5, 1.0), span("a", None, 0.0, 2.0)],
            now,
        );
        assert_eq!(outcome(&report, "b"), SpanOutcome::Linked);
        assert_eq!(outcome(&report, "a"), SpanOutcome::Linked);
        assert!(report.connected);
    }

    #[test]
    fn test_readmitting_identical_span_is_noop() {
        let (mut a, now) = assembly();
        a.admit(vec![span("a", None, 0.0, 1.0)], now);
        a.mark_clean();

        let report = a.admit(vec![span("a", None, 0.0, 1.0)], now);
        assert_eq!(outcome(&report, "a"), SpanOutcome::Unchanged);
        assert!(!a.is_dirty());
        assert_eq!(a.span_count(), 1);
    }

    #[test]
    fn test_update_replaces_content_keeps_position() {
        let (mut a, now) = assembly();
        a.admit(
            vec![span("a", None, 0.0, 3.0), span("b", Some("a"), 0.0, 1.0)],
            now,
        );

        let mut updated = span("b", Some("elsewhere"), 0.0, 1.0);
        updated.status = SpanStatus::Error;
        let report = a.admit(vec![updated], now);
        assert_eq!(outcome(&report, "b"), SpanOutcome::Updated);

        let rollup = aggregate(&a.view());
        assert_eq!(rollup.status, SpanStatus::Error);
        let records = a.records(&rollup);
        assert_eq!(tree_parent_of(&records, "b").as_deref(), Some("a"));
    }

    #[test]
    fn test_parent_only_update_is_unchanged() {
        let (mut a, now) = assembly();
        a.admit(
            vec![span("a", None, 0.0, 3.0), span("b", Some("a"), 0.0, 1.0)],
            now,
        );
        a.mark_clean();

        let later = now + Duration::from_millis(50);
        let report = a.admit(vec![span("b", Some("elsewhere"), 0.0, 1.0)], later);
        assert_eq!(outcome(&report, "b"), SpanOutcome::Unchanged);
        assert!(!a.is_dirty());
        // Quiescence still counts from the original admission.
        assert!(a.on_timer(now + Duration::from_millis(100), &config()));
    }

    #[test]
    fn test_second_root_detached_as_duplicate() {
        let (mut a, now) = assembly();
        a.admit(vec![span("a", None, 0.0, 1.0)], now);
        let report = a.admit(vec![span("z", None, 0.0, 1.0)], now);
        assert_eq!(
            outcome(&report, "z"),
            SpanOutcome::Detached {
                reason: DetachReason::DuplicateRoot
            }
        );

        let records = a.records(&aggregate(&a.view()));
        let z = records.iter().find(|r| r.id() == "z").unwrap();
        assert_eq!(z.tree_parent_id.as_deref(), Some("a"));
        assert_eq!(z.span.metadata[keys::DETACHED], Value::Bool(true));
        assert_eq!(z.span.meta_str(keys::DETACHED_REASON), Some("duplicate_root"));
    }

    #[test]
    fn test_self_parent_detached_as_cycle() {
        let (mut a, now) = assembly();
        a.admit(vec![span("a", None, 0.0, 1.0)], now);
        let report = a.admit(vec![span("s", Some("s"), 0.0, 1.0)], now);
        assert_eq!(
            outcome(&report, "s"),
            SpanOutcome::Detached {
                reason: DetachReason::Cycle
            }
        );
    }

    #[test]
    fn test_mutual_parents_break_cycle() {
        let (mut a, now) = assembly();
        a.admit(vec![span("root", None, 0.0, 5.0)], now);
        a.admit(vec![span("x", Some("y"), 0.0, 1.0)], now);
        let report = a.admit(vec![span("y", Some("x"), 0.0, 1.0)], now);

        // y links under x; hanging x under y would close the loop.
        assert!(report.connected);
        let records = a.records(&aggregate(&a.view()));
        assert_eq!(tree_parent_of(&records, "y").as_deref(), Some("x"));
        assert_eq!(tree_parent_of(&records, "x").as_deref(), Some("root"));
        let x = records.iter().find(|r| r.id() == "x").unwrap();
        assert_eq!(x.detached, Some(DetachReason::Cycle));
    }

    #[test]
    fn test_quiescence_completes_connected_trace() {
        let (mut a, now) = assembly();
        a.admit(vec![span("a", None, 0.0, 1.0)], now);

        assert!(!a.on_timer(now + Duration::from_millis(50), &config()));
        assert_eq!(a.next_deadline(&config()), Some(now + Duration::from_millis(100)));
        assert!(a.on_timer(now + Duration::from_millis(100), &config()));
        assert!(a.is_complete());
        assert_eq!(a.next_deadline(&config()), None);
    }

    #[test]
    fn test_disconnected_trace_waits_for_timeout() {
        let (mut a, now) = assembly();
        a.admit(
            vec![span("a", None, 0.0, 1.0), span("b", Some("ghost"), 0.2, 0.3)],
            now,
        );
        assert!(!a.on_timer(now + Duration::from_millis(500), &config()));
        assert_eq!(a.next_deadline(&config()), Some(now + Duration::from_secs(1)));

        assert!(a.on_timer(now + Duration::from_secs(1), &config()));
        let records = a.records(&aggregate(&a.view()));
        let b = records.iter().find(|r| r.id() == "b").unwrap();
        assert_eq!(b.detached, Some(DetachReason::MissingParent));
        assert_eq!(b.tree_parent_id.as_deref(), Some("a"));
        assert_eq!(b.span.parent_id.as_deref(), Some("ghost"));
    }

    #[test]
    fn test_timeout_without_root_synthesizes_one() {
        let (mut a, now) = assembly();
        a.admit(vec![span("b", Some("a"), 1.0, 2.5)], now);
        assert!(a.on_timer(now + Duration::from_secs(1), &config()));

        let rollup = aggregate(&a.view());
        let trace = a.trace_record(&rollup, 2_000);
        let root_id = trace.root_span_id.clone().unwrap();
        assert_eq!(trace.name, SYNTHETIC_ROOT_NAME);
        assert_eq!(trace.total_duration, 3.5);
        assert_eq!(trace.span_count, 2);
        assert!(trace
            .warnings
            .iter()
            .any(|w| matches!(w, AssemblyAnomaly::SyntheticRoot { span_id } if *span_id == root_id)));

        let records = a.records(&rollup);
        assert_eq!(tree_parent_of(&records, "b"), Some(root_id));
    }

    #[test]
    fn test_late_span_on_complete_trace() {
        let (mut a, now) = assembly();
        a.admit(vec![span("a", None, 0.0, 1.0)], now);
        a.on_timer(now + Duration::from_millis(100), &config());

        let report = a.admit(
            vec![span("b", Some("a"), 0.0, 0.5), span("c", Some("ghost"), 0.0, 0.5)],
            now + Duration::from_millis(200),
        );
        assert_eq!(outcome(&report, "b"), SpanOutcome::Linked);
        assert_eq!(
            outcome(&report, "c"),
            SpanOutcome::Detached {
                reason: DetachReason::MissingParent
            }
        );
        assert!(report.complete);
    }

    #[test]
    fn test_trace_attributes_from_root_metadata() {
        let (mut a, now) = assembly();
        let mut root = span("a", None, 0.0, 1.0);
        root.metadata = serde_json::from_value(serde_json::json!({
            "user_id": "u-1",
            "session_id": "s-9",
            "request_time": 1_700_000_000_000i64,
            "tags": "prod, beta,,prod"
        }))
        .unwrap();
        a.admit(vec![root], now);

        let trace = a.trace_record(&aggregate(&a.view()), 5);
        assert_eq!(trace.user_id.as_deref(), Some("u-1"));
        assert_eq!(trace.session_id.as_deref(), Some("s-9"));
        assert_eq!(trace.request_time, 1_700_000_000_000);
        assert_eq!(
            trace.tags.into_iter().collect::<Vec<_>>(),
            vec!["beta".to_string(), "prod".to_string()]
        );
    }

    #[test]
    fn test_numeric_user_and_session_ids_kept_as_text() {
        let (mut a, now) = assembly();
        let mut root = span("a", None, 0.0, 1.0);
        root.metadata = serde_json::from_value(serde_json::json!({
            "user_id": 4217,
            "session_id": 99,
            "tokens": 5
        }))
        .unwrap();
        a.admit(vec![root], now);

        let rollup = aggregate(&a.view());
        let trace = a.trace_record(&rollup, 5);
        assert_eq!(trace.user_id.as_deref(), Some("4217"));
        assert_eq!(trace.session_id.as_deref(), Some("99"));
        assert_eq!(trace.rollup.len(), 1);
        assert_eq!(trace.rollup["tokens"], 5.0);
    }

    #[test]
    fn test_request_time_falls_back_to_created_at() {
        let (mut a, now) = assembly();
        a.admit(vec![span("a", None, 0.0, 1.0)], now);
        let trace = a.trace_record(&aggregate(&a.view()), 5);
        assert_eq!(trace.request_time, 1_000);
    }

    #[test]
    fn test_window_overrun_recorded_not_rejected() {
        let (mut a, now) = assembly();
        a.admit(
            vec![span("a", None, 0.0, 1.0), span("b", Some("a"), 0.5, 1.0)],
            now,
        );
        let warnings = a.warnings();
        assert_eq!(warnings.len(), 1);
        match &warnings[0] {
            AssemblyAnomaly::WindowOverrun { span_id, overrun, .. } => {
                assert_eq!(span_id, "b");
                assert!((overrun - 0.5).abs() < 1e-9);
            }
            other => panic!("unexpected warning {other:?}"),
        }
    }

    #[test]
    fn test_restore_resumes_waiting_children() {
        let (mut a, now) = assembly();
        a.admit(
            vec![span("a", None, 0.0, 3.0), span("c", Some("b"), 1.0, 0.5)],
            now,
        );
        let rollup = aggregate(&a.view());
        let trace = a.trace_record(&rollup, 1_000);
        let records = a.records(&rollup);

        let mut restored = TraceAssembly::restore(trace, records, now, 1_000);
        assert!(!restored.is_connected());
        assert!(!restored.is_dirty());

        let report = restored.admit(vec![span("b", Some("a"), 0.5, 2.0)], now);
        assert!(report.connected);
        let records = restored.records(&aggregate(&restored.view()));
        assert_eq!(tree_parent_of(&records, "c").as_deref(), Some("b"));
    }

    #[test]
    fn test_restore_strips_assembly_metadata() {
        let (mut a, now) = assembly();
        a.admit(
            vec![span("a", None, 0.0, 1.0), span("z", None, 0.0, 1.0)],
            now,
        );
        let rollup = aggregate(&a.view());
        let trace = a.trace_record(&rollup, 1_000);
        let records = a.records(&rollup);

        let mut restored = TraceAssembly::restore(trace, records, now, 1_000);
        let report = restored.admit(vec![span("z", None, 0.0, 1.0)], now);
        assert_eq!(outcome(&report, "z"), SpanOutcome::Unchanged);
        assert_eq!(restored.anomalies().len(), 1);
    }
}
