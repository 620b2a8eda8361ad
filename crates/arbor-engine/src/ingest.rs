//! Span ingestion: validation, routing to per-trace workers, commits.
//!
//! Every trace with work in flight has exactly one worker task. The worker
//! owns the trace's [`TraceAssembly`], so all structural decisions for a
//! trace are made by a single writer. Workers commit the trace record and
//! changed spans in one store transaction, drive the quiescence and timeout
//! timers, and retire once their trace is complete and fully committed.

use crate::aggregate::aggregate;
use crate::assemble::TraceAssembly;
use crate::validate::Validator;
use arbor_config::{AssemblyConfig, ValidationConfig};
use arbor_core::{now_ms, RejectionReason, Span, SpanInput, SpanRecord, TraceError};
use arbor_store::TraceStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Per-span result of an ingest call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AdmissionStatus {
    Accepted,
    Rejected(RejectionReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanAdmission {
    pub span_id: Option<String>,
    pub trace_id: Option<String>,
    #[serde(flatten)]
    pub status: AdmissionStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    /// One entry per submitted span, in submission order.
    pub results: Vec<SpanAdmission>,
}

impl IngestReport {
    fn push(&mut self, span_id: Option<String>, trace_id: Option<String>, status: AdmissionStatus) {
        match status {
            AdmissionStatus::Accepted => self.accepted += 1,
            AdmissionStatus::Rejected(_) => self.rejected += 1,
        }
        self.results.push(SpanAdmission {
            span_id,
            trace_id,
            status,
        });
    }

    /// Trace ids that received at least one accepted span.
    pub fn trace_ids(&self) -> Vec<String> {
        let ids: BTreeSet<&String> = self
            .results
            .iter()
            .filter(|r| r.status == AdmissionStatus::Accepted)
            .filter_map(|r| r.trace_id.as_ref())
            .collect();
        ids.into_iter().cloned().collect()
    }
}

enum Command {
    Admit(Vec<Span>),
    /// Commit pending state, then report whether the store accepted it.
    Sync(oneshot::Sender<bool>),
}

struct WorkerHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Command>,
}

struct Shared {
    store: Arc<TraceStore>,
    config: AssemblyConfig,
    workers: DashMap<String, WorkerHandle>,
    /// Span ids admitted but not yet committed, with the trace that claimed them.
    claims: DashMap<String, String>,
    next_worker: AtomicU64,
}

impl Shared {
    fn release(&self, span_id: &str, trace_id: &str) {
        self.claims.remove_if(span_id, |_, owner| owner == trace_id);
    }

    fn spawn_worker(self: &Arc<Self>, trace_id: &str) -> WorkerHandle {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = TraceWorker {
            id,
            trace_id: trace_id.to_string(),
            shared: Arc::clone(self),
            rx,
            assembly: None,
            committed: HashMap::new(),
            held: Vec::new(),
            retry_at: None,
        };
        tokio::spawn(worker.run());
        WorkerHandle { id, tx }
    }
}

/// Accepts span batches and routes them to per-trace assembly workers.
#[derive(Clone)]
pub struct Ingestor {
    shared: Arc<Shared>,
    validator: Validator,
}

impl Ingestor {
    pub fn new(store: Arc<TraceStore>, assembly: AssemblyConfig, validation: ValidationConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                config: assembly,
                workers: DashMap::new(),
                claims: DashMap::new(),
                next_worker: AtomicU64::new(0),
            }),
            validator: Validator::new(validation),
        }
    }

    /// Validates and admits a batch of spans.
    ///
    /// Invalid spans are rejected individually with a reason; valid spans in
    /// the same batch are still admitted. Fails as a whole only when the
    /// store cannot be reached, in which case nothing is admitted.
    ///
    /// Returns once every accepted span is queued with its trace worker.
    /// Use [`sync`](Self::sync) to wait for the commit.
    pub fn ingest(&self, batch: Vec<SpanInput>) -> Result<IngestReport, TraceError> {
        self.shared.store.ping()?;

        let mut report = IngestReport::default();
        let mut seen: HashSet<String> = HashSet::with_capacity(batch.len());
        let mut claimed: Vec<(String, String)> = Vec::new();
        let mut groups: BTreeMap<String, Vec<Span>> = BTreeMap::new();

        for input in batch {
            let (span_id, trace_id) = (input.id.clone(), input.trace_id.clone());
            let span = match self.validator.validate(input) {
                Ok(span) => span,
                Err(reason) => {
                    debug!(span_id = ?span_id, code = reason.code(), "Span rejected");
                    report.push(span_id, trace_id, AdmissionStatus::Rejected(reason));
                    continue;
                }
            };

            let conflict = match self.conflict(&span, &mut seen, &mut claimed) {
                Ok(conflict) => conflict,
                Err(e) => {
                    // Nothing from this batch reaches a worker.
                    for (span_id, trace_id) in &claimed {
                        self.shared.release(span_id, trace_id);
                    }
                    return Err(e);
                }
            };
            if let Some(reason) = conflict {
                debug!(span_id = %span.id, code = reason.code(), "Span rejected");
                report.push(span_id, trace_id, AdmissionStatus::Rejected(reason));
                continue;
            }

            report.push(span_id, trace_id, AdmissionStatus::Accepted);
            groups.entry(span.trace_id.clone()).or_default().push(span);
        }

        let traces = groups.len();
        for (trace_id, spans) in groups {
            self.dispatch(&trace_id, Command::Admit(spans));
        }

        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            traces,
            "Ingested span batch"
        );
        Ok(report)
    }

    /// Checks that `span.id` is free for its trace and claims it.
    ///
    /// The claim is taken before the store is consulted, so of two traces
    /// racing for one new id exactly one wins. Claims are released once the
    /// owning worker has committed the span.
    fn conflict(
        &self,
        span: &Span,
        seen: &mut HashSet<String>,
        claimed: &mut Vec<(String, String)>,
    ) -> Result<Option<RejectionReason>, TraceError> {
        if !seen.insert(span.id.clone()) {
            return Ok(Some(RejectionReason::DuplicateInBatch));
        }

        let fresh = match self.shared.claims.entry(span.id.clone()) {
            Entry::Occupied(claim) if *claim.get() != span.trace_id => {
                return Ok(Some(RejectionReason::SpanIdConflict {
                    owner: claim.get().clone(),
                }));
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(span.trace_id.clone());
                true
            }
        };

        let owner = self.shared.store.span_owner(&span.id).inspect_err(|_| {
            if fresh {
                self.shared.release(&span.id, &span.trace_id);
            }
        })?;
        match owner {
            Some(owner) if owner != span.trace_id => {
                if fresh {
                    self.shared.release(&span.id, &span.trace_id);
                }
                Ok(Some(RejectionReason::SpanIdConflict { owner }))
            }
            _ => {
                if fresh {
                    claimed.push((span.id.clone(), span.trace_id.clone()));
                }
                Ok(None)
            }
        }
    }

    fn dispatch(&self, trace_id: &str, mut command: Command) {
        loop {
            let handle = self
                .shared
                .workers
                .entry(trace_id.to_string())
                .or_insert_with(|| self.shared.spawn_worker(trace_id));
            match handle.tx.send(command) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // Worker exited without deregistering; replace it.
                    let stale = handle.id;
                    drop(handle);
                    self.shared
                        .workers
                        .remove_if(trace_id, |_, h| h.id == stale);
                    command = returned;
                }
            }
        }
    }

    /// Waits until everything admitted so far for `trace_id` is committed.
    pub async fn sync(&self, trace_id: &str) -> Result<(), TraceError> {
        let (tx, rx) = oneshot::channel();
        let sent = match self.shared.workers.get(trace_id) {
            Some(handle) => handle.tx.send(Command::Sync(tx)).is_ok(),
            None => false,
        };
        if !sent {
            // No live worker: the trace is fully committed.
            return Ok(());
        }
        match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TraceError::StoreUnavailable(format!(
                "commit of trace {trace_id} failed; retry pending"
            ))),
            Err(_) => Err(TraceError::StoreUnavailable(format!(
                "worker for trace {trace_id} stopped"
            ))),
        }
    }

    /// [`sync`](Self::sync) for several traces concurrently.
    pub async fn sync_all(&self, trace_ids: &[String]) -> Result<(), TraceError> {
        let results = join_all(trace_ids.iter().map(|id| self.sync(id))).await;
        results.into_iter().collect()
    }

    /// Number of traces with a live worker.
    pub fn active_traces(&self) -> usize {
        self.shared.workers.len()
    }

    /// Flushes every worker and stops them.
    ///
    /// Traces that are still assembling stay committed in the assembling
    /// state and resume when their next span arrives.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .shared
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        info!(workers = ids.len(), "Flushing trace workers");
        for (id, result) in ids.iter().zip(join_all(ids.iter().map(|id| self.sync(id))).await) {
            if let Err(e) = result {
                error!(trace_id = %id, error = %e, "Trace not flushed at shutdown");
            }
        }
        self.shared.workers.clear();
    }
}

struct TraceWorker {
    id: u64,
    trace_id: String,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Command>,
    assembly: Option<TraceAssembly>,
    /// Span records as last written, to skip unchanged rows.
    committed: HashMap<String, SpanRecord>,
    /// Admitted span ids whose claims are released on the next clean commit.
    held: Vec<String>,
    retry_at: Option<Instant>,
}

impl TraceWorker {
    async fn run(mut self) {
        debug!(trace_id = %self.trace_id, worker = self.id, "Trace worker started");
        self.load().await;

        loop {
            let deadline = self.next_deadline();
            let wake = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Admit(spans)) => self.admit(spans),
                    Some(Command::Sync(done)) => {
                        let ok = self.commit();
                        let _ = done.send(ok);
                    }
                    None => {
                        self.commit();
                        break;
                    }
                },
                _ = sleep_until(wake), if deadline.is_some() => self.on_timer(),
            }

            self.commit();
            if self.settled() && self.retire() {
                break;
            }
        }
        debug!(trace_id = %self.trace_id, worker = self.id, "Trace worker retired");
    }

    /// Picks up committed state for traces that are receiving spans again.
    async fn load(&mut self) {
        loop {
            match self.shared.store.get_trace_tree(&self.trace_id) {
                Ok(Some((trace, records))) => {
                    debug!(
                        trace_id = %self.trace_id,
                        spans = records.len(),
                        assembly = trace.assembly.as_str(),
                        "Resuming committed trace"
                    );
                    self.committed = records
                        .iter()
                        .map(|r| (r.id().to_string(), r.clone()))
                        .collect();
                    self.assembly = Some(TraceAssembly::restore(
                        trace,
                        records,
                        Instant::now(),
                        now_ms(),
                    ));
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(trace_id = %self.trace_id, error = %e, "Failed to load trace; retrying");
                    tokio::time::sleep(self.shared.config.commit_retry()).await;
                }
            }
        }
    }

    fn admit(&mut self, spans: Vec<Span>) {
        let now = Instant::now();
        let trace_id = &self.trace_id;
        let assembly = self
            .assembly
            .get_or_insert_with(|| TraceAssembly::new(trace_id.clone(), now, now_ms()));
        self.held.extend(spans.iter().map(|s| s.id.clone()));
        let report = assembly.admit(spans, now);
        debug!(
            trace_id = %report.trace_id,
            spans = report.spans.len(),
            connected = report.connected,
            complete = report.complete,
            "Admitted spans"
        );
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if let Some(assembly) = self.assembly.as_mut() {
            if assembly.on_timer(now, &self.shared.config) {
                info!(
                    trace_id = %self.trace_id,
                    spans = assembly.span_count(),
                    anomalies = assembly.anomalies().len(),
                    "Trace complete"
                );
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let assembly = self
            .assembly
            .as_ref()
            .and_then(|a| a.next_deadline(&self.shared.config));
        match (assembly, self.retry_at) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (a, r) => a.or(r),
        }
    }

    /// Writes pending state, then releases the claims it covered.
    /// Returns false on failure.
    fn commit(&mut self) -> bool {
        if !self.write_pending() {
            return false;
        }
        let trace_id = &self.trace_id;
        for span_id in self.held.drain(..) {
            self.shared.release(&span_id, trace_id);
        }
        true
    }

    /// Writes the trace record and changed spans. Returns false on failure.
    fn write_pending(&mut self) -> bool {
        let Some(assembly) = self.assembly.as_mut() else {
            return true;
        };
        if !assembly.is_dirty() {
            return true;
        }
        if self.retry_at.is_some_and(|at| Instant::now() < at) {
            return false;
        }

        let rollup = aggregate(&assembly.view());
        let trace = assembly.trace_record(&rollup, now_ms());
        let changed: Vec<SpanRecord> = assembly
            .records(&rollup)
            .into_iter()
            .filter(|r| self.committed.get(r.id()) != Some(r))
            .collect();

        match self.shared.store.put(&trace, &changed) {
            Ok(()) => {
                debug!(
                    trace_id = %self.trace_id,
                    spans = changed.len(),
                    status = trace.status.as_str(),
                    assembly = trace.assembly.as_str(),
                    "Committed trace"
                );
                for record in changed {
                    self.committed.insert(record.id().to_string(), record);
                }
                assembly.mark_clean();
                self.retry_at = None;
                true
            }
            Err(e) => {
                error!(trace_id = %self.trace_id, error = %e, "Commit failed; will retry");
                self.retry_at = Some(Instant::now() + self.shared.config.commit_retry());
                false
            }
        }
    }

    fn settled(&self) -> bool {
        self.retry_at.is_none()
            && self
                .assembly
                .as_ref()
                .is_some_and(|a| a.is_complete() && !a.is_dirty())
    }

    /// Deregisters if no command is queued. Returns true when the worker should exit.
    fn retire(&self) -> bool {
        let (id, rx) = (self.id, &self.rx);
        if self
            .shared
            .workers
            .remove_if(&self.trace_id, |_, h| h.id == id && rx.is_empty())
            .is_some()
        {
            return true;
        }
        // A replaced worker has nobody left to send to it.
        !self
            .shared
            .workers
            .get(&self.trace_id)
            .is_some_and(|h| h.id == id)
    }
}
