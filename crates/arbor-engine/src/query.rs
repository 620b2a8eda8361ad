//! Filtered, paginated trace listing under a time budget.

use arbor_config::QueryConfig;
use arbor_core::{PageRequest, QueryPage, TraceError, TraceFilter, TraceSummary};
use arbor_store::{QueryCancel, TraceStore};
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Cancels the query's store statement unless disarmed.
///
/// Covers both an exceeded budget and the caller dropping the query future.
struct CancelOnDrop(Option<QueryCancel>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel.cancel();
        }
    }
}

/// Runs trace queries against the store.
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<TraceStore>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(store: Arc<TraceStore>, config: QueryConfig) -> Self {
        Self { store, config }
    }

    /// Returns one page of traces matching `filter`, newest request first.
    ///
    /// Ties on request time are broken by trace id, so paging through a
    /// stable store yields every match exactly once.
    pub async fn query(
        &self,
        filter: TraceFilter,
        page: PageRequest,
    ) -> Result<QueryPage<TraceSummary>, TraceError> {
        let (offset, size) = self.window(&filter, page)?;

        let cancel = QueryCancel::new();
        let guard = CancelOnDrop(Some(cancel.clone()));
        let store = Arc::clone(&self.store);
        let task = spawn_blocking(move || store.query_traces(&filter, offset, size, &cancel));

        let (items, total_count) = match timeout(self.config.timeout(), task).await {
            Ok(joined) => {
                guard.disarm();
                joined.map_err(|e| TraceError::StoreUnavailable(format!("query task failed: {e}")))??
            }
            Err(_) => {
                warn!(timeout_ms = self.config.timeout_ms, "Trace query exceeded its budget");
                return Err(TraceError::QueryTimeout(self.config.timeout_ms));
            }
        };

        let has_next = offset + (items.len() as u64) < total_count;
        debug!(
            page = page.number,
            page_size = size,
            returned = items.len(),
            total_count,
            "Trace query"
        );
        Ok(QueryPage {
            items,
            total_count,
            has_next,
            page: page.number,
            page_size: size,
        })
    }

    /// Resolves a page request into an (offset, size) window.
    fn window(&self, filter: &TraceFilter, page: PageRequest) -> Result<(u64, u32), TraceError> {
        if page.number == 0 {
            return Err(TraceError::InvalidQuery("page numbers start at 1".into()));
        }
        let size = page.size.unwrap_or(self.config.default_page_size);
        if size == 0 {
            return Err(TraceError::InvalidQuery("page_size must be at least 1".into()));
        }
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(TraceError::InvalidQuery(format!(
                    "time range start {from} is after its end {to}"
                )));
            }
        }
        let size = size.min(self.config.max_page_size);
        Ok((u64::from(page.number - 1) * u64::from(size), size))
    }
}
