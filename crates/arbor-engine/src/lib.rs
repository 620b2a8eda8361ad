//! Trace assembly engine for arbor.
//!
//! Spans flow through four stages:
//!
//! - [`Validator`] rejects malformed spans individually
//! - [`Ingestor`] routes valid spans to one worker per trace
//! - [`TraceAssembly`] links spans into a tree as they arrive, in any order
//! - [`aggregate`] computes status, duration and metric rollups bottom-up
//!
//! Committed traces are read back through [`QueryEngine`] (filtered,
//! paginated listings) and [`TreeReader`] (lazy node and subtree reads).

pub mod aggregate;
pub mod assemble;
pub mod ingest;
pub mod query;
pub mod tree;
pub mod validate;

pub use aggregate::{aggregate, TraceRollup, TreeView};
pub use assemble::{AssemblyReport, SpanAssembly, SpanOutcome, TraceAssembly};
pub use ingest::{AdmissionStatus, IngestReport, Ingestor, SpanAdmission};
pub use query::QueryEngine;
pub use tree::{ChildSummary, SpanNode, SpanTree, TreeReader, MAX_SUBTREE_DEPTH};
pub use validate::Validator;

use arbor_config::ArborConfig;
use arbor_core::TraceError;
use arbor_store::TraceStore;
use std::sync::Arc;

/// The engine's entry points over one shared store.
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<TraceStore>,
    pub ingestor: Ingestor,
    pub queries: QueryEngine,
    pub trees: TreeReader,
}

impl Engine {
    pub fn new(store: Arc<TraceStore>, config: &ArborConfig) -> Self {
        Self {
            ingestor: Ingestor::new(
                Arc::clone(&store),
                config.assembly.clone(),
                config.validation.clone(),
            ),
            queries: QueryEngine::new(Arc::clone(&store), config.query.clone()),
            trees: TreeReader::new(Arc::clone(&store)),
            store,
        }
    }

    /// Opens the store at the configured database path.
    pub fn open(config: &ArborConfig) -> Result<Self, TraceError> {
        let store = TraceStore::new(&config.database_path)?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Engine over a private in-memory store.
    pub fn in_memory(config: &ArborConfig) -> Result<Self, TraceError> {
        Ok(Self::new(Arc::new(TraceStore::in_memory()?), config))
    }
}
