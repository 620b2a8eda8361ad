//! Durable trace storage for arbor.

mod schema;
mod store;

pub use store::{MetricsSummary, NodeSnapshot, QueryCancel, StoreError, TraceStore};
