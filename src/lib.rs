#![doc = include_str!("../README.md")]
// Declare modules
pub mod buffer;
pub mod clickhouse;
pub mod error;
pub mod query;
pub mod remote;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod writer;

/// ClickHouse HTTP backend and its connection settings.
pub use crate::clickhouse::{ClickHouseConfig, ClickHouseStore};
/// Error type and result alias for every fallible operation.
pub use crate::error::{BridgeError, Result};
/// Read path: query translation and series reassembly.
pub use crate::query::{build_select, Reader, ReaderConfig, SelectQuery};
/// Storage seam and the in-memory backend.
pub use crate::storage::{MemoryStore, SampleStore, StoreTransaction};
/// Structured event hook for observability.
pub use crate::telemetry::{BridgeEvent, EventListener};
/// Metrics handle shared with the write engine.
pub use crate::telemetry::bridge_metrics::WriterMetrics;
/// Core data model.
pub use crate::types::{Label, MatchOp, Matcher, Query, Sample, SampleRecord, TimeSeries};
/// Write path: bounded queue plus batching flush thread.
pub use crate::writer::{ShutdownOutcome, WriteEngine, WriterConfig, DEFAULT_SHUTDOWN_DEADLINE};
