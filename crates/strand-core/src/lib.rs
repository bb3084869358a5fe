//! Persistent log-unit storage engine for the strand shared log.
//!
//! The engine durably stores `{global address, stream ids, payload}` records
//! in fixed-width segment files, indexes them by address and by stream,
//! enforces write-once semantics, and supports prefix trimming, compaction,
//! quota back-pressure, and recovery after restart. The sequencer, cluster
//! layout, and client RPC surface live above this crate.

pub mod address_space;
pub mod config;
pub mod datastore;
pub mod entry;
pub mod error;
pub mod fs_agent;
pub mod metadata;
pub mod metrics;
pub mod quota;
pub mod storage;

pub use address_space::StreamAddressSpace;
pub use config::{StreamLogConfig, RECORDS_PER_SEGMENT};
pub use datastore::{DataStore, FileDataStore, InMemoryDataStore};
pub use entry::{EntryKind, LogEntry};
pub use error::{Error, OverwriteCause, Result};
pub use fs_agent::FileSystemAgent;
pub use metadata::{StreamsAddressSpaceView, Tails};
pub use metrics::StreamLogMetrics;
pub use quota::ResourceQuota;
pub use storage::StreamLog;
