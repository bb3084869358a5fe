use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of consecutive global addresses covered by one segment file.
pub const RECORDS_PER_SEGMENT: u64 = 10_000;

/// Configuration for a stream log unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamLogConfig {
    /// Root directory of the log unit. Segment files and the metadata
    /// snapshot live under `<log_path>/log/`.
    pub log_path: PathBuf,

    /// Upper bound on the summed size of segment files, in bytes.
    /// `None` disables quota enforcement.
    pub log_size_limit: Option<u64>,

    /// Use `fdatasync` instead of `fsync` when flushing segments.
    pub sync_data_only: bool,
}

impl Default for StreamLogConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./data"),
            log_size_limit: None,
            sync_data_only: false,
        }
    }
}

impl StreamLogConfig {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            ..Default::default()
        }
    }

    /// Set the log size quota in bytes.
    pub fn with_log_size_limit(mut self, limit: u64) -> Self {
        self.log_size_limit = Some(limit);
        self
    }

    /// Flush segment data without metadata (`fdatasync`).
    pub fn with_sync_data_only(mut self, enabled: bool) -> Self {
        self.sync_data_only = enabled;
        self
    }

    /// Directory holding segment files.
    pub fn log_dir(&self) -> PathBuf {
        self.log_path.join("log")
    }
}
