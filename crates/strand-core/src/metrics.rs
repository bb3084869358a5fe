//! Stream log instrumentation through the `metrics` facade.
//!
//! Metric names follow `strand_streamlog_{name}_{unit}`. The engine only
//! emits; installing an exporter is the embedding server's concern.

use std::time::Duration;

/// Storage engine metrics.
pub struct StreamLogMetrics;

impl StreamLogMetrics {
    /// Bytes of segment data currently accounted against the quota.
    pub fn set_log_size_bytes(bytes: u64) {
        metrics::gauge!("strand_streamlog_size_bytes").set(bytes as f64);
    }

    /// Number of open segment handles.
    pub fn set_open_segments(count: usize) {
        metrics::gauge!("strand_streamlog_open_segments").set(count as f64);
    }

    /// Current trim mark (starting address).
    pub fn set_trim_mark(address: u64) {
        metrics::gauge!("strand_streamlog_trim_mark").set(address as f64);
    }

    /// Records appended.
    pub fn add_records_appended(count: u64) {
        metrics::counter!("strand_streamlog_records_appended_total").increment(count);
    }

    /// Bytes written to segment files.
    pub fn add_write_bytes(bytes: u64) {
        metrics::counter!("strand_streamlog_write_bytes_total").increment(bytes);
    }

    /// Records read back.
    pub fn increment_reads() {
        metrics::counter!("strand_streamlog_reads_total").increment(1);
    }

    /// Write-once violations rejected.
    pub fn increment_overwrite_rejections() {
        metrics::counter!("strand_streamlog_overwrite_rejections_total").increment(1);
    }

    /// Duration of one segment fsync.
    pub fn record_fsync_duration(duration: Duration) {
        metrics::histogram!("strand_streamlog_fsync_seconds").record(duration.as_secs_f64());
    }
}
