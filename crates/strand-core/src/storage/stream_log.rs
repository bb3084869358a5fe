//! The log-unit storage engine.
//!
//! `StreamLog` durably stores addressed records across segment files,
//! indexes them by global address and stream id, enforces write-once
//! semantics, and supports prefix trimming, compaction, and a destructive
//! reset used to heal a recovering node.
//!
//! Maintenance (reset, compaction) takes the write side of a
//! readers-writer lock; all normal I/O takes the read side, so the two can
//! never interleave.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{StreamLogConfig, RECORDS_PER_SEGMENT};
use crate::datastore::{DataStore, FileDataStore};
use crate::entry::LogEntry;
use crate::error::OverwriteCause;
use crate::fs_agent::FileSystemAgent;
use crate::metadata::{LogMetadata, StreamsAddressSpaceView, Tails};
use crate::metrics::StreamLogMetrics;
use crate::quota::ResourceQuota;
use crate::storage::segment::{Segment, SegmentHandle};
use crate::{Error, Result};

/// File-backed stream log for one log unit.
pub struct StreamLog {
    config: StreamLogConfig,
    log_dir: PathBuf,
    data_store: Arc<dyn DataStore>,
    fs_agent: FileSystemAgent,
    quota: Arc<ResourceQuota>,
    /// Lazily opened segments; at most one handle per segment id.
    open_segments: DashMap<u64, Arc<Segment>>,
    metadata: Mutex<LogMetadata>,
    /// Normal I/O takes the read side; reset and compaction the write side.
    reset_lock: RwLock<()>,
}

impl StreamLog {
    /// Open a stream log rooted at `config.log_path`, persisting bookkeeping
    /// in a [`FileDataStore`] under the log directory.
    pub fn open(config: StreamLogConfig) -> Result<Self> {
        let fs_agent = FileSystemAgent::init(&config.log_dir(), config.log_size_limit)?;
        let data_store = Arc::new(FileDataStore::open(config.log_dir().join("log_metadata"))?);
        Self::with_agent(config, fs_agent, data_store)
    }

    /// Open a stream log with an externally provided datastore.
    pub fn open_with_datastore(
        config: StreamLogConfig,
        data_store: Arc<dyn DataStore>,
    ) -> Result<Self> {
        let fs_agent = FileSystemAgent::init(&config.log_dir(), config.log_size_limit)?;
        Self::with_agent(config, fs_agent, data_store)
    }

    fn with_agent(
        config: StreamLogConfig,
        fs_agent: FileSystemAgent,
        data_store: Arc<dyn DataStore>,
    ) -> Result<Self> {
        let quota = fs_agent.quota();
        let log = Self {
            log_dir: config.log_dir(),
            config,
            data_store: data_store.clone(),
            fs_agent,
            quota,
            open_segments: DashMap::new(),
            metadata: Mutex::new(LogMetadata::new(data_store)),
            reset_lock: RwLock::new(()),
        };

        {
            let mut md = log.metadata.lock();
            log.recover(&mut md, Some(u64::MAX))?;

            // A prefix trim may land beyond anything ever written; the tail
            // segment must still cover the trim mark.
            let starting_address = log.data_store.starting_address();
            if starting_address > 0
                && md.global_tail().is_none_or(|tail| tail < starting_address - 1)
            {
                md.sync_tail_segment(starting_address - 1, false)?;
            }
        }

        StreamLogMetrics::set_trim_mark(log.data_store.starting_address());
        StreamLogMetrics::set_log_size_bytes(log.quota.used());
        info!(
            dir = %log.log_dir.display(),
            global_tail = ?log.log_tail(),
            trim_mark = log.trim_mark(),
            "opened stream log"
        );
        Ok(log)
    }

    // ---- segment handles ------------------------------------------------

    fn segment_for_id(&self, segment_id: u64) -> Result<SegmentHandle> {
        let segment = match self.open_segments.entry(segment_id) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let segment = Arc::new(Segment::open(
                    segment_id,
                    &self.log_dir,
                    self.quota.clone(),
                    self.config.sync_data_only,
                )?);
                vacant.insert(segment.clone());
                segment
            }
        };
        StreamLogMetrics::set_open_segments(self.open_segments.len());
        Ok(SegmentHandle::new(segment))
    }

    fn segment_for_address(&self, address: u64) -> Result<SegmentHandle> {
        self.segment_for_id(address / RECORDS_PER_SEGMENT)
    }

    fn is_trimmed(&self, address: u64) -> bool {
        address < self.data_store.starting_address()
    }

    /// Directory holding this log's segment files.
    pub fn log_dir(&self) -> &std::path::Path {
        self.fs_agent.log_dir()
    }

    // ---- append ---------------------------------------------------------

    /// Append one entry at its global address.
    ///
    /// On success the record has reached the OS cache and the in-memory
    /// index; durability requires a subsequent [`sync`](Self::sync) with
    /// `force`.
    pub fn append(&self, entry: LogEntry) -> Result<()> {
        let _io = self.reset_lock.read();
        let address = entry.global_address;

        if self.is_trimmed(address) {
            return Err(Error::Overwrite(OverwriteCause::Trimmed));
        }
        if !self.quota.has_available() {
            return Err(Error::QuotaExceeded);
        }

        let segment = self.segment_for_address(address)?;
        match segment.write(&entry)? {
            Some(bytes) => {
                let mut md = self.metadata.lock();
                md.sync_tail_segment(address, false)?;
                md.update(&entry);
                drop(md);

                StreamLogMetrics::add_records_appended(1);
                StreamLogMetrics::add_write_bytes(bytes);
                StreamLogMetrics::set_log_size_bytes(self.quota.used());
                trace!(address, bytes, "appended record");
                Ok(())
            }
            None => {
                let err = self.classify_overwrite(&segment, &entry)?;
                StreamLogMetrics::increment_overwrite_rejections();
                trace!(address, error = %err, "rejected overwrite");
                Err(err)
            }
        }
    }

    /// Append a consecutive range of entries, as used by state transfer.
    ///
    /// The range must be non-empty and strictly consecutive and may span at
    /// most two segments. Entries below the local trim mark are pruned (trim
    /// races with state transfer); each segment's batch is written with one
    /// positioned write.
    pub fn append_range(&self, entries: Vec<LogEntry>) -> Result<()> {
        let _io = self.reset_lock.read();

        let range = self.prepare_range(entries)?;
        if range.is_empty() {
            return Ok(());
        }
        if !self.quota.has_available() {
            return Err(Error::QuotaExceeded);
        }

        let mut batches: BTreeMap<u64, Vec<LogEntry>> = BTreeMap::new();
        for entry in range {
            batches
                .entry(entry.global_address / RECORDS_PER_SEGMENT)
                .or_default()
                .push(entry);
        }
        if batches.len() > 2 {
            return Err(Error::IllegalArgument(format!(
                "range spans {} segments, at most 2 allowed",
                batches.len()
            )));
        }

        for (segment_id, batch) in &batches {
            let segment = self.segment_for_id(*segment_id)?;
            if batch.iter().any(|e| segment.contains(e.global_address)) {
                return Err(Error::Overwrite(OverwriteCause::SameData));
            }
        }

        let mut total_bytes = 0;
        let mut total_records = 0;
        for (segment_id, batch) in &batches {
            let segment = self.segment_for_id(*segment_id)?;
            let bytes = match segment.write_batch(batch)? {
                Some(bytes) => bytes,
                None => return Err(Error::Overwrite(OverwriteCause::SameData)),
            };

            let last = batch.last().expect("batches are non-empty").global_address;
            let mut md = self.metadata.lock();
            md.sync_tail_segment(last, false)?;
            md.update_all(batch);
            drop(md);

            total_bytes += bytes;
            total_records += batch.len() as u64;
        }

        StreamLogMetrics::add_records_appended(total_records);
        StreamLogMetrics::add_write_bytes(total_bytes);
        StreamLogMetrics::set_log_size_bytes(self.quota.used());
        Ok(())
    }

    /// Validate a range write and prune entries the local trim mark has
    /// already passed.
    fn prepare_range(&self, entries: Vec<LogEntry>) -> Result<Vec<LogEntry>> {
        if entries.is_empty() {
            return Err(Error::IllegalArgument("empty range".to_string()));
        }

        let mut previous: Option<u64> = None;
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            // State transfer cannot read trimmed addresses, so receiving one
            // means the source already considers this data gone.
            if entry.is_trimmed() {
                return Err(Error::Overwrite(OverwriteCause::SameData));
            }
            if let Some(prev) = previous {
                if entry.global_address != prev + 1 {
                    return Err(Error::IllegalArgument(format!(
                        "range must be consecutive, got {} after {prev}",
                        entry.global_address
                    )));
                }
            }
            previous = Some(entry.global_address);

            if self.is_trimmed(entry.global_address) {
                continue;
            }
            kept.push(entry);
        }
        Ok(kept)
    }

    /// Read back the stored record and classify the write-once violation.
    fn classify_overwrite(&self, segment: &Segment, incoming: &LogEntry) -> Result<Error> {
        let stored = match segment.read(incoming.global_address)? {
            Some(stored) => stored,
            // The colliding record vanished between the write attempt and
            // the read-back; report the generic cause.
            None => return Ok(Error::Overwrite(OverwriteCause::DifferentData)),
        };

        if let (Some(incoming_rank), Some(stored_rank)) = (incoming.rank, stored.rank) {
            if incoming_rank <= stored_rank {
                if incoming.is_hole() && incoming_rank < stored_rank {
                    return Ok(Error::DataOutranked);
                }
                return Ok(Error::Overwrite(OverwriteCause::Rank));
            }
        }
        if stored.is_hole() {
            return Ok(Error::Overwrite(OverwriteCause::Hole));
        }
        if stored == *incoming {
            Ok(Error::Overwrite(OverwriteCause::SameData))
        } else {
            Ok(Error::Overwrite(OverwriteCause::DifferentData))
        }
    }

    // ---- read -----------------------------------------------------------

    /// Read the entry at `address`.
    ///
    /// Returns `None` when the address has never been written, and a
    /// synthetic trimmed entry when the address is below the trim mark.
    pub fn read(&self, address: u64) -> Result<Option<LogEntry>> {
        let _io = self.reset_lock.read();
        if self.is_trimmed(address) {
            return Ok(Some(LogEntry::trimmed(address)));
        }
        let segment = self.segment_for_address(address)?;
        StreamLogMetrics::increment_reads();
        segment.read(address)
    }

    /// Whether the log holds a record at `address`.
    ///
    /// Addresses at or below the committed tail answer `true` without
    /// consulting the index: the committed tail guarantees presence, and the
    /// auto-commit client above depends on this short circuit.
    ///
    /// # Errors
    ///
    /// `Trimmed` below the trim mark; auto-commit treats it as a signal that
    /// its commit counter fell behind.
    pub fn contains(&self, address: u64) -> Result<bool> {
        if self.is_trimmed(address) {
            return Err(Error::Trimmed);
        }
        if self
            .data_store
            .committed_tail()
            .is_some_and(|tail| address <= tail)
        {
            return Ok(true);
        }

        let _io = self.reset_lock.read();
        let segment = self.segment_for_address(address)?;
        Ok(segment.contains(address))
    }

    /// Addresses with a record in the inclusive range `[range_start, range_end]`.
    pub fn known_addresses_in_range(
        &self,
        range_start: u64,
        range_end: u64,
    ) -> Result<BTreeSet<u64>> {
        let _io = self.reset_lock.read();
        let mut known = BTreeSet::new();
        if range_start > range_end {
            return Ok(known);
        }

        for segment_id in range_start / RECORDS_PER_SEGMENT..=range_end / RECORDS_PER_SEGMENT {
            let segment = self.segment_for_id(segment_id)?;
            known.extend(segment.addresses_in_range(range_start, range_end));
        }
        Ok(known)
    }

    // ---- tails and address spaces ---------------------------------------

    /// Highest address ever written, if any.
    pub fn log_tail(&self) -> Option<u64> {
        self.metadata.lock().global_tail()
    }

    /// Global tail plus the tails of the requested streams.
    pub fn get_tails(&self, streams: &[Uuid]) -> Tails {
        self.metadata.lock().tails(streams)
    }

    /// Global tail plus every known stream tail.
    pub fn get_all_tails(&self) -> Tails {
        self.metadata.lock().all_tails()
    }

    /// Snapshot of the global tail and the full per-stream address map.
    pub fn streams_address_space(&self) -> StreamsAddressSpaceView {
        self.metadata.lock().view()
    }

    /// Current trim mark: the smallest address that is not trimmed.
    pub fn trim_mark(&self) -> u64 {
        self.data_store.starting_address()
    }

    pub fn committed_tail(&self) -> Option<u64> {
        self.data_store.committed_tail()
    }

    /// Write-through update of the committed tail; regressions are ignored.
    pub fn update_committed_tail(&self, address: u64) -> Result<()> {
        self.data_store.update_committed_tail(address)
    }

    // ---- quota ----------------------------------------------------------

    /// Whether appends are currently refused for lack of quota.
    pub fn quota_exceeded(&self) -> bool {
        !self.quota.has_available()
    }

    pub fn quota_limit_in_bytes(&self) -> Option<u64> {
        self.quota.limit()
    }

    pub fn quota_used_bytes(&self) -> u64 {
        self.quota.used()
    }

    // ---- trim and compaction --------------------------------------------

    /// Mark every address at or below `address` as trimmed. Idempotent;
    /// repeated trims at or below the current mark are ignored. Segment
    /// files are reclaimed separately by [`compact`](Self::compact).
    pub fn prefix_trim(&self, address: u64) -> Result<()> {
        let _io = self.reset_lock.read();
        if self.is_trimmed(address) {
            warn!(address, "ignoring repeated prefix trim");
            return Ok(());
        }

        let new_starting_address = address
            .checked_add(1)
            .ok_or_else(|| Error::IllegalArgument("trim address overflows".to_string()))?;
        self.data_store.update_starting_address(new_starting_address)?;

        let mut md = self.metadata.lock();
        md.sync_tail_segment(address, false)?;
        md.prefix_trim(address);
        drop(md);

        StreamLogMetrics::set_trim_mark(new_starting_address);
        debug!(new_starting_address, "advanced trim mark");
        Ok(())
    }

    /// Delete segment files that lie entirely below the trim mark.
    pub fn compact(&self) -> Result<()> {
        let _maintenance = self.reset_lock.write();

        let starting_segment = self.data_store.starting_address() / RECORDS_PER_SEGMENT;
        if starting_segment == 0 {
            debug!("no complete segments below the trim mark");
            return Ok(());
        }
        let end_segment = starting_segment - 1;

        self.close_segments_up_to(end_segment);
        let (removed, freed) = self.delete_segment_files(|id| id <= end_segment)?;
        info!(end_segment, removed, freed, "compaction reclaimed trimmed segments");
        Ok(())
    }

    fn close_segments_up_to(&self, end_segment: u64) {
        let stale: Vec<u64> = self
            .open_segments
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| *id <= end_segment)
            .collect();
        for segment_id in stale {
            if let Some((_, segment)) = self.open_segments.remove(&segment_id) {
                segment.close();
            }
        }
        StreamLogMetrics::set_open_segments(self.open_segments.len());
    }

    /// Delete every segment file whose id matches `matches`, releasing the
    /// freed bytes from the quota. Files that do not parse as segment ids
    /// are ignored.
    fn delete_segment_files(&self, matches: impl Fn(u64) -> bool) -> Result<(usize, u64)> {
        let mut removed = 0;
        let mut freed = 0;

        for dir_entry in std::fs::read_dir(&self.log_dir)? {
            let path = dir_entry?.path();
            if !path.extension().is_some_and(|ext| ext == "log") {
                continue;
            }
            let segment_id = match path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                Some(id) => id,
                None => {
                    warn!(file = %path.display(), "ignoring non-segment file");
                    continue;
                }
            };
            if !matches(segment_id) {
                continue;
            }

            let bytes = std::fs::metadata(&path)?.len();
            std::fs::remove_file(&path)?;
            removed += 1;
            freed += bytes;
        }

        self.quota.release(freed);
        StreamLogMetrics::set_log_size_bytes(self.quota.used());
        Ok((removed, freed))
    }

    // ---- durability -----------------------------------------------------

    /// Fsync all dirty segments in segment order when `force` is set.
    /// Without `force` this is a no-op: appends batch in the OS cache until
    /// the caller decides to pay for durability.
    pub fn sync(&self, force: bool) -> Result<()> {
        if !force {
            return Ok(());
        }

        let mut dirty: Vec<Arc<Segment>> = self
            .open_segments
            .iter()
            .filter(|entry| entry.value().is_dirty())
            .map(|entry| entry.value().clone())
            .collect();
        dirty.sort_by_key(|segment| segment.id);

        for segment in dirty {
            let started = Instant::now();
            segment.flush()?;
            StreamLogMetrics::record_fsync_duration(started.elapsed());
            trace!(segment = segment.id, "synced segment");
        }
        Ok(())
    }

    /// Persist the per-stream address-space snapshot through the datastore.
    pub fn persist_log_metadata(&self) -> Result<()> {
        let md = self.metadata.lock();
        self.persist_metadata_locked(&md)
    }

    fn persist_metadata_locked(&self, md: &LogMetadata) -> Result<()> {
        let snapshot = md.build_snapshot()?;
        let streams = snapshot.len();
        self.data_store.set_log_unit_metadata(snapshot)?;
        debug!(streams, "persisted log metadata snapshot");
        Ok(())
    }

    // ---- reset ----------------------------------------------------------

    /// Erase all data at or after the committed tail's segment and rebuild
    /// the metadata index. Used to heal a recovering node holding
    /// uncommitted data ahead of the cluster's committed tail.
    ///
    /// The committed tail segment itself is deleted, so when the committed
    /// tail is not the last address of its segment, payloads in
    /// `[committed_tail_segment × N, committed_tail]` are dropped as well;
    /// their tails and address-space entries survive through the metadata
    /// snapshot persisted at the start of the reset.
    pub fn reset(&self) -> Result<()> {
        let _maintenance = self.reset_lock.write();
        let mut md = self.metadata.lock();
        warn!(global_tail = ?md.global_tail(), "resetting stream log");

        // Bring the advisory snapshot current so everything at or below the
        // committed tail is reloadable after the wipe.
        self.persist_metadata_locked(&md)?;

        let committed_tail = self.data_store.committed_tail();
        let global_tail = md.global_tail();

        let new_tail = if committed_tail < global_tail {
            let latest_segment =
                global_tail.expect("global tail exists above committed tail") / RECORDS_PER_SEGMENT;
            let committed_segment = committed_tail.map_or(0, |tail| tail / RECORDS_PER_SEGMENT);

            for segment_id in committed_segment..=latest_segment {
                if let Some((_, segment)) = self.open_segments.remove(&segment_id) {
                    debug!(path = %segment.path().display(), "closing segment for reset");
                    segment.close();
                }
                self.delete_segment_files(|id| id == segment_id)?;
            }

            if committed_segment > 0 {
                Some(committed_segment * RECORDS_PER_SEGMENT - 1)
            } else {
                None
            }
        } else {
            global_tail
        };

        *md = LogMetadata::new(self.data_store.clone());
        md.sync_tail_segment(new_tail.unwrap_or(0), true)?;
        self.recover(&mut md, committed_tail)?;

        // Replace the pre-wipe snapshot with the rebuilt state, so a later
        // restart does not resurrect addresses that were just erased.
        self.persist_metadata_locked(&md)?;

        info!(global_tail = ?md.global_tail(), "reset complete");
        Ok(())
    }

    // ---- recovery -------------------------------------------------------

    /// Rebuild the metadata index: load the persisted snapshot (clipped to
    /// `snapshot_max`, skipped entirely when `None`), then scan segments
    /// above the snapshot's highest tail in reverse.
    fn recover(&self, md: &mut LogMetadata, snapshot_max: Option<u64>) -> Result<()> {
        let starting_address = self.data_store.starting_address();
        let tail_segment = self.data_store.tail_segment();
        let mut starting_segment = starting_address / RECORDS_PER_SEGMENT;

        let highest_loaded = match (snapshot_max, self.data_store.log_unit_metadata()) {
            (Some(max_address), Some(snapshot)) => {
                md.load_snapshot(&snapshot, starting_address, max_address)
            }
            _ => None,
        };
        if let Some(tail) = highest_loaded {
            starting_segment = starting_segment.max(tail / RECORDS_PER_SEGMENT);
        }

        info!(
            from = starting_segment,
            to = tail_segment,
            highest_loaded = ?highest_loaded,
            "scanning segments to rebuild the address space"
        );

        for segment_id in (starting_segment..=tail_segment).rev() {
            // Trim or reset may have removed the file; opening would
            // recreate it empty.
            if !self.log_dir.join(format!("{segment_id}.log")).exists() {
                continue;
            }
            let segment = self.segment_for_id(segment_id)?;
            for address in segment.addresses().into_iter().rev() {
                if address < starting_address {
                    continue;
                }
                if highest_loaded.is_some_and(|tail| address <= tail) {
                    continue;
                }
                match segment.read(address) {
                    Ok(Some(entry)) => md.update(&entry),
                    Ok(None) => {}
                    Err(Error::DataCorruption { address }) => {
                        warn!(
                            segment = segment_id,
                            address, "corrupt record during recovery scan, stopping this segment"
                        );
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Recovery held temporary handles only.
        self.open_segments.clear();
        StreamLogMetrics::set_open_segments(0);
        Ok(())
    }

    // ---- shutdown -------------------------------------------------------

    /// Flush dirty segments, persist the metadata snapshot, and drop all
    /// segment handles.
    pub fn close(&self) -> Result<()> {
        let _maintenance = self.reset_lock.write();
        self.sync(true)?;
        {
            let md = self.metadata.lock();
            self.persist_metadata_locked(&md)?;
        }
        for entry in self.open_segments.iter() {
            entry.value().close();
        }
        self.open_segments.clear();
        StreamLogMetrics::set_open_segments(0);
        info!("closed stream log");
        Ok(())
    }
}

impl std::fmt::Debug for StreamLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLog")
            .field("log_dir", &self.log_dir)
            .field("open_segments", &self.open_segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> StreamLog {
        StreamLog::open(StreamLogConfig::new(dir.path())).unwrap()
    }

    fn data(address: u64, payload: &str) -> LogEntry {
        LogEntry::data(address, 0, [], Bytes::copy_from_slice(payload.as_bytes()))
    }

    #[test]
    fn test_append_then_read() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(0, "a")).unwrap();
        log.append(data(1, "b")).unwrap();

        assert_eq!(log.read(0).unwrap().unwrap().payload, Bytes::from("a"));
        assert_eq!(log.read(1).unwrap().unwrap().payload, Bytes::from("b"));
        assert_eq!(log.read(2).unwrap(), None);
        assert_eq!(log.log_tail(), Some(1));
    }

    #[test]
    fn test_overwrite_classification() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(42, "x")).unwrap();

        let err = log.append(data(42, "y")).unwrap_err();
        assert_eq!(err.overwrite_cause(), Some(OverwriteCause::DifferentData));

        let err = log.append(data(42, "x")).unwrap_err();
        assert_eq!(err.overwrite_cause(), Some(OverwriteCause::SameData));

        // The stored record is untouched.
        assert_eq!(log.read(42).unwrap().unwrap().payload, Bytes::from("x"));
    }

    #[test]
    fn test_hole_overwrite_signals_hole() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(LogEntry::hole(5, 0)).unwrap();
        let err = log.append(data(5, "later")).unwrap_err();
        assert_eq!(err.overwrite_cause(), Some(OverwriteCause::Hole));
    }

    #[test]
    fn test_rank_resolution() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(3, "winner").with_rank(10)).unwrap();

        let err = log.append(data(3, "equal").with_rank(10)).unwrap_err();
        assert_eq!(err.overwrite_cause(), Some(OverwriteCause::Rank));

        let err = log
            .append(LogEntry::hole(3, 0).with_rank(4))
            .unwrap_err();
        assert!(matches!(err, Error::DataOutranked));
    }

    #[test]
    fn test_trimmed_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(100, "kept")).unwrap();
        log.prefix_trim(99).unwrap();

        assert!(log.read(99).unwrap().unwrap().is_trimmed());
        assert_eq!(log.read(100).unwrap().unwrap().payload, Bytes::from("kept"));

        let err = log.append(data(50, "below")).unwrap_err();
        assert_eq!(err.overwrite_cause(), Some(OverwriteCause::Trimmed));

        // Repeated trim is a no-op.
        log.prefix_trim(99).unwrap();
        assert_eq!(log.trim_mark(), 100);
    }

    #[test]
    fn test_trim_at_unwritten_address_advances_mark() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.prefix_trim(12_345).unwrap();
        assert_eq!(log.trim_mark(), 12_346);
        assert!(log.read(12_000).unwrap().unwrap().is_trimmed());
    }

    #[test]
    fn test_contains_committed_tail_shortcut() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(10, "x")).unwrap();
        assert!(log.contains(10).unwrap());
        assert!(!log.contains(11).unwrap());

        // Below the committed tail, presence is implied without an index
        // lookup, even for addresses never written locally.
        log.update_committed_tail(20).unwrap();
        assert!(log.contains(11).unwrap());

        log.prefix_trim(5).unwrap();
        assert!(matches!(log.contains(3), Err(Error::Trimmed)));
    }

    #[test]
    fn test_segment_boundary_writes() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(9_999, "end of segment 0")).unwrap();
        log.append(data(10_000, "start of segment 1")).unwrap();

        assert!(dir.path().join("log").join("0.log").exists());
        assert!(dir.path().join("log").join("1.log").exists());
        assert_eq!(
            log.known_addresses_in_range(9_998, 10_001)
                .unwrap()
                .into_iter()
                .collect::<Vec<_>>(),
            vec![9_999, 10_000]
        );
    }

    #[test]
    fn test_range_append_validation() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        assert!(matches!(
            log.append_range(vec![]),
            Err(Error::IllegalArgument(_))
        ));

        let gap = vec![data(1, "a"), data(3, "b")];
        assert!(matches!(
            log.append_range(gap),
            Err(Error::IllegalArgument(_))
        ));

        let unsorted = vec![data(2, "a"), data(1, "b")];
        assert!(matches!(
            log.append_range(unsorted),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_range_append_across_two_segments() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        let range: Vec<LogEntry> = (9_998..=10_001).map(|a| data(a, "r")).collect();
        log.append_range(range).unwrap();

        for address in 9_998..=10_001 {
            assert!(log.read(address).unwrap().is_some());
        }
        assert_eq!(log.log_tail(), Some(10_001));
    }

    #[test]
    fn test_range_append_three_segments_rejected() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        // 9_999 .. 20_001 touches segments 0, 1 and 2.
        let range: Vec<LogEntry> = (9_999..=20_001).map(|a| data(a, "r")).collect();
        assert!(matches!(
            log.append_range(range),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_range_append_rejects_overlap() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(2, "existing")).unwrap();
        let range = vec![data(1, "a"), data(2, "b"), data(3, "c")];
        let err = log.append_range(range).unwrap_err();
        assert_eq!(err.overwrite_cause(), Some(OverwriteCause::SameData));
        assert_eq!(log.read(1).unwrap(), None);
    }

    #[test]
    fn test_range_append_prunes_trimmed_prefix() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.prefix_trim(1).unwrap();
        log.append_range(vec![data(0, "a"), data(1, "b"), data(2, "c")])
            .unwrap();

        assert!(log.read(0).unwrap().unwrap().is_trimmed());
        assert_eq!(log.read(2).unwrap().unwrap().payload, Bytes::from("c"));
    }

    #[test]
    fn test_stream_tails_and_address_space() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let stream = Uuid::from_u128(77);

        for address in (0u64..10).step_by(2) {
            log.append(LogEntry::data(address, 0, [stream], Bytes::from("e")))
                .unwrap();
        }

        let view = log.streams_address_space();
        assert_eq!(view.global_tail, Some(8));
        assert_eq!(
            view.address_spaces[&stream].iter().collect::<Vec<_>>(),
            vec![0, 2, 4, 6, 8]
        );

        let tails = log.get_tails(&[stream]);
        assert_eq!(tails.stream_tails[&stream], 8);
        assert_eq!(log.get_all_tails().stream_tails.len(), 1);
    }

    #[test]
    fn test_quota_refuses_appends_until_freed() {
        let dir = TempDir::new().unwrap();
        let config = StreamLogConfig::new(dir.path()).with_log_size_limit(256);
        let log = StreamLog::open(config).unwrap();

        let mut address = 0;
        while !log.quota_exceeded() {
            log.append(data(address, "some payload bytes")).unwrap();
            address += 1;
        }
        assert!(matches!(
            log.append(data(address, "over")),
            Err(Error::QuotaExceeded)
        ));
        assert_eq!(log.quota_limit_in_bytes(), Some(256));
    }

    #[test]
    fn test_compact_reclaims_whole_segments() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(5, "old")).unwrap();
        log.append(data(10_005, "new")).unwrap();
        log.sync(true).unwrap();
        let used_before = log.quota_used_bytes();

        log.prefix_trim(10_000).unwrap();
        log.compact().unwrap();

        assert!(!dir.path().join("log").join("0.log").exists());
        assert!(dir.path().join("log").join("1.log").exists());
        assert!(log.quota_used_bytes() < used_before);
        assert_eq!(
            log.read(10_005).unwrap().unwrap().payload,
            Bytes::from("new")
        );
    }

    #[test]
    fn test_compact_without_complete_trimmed_segment_is_noop() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(5, "kept")).unwrap();
        log.prefix_trim(3).unwrap();
        log.compact().unwrap();
        assert!(dir.path().join("log").join("0.log").exists());
    }

    #[test]
    fn test_non_segment_files_ignored() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.append(data(10_001, "x")).unwrap();
        std::fs::write(dir.path().join("log").join("notes.log"), b"keep me").unwrap();

        log.prefix_trim(10_000).unwrap();
        log.compact().unwrap();
        assert!(dir.path().join("log").join("notes.log").exists());
    }

    #[test]
    fn test_reset_rewinds_to_committed_tail() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let stream = Uuid::from_u128(9);

        for address in [4_999u64, 5_000] {
            log.append(LogEntry::data(address, 0, [stream], Bytes::from("v")))
                .unwrap();
        }
        log.sync(true).unwrap();
        log.update_committed_tail(4_999).unwrap();

        log.reset().unwrap();

        // The segment holding 5000 (segment 0) is gone from disk; the
        // tails rewind to the committed tail via the snapshot.
        assert!(!dir.path().join("log").join("0.log").exists());
        assert_eq!(log.log_tail(), Some(4_999));
        assert_eq!(log.read(5_000).unwrap(), None);

        // The address is writable again.
        log.append(data(5_000, "other")).unwrap();
        assert_eq!(
            log.read(5_000).unwrap().unwrap().payload,
            Bytes::from("other")
        );
    }

    #[test]
    fn test_reset_with_nothing_uncommitted_keeps_data() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.append(data(7, "committed")).unwrap();
        log.sync(true).unwrap();
        log.update_committed_tail(7).unwrap();

        log.reset().unwrap();
        assert_eq!(log.log_tail(), Some(7));
        assert_eq!(
            log.read(7).unwrap().unwrap().payload,
            Bytes::from("committed")
        );
    }

    #[test]
    fn test_close_persists_metadata() {
        let dir = TempDir::new().unwrap();
        let stream = Uuid::from_u128(3);
        {
            let log = open_log(&dir);
            log.append(LogEntry::data(1, 0, [stream], Bytes::from("x")))
                .unwrap();
            log.close().unwrap();
        }

        let log = open_log(&dir);
        assert_eq!(log.get_all_tails().stream_tails[&stream], 1);
    }
}
