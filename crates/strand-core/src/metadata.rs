//! In-memory log metadata: tails and per-stream address spaces.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::address_space::StreamAddressSpace;
use crate::config::RECORDS_PER_SEGMENT;
use crate::datastore::DataStore;
use crate::entry::LogEntry;
use crate::Result;

/// Global and per-stream tails, as returned by tail queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tails {
    /// Highest address ever written, `None` if the log is empty.
    pub global_tail: Option<u64>,
    pub stream_tails: HashMap<Uuid, u64>,
}

/// Point-in-time snapshot of the full per-stream address map.
#[derive(Debug, Clone)]
pub struct StreamsAddressSpaceView {
    pub global_tail: Option<u64>,
    pub address_spaces: HashMap<Uuid, StreamAddressSpace>,
}

/// Mutable metadata index for one log unit.
///
/// Updated on every successful append; the tail segment is written through
/// to the datastore so restart knows how far to scan.
pub struct LogMetadata {
    data_store: Arc<dyn DataStore>,
    global_tail: Option<u64>,
    stream_tails: HashMap<Uuid, u64>,
    stream_address_spaces: HashMap<Uuid, StreamAddressSpace>,
}

impl LogMetadata {
    pub fn new(data_store: Arc<dyn DataStore>) -> Self {
        Self {
            data_store,
            global_tail: None,
            stream_tails: HashMap::new(),
            stream_address_spaces: HashMap::new(),
        }
    }

    pub fn global_tail(&self) -> Option<u64> {
        self.global_tail
    }

    pub fn stream_tails(&self) -> &HashMap<Uuid, u64> {
        &self.stream_tails
    }

    pub fn address_spaces(&self) -> &HashMap<Uuid, StreamAddressSpace> {
        &self.stream_address_spaces
    }

    /// Fold one appended entry into the index.
    pub fn update(&mut self, entry: &LogEntry) {
        let address = entry.global_address;
        for stream_id in &entry.stream_ids {
            let tail = self.stream_tails.entry(*stream_id).or_insert(address);
            *tail = (*tail).max(address);
            self.stream_address_spaces
                .entry(*stream_id)
                .or_default()
                .add(address);
        }
        self.update_global_tail(address);
    }

    /// Fold a batch of appended entries into the index.
    pub fn update_all<'a>(&mut self, entries: impl IntoIterator<Item = &'a LogEntry>) {
        for entry in entries {
            self.update(entry);
        }
    }

    pub fn update_global_tail(&mut self, address: u64) {
        if self.global_tail.is_none_or(|tail| address > tail) {
            self.global_tail = Some(address);
        }
    }

    /// Advance the persisted tail segment to cover `address`; with `force`
    /// the tail segment may regress (reset path).
    pub fn sync_tail_segment(&self, address: u64, force: bool) -> Result<()> {
        let segment = address / RECORDS_PER_SEGMENT;
        if force || segment > self.data_store.tail_segment() {
            self.data_store.update_tail_segment(segment)?;
        }
        Ok(())
    }

    /// Drop all addresses at or below `address` from every stream's address
    /// space. Stream tails are high-water marks and are not regressed.
    pub fn prefix_trim(&mut self, address: u64) {
        for space in self.stream_address_spaces.values_mut() {
            space.trim_prefix(address);
        }
    }

    pub fn tails(&self, streams: &[Uuid]) -> Tails {
        let stream_tails = streams
            .iter()
            .filter_map(|id| self.stream_tails.get(id).map(|tail| (*id, *tail)))
            .collect();
        Tails {
            global_tail: self.global_tail,
            stream_tails,
        }
    }

    pub fn all_tails(&self) -> Tails {
        Tails {
            global_tail: self.global_tail,
            stream_tails: self.stream_tails.clone(),
        }
    }

    pub fn view(&self) -> StreamsAddressSpaceView {
        StreamsAddressSpaceView {
            global_tail: self.global_tail,
            address_spaces: self.stream_address_spaces.clone(),
        }
    }

    /// Serialize every non-empty address space to the base64 map persisted
    /// through the datastore.
    pub fn build_snapshot(&self) -> Result<HashMap<Uuid, String>> {
        let mut snapshot = HashMap::new();
        for (stream_id, space) in &self.stream_address_spaces {
            if space.is_empty() {
                continue;
            }
            snapshot.insert(*stream_id, STANDARD.encode(space.serialize()?));
        }
        Ok(snapshot)
    }

    /// Load a persisted snapshot, keeping only addresses in
    /// `[starting_address, max_address]`.
    ///
    /// Undecodable entries are skipped with a warning; the snapshot is
    /// advisory and the segment scan rebuilds whatever it misses. Returns
    /// the highest stream tail loaded, if any.
    pub fn load_snapshot(
        &mut self,
        snapshot: &HashMap<Uuid, String>,
        starting_address: u64,
        max_address: u64,
    ) -> Option<u64> {
        for (stream_id, blob) in snapshot {
            let space = match STANDARD
                .decode(blob)
                .ok()
                .and_then(|bytes| StreamAddressSpace::deserialize(&bytes).ok())
            {
                Some(space) => space,
                None => {
                    warn!(stream = %stream_id, "skipping undecodable address space in snapshot");
                    continue;
                }
            };

            let valid = space.addresses_in_range(starting_address, max_address);
            if let Some(tail) = valid.tail() {
                self.stream_tails.insert(*stream_id, tail);
                self.stream_address_spaces.insert(*stream_id, valid);
            }
        }

        let highest = self.stream_tails.values().copied().max();
        if let Some(tail) = highest {
            self.update_global_tail(tail);
        }
        highest
    }
}

impl std::fmt::Debug for LogMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMetadata")
            .field("global_tail", &self.global_tail)
            .field("streams", &self.stream_tails.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::FileDataStore;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn metadata(dir: &TempDir) -> (LogMetadata, Arc<FileDataStore>) {
        let store = Arc::new(FileDataStore::open(dir.path().join("log_metadata")).unwrap());
        (LogMetadata::new(store.clone()), store)
    }

    #[test]
    fn test_update_tracks_tails_and_spaces() {
        let dir = TempDir::new().unwrap();
        let (mut md, _) = metadata(&dir);
        let s = Uuid::from_u128(7);

        md.update(&LogEntry::data(10, 0, [s], Bytes::from("a")));
        md.update(&LogEntry::data(4, 0, [s], Bytes::from("b")));

        assert_eq!(md.global_tail(), Some(10));
        assert_eq!(md.stream_tails()[&s], 10);
        assert!(md.address_spaces()[&s].contains(4));
        assert!(md.address_spaces()[&s].contains(10));
    }

    #[test]
    fn test_stream_tail_equals_space_max() {
        let dir = TempDir::new().unwrap();
        let (mut md, _) = metadata(&dir);
        let s = Uuid::from_u128(1);
        for address in [0u64, 2, 4, 6, 8] {
            md.update(&LogEntry::data(address, 0, [s], Bytes::from("e")));
        }
        assert_eq!(md.stream_tails()[&s], md.address_spaces()[&s].tail().unwrap());
    }

    #[test]
    fn test_hole_updates_global_tail_only() {
        let dir = TempDir::new().unwrap();
        let (mut md, _) = metadata(&dir);
        md.update(&LogEntry::hole(99, 0));
        assert_eq!(md.global_tail(), Some(99));
        assert!(md.stream_tails().is_empty());
    }

    #[test]
    fn test_sync_tail_segment_monotone_and_forced() {
        let dir = TempDir::new().unwrap();
        let (md, store) = metadata(&dir);

        md.sync_tail_segment(25_000, false).unwrap();
        assert_eq!(store.tail_segment(), 2);

        // Regression ignored without force
        md.sync_tail_segment(5, false).unwrap();
        assert_eq!(store.tail_segment(), 2);

        md.sync_tail_segment(5, true).unwrap();
        assert_eq!(store.tail_segment(), 0);
    }

    #[test]
    fn test_prefix_trim_drops_addresses_keeps_tails() {
        let dir = TempDir::new().unwrap();
        let (mut md, _) = metadata(&dir);
        let s = Uuid::from_u128(2);
        for address in [1u64, 5, 9] {
            md.update(&LogEntry::data(address, 0, [s], Bytes::from("x")));
        }

        md.prefix_trim(5);
        assert_eq!(md.address_spaces()[&s].iter().collect::<Vec<_>>(), vec![9]);
        assert_eq!(md.stream_tails()[&s], 9);
    }

    #[test]
    fn test_snapshot_roundtrip_with_clipping() {
        let dir = TempDir::new().unwrap();
        let (mut md, store) = metadata(&dir);
        let s = Uuid::from_u128(3);
        for address in [10u64, 20, 30, 40] {
            md.update(&LogEntry::data(address, 0, [s], Bytes::from("x")));
        }

        let snapshot = md.build_snapshot().unwrap();
        let mut restored = LogMetadata::new(store);
        let highest = restored.load_snapshot(&snapshot, 15, 35);

        assert_eq!(highest, Some(30));
        assert_eq!(restored.global_tail(), Some(30));
        assert_eq!(
            restored.address_spaces()[&s].iter().collect::<Vec<_>>(),
            vec![20, 30]
        );
    }

    #[test]
    fn test_snapshot_skips_corrupt_blobs() {
        let dir = TempDir::new().unwrap();
        let (mut md, _) = metadata(&dir);
        let snapshot = HashMap::from([(Uuid::from_u128(9), "!!not-base64!!".to_string())]);
        assert_eq!(md.load_snapshot(&snapshot, 0, u64::MAX), None);
        assert!(md.address_spaces().is_empty());
    }

    #[test]
    fn test_tails_filters_requested_streams() {
        let dir = TempDir::new().unwrap();
        let (mut md, _) = metadata(&dir);
        let s1 = Uuid::from_u128(1);
        let s2 = Uuid::from_u128(2);
        md.update(&LogEntry::data(5, 0, [s1], Bytes::from("x")));
        md.update(&LogEntry::data(6, 0, [s2], Bytes::from("y")));

        let tails = md.tails(&[s1, Uuid::from_u128(42)]);
        assert_eq!(tails.global_tail, Some(6));
        assert_eq!(tails.stream_tails.len(), 1);
        assert_eq!(tails.stream_tails[&s1], 5);

        let all = md.all_tails();
        assert_eq!(all.stream_tails.len(), 2);
    }
}
