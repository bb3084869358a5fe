//! Durable key-value store for log-unit bookkeeping.
//!
//! The engine persists a handful of small values through this abstraction:
//! the trim mark (starting address), the tail segment, the committed tail,
//! and the serialized per-stream address-space map. Updates are
//! write-through; an implementation must not acknowledge an update before it
//! is durable, otherwise a completed `prefix_trim` can be lost on crash.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// Key-value persistence consumed by the stream log.
pub trait DataStore: Send + Sync {
    /// Trim mark: all addresses strictly below it are trimmed. Defaults to 0.
    fn starting_address(&self) -> u64;

    fn update_starting_address(&self, address: u64) -> Result<()>;

    /// Highest segment id ever opened for write. Defaults to 0.
    fn tail_segment(&self) -> u64;

    fn update_tail_segment(&self, segment: u64) -> Result<()>;

    /// Highest address the cluster considers durably replicated, if any.
    fn committed_tail(&self) -> Option<u64>;

    /// Monotone update of the committed tail; regressions are ignored.
    fn update_committed_tail(&self, address: u64) -> Result<()>;

    /// Serialized per-stream address spaces, keyed by stream id.
    fn log_unit_metadata(&self) -> Option<HashMap<Uuid, String>>;

    fn set_log_unit_metadata(&self, metadata: HashMap<Uuid, String>) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DataStoreState {
    starting_address: u64,
    tail_segment: u64,
    committed_tail: Option<u64>,
    log_unit_metadata: Option<HashMap<Uuid, String>>,
}

/// File-backed [`DataStore`]: one JSON file rewritten on every update via
/// temp file, fsync, atomic rename, and parent-directory fsync.
#[derive(Debug)]
pub struct FileDataStore {
    path: PathBuf,
    state: Mutex<DataStoreState>,
}

impl FileDataStore {
    /// Open the store at `path`, loading existing state if present.
    ///
    /// An unreadable or unparseable file is treated as absent with a
    /// warning; the snapshot it feeds is advisory and recovery rebuilds the
    /// rest from segment files.
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<DataStoreState>(&content) {
                    Ok(loaded) => {
                        debug!(path = %path.display(), "loaded datastore state");
                        loaded
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to parse datastore file, starting empty");
                        DataStoreState::default()
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read datastore file, starting empty");
                    DataStoreState::default()
                }
            }
        } else {
            DataStoreState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Apply `mutate` to the in-memory state and persist the result before
    /// returning.
    fn update<F: FnOnce(&mut DataStoreState)>(&self, mutate: F) -> Result<()> {
        let mut state = self.state.lock();
        mutate(&mut state);
        self.persist(&state)
    }

    fn persist(&self, state: &DataStoreState) -> Result<()> {
        let json = serde_json::to_string(state)
            .map_err(|e| Error::LogUnit(format!("datastore serialization failed: {e}")))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json.as_bytes())?;
        File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }
}

/// In-memory [`DataStore`] for tests and embedding.
///
/// Nothing survives drop: a trim acknowledged through this store is lost on
/// restart, which is exactly the crash window the file-backed store closes.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    state: Mutex<DataStoreState>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn starting_address(&self) -> u64 {
        self.state.lock().starting_address
    }

    fn update_starting_address(&self, address: u64) -> Result<()> {
        self.state.lock().starting_address = address;
        Ok(())
    }

    fn tail_segment(&self) -> u64 {
        self.state.lock().tail_segment
    }

    fn update_tail_segment(&self, segment: u64) -> Result<()> {
        self.state.lock().tail_segment = segment;
        Ok(())
    }

    fn committed_tail(&self) -> Option<u64> {
        self.state.lock().committed_tail
    }

    fn update_committed_tail(&self, address: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.committed_tail.is_none_or(|current| address > current) {
            state.committed_tail = Some(address);
        }
        Ok(())
    }

    fn log_unit_metadata(&self) -> Option<HashMap<Uuid, String>> {
        self.state.lock().log_unit_metadata.clone()
    }

    fn set_log_unit_metadata(&self, metadata: HashMap<Uuid, String>) -> Result<()> {
        self.state.lock().log_unit_metadata = Some(metadata);
        Ok(())
    }
}

impl DataStore for FileDataStore {
    fn starting_address(&self) -> u64 {
        self.state.lock().starting_address
    }

    fn update_starting_address(&self, address: u64) -> Result<()> {
        self.update(|s| s.starting_address = address)
    }

    fn tail_segment(&self) -> u64 {
        self.state.lock().tail_segment
    }

    fn update_tail_segment(&self, segment: u64) -> Result<()> {
        self.update(|s| s.tail_segment = segment)
    }

    fn committed_tail(&self) -> Option<u64> {
        self.state.lock().committed_tail
    }

    fn update_committed_tail(&self, address: u64) -> Result<()> {
        self.update(|s| {
            if s.committed_tail.is_none_or(|current| address > current) {
                s.committed_tail = Some(address);
            }
        })
    }

    fn log_unit_metadata(&self) -> Option<HashMap<Uuid, String>> {
        self.state.lock().log_unit_metadata.clone()
    }

    fn set_log_unit_metadata(&self, metadata: HashMap<Uuid, String>) -> Result<()> {
        self.update(|s| s.log_unit_metadata = Some(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> FileDataStore {
        FileDataStore::open(dir.path().join("log_metadata")).unwrap()
    }

    #[test]
    fn test_defaults_when_absent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert_eq!(store.starting_address(), 0);
        assert_eq!(store.tail_segment(), 0);
        assert_eq!(store.committed_tail(), None);
        assert!(store.log_unit_metadata().is_none());
    }

    #[test]
    fn test_updates_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.update_starting_address(500).unwrap();
            store.update_tail_segment(3).unwrap();
            store.update_committed_tail(4999).unwrap();
            store
                .set_log_unit_metadata(HashMap::from([(Uuid::from_u128(1), "blob".to_string())]))
                .unwrap();
        }

        let store = open_store(&dir);
        assert_eq!(store.starting_address(), 500);
        assert_eq!(store.tail_segment(), 3);
        assert_eq!(store.committed_tail(), Some(4999));
        assert_eq!(
            store.log_unit_metadata().unwrap()[&Uuid::from_u128(1)],
            "blob"
        );
    }

    #[test]
    fn test_committed_tail_is_monotone() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.update_committed_tail(100).unwrap();
        store.update_committed_tail(50).unwrap();
        assert_eq!(store.committed_tail(), Some(100));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log_metadata");
        std::fs::write(&path, b"not json").unwrap();
        let store = FileDataStore::open(path).unwrap();
        assert_eq!(store.starting_address(), 0);
    }

    #[test]
    fn test_in_memory_store_roundtrip() {
        let store = InMemoryDataStore::new();
        store.update_starting_address(9).unwrap();
        store.update_tail_segment(2).unwrap();
        store.update_committed_tail(88).unwrap();
        store.update_committed_tail(7).unwrap();

        assert_eq!(store.starting_address(), 9);
        assert_eq!(store.tail_segment(), 2);
        assert_eq!(store.committed_tail(), Some(88));
    }
}
