//! Segment files: the on-disk unit of the stream log.
//!
//! A segment covers `RECORDS_PER_SEGMENT` consecutive global addresses and
//! is stored as one append-only file named `<segment_id>.log`. The file
//! starts with a fixed header and is followed by length-prefixed,
//! checksummed record blocks:
//!
//! ```text
//! header:  [magic: u16 = 0xC0F1][version: u16][segment_id: u64]
//! record:  [record_length: u32][record body][checksum: u32]
//! ```
//!
//! All integers are little-endian. The checksum is CRC32 over the length
//! prefix and the body, and is verified on every read. The in-memory index
//! (address → file offset) is the sole authority for which addresses the
//! segment contains; file order is not. On open, the file is scanned
//! sequentially to rebuild the index; the scan checks record structure only
//! and stops at the first truncated or unparseable record, whose offset
//! becomes the write watermark, so trailing residue from an interrupted
//! write is overwritten by the next append. A record whose bytes rotted in
//! place keeps its index slot and surfaces as `DataCorruption` when read.
//!
//! Appends reach the OS page cache only; durability requires
//! [`Segment::flush`], which the engine drives through `sync(force)`.

use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::ops::Deref;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RECORDS_PER_SEGMENT;
use crate::entry::LogEntry;
use crate::quota::ResourceQuota;
use crate::{Error, Result};

pub(crate) const SEGMENT_MAGIC: u16 = 0xC0F1;
pub(crate) const SEGMENT_VERSION: u16 = 1;
pub(crate) const HEADER_SIZE: u64 = 12;

const LENGTH_PREFIX_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;

/// One open segment file.
pub(crate) struct Segment {
    pub(crate) id: u64,
    path: PathBuf,
    file: std::fs::File,
    /// Address → offset of the record's length prefix. Authoritative for
    /// membership.
    index: RwLock<BTreeMap<u64, u64>>,
    /// Write watermark; the lock serializes appends to the file.
    write_pos: Mutex<u64>,
    dirty: AtomicBool,
    ref_count: AtomicU64,
    quota: Arc<ResourceQuota>,
    sync_data_only: bool,
}

impl Segment {
    /// Open (creating if absent) the segment file for `id`, rebuilding the
    /// record index from disk.
    pub(crate) fn open(
        id: u64,
        log_dir: &Path,
        quota: Arc<ResourceQuota>,
        sync_data_only: bool,
    ) -> Result<Self> {
        let path = log_dir.join(format!("{id}.log"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let segment = Self {
            id,
            path,
            file,
            index: RwLock::new(BTreeMap::new()),
            write_pos: Mutex::new(HEADER_SIZE),
            dirty: AtomicBool::new(false),
            ref_count: AtomicU64::new(0),
            quota,
            sync_data_only,
        };

        if file_len < HEADER_SIZE {
            // Fresh file, or a header torn by a crash during creation.
            let mut header = BytesMut::with_capacity(HEADER_SIZE as usize);
            header.put_u16_le(SEGMENT_MAGIC);
            header.put_u16_le(SEGMENT_VERSION);
            header.put_u64_le(id);
            segment.file.write_all_at(&header, 0)?;
            segment.quota.acquire(HEADER_SIZE - file_len);
            segment.dirty.store(true, Ordering::Release);
        } else {
            segment.validate_header()?;
            segment.scan(file_len)?;
        }

        Ok(segment)
    }

    fn validate_header(&self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        self.file.read_exact_at(&mut header, 0)?;

        let magic = u16::from_le_bytes([header[0], header[1]]);
        let version = u16::from_le_bytes([header[2], header[3]]);
        let id = u64::from_le_bytes(header[4..12].try_into().expect("8-byte slice"));

        if magic != SEGMENT_MAGIC {
            return Err(Error::LogUnit(format!(
                "segment file {} has bad magic {magic:#06x}",
                self.path.display()
            )));
        }
        if version != SEGMENT_VERSION {
            return Err(Error::LogUnit(format!(
                "segment file {} has unsupported format version {version}",
                self.path.display()
            )));
        }
        if id != self.id {
            return Err(Error::LogUnit(format!(
                "segment file {} claims id {id}, expected {}",
                self.path.display(),
                self.id
            )));
        }
        Ok(())
    }

    /// Minimum record length: fixed body fields, stream count, payload
    /// length, trailing checksum.
    const MIN_RECORD_LEN: u64 = 18 + 2 + 4 + CHECKSUM_SIZE as u64;

    /// Walk record blocks from the header to the end of valid data,
    /// rebuilding the index.
    ///
    /// Only record structure is checked here: a truncated or unparseable
    /// record stops the scan and leaves the watermark at its offset, so
    /// residue from a torn write is overwritten by the next append.
    /// Checksums are not verified here: a record that rotted in place must
    /// stay addressable so reads can report the corruption instead of
    /// silently returning "never written".
    fn scan(&self, file_len: u64) -> Result<()> {
        let mut pos = HEADER_SIZE;
        let mut index = self.index.write();

        loop {
            let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
            if pos + LENGTH_PREFIX_SIZE as u64 > file_len
                || self.file.read_exact_at(&mut len_bytes, pos).is_err()
            {
                break;
            }
            let record_len = u32::from_le_bytes(len_bytes) as u64;
            if record_len < Self::MIN_RECORD_LEN
                || pos + LENGTH_PREFIX_SIZE as u64 + record_len > file_len
            {
                warn!(
                    segment = self.id,
                    offset = pos,
                    "truncated record during segment scan, discarding residue"
                );
                break;
            }

            let mut address_bytes = [0u8; 8];
            if self
                .file
                .read_exact_at(&mut address_bytes, pos + LENGTH_PREFIX_SIZE as u64)
                .is_err()
            {
                break;
            }
            let address = u64::from_le_bytes(address_bytes);
            if !self.covers(address) {
                warn!(
                    segment = self.id,
                    address,
                    offset = pos,
                    "record address outside segment during scan, discarding residue"
                );
                break;
            }

            index.insert(address, pos);
            pos += LENGTH_PREFIX_SIZE as u64 + record_len;
        }

        *self.write_pos.lock() = pos;
        debug!(segment = self.id, records = index.len(), watermark = pos, "scanned segment");
        Ok(())
    }

    /// First global address covered by this segment.
    pub(crate) fn first_address(&self) -> u64 {
        self.id * RECORDS_PER_SEGMENT
    }

    /// Last global address covered by this segment.
    pub(crate) fn last_address(&self) -> u64 {
        (self.id + 1) * RECORDS_PER_SEGMENT - 1
    }

    fn covers(&self, address: u64) -> bool {
        address / RECORDS_PER_SEGMENT == self.id
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn contains(&self, address: u64) -> bool {
        self.index.read().contains_key(&address)
    }

    /// Indexed addresses within `[lo, hi]`, ascending.
    pub(crate) fn addresses_in_range(&self, lo: u64, hi: u64) -> Vec<u64> {
        self.index.read().range(lo..=hi).map(|(addr, _)| *addr).collect()
    }

    /// All indexed addresses, ascending.
    pub(crate) fn addresses(&self) -> Vec<u64> {
        self.index.read().keys().copied().collect()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Frame a record block: length prefix, body, trailing CRC.
    fn frame(entry: &LogEntry) -> Result<BytesMut> {
        let body = entry.record_body()?;
        let record_len = (body.len() + CHECKSUM_SIZE) as u32;

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len() + CHECKSUM_SIZE);
        frame.put_u32_le(record_len);
        frame.extend_from_slice(&body);

        let mut hasher = Hasher::new();
        hasher.update(&frame);
        let crc = hasher.finalize();
        frame.put_u32_le(crc);
        Ok(frame)
    }

    /// Append one entry. Returns the number of bytes written, or `None`
    /// when the address is already present (the caller classifies the
    /// overwrite). The record reaches the OS cache only; call
    /// [`flush`](Self::flush) for durability.
    pub(crate) fn write(&self, entry: &LogEntry) -> Result<Option<u64>> {
        self.check_covers(entry.global_address)?;
        let frame = Self::frame(entry)?;

        let mut pos = self.write_pos.lock();
        if self.index.read().contains_key(&entry.global_address) {
            return Ok(None);
        }

        self.file.write_all_at(&frame, *pos)?;
        self.index.write().insert(entry.global_address, *pos);
        *pos += frame.len() as u64;
        self.dirty.store(true, Ordering::Release);
        self.quota.acquire(frame.len() as u64);
        Ok(Some(frame.len() as u64))
    }

    /// Append a batch of entries with a single positioned write, so the
    /// batch lands in the file atomically with respect to other writers.
    /// Returns `None` when any address is already present; in that case
    /// nothing is written.
    pub(crate) fn write_batch(&self, entries: &[LogEntry]) -> Result<Option<u64>> {
        for entry in entries {
            self.check_covers(entry.global_address)?;
        }

        let mut pos = self.write_pos.lock();
        {
            let index = self.index.read();
            if entries.iter().any(|e| index.contains_key(&e.global_address)) {
                return Ok(None);
            }
        }

        let mut batch = BytesMut::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            offsets.push((entry.global_address, *pos + batch.len() as u64));
            batch.extend_from_slice(&Self::frame(entry)?);
        }

        self.file.write_all_at(&batch, *pos)?;
        let mut index = self.index.write();
        for (address, offset) in offsets {
            index.insert(address, offset);
        }
        *pos += batch.len() as u64;
        self.dirty.store(true, Ordering::Release);
        self.quota.acquire(batch.len() as u64);
        Ok(Some(batch.len() as u64))
    }

    /// Read the entry at `address`, verifying its checksum.
    pub(crate) fn read(&self, address: u64) -> Result<Option<LogEntry>> {
        let offset = match self.index.read().get(&address) {
            Some(offset) => *offset,
            None => return Ok(None),
        };
        self.read_record_at(offset, address).map(Some)
    }

    fn read_record_at(&self, offset: u64, address: u64) -> Result<LogEntry> {
        let corrupt = || Error::DataCorruption { address };
        let map_io = |e: std::io::Error| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::DataCorruption { address }
            } else {
                Error::from(e)
            }
        };

        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        self.file.read_exact_at(&mut len_bytes, offset).map_err(map_io)?;
        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len < CHECKSUM_SIZE {
            return Err(corrupt());
        }

        let mut block = vec![0u8; record_len];
        self.file
            .read_exact_at(&mut block, offset + LENGTH_PREFIX_SIZE as u64)
            .map_err(map_io)?;

        let (body, crc_bytes) = block.split_at(record_len - CHECKSUM_SIZE);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("4-byte slice"));
        let mut hasher = Hasher::new();
        hasher.update(&len_bytes);
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(corrupt());
        }

        let entry = LogEntry::from_record_body(body).map_err(|_| corrupt())?;
        if entry.global_address != address {
            return Err(corrupt());
        }
        Ok(entry)
    }

    /// Fsync the segment file. Clears the dirty flag before syncing so a
    /// concurrent append re-marks the segment for the next flush.
    pub(crate) fn flush(&self) -> Result<()> {
        self.dirty.store(false, Ordering::Release);
        if self.sync_data_only {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    pub(crate) fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Mark the segment closed. The engine only calls this once no handle
    /// is outstanding; the maintenance write lock guarantees that.
    pub(crate) fn close(&self) {
        let refs = self.ref_count();
        if refs != 0 {
            warn!(segment = self.id, refs, "closing segment with outstanding handles");
        }
    }

    fn check_covers(&self, address: u64) -> Result<()> {
        if !self.covers(address) {
            return Err(Error::IllegalArgument(format!(
                "address {address} outside segment {} ({}..={})",
                self.id,
                self.first_address(),
                self.last_address()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("records", &self.index.read().len())
            .finish()
    }
}

/// Scope-bound segment acquisition: retains on creation, releases on drop.
pub(crate) struct SegmentHandle {
    segment: Arc<Segment>,
}

impl SegmentHandle {
    pub(crate) fn new(segment: Arc<Segment>) -> Self {
        segment.retain();
        Self { segment }
    }
}

impl Deref for SegmentHandle {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.segment
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        self.segment.release();
    }
}
