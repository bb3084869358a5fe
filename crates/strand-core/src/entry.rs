//! Log entry type and its on-disk record body codec.
//!
//! The record body layout is little-endian and stable across versions:
//!
//! ```text
//! [global_address: u64][type: u8][flags: u8][epoch: u64]
//! [rank: u64, if flags bit 0][stream_id_count: u16][16B stream id...]
//! [payload_length: u32][payload bytes]
//! ```
//!
//! The length prefix and trailing checksum that frame a body inside a
//! segment file are owned by the segment store; see `storage::segment`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::{Error, Result};

const TYPE_DATA: u8 = 1;
const TYPE_HOLE: u8 = 2;
const FLAG_HAS_RANK: u8 = 1;

/// Fixed-size part of a record body: address + type + flags + epoch.
const BODY_FIXED_LEN: usize = 8 + 1 + 1 + 8;

/// Kind of record held at a global address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// An application payload.
    Data,
    /// An address explicitly skipped by the layers above; carries no payload.
    Hole,
    /// Synthetic marker for addresses below the trim mark. Never persisted,
    /// only returned on read.
    Trimmed,
}

/// A single addressed log record.
///
/// Stream ids are kept in a `BTreeSet` so that encoding is deterministic:
/// two entries with the same fields always produce identical record bytes,
/// which the write-once overwrite classification depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Globally unique address assigned by the external sequencer.
    pub global_address: u64,
    pub kind: EntryKind,
    /// Streams this entry belongs to. May be empty (e.g. holes).
    pub stream_ids: BTreeSet<Uuid>,
    /// Cluster epoch at write time; persisted verbatim.
    pub epoch: u64,
    /// Optional rank for single-address consensus writes.
    pub rank: Option<u64>,
    /// Opaque payload; empty for holes.
    pub payload: Bytes,
}

impl LogEntry {
    /// Create a data entry.
    pub fn data(
        global_address: u64,
        epoch: u64,
        stream_ids: impl IntoIterator<Item = Uuid>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            global_address,
            kind: EntryKind::Data,
            stream_ids: stream_ids.into_iter().collect(),
            epoch,
            rank: None,
            payload: payload.into(),
        }
    }

    /// Create a hole entry for an explicitly skipped address.
    pub fn hole(global_address: u64, epoch: u64) -> Self {
        Self {
            global_address,
            kind: EntryKind::Hole,
            stream_ids: BTreeSet::new(),
            epoch,
            rank: None,
            payload: Bytes::new(),
        }
    }

    /// Create the synthetic entry returned for addresses below the trim mark.
    pub fn trimmed(global_address: u64) -> Self {
        Self {
            global_address,
            kind: EntryKind::Trimmed,
            stream_ids: BTreeSet::new(),
            epoch: 0,
            rank: None,
            payload: Bytes::new(),
        }
    }

    /// Attach a consensus rank.
    pub fn with_rank(mut self, rank: u64) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn is_data(&self) -> bool {
        self.kind == EntryKind::Data
    }

    pub fn is_hole(&self) -> bool {
        self.kind == EntryKind::Hole
    }

    pub fn is_trimmed(&self) -> bool {
        self.kind == EntryKind::Trimmed
    }

    /// Encode the record body (everything between the length prefix and the
    /// checksum).
    ///
    /// # Errors
    ///
    /// Trimmed entries are synthetic and are never written to disk.
    pub fn record_body(&self) -> Result<BytesMut> {
        let type_byte = match self.kind {
            EntryKind::Data => TYPE_DATA,
            EntryKind::Hole => TYPE_HOLE,
            EntryKind::Trimmed => {
                return Err(Error::IllegalArgument(
                    "trimmed entries are never persisted".to_string(),
                ))
            }
        };

        if self.stream_ids.len() > u16::MAX as usize {
            return Err(Error::IllegalArgument(format!(
                "too many stream ids: {}",
                self.stream_ids.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(
            BODY_FIXED_LEN + 8 + 2 + self.stream_ids.len() * 16 + 4 + self.payload.len(),
        );
        buf.put_u64_le(self.global_address);
        buf.put_u8(type_byte);
        buf.put_u8(if self.rank.is_some() { FLAG_HAS_RANK } else { 0 });
        buf.put_u64_le(self.epoch);
        if let Some(rank) = self.rank {
            buf.put_u64_le(rank);
        }
        buf.put_u16_le(self.stream_ids.len() as u16);
        for id in &self.stream_ids {
            buf.put_slice(id.as_bytes());
        }
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a record body produced by [`record_body`](Self::record_body).
    ///
    /// # Errors
    ///
    /// Returns `DataCorruption` on any malformed field; the reported address
    /// is the one parsed from the body when enough bytes are present.
    pub fn from_record_body(mut buf: &[u8]) -> Result<Self> {
        let address = if buf.len() >= 8 {
            u64::from_le_bytes(buf[..8].try_into().expect("8-byte slice"))
        } else {
            0
        };
        let corrupt = || Error::DataCorruption { address };

        if buf.len() < BODY_FIXED_LEN {
            return Err(corrupt());
        }
        let global_address = buf.get_u64_le();
        let type_byte = buf.get_u8();
        let flags = buf.get_u8();
        let epoch = buf.get_u64_le();

        let kind = match type_byte {
            TYPE_DATA => EntryKind::Data,
            TYPE_HOLE => EntryKind::Hole,
            _ => return Err(corrupt()),
        };

        let rank = if flags & FLAG_HAS_RANK != 0 {
            if buf.remaining() < 8 {
                return Err(corrupt());
            }
            Some(buf.get_u64_le())
        } else {
            None
        };

        if buf.remaining() < 2 {
            return Err(corrupt());
        }
        let stream_count = buf.get_u16_le() as usize;
        if buf.remaining() < stream_count * 16 {
            return Err(corrupt());
        }
        let mut stream_ids = BTreeSet::new();
        for _ in 0..stream_count {
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            stream_ids.insert(Uuid::from_bytes(raw));
        }

        if buf.remaining() < 4 {
            return Err(corrupt());
        }
        let payload_len = buf.get_u32_le() as usize;
        if buf.remaining() != payload_len {
            return Err(corrupt());
        }
        let payload = Bytes::copy_from_slice(buf);

        Ok(Self {
            global_address,
            kind,
            stream_ids,
            epoch,
            rank,
            payload,
        })
    }
}
