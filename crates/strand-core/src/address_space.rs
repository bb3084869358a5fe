//! Compact per-stream address sets.

use roaring::RoaringTreemap;

use crate::{Error, Result};

/// Sparse set of global addresses belonging to one stream.
///
/// Backed by a compressed run-container bitmap so that dense runs (bulk
/// loads, checkpoint intervals) and sparse writes both stay small. The
/// serialized form is the bitmap's portable byte format, stable across
/// platforms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamAddressSpace {
    addresses: RoaringTreemap,
}

impl StreamAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single address.
    pub fn add(&mut self, address: u64) {
        self.addresses.insert(address);
    }

    /// Record a batch of addresses.
    pub fn add_all(&mut self, addresses: impl IntoIterator<Item = u64>) {
        self.addresses.extend(addresses);
    }

    pub fn contains(&self, address: u64) -> bool {
        self.addresses.contains(address)
    }

    /// Highest address in the set.
    pub fn tail(&self) -> Option<u64> {
        self.addresses.max()
    }

    /// Lowest address in the set.
    pub fn first(&self) -> Option<u64> {
        self.addresses.min()
    }

    pub fn len(&self) -> u64 {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Subset of addresses within the inclusive range `[lo, hi]`.
    pub fn addresses_in_range(&self, lo: u64, hi: u64) -> Self {
        let mut subset = self.addresses.clone();
        subset.remove_range(..lo);
        if hi < u64::MAX {
            subset.remove_range(hi + 1..);
        }
        Self { addresses: subset }
    }

    /// Drop every address at or below `address`. Idempotent.
    pub fn trim_prefix(&mut self, address: u64) {
        self.addresses.remove_range(..=address);
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.addresses.iter()
    }

    /// Portable byte serialization.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.addresses.serialized_size());
        self.addresses
            .serialize_into(&mut buf)
            .map_err(Error::Io)?;
        Ok(buf)
    }

    /// Decode bytes produced by [`serialize`](Self::serialize).
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let addresses = RoaringTreemap::deserialize_from(bytes).map_err(Error::Io)?;
        Ok(Self { addresses })
    }
}

impl FromIterator<u64> for StreamAddressSpace {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
        }
    }
}
