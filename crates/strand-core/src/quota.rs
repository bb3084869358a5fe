use std::sync::atomic::{AtomicU64, Ordering};

/// Byte-accounting quota for the log directory.
///
/// `used` moves up on every successful segment write and down by the deleted
/// file's length when trim or reset removes a file. The quota is a soft
/// admission gate: availability is checked before a write is admitted, so a
/// single admitted write may overshoot the limit, after which further writes
/// are refused until space is released.
#[derive(Debug)]
pub struct ResourceQuota {
    limit: Option<u64>,
    used: AtomicU64,
}

impl ResourceQuota {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Account for `bytes` of new log data.
    pub fn acquire(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Return `bytes` of freed log data. Saturates at zero.
    pub fn release(&self, bytes: u64) {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Whether another write may be admitted.
    pub fn has_available(&self) -> bool {
        match self.limit {
            Some(limit) => self.used.load(Ordering::Acquire) < limit,
            None => true,
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}
