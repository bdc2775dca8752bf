//! Allocator metrics

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lease counters
#[derive(Debug, Default)]
pub struct AllocatorMetrics {
    /// Successful acquires
    acquired: AtomicU64,
    /// Acquires that found no matching free record
    empty: AtomicU64,
    released: AtomicU64,
    /// Releases refused with `NotLeased`
    rejected_releases: AtomicU64,
    /// Expired leases returned to the pool
    reclaimed: AtomicU64,
    /// Leases dropped because the record reached a terminal status
    revoked: AtomicU64,
}

impl AllocatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_empty(&self) {
        self.empty.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rejected_release(&self) {
        self.rejected_releases.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_reclaimed(&self, count: u64) {
        self.reclaimed.fetch_add(count, Ordering::SeqCst);
    }

    pub fn record_revoked(&self) {
        self.revoked.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> AllocatorMetricsSnapshot {
        AllocatorMetricsSnapshot {
            acquired: self.acquired.load(Ordering::SeqCst),
            empty: self.empty.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            rejected_releases: self.rejected_releases.load(Ordering::SeqCst),
            reclaimed: self.reclaimed.load(Ordering::SeqCst),
            revoked: self.revoked.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of [`AllocatorMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorMetricsSnapshot {
    pub acquired: u64,
    pub empty: u64,
    pub released: u64,
    pub rejected_releases: u64,
    pub reclaimed: u64,
    pub revoked: u64,
}

impl fmt::Display for AllocatorMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acquired={} empty={} released={} rejected_releases={} reclaimed={} revoked={}",
            self.acquired,
            self.empty,
            self.released,
            self.rejected_releases,
            self.reclaimed,
            self.revoked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = AllocatorMetrics::new();
        metrics.record_acquired();
        metrics.record_acquired();
        metrics.record_empty();
        metrics.record_reclaimed(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.acquired, 2);
        assert_eq!(snap.empty, 1);
        assert_eq!(snap.reclaimed, 3);
        assert_eq!(snap.released, 0);
        assert!(snap.to_string().contains("reclaimed=3"));
    }
}
