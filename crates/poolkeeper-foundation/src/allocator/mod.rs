//! Pool allocator
//!
//! Leases records to holders. The whole matching scan of `acquire` (walk the
//! available set, test the predicate, move the winner to the in-use set with
//! its lease) runs inside one [`ResourceStore::transact`] region, so two
//! concurrent callers can never be handed the same record.
//!
//! Lease state machine:
//!
//! ```text
//! FREE ──acquire──► LEASED ──release / TTL reclaim──► FREE
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let allocator = PoolAllocator::new(store, AllocatorConfig::default());
//! let predicate = MatchPredicate::any().country("US").age_days(30, 90);
//!
//! if let Some(record) = allocator
//!     .acquire(&predicate, HolderToken::new("worker-1"), Some(Duration::from_secs(60)))
//!     .await?
//! {
//!     // ... use the record ...
//!     allocator.release(&record.id, &HolderToken::new("worker-1")).await?;
//! }
//! ```

mod config;
mod metrics;

pub use config::AllocatorConfig;
pub use metrics::{AllocatorMetrics, AllocatorMetricsSnapshot};

use std::sync::Arc;
use std::time::Duration;

use poolkeeper_kernel::clock::{Clock, SystemClock};
use poolkeeper_kernel::error::{PoolError, PoolResult};
use poolkeeper_kernel::predicate::MatchPredicate;
use poolkeeper_kernel::resource::{
    HolderToken, Lease, LeaseState, ResourceId, ResourceRecord,
};
use poolkeeper_kernel::store::{IndexSet, ResourceStore, StoreError, StoreResult, StoreTxn};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::background::BackgroundTask;

/// Handle to the periodic reclaim sweep.
pub type ReclaimerHandle = BackgroundTask;

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

/// Index membership counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
}

struct AllocatorInner {
    store: Arc<dyn ResourceStore>,
    config: AllocatorConfig,
    clock: Arc<dyn Clock>,
    metrics: AllocatorMetrics,
}

/// Predicate-matching lease manager.
///
/// Cheap to clone; clones share the same store, config and metrics.
#[derive(Clone)]
pub struct PoolAllocator {
    inner: Arc<AllocatorInner>,
}

impl PoolAllocator {
    pub fn new(store: Arc<dyn ResourceStore>, config: AllocatorConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ResourceStore>,
        config: AllocatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                store,
                config,
                clock,
                metrics: AllocatorMetrics::new(),
            }),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Lease the first free record (ascending id) that matches `predicate`.
    ///
    /// `ttl` falls back to `default_ttl_ms`. Returns `Ok(None)` when nothing
    /// matches; that is a normal outcome and callers decide whether to retry.
    pub async fn acquire(
        &self,
        predicate: &MatchPredicate,
        holder: HolderToken,
        ttl: Option<Duration>,
    ) -> PoolResult<Option<ResourceRecord>> {
        let ttl_ms = ttl.map(duration_ms).or(self.inner.config.default_ttl_ms);
        let now = self.inner.clock.now_millis();
        let reclaim_first = self.inner.config.reclaim_on_acquire;

        let mut reclaimed = Vec::new();
        let mut leased = None;

        self.inner
            .store
            .transact(&mut |txn| {
                reclaimed = if reclaim_first {
                    reclaim_in(txn, now)?
                } else {
                    Vec::new()
                };
                leased = lease_first_match(txn, predicate, &holder, now, ttl_ms)?;
                Ok(())
            })
            .await?;

        self.note_reclaimed(&reclaimed);

        match &leased {
            Some(record) => {
                self.inner.metrics.record_acquired();
                info!(resource_id = %record.id, holder = %holder, ttl_ms = ?ttl_ms, "lease acquired");
            }
            None => {
                self.inner.metrics.record_empty();
                debug!(holder = %holder, "no free record matches predicate");
            }
        }

        Ok(leased)
    }

    /// Return a leased record to the pool.
    ///
    /// Fails with `NotLeased` unless `holder` currently holds the lease; the
    /// record is left untouched in that case. The record is re-indexed as
    /// available only if its status is still matchable.
    pub async fn release(&self, id: &ResourceId, holder: &HolderToken) -> PoolResult<()> {
        let mut held = false;
        let mut reindexed = false;

        self.inner
            .store
            .transact(&mut |txn| {
                let record = txn.get(id)?;
                held = record.lease.is_held_by(holder);
                if held {
                    reindexed = free_in(txn, record)?;
                }
                Ok(())
            })
            .await?;

        if !held {
            self.inner.metrics.record_rejected_release();
            warn!(resource_id = %id, holder = %holder, "release rejected: not the lease holder");
            return Err(PoolError::NotLeased {
                id: id.clone(),
                holder: holder.clone(),
            });
        }

        self.inner.metrics.record_released();
        info!(resource_id = %id, holder = %holder, reindexed, "lease released");
        Ok(())
    }

    /// Force-release every lease past its TTL. Returns how many were
    /// reclaimed; a lease is reclaimed at most once.
    pub async fn reclaim_expired(&self) -> PoolResult<usize> {
        let now = self.inner.clock.now_millis();
        let mut reclaimed = Vec::new();

        self.inner
            .store
            .transact(&mut |txn| {
                reclaimed = reclaim_in(txn, now)?;
                Ok(())
            })
            .await?;

        self.note_reclaimed(&reclaimed);
        Ok(reclaimed.len())
    }

    /// Bring index membership of one record in line with its status and
    /// lease: terminal records lose their lease, and the record is available
    /// iff it is free and matchable. Returns the revoked lease, if any.
    pub async fn reconcile(&self, id: &ResourceId) -> PoolResult<Option<Lease>> {
        let mut revoked = None;

        self.inner
            .store
            .transact(&mut |txn| {
                let mut record = txn.get(id)?;
                revoked = reconcile_in(txn, &mut record)?;
                if revoked.is_some() {
                    txn.put(record)?;
                }
                Ok(())
            })
            .await?;

        if let Some(lease) = &revoked {
            self.note_revoked(id, lease);
        }
        Ok(revoked)
    }

    /// Current copy of a record.
    pub async fn record(&self, id: &ResourceId) -> PoolResult<ResourceRecord> {
        Ok(self.inner.store.get(id).await?)
    }

    pub async fn pool_stats(&self) -> PoolResult<PoolStats> {
        let mut stats = PoolStats::default();
        self.inner
            .store
            .transact(&mut |txn| {
                stats.available = txn.scan(IndexSet::Available)?.len();
                stats.in_use = txn.scan(IndexSet::InUse)?.len();
                Ok(())
            })
            .await?;
        stats.total = self.inner.store.list_ids().await?.len();
        Ok(stats)
    }

    pub fn metrics(&self) -> AllocatorMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Spawn the periodic reclaim sweep at `reclaim_interval_ms`.
    pub fn start_reclaimer(&self) -> ReclaimerHandle {
        let allocator = self.clone();
        BackgroundTask::spawn("lease-reclaimer", self.inner.config.reclaim_interval(), move || {
            let allocator = allocator.clone();
            async move {
                if let Err(err) = allocator.reclaim_expired().await {
                    warn!(error = %err, "reclaim sweep failed");
                }
            }
        })
    }

    pub(crate) fn note_revoked(&self, id: &ResourceId, lease: &Lease) {
        self.inner.metrics.record_revoked();
        warn!(resource_id = %id, holder = %lease.holder, "lease revoked on terminal status");
    }

    fn note_reclaimed(&self, reclaimed: &[ResourceId]) {
        if reclaimed.is_empty() {
            return;
        }
        self.inner.metrics.record_reclaimed(reclaimed.len() as u64);
        for id in reclaimed {
            info!(resource_id = %id, "expired lease reclaimed");
        }
    }
}

/// Scan the available set in ascending id order and lease the first record
/// that is genuinely free, matchable and matches. Stale entries met on the
/// way are dropped from the index.
fn lease_first_match(
    txn: &mut dyn StoreTxn,
    predicate: &MatchPredicate,
    holder: &HolderToken,
    now_ms: u64,
    ttl_ms: Option<u64>,
) -> StoreResult<Option<ResourceRecord>> {
    for id in txn.scan(IndexSet::Available)? {
        let mut record = match txn.get(&id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                txn.index_remove(IndexSet::Available, &id)?;
                continue;
            }
            Err(err) => return Err(err),
        };

        if !record.is_available() {
            txn.index_remove(IndexSet::Available, &id)?;
            continue;
        }
        if !predicate.matches(&record) {
            continue;
        }

        record.lease = LeaseState::Leased(Lease {
            holder: holder.clone(),
            acquired_at_ms: now_ms,
            ttl_ms,
        });
        txn.put(record.clone())?;
        txn.index_remove(IndexSet::Available, &id)?;
        txn.index_add(IndexSet::InUse, &id)?;
        return Ok(Some(record));
    }

    Ok(None)
}

/// Free a record's lease and move it out of the in-use set. Returns whether
/// it went back to the available set.
fn free_in(txn: &mut dyn StoreTxn, mut record: ResourceRecord) -> StoreResult<bool> {
    record.lease = LeaseState::Free;
    let id = record.id.clone();
    let matchable = record.status.is_matchable();

    txn.put(record)?;
    txn.index_remove(IndexSet::InUse, &id)?;
    if matchable {
        txn.index_add(IndexSet::Available, &id)?;
    } else {
        txn.index_remove(IndexSet::Available, &id)?;
    }
    Ok(matchable)
}

fn reclaim_in(txn: &mut dyn StoreTxn, now_ms: u64) -> StoreResult<Vec<ResourceId>> {
    let mut reclaimed = Vec::new();

    for id in txn.scan(IndexSet::InUse)? {
        let mut record = match txn.get(&id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                txn.index_remove(IndexSet::InUse, &id)?;
                continue;
            }
            Err(err) => return Err(err),
        };

        let expired = match record.lease.lease() {
            Some(lease) => lease.is_expired(now_ms),
            None => {
                txn.index_remove(IndexSet::InUse, &id)?;
                continue;
            }
        };
        if !expired {
            continue;
        }

        record.counters.reclaimed_count += 1;
        free_in(txn, record)?;
        reclaimed.push(id);
    }

    Ok(reclaimed)
}

/// Align lease and index membership of `record` with its status. The caller
/// persists `record` when a lease was revoked.
pub(crate) fn reconcile_in(
    txn: &mut dyn StoreTxn,
    record: &mut ResourceRecord,
) -> StoreResult<Option<Lease>> {
    let mut revoked = None;

    if record.status.is_terminal() {
        if let LeaseState::Leased(lease) = std::mem::take(&mut record.lease) {
            revoked = Some(lease);
        }
        txn.index_remove(IndexSet::InUse, &record.id)?;
    }

    if record.is_available() {
        txn.index_add(IndexSet::Available, &record.id)?;
    } else {
        txn.index_remove(IndexSet::Available, &record.id)?;
    }

    Ok(revoked)
}
