//! Resource store contract
//!
//! Durable keyed storage for [`ResourceRecord`]s plus two membership indices
//! (`available`, `in-use`). Any sequence of reads and writes that must be
//! indivisible runs inside [`ResourceStore::transact`]: the closure gets
//! exclusive access to a [`StoreTxn`] view, and if it returns `Err` every
//! mutation it made is undone.
//!
//! ```rust,ignore
//! let mut leased = None;
//! store
//!     .transact(&mut |txn| {
//!         for id in txn.scan(IndexSet::Available)? {
//!             let mut record = txn.get(&id)?;
//!             // ... test, mutate, move between indices ...
//!             txn.put(record.clone())?;
//!             leased = Some(record);
//!             break;
//!         }
//!         Ok(())
//!     })
//!     .await?;
//! ```
//!
//! The closure is synchronous, so nothing can await (score, network) while the
//! atomic region is held.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lifecycle::TransitionPlan;
use crate::resource::{ResourceId, ResourceRecord};

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No record with this id
    #[error("Record not found: {0}")]
    NotFound(ResourceId),
    /// Backend down or unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Explicitly maintained membership sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexSet {
    /// Free records in a matchable status
    Available,
    /// Leased records
    InUse,
}

impl IndexSet {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexSet::Available => "available",
            IndexSet::InUse => "in-use",
        }
    }
}

impl fmt::Display for IndexSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous view of the store inside an atomic region.
pub trait StoreTxn {
    fn get(&self, id: &ResourceId) -> StoreResult<ResourceRecord>;

    /// Insert or replace a record.
    fn put(&mut self, record: ResourceRecord) -> StoreResult<()>;

    fn index_add(&mut self, set: IndexSet, id: &ResourceId) -> StoreResult<()>;

    fn index_remove(&mut self, set: IndexSet, id: &ResourceId) -> StoreResult<()>;

    fn contains(&self, set: IndexSet, id: &ResourceId) -> StoreResult<bool>;

    /// Members of `set` in ascending id order.
    fn scan(&self, set: IndexSet) -> StoreResult<Vec<ResourceId>>;
}

/// Closure run inside [`ResourceStore::transact`].
pub type TxnFn<'a> = dyn FnMut(&mut dyn StoreTxn) -> StoreResult<()> + Send + 'a;

/// Progress marker of an in-flight transition plan, persisted so a plan can
/// be resumed after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCheckpoint {
    pub resource_id: ResourceId,
    pub plan: TransitionPlan,
    /// Index of the next step to execute
    pub next_step: usize,
    /// When that step becomes due (Unix-epoch ms)
    pub due_at_ms: u64,
    /// Record status version the plan was started against
    pub status_version: u64,
}

/// Resource store trait
///
/// Single-call operations are individually atomic. Anything spanning more
/// than one call must go through [`transact`](ResourceStore::transact).
/// Implementations surface backend outages as [`StoreError::Unavailable`]
/// and never retry internally.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Insert or replace a record
    async fn put(&self, record: ResourceRecord) -> StoreResult<()>;

    /// Get a record, `NotFound` when missing
    async fn get(&self, id: &ResourceId) -> StoreResult<ResourceRecord>;

    async fn index_add(&self, set: IndexSet, id: &ResourceId) -> StoreResult<()>;

    async fn index_remove(&self, set: IndexSet, id: &ResourceId) -> StoreResult<()>;

    /// Members of `set` in ascending id order
    async fn scan(&self, set: IndexSet) -> StoreResult<Vec<ResourceId>>;

    /// Every record id in ascending order
    async fn list_ids(&self) -> StoreResult<Vec<ResourceId>>;

    /// Run `f` as one indivisible unit. Mutations made by `f` are rolled back
    /// if it returns `Err`.
    async fn transact(&self, f: &mut TxnFn<'_>) -> StoreResult<()>;

    async fn save_checkpoint(&self, checkpoint: PlanCheckpoint) -> StoreResult<()>;

    async fn load_checkpoint(&self, id: &ResourceId) -> StoreResult<Option<PlanCheckpoint>>;

    /// Returns `true` if a checkpoint existed
    async fn clear_checkpoint(&self, id: &ResourceId) -> StoreResult<bool>;

    async fn list_checkpoints(&self) -> StoreResult<Vec<PlanCheckpoint>>;
}
