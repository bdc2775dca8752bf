//! In-memory resource store
//!
//! Thread-safe [`ResourceStore`] backed by a single `parking_lot::Mutex`.
//! Suitable for:
//! - Unit and integration testing
//! - Single-process deployments
//! - Restart simulation via [`StoreSnapshot`]
//!
//! Every transaction keeps an undo journal; when the closure passed to
//! [`transact`](ResourceStore::transact) fails, the journal is replayed in
//! reverse so no partial state survives.
//!
//! # Example
//!
//! ```rust,ignore
//! use poolkeeper_foundation::store::InMemoryResourceStore;
//!
//! let store = InMemoryResourceStore::shared();
//! store.put(record).await?;
//! let ids = store.scan(IndexSet::Available).await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use poolkeeper_kernel::resource::{ResourceId, ResourceRecord};
use poolkeeper_kernel::store::{
    IndexSet, PlanCheckpoint, ResourceStore, StoreError, StoreResult, StoreTxn, TxnFn,
};

/// Serializable image of the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub records: Vec<ResourceRecord>,
    pub available: Vec<ResourceId>,
    pub in_use: Vec<ResourceId>,
    pub checkpoints: Vec<PlanCheckpoint>,
}

#[derive(Debug, Default)]
struct StoreState {
    records: BTreeMap<ResourceId, ResourceRecord>,
    available: BTreeSet<ResourceId>,
    in_use: BTreeSet<ResourceId>,
    checkpoints: BTreeMap<ResourceId, PlanCheckpoint>,
}

impl StoreState {
    fn index(&self, set: IndexSet) -> &BTreeSet<ResourceId> {
        match set {
            IndexSet::Available => &self.available,
            IndexSet::InUse => &self.in_use,
        }
    }

    fn index_mut(&mut self, set: IndexSet) -> &mut BTreeSet<ResourceId> {
        match set {
            IndexSet::Available => &mut self.available,
            IndexSet::InUse => &mut self.in_use,
        }
    }
}

/// Undo journal entry
enum Undo {
    Record {
        id: ResourceId,
        previous: Option<ResourceRecord>,
    },
    IndexAdded(IndexSet, ResourceId),
    IndexRemoved(IndexSet, ResourceId),
}

/// Transaction view over the locked state.
struct JournaledTxn<'a> {
    state: &'a mut StoreState,
    undo: Vec<Undo>,
}

impl<'a> JournaledTxn<'a> {
    fn new(state: &'a mut StoreState) -> Self {
        Self {
            state,
            undo: Vec::new(),
        }
    }

    fn rollback(self) {
        let JournaledTxn { state, undo } = self;
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Record { id, previous } => match previous {
                    Some(record) => {
                        state.records.insert(id, record);
                    }
                    None => {
                        state.records.remove(&id);
                    }
                },
                Undo::IndexAdded(set, id) => {
                    state.index_mut(set).remove(&id);
                }
                Undo::IndexRemoved(set, id) => {
                    state.index_mut(set).insert(id);
                }
            }
        }
    }
}

impl StoreTxn for JournaledTxn<'_> {
    fn get(&self, id: &ResourceId) -> StoreResult<ResourceRecord> {
        self.state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn put(&mut self, record: ResourceRecord) -> StoreResult<()> {
        let id = record.id.clone();
        let previous = self.state.records.insert(id.clone(), record);
        self.undo.push(Undo::Record { id, previous });
        Ok(())
    }

    fn index_add(&mut self, set: IndexSet, id: &ResourceId) -> StoreResult<()> {
        if !self.state.records.contains_key(id) {
            return Err(StoreError::NotFound(id.clone()));
        }
        if self.state.index_mut(set).insert(id.clone()) {
            self.undo.push(Undo::IndexAdded(set, id.clone()));
        }
        Ok(())
    }

    fn index_remove(&mut self, set: IndexSet, id: &ResourceId) -> StoreResult<()> {
        if self.state.index_mut(set).remove(id) {
            self.undo.push(Undo::IndexRemoved(set, id.clone()));
        }
        Ok(())
    }

    fn contains(&self, set: IndexSet, id: &ResourceId) -> StoreResult<bool> {
        Ok(self.state.index(set).contains(id))
    }

    fn scan(&self, set: IndexSet) -> StoreResult<Vec<ResourceId>> {
        Ok(self.state.index(set).iter().cloned().collect())
    }
}

/// In-memory resource store
pub struct InMemoryResourceStore {
    state: Mutex<StoreState>,
    /// Simulated backend reachability
    connected: AtomicBool,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            connected: AtomicBool::new(true),
        }
    }

    /// Create a shared store
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Rebuild a store from a snapshot, e.g. after a simulated restart.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let state = StoreState {
            records: snapshot
                .records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
            available: snapshot.available.into_iter().collect(),
            in_use: snapshot.in_use.into_iter().collect(),
            checkpoints: snapshot
                .checkpoints
                .into_iter()
                .map(|cp| (cp.resource_id.clone(), cp))
                .collect(),
        };

        Self {
            state: Mutex::new(state),
            connected: AtomicBool::new(true),
        }
    }

    /// Consistent copy of the whole store.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock();
        StoreSnapshot {
            records: state.records.values().cloned().collect(),
            available: state.available.iter().cloned().collect(),
            in_use: state.in_use.iter().cloned().collect(),
            checkpoints: state.checkpoints.values().cloned().collect(),
        }
    }

    pub fn to_json(&self) -> StoreResult<String> {
        serde_json::to_string(&self.snapshot())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> StoreResult<Self> {
        let snapshot: StoreSnapshot =
            serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Toggle simulated availability. While unavailable every call fails
    /// with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.connected.store(available, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    fn ensure_connected(&self) -> StoreResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }

    fn run_txn(&self, f: &mut TxnFn<'_>) -> StoreResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let mut txn = JournaledTxn::new(&mut state);
        match f(&mut txn) {
            Ok(()) => Ok(()),
            Err(err) => {
                txn.rollback();
                Err(err)
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> StoreResult<T>) -> StoreResult<T> {
        self.ensure_connected()?;
        let state = self.state.lock();
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> StoreResult<T> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        Ok(f(&mut state))
    }
}

impl Default for InMemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn put(&self, record: ResourceRecord) -> StoreResult<()> {
        self.write(|state| {
            state.records.insert(record.id.clone(), record);
        })
    }

    async fn get(&self, id: &ResourceId) -> StoreResult<ResourceRecord> {
        self.read(|state| {
            state
                .records
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.clone()))
        })
    }

    async fn index_add(&self, set: IndexSet, id: &ResourceId) -> StoreResult<()> {
        self.run_txn(&mut |txn| txn.index_add(set, id))
    }

    async fn index_remove(&self, set: IndexSet, id: &ResourceId) -> StoreResult<()> {
        self.run_txn(&mut |txn| txn.index_remove(set, id))
    }

    async fn scan(&self, set: IndexSet) -> StoreResult<Vec<ResourceId>> {
        self.read(|state| Ok(state.index(set).iter().cloned().collect()))
    }

    async fn list_ids(&self) -> StoreResult<Vec<ResourceId>> {
        self.read(|state| Ok(state.records.keys().cloned().collect()))
    }

    async fn transact(&self, f: &mut TxnFn<'_>) -> StoreResult<()> {
        self.run_txn(f)
    }

    async fn save_checkpoint(&self, checkpoint: PlanCheckpoint) -> StoreResult<()> {
        self.write(|state| {
            state
                .checkpoints
                .insert(checkpoint.resource_id.clone(), checkpoint);
        })
    }

    async fn load_checkpoint(&self, id: &ResourceId) -> StoreResult<Option<PlanCheckpoint>> {
        self.read(|state| Ok(state.checkpoints.get(id).cloned()))
    }

    async fn clear_checkpoint(&self, id: &ResourceId) -> StoreResult<bool> {
        self.write(|state| state.checkpoints.remove(id).is_some())
    }

    async fn list_checkpoints(&self) -> StoreResult<Vec<PlanCheckpoint>> {
        self.read(|state| Ok(state.checkpoints.values().cloned().collect()))
    }
}
