//! Record provisioning
//!
//! Thin surface used by the external provisioning collaborator: every new
//! record starts NEW, free, and indexed as available.

use std::sync::Arc;

use poolkeeper_kernel::clock::{Clock, SystemClock};
use poolkeeper_kernel::error::{PoolError, PoolResult};
use poolkeeper_kernel::resource::{ResourceAttributes, ResourceId, ResourceRecord};
use poolkeeper_kernel::store::{IndexSet, ResourceStore, StoreError};
use tracing::info;

/// Creates resource records.
#[derive(Clone)]
pub struct Provisioner {
    store: Arc<dyn ResourceStore>,
    clock: Arc<dyn Clock>,
}

impl Provisioner {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn ResourceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create a record under a freshly generated id.
    pub async fn create_resource(&self, attributes: ResourceAttributes) -> PoolResult<ResourceId> {
        self.create_with_id(ResourceId::generate(), attributes).await
    }

    /// Create a record under a caller-chosen id. Fails with `InvalidState`
    /// if the id is already taken.
    pub async fn create_with_id(
        &self,
        id: ResourceId,
        attributes: ResourceAttributes,
    ) -> PoolResult<ResourceId> {
        let record = ResourceRecord::new(id.clone(), attributes, self.clock.now_millis());
        let mut existing = None;

        self.store
            .transact(&mut |txn| {
                match txn.get(&record.id) {
                    Ok(current) => {
                        existing = Some(current.status);
                        return Ok(());
                    }
                    Err(StoreError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                txn.put(record.clone())?;
                txn.index_add(IndexSet::Available, &record.id)
            })
            .await?;

        if let Some(status) = existing {
            return Err(PoolError::invalid_state(&id, status, "provision"));
        }

        info!(resource_id = %id, "resource provisioned");
        Ok(id)
    }
}
