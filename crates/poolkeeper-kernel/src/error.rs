//! Error types for `poolkeeper-kernel`.
//!
//! [`PoolError`] is the operation-level taxonomy returned by the allocator
//! and the lifecycle engine. [`KernelError`] composes every sub-module error
//! and is carried in an [`error_stack::Report`] at the wiring / bootstrap
//! boundary, where attaching context matters more than matching variants.
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//!
//! let config = PoolKeeperConfig::load("pool.yaml")
//!     .attach("loading pool configuration")?;
//! ```
//!
//! "No free record matches" is not an error: `acquire` returns `Ok(None)`.

use thiserror::Error;

use crate::lifecycle::ActionKind;
use crate::resource::{HolderToken, ResourceId, ResourceStatus};
use crate::risk::ClassifierError;
use crate::store::StoreError;

/// Operation-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Unknown resource id
    #[error("Resource not found: {0}")]
    NotFound(ResourceId),

    /// Release (or lease-scoped action) by a caller that does not hold the lease
    #[error("Resource {id} is not leased to {holder}")]
    NotLeased { id: ResourceId, holder: HolderToken },

    /// Operation illegal for the record's current status, including a
    /// status change that is not an edge of the lifecycle graph
    #[error("Resource {id} is {status}: cannot {operation}")]
    InvalidState {
        id: ResourceId,
        status: ResourceStatus,
        operation: String,
    },

    /// A plan is already executing for this record
    #[error("A transition plan is already running for {0}")]
    PlanInProgress(ResourceId),

    /// The plan references an action with no registered handler
    #[error("No handler registered for action '{0}'")]
    UnknownAction(ActionKind),

    /// The classifier could not score
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Storage backend down; callers own retry policy
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Result alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    pub fn invalid_state(id: &ResourceId, status: ResourceStatus, operation: impl Into<String>) -> Self {
        PoolError::InvalidState {
            id: id.clone(),
            status,
            operation: operation.into(),
        }
    }
}

impl From<StoreError> for PoolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => PoolError::NotFound(id),
            StoreError::Unavailable(msg) => PoolError::StoreUnavailable(msg),
            StoreError::Serialization(msg) => PoolError::StoreUnavailable(msg),
        }
    }
}

impl From<ClassifierError> for PoolError {
    fn from(err: ClassifierError) -> Self {
        PoolError::ModelUnavailable(err.to_string())
    }
}

/// Crate-level error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// A pool operation failed
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// A store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A configuration-related error (requires the `config` feature)
    #[cfg(feature = "config")]
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Configuration parsed but is semantically invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;

/// Extension trait to lift any error convertible into [`KernelError`] into a
/// [`KernelResult`].
pub trait IntoKernelReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> KernelResult<T>;
}

impl<T, E> IntoKernelReport<T> for Result<T, E>
where
    E: Into<KernelError>,
{
    #[inline]
    fn into_report(self) -> KernelResult<T> {
        self.map_err(|err| error_stack::Report::new(err.into()))
    }
}
