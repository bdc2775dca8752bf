//! Poolkeeper kernel.
//!
//! Contracts shared by every pool component: the resource data model, the
//! match predicate, the store / classifier / action traits, plan types and
//! the error taxonomy. Concrete implementations live in `poolkeeper-foundation`;
//! the kernel never depends on them.

// clock module
pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

// error module
pub mod error;
pub use error::{IntoKernelReport, KernelError, KernelResult, PoolError, PoolResult};

// resource module
pub mod resource;
pub use resource::*;

// predicate module
pub mod predicate;
pub use predicate::{AgeRange, MatchPredicate};

// store module
pub mod store;

// risk module
pub mod risk;

// lifecycle module
pub mod lifecycle;

// config module
#[cfg(feature = "config")]
pub mod config;
