//! Resource store implementations

mod memory;

pub use memory::{InMemoryResourceStore, StoreSnapshot};
