//! Poolkeeper foundation
//!
//! Implementations of the kernel contracts:
//!
//! - [`store::InMemoryResourceStore`]: atomic in-process store
//! - [`provisioning::Provisioner`]: creates NEW, free records
//! - [`allocator::PoolAllocator`]: predicate-matching lease / release / TTL reclaim
//! - [`risk::RiskGate`]: bounded action windows and threshold decisions
//! - [`lifecycle::LifecycleEngine`]: status transitions and delayed action plans
//! - [`keeper::PoolKeeper`]: wires everything from a [`config::PoolKeeperConfig`]

// store module - in-memory resource store
pub mod store;

// provisioning module - record creation
pub mod provisioning;

// background module - periodic tasks
pub mod background;

// allocator module - lease management
pub mod allocator;

// risk module - classifier gating
pub mod risk;

// lifecycle module - state machine and plan execution
pub mod lifecycle;

// config module
pub mod config;

// keeper module - composition root
pub mod keeper;

pub use allocator::{
    AllocatorConfig, AllocatorMetrics, AllocatorMetricsSnapshot, PoolAllocator, PoolStats,
    ReclaimerHandle,
};
pub use config::PoolKeeperConfig;
pub use keeper::PoolKeeper;
pub use lifecycle::{
    ActionRegistry, EngineConfig, LifecycleEngine, LifecycleEngineBuilder, RiskMonitorHandle,
};
pub use provisioning::Provisioner;
pub use risk::{GateDecision, RiskGate, RiskGateConfig, RiskGateMetricsSnapshot, RiskSignal};
pub use store::{InMemoryResourceStore, StoreSnapshot};
