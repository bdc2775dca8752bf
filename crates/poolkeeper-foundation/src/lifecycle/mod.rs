//! Lifecycle engine, action registry and plan interrupts

mod engine;
mod interrupt;
mod registry;

pub use engine::{EngineConfig, LifecycleEngine, LifecycleEngineBuilder, RiskMonitorHandle};
pub use registry::ActionRegistry;
