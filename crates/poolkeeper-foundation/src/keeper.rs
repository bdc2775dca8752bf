//! Composition root
//!
//! [`PoolKeeper`] wires a store and a classifier into the provisioner,
//! allocator, risk gate and lifecycle engine described by a
//! [`PoolKeeperConfig`], and owns the background sweeps.
//!
//! ```rust,ignore
//! let keeper = PoolKeeper::load("pool.yaml", store, classifier, registry)?;
//! keeper.start_background();
//! let id = keeper.provisioner().create_resource(attrs).await?;
//! ```

use std::sync::Arc;

use error_stack::ResultExt;
use parking_lot::Mutex;
use tracing::info;

use poolkeeper_kernel::clock::{Clock, SystemClock};
use poolkeeper_kernel::error::KernelResult;
use poolkeeper_kernel::risk::RiskClassifier;
use poolkeeper_kernel::store::ResourceStore;

use crate::allocator::PoolAllocator;
use crate::background::BackgroundTask;
use crate::config::PoolKeeperConfig;
use crate::lifecycle::{ActionRegistry, LifecycleEngine};
use crate::provisioning::Provisioner;
use crate::risk::RiskGate;

pub struct PoolKeeper {
    config: PoolKeeperConfig,
    provisioner: Provisioner,
    allocator: PoolAllocator,
    gate: Arc<RiskGate>,
    engine: LifecycleEngine,
    background: Mutex<Vec<BackgroundTask>>,
}

impl PoolKeeper {
    pub fn from_config(
        config: PoolKeeperConfig,
        store: Arc<dyn ResourceStore>,
        classifier: Arc<dyn RiskClassifier>,
        registry: ActionRegistry,
    ) -> KernelResult<Self> {
        Self::with_clock(config, store, classifier, registry, Arc::new(SystemClock))
    }

    /// Like [`from_config`](Self::from_config) with an explicit clock.
    pub fn with_clock(
        config: PoolKeeperConfig,
        store: Arc<dyn ResourceStore>,
        classifier: Arc<dyn RiskClassifier>,
        registry: ActionRegistry,
        clock: Arc<dyn Clock>,
    ) -> KernelResult<Self> {
        config.validate().attach("wiring pool keeper")?;

        let provisioner = Provisioner::with_clock(store.clone(), clock.clone());
        let allocator = PoolAllocator::with_clock(store, config.allocator.clone(), clock.clone());
        let gate = Arc::new(RiskGate::new(classifier, config.risk.clone()));
        let engine = LifecycleEngine::builder(allocator.clone(), gate.clone())
            .registry(registry)
            .clock(clock)
            .config(config.lifecycle.clone())
            .build();

        info!(
            actions = engine.registry().len(),
            high_threshold = config.risk.high_threshold,
            low_threshold = config.risk.low_threshold,
            "pool keeper ready"
        );

        Ok(Self {
            config,
            provisioner,
            allocator,
            gate,
            engine,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Load configuration from `path` and wire the components.
    pub fn load(
        path: &str,
        store: Arc<dyn ResourceStore>,
        classifier: Arc<dyn RiskClassifier>,
        registry: ActionRegistry,
    ) -> KernelResult<Self> {
        let config = PoolKeeperConfig::load(path)?;
        Self::from_config(config, store, classifier, registry)
    }

    pub fn config(&self) -> &PoolKeeperConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn allocator(&self) -> &PoolAllocator {
        &self.allocator
    }

    pub fn gate(&self) -> &Arc<RiskGate> {
        &self.gate
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    /// Start the reclaim sweep and the risk monitor.
    ///
    /// Returns `false` if they are already running.
    pub fn start_background(&self) -> bool {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return false;
        }
        background.push(self.allocator.start_reclaimer());
        background.push(self.engine.spawn_risk_monitor());
        true
    }

    pub fn background_running(&self) -> bool {
        let background = self.background.lock();
        !background.is_empty() && background.iter().all(|task| !task.is_finished())
    }

    /// Stop the background sweeps and wait for any in-progress pass.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.background.lock().drain(..).collect();
        for task in tasks {
            let name = task.name();
            task.shutdown().await;
            info!(task = name, "background task shut down");
        }
    }
}

impl std::fmt::Debug for PoolKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolKeeper")
            .field("config", &self.config)
            .field("background", &self.background.lock().len())
            .finish_non_exhaustive()
    }
}
