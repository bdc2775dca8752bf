//! Pool configuration file
//!
//! ```yaml
//! allocator:
//!   default_ttl_ms: 300000     # applied when acquire passes no TTL
//!   reclaim_interval_ms: 30000
//!   reclaim_on_acquire: true
//!
//! risk:
//!   high_threshold: 0.9
//!   low_threshold: 0.6
//!   window_size: 50
//!   evaluation_interval_ms: 60000
//!
//! lifecycle:
//!   checkpoint_plans: true
//! ```
//!
//! Every section and field is optional. `${VAR}` references are substituted
//! from the environment before parsing.

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use poolkeeper_kernel::config::{self as loader, FileFormat};
use poolkeeper_kernel::error::{IntoKernelReport, KernelResult};

use crate::allocator::AllocatorConfig;
use crate::lifecycle::EngineConfig;
use crate::risk::RiskGateConfig;

/// Environment prefix for [`PoolKeeperConfig::load_with_env`]
pub const ENV_PREFIX: &str = "POOLKEEPER";

/// Root of the pool configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolKeeperConfig {
    pub allocator: AllocatorConfig,
    pub risk: RiskGateConfig,
    pub lifecycle: EngineConfig,
}

impl PoolKeeperConfig {
    /// Load and validate a configuration file; the format follows the extension.
    pub fn load(path: &str) -> KernelResult<Self> {
        let config: Self = loader::load_config(path)
            .into_report()
            .attach(format!("loading pool configuration from {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), with `POOLKEEPER_<SECTION>__<FIELD>`
    /// environment variables overriding file values.
    pub fn load_with_env(path: &str) -> KernelResult<Self> {
        let config: Self = loader::load_with_env(path, ENV_PREFIX)
            .into_report()
            .attach(format!("loading pool configuration from {path} with env overrides"))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_str(content: &str, format: FileFormat) -> KernelResult<Self> {
        let config: Self = loader::from_str(content, format)
            .into_report()
            .attach("parsing pool configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section; the first problem found is reported.
    pub fn validate(&self) -> KernelResult<()> {
        self.allocator
            .validate()
            .map_err(Report::new)
            .attach("validating allocator section")?;
        self.risk
            .validate()
            .map_err(Report::new)
            .attach("validating risk section")?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
