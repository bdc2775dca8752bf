//! Allocator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use poolkeeper_kernel::error::KernelError;

/// Configuration for [`PoolAllocator`](super::PoolAllocator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// TTL applied when `acquire` is called without one; `None` means leases
    /// never expire unless the caller asks
    pub default_ttl_ms: Option<u64>,
    /// Period of the background reclaim sweep
    pub reclaim_interval_ms: u64,
    /// Reclaim expired leases inside every `acquire`
    pub reclaim_on_acquire: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: None,
            reclaim_interval_ms: 30_000,
            reclaim_on_acquire: true,
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_ms = Some(super::duration_ms(ttl));
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval_ms = super::duration_ms(interval);
        self
    }

    pub fn with_reclaim_on_acquire(mut self, enabled: bool) -> Self {
        self.reclaim_on_acquire = enabled;
        self
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if self.reclaim_interval_ms == 0 {
            return Err(KernelError::InvalidConfig(
                "allocator.reclaim_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.default_ttl_ms == Some(0) {
            return Err(KernelError::InvalidConfig(
                "allocator.default_ttl_ms must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AllocatorConfig::default();
        assert_eq!(config.default_ttl_ms, None);
        assert_eq!(config.reclaim_interval(), Duration::from_secs(30));
        assert!(config.reclaim_on_acquire);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: AllocatorConfig = serde_yaml::from_str("default_ttl_ms: 60000").unwrap();
        assert_eq!(config.default_ttl_ms, Some(60_000));
        assert_eq!(config.reclaim_interval_ms, 30_000);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = AllocatorConfig::new().with_reclaim_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(KernelError::InvalidConfig(_))));
    }
}
