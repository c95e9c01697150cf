//! Process-wide Prometheus registry
//!
//! Metric families are added by [`PipelineMetrics::register`]; callers only
//! obtain the registry and encode it.
//!
//! [`PipelineMetrics::register`]: super::PipelineMetrics::register

use super::{MetricsError, Result};
use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Registry of every `tradeflow_*` metric family
pub struct MetricsRegistry {
    inner: RwLock<Registry>,
}

impl MetricsRegistry {
    /// Empty registry with the `tradeflow` prefix
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::with_prefix("tradeflow")),
        }
    }

    /// The registry shared by the whole process
    pub fn global() -> Arc<MetricsRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MetricsRegistry::new())))
    }

    /// Add metric families under the write lock
    pub(crate) fn register_with<F>(&self, register: F)
    where
        F: FnOnce(&mut Registry),
    {
        register(&mut self.inner.write());
    }

    /// Prometheus text exposition of every registered family
    pub fn encode(&self) -> Result<String> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.inner.read())
            .map_err(|e| MetricsError::EncodingError(e.to_string()))?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::metrics::counter::Counter;

    #[test]
    fn test_empty_registry_encodes() {
        let text = MetricsRegistry::new().encode().unwrap();
        assert!(text.contains("# EOF"));
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&MetricsRegistry::global(), &MetricsRegistry::global()));
    }

    #[test]
    fn test_families_carry_prefix() {
        let registry = MetricsRegistry::new();
        let counter = Counter::<u64>::default();
        registry.register_with(|r| r.register("polls", "Polls", counter.clone()));
        counter.inc_by(4);

        let text = registry.encode().unwrap();
        assert!(text.contains("tradeflow_polls_total 4"));
    }
}
