//! Job context: the frozen view of one job's configuration.
//!
//! Built once at job start from an [`EngineConfig`], after which the
//! communication strategy and storage implementation never change. The
//! context is passed explicitly to everything that needs it; the process
//! wide handle below exists only for driver-style entry points that have no
//! context to thread through.

use crate::aggregation::StorageKind;
use crate::comm::{CommStrategy, FrontierCodec};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::{read_lock, write_lock, AggregationRegistry, AggregationStorageFactory};
use lazy_static::lazy_static;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

lazy_static! {
    static ref CURRENT_JOB: RwLock<Option<Arc<JobContext>>> = RwLock::new(None);
}

pub struct JobContext {
    config: EngineConfig,
    strategy: CommStrategy,
    storage_kind: StorageKind,
    registry: Arc<AggregationRegistry>,
    factory: AggregationStorageFactory,
}

impl JobContext {
    /// Resolves and freezes every name-valued setting. A bad strategy or
    /// storage name fails here, before any superstep runs.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        let strategy = config.comm_strategy()?;
        let storage_kind = config.storage_kind()?;
        let registry = Arc::new(AggregationRegistry::new(config.engine.default_splits));
        let factory = AggregationStorageFactory::new(
            Arc::clone(&registry),
            config.engine.two_level_aggregation,
        );
        info!(
            strategy = %strategy,
            storage = storage_kind.as_str(),
            num_partitions = config.engine.num_partitions,
            "job context initialized"
        );
        Ok(Arc::new(JobContext {
            config,
            strategy,
            storage_kind,
            registry,
            factory,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn strategy(&self) -> CommStrategy {
        self.strategy
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.storage_kind
    }

    pub fn registry(&self) -> &Arc<AggregationRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &AggregationStorageFactory {
        &self.factory
    }

    pub fn num_partitions(&self) -> usize {
        self.config.engine.num_partitions.max(1)
    }

    /// Codec for the frozen strategy.
    pub fn frontier_codec(&self) -> Box<dyn FrontierCodec> {
        self.strategy.codec(self.config.engine.max_exchange_units)
    }

    pub fn info_period(&self) -> Duration {
        Duration::from_millis(self.config.engine.info_period_ms)
    }

    pub fn incremental_aggregation(&self) -> bool {
        self.config.engine.incremental_aggregation
    }

    pub fn force_gc(&self) -> bool {
        self.config.engine.force_gc
    }

    pub fn output_active(&self) -> bool {
        self.config.output.active
    }

    pub fn output_path(&self) -> &str {
        &self.config.output.path
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("strategy", &self.strategy)
            .field("storage_kind", &self.storage_kind)
            .field("num_partitions", &self.num_partitions())
            .finish()
    }
}

/// Installs `context` as the process-wide current job unless one is already
/// installed. Returns whether this call installed it.
pub fn set_current_if_unset(context: Arc<JobContext>) -> bool {
    let mut slot = write_lock(&CURRENT_JOB);
    if slot.is_some() {
        return false;
    }
    *slot = Some(context);
    true
}

/// The process-wide current job. Accessing it before any job installed one
/// is a configuration error.
pub fn current() -> Result<Arc<JobContext>, EngineError> {
    read_lock(&CURRENT_JOB)
        .as_ref()
        .map(Arc::clone)
        .ok_or(EngineError::ContextUnset)
}

/// Clears the process-wide current job, making room for the next one.
pub fn unset_current() {
    write_lock(&CURRENT_JOB).take();
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test covers the whole handle lifecycle: the slot is process-wide
    // and parallel tests would race on it.
    #[test]
    fn test_current_job_handle_lifecycle() {
        unset_current();
        assert!(matches!(current(), Err(EngineError::ContextUnset)));

        let first = JobContext::new(EngineConfig::default()).unwrap();
        assert!(set_current_if_unset(Arc::clone(&first)));

        let mut other_config = EngineConfig::default();
        other_config.engine.comm_strategy = "flat_bitmap".to_string();
        let second = JobContext::new(other_config).unwrap();
        assert!(!set_current_if_unset(second));

        // First installation wins.
        assert_eq!(current().unwrap().strategy(), CommStrategy::CompressedSingle);

        unset_current();
        assert!(matches!(current(), Err(EngineError::ContextUnset)));
    }

    #[test]
    fn test_context_freezes_resolved_settings() {
        let mut config = EngineConfig::default();
        config.engine.comm_strategy = "bounded_mp".to_string();
        config.engine.num_partitions = 0;
        let context = JobContext::new(config).unwrap();
        assert_eq!(context.strategy(), CommStrategy::BoundedMulti);
        // Partition count is clamped to something runnable.
        assert_eq!(context.num_partitions(), 1);
    }

    #[test]
    fn test_bad_names_fail_at_construction() {
        let mut config = EngineConfig::default();
        config.engine.storage = "punched_cards".to_string();
        assert!(matches!(
            JobContext::new(config),
            Err(EngineError::UnsupportedStorage(_))
        ));
    }
}
