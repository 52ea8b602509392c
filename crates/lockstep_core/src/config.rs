//! Engine configuration.
//!
//! Plain serde structs with per-field defaults, deserialized from the job's
//! TOML file by the launcher. Strategy and storage names stay strings here;
//! they are resolved (and frozen) when the job context is built.

use crate::aggregation::StorageKind;
use crate::comm::CommStrategy;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Frontier wire format: "compressed_sp", "bounded_mp", "flat_bitmap"
    #[serde(default = "default_comm_strategy")]
    pub comm_strategy: String,
    /// Aggregation storage implementation: "in_memory"
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Block-count bound for the bounded multi-pattern exchange
    #[serde(default = "default_max_exchange_units")]
    pub max_exchange_units: usize,
    /// Shard count for aggregations registered without an explicit one
    #[serde(default = "default_splits")]
    pub default_splits: usize,
    /// Reduce writes into the shard map immediately instead of buffering
    /// them until the barrier
    #[serde(default = "default_true")]
    pub two_level_aggregation: bool,
    /// Fold fresh entries into the carried map of persistent aggregations
    /// in place instead of rebuilding the union each superstep
    #[serde(default)]
    pub incremental_aggregation: bool,
    /// Release retired shard buffers to the allocator after every barrier
    #[serde(default)]
    pub force_gc: bool,
    /// Period of the superstep progress log line
    #[serde(default = "default_info_period_ms")]
    pub info_period_ms: u64,
    /// Worker partitions executed in parallel per superstep
    #[serde(default = "default_num_partitions")]
    pub num_partitions: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            comm_strategy: default_comm_strategy(),
            storage: default_storage(),
            max_exchange_units: default_max_exchange_units(),
            default_splits: default_splits(),
            two_level_aggregation: true,
            incremental_aggregation: false,
            force_gc: false,
            info_period_ms: default_info_period_ms(),
            num_partitions: default_num_partitions(),
        }
    }
}

fn default_comm_strategy() -> String {
    "compressed_sp".to_string()
}

fn default_storage() -> String {
    "in_memory".to_string()
}

fn default_max_exchange_units() -> usize {
    100
}

fn default_splits() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_info_period_ms() -> u64 {
    60_000
}

fn default_num_partitions() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    /// Whether finalization writes persistent aggregations at all
    #[serde(default = "default_true")]
    pub active: bool,
    /// Directory the finalization pass writes into
    #[serde(default = "default_output_path")]
    pub path: String,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            active: true,
            path: default_output_path(),
        }
    }
}

fn default_output_path() -> String {
    "Output".to_string()
}

impl EngineConfig {
    /// Resolves the configured strategy name. Unknown names fail fast,
    /// before any superstep runs.
    pub fn comm_strategy(&self) -> Result<CommStrategy, EngineError> {
        CommStrategy::parse(&self.engine.comm_strategy)
    }

    /// Resolves the configured storage implementation name.
    pub fn storage_kind(&self) -> Result<StorageKind, EngineError> {
        StorageKind::parse(&self.engine.storage)
    }
}
