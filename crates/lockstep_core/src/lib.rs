//! Superstep-synchronized aggregation engine.
//!
//! Partitions compute in lockstep: each superstep they fold typed values
//! into named partition-local aggregation shards, then a full-join barrier
//! merges all shards per aggregation, publishes the merged maps, and routes
//! the emitted work-unit frontiers to their owning partitions for the next
//! superstep. Domain logic plugs in through [`engine::Computation`]; the
//! rest of the crate is the machinery around it.

pub mod aggregation;
pub mod comm;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod registry;
pub mod value;

pub use config::EngineConfig;
pub use context::JobContext;
pub use engine::{Computation, MasterEngine, SuperstepMaster, WorkerEngine};
pub use error::EngineError;
pub use value::{AggKey, AggValue};
