use crate::value::ValueKind;
use thiserror::Error;

/// Failures raised by the engine layer.
///
/// Configuration and registration errors surface before any superstep runs;
/// merge failures abort the superstep (and the job, no retry at this layer);
/// phase/kind errors are programmer errors surfaced fatally.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The process-wide job context was read before a job installed one.
    #[error("job context accessed before initialization")]
    ContextUnset,

    /// An aggregation name was used without a prior registration.
    #[error("aggregation `{0}` is not registered")]
    NotRegistered(String),

    /// The configured communication strategy name is unknown.
    #[error("unsupported communication strategy `{0}`")]
    UnsupportedStrategy(String),

    /// The configured aggregation storage kind is unknown.
    #[error("unsupported aggregation storage `{0}`")]
    UnsupportedStorage(String),

    /// A write carried a value of the wrong kind for its aggregation.
    #[error("aggregation `{aggregation}` expects {expected} values, got {actual}")]
    KindMismatch {
        aggregation: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    /// A key of the wrong kind was used with a keyed aggregation write.
    #[error("aggregation `{aggregation}` expects {expected} keys, got {actual}")]
    KeyKindMismatch {
        aggregation: String,
        expected: crate::value::KeyKind,
        actual: crate::value::KeyKind,
    },

    /// An engine call arrived while the partition was in the wrong phase.
    #[error("`{operation}` called on partition {partition} during {phase} phase")]
    InvalidPhase {
        operation: &'static str,
        partition: usize,
        phase: &'static str,
    },

    /// A reduction or end-aggregation function failed during the barrier merge.
    #[error("merge failed for aggregation `{aggregation}` at superstep {superstep}: {source}")]
    Merge {
        aggregation: String,
        superstep: u64,
        #[source]
        source: ReduceError,
    },

    /// A partition's compute closure failed; the barrier aborts the job.
    #[error("partition {partition} failed at superstep {superstep}: {message}")]
    PartitionFailed {
        partition: usize,
        superstep: u64,
        message: String,
    },

    /// A frontier payload could not be encoded or decoded.
    #[error("frontier exchange failed ({strategy}): {message}")]
    Exchange {
        strategy: &'static str,
        message: String,
    },

    /// Output flush failed during finalization.
    #[error("output flush failed for `{path}`: {source}")]
    OutputFlush {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures inside a reduction or end-aggregation function.
///
/// Reductions must be total over their registered value kind; anything else
/// aborts the merge that invoked them.
#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("cannot combine {left} with {right}")]
    Incompatible { left: ValueKind, right: ValueKind },

    #[error("integer overflow while combining values")]
    Overflow,
    #[error("merge worker panicked")]
    WorkerPanicked,

    #[error("end-aggregation failed: {0}")]
    EndAggregation(String),
}
