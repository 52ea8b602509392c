//! Superstep engine: partition-local worker engines and the master barrier
//! loop that drives them.
//!
//! One superstep runs in three strokes. Every partition computes in its own
//! thread against its own shards, with no locks taken. The barrier then
//! folds all shards per aggregation (splits in parallel) and publishes the
//! merged maps. Finally the frontiers each partition emitted are encoded
//! with the job's wire strategy and routed to their destination partitions
//! for the next superstep. The barrier is a full join: no partition starts
//! superstep N+1 until merging and publishing for superstep N finished.

use crate::aggregation::{fold_entry, split_of, AggregationStorage};
use crate::comm::{normalize, route};
use crate::context::JobContext;
use crate::error::{EngineError, ReduceError};
use crate::registry::{read_lock, write_lock, AggregationMetadata};
use crate::value::{AggKey, AggValue};
use std::any::Any;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Merged key-value view of one aggregation, as published at a barrier.
pub type AggregateMap = HashMap<AggKey, AggValue>;

type SharedPublished = Arc<RwLock<HashMap<String, Arc<AggregateMap>>>>;

/// Engine surface a computation sees while its partition is computing.
pub trait WorkerEngine {
    fn partition_id(&self) -> usize;
    fn num_partitions(&self) -> usize;
    /// Current superstep, starting at 0. Advances by exactly 1 per barrier.
    fn superstep(&self) -> u64;
    /// Folds `value` into the partition-local scalar slot of `name`.
    fn aggregate(&mut self, name: &str, value: AggValue) -> Result<(), EngineError>;
    /// Folds `value` into the partition-local shard of `name` under `key`.
    fn map(&mut self, name: &str, key: AggKey, value: AggValue) -> Result<(), EngineError>;
    /// Most recently published global value of `name`, from the previous
    /// barrier. Never reflects uncommitted local writes.
    fn aggregated_value(&self, name: &str) -> Result<Arc<AggregateMap>, EngineError>;
    /// Queues a work unit for whichever partition owns it next superstep.
    fn emit_unit(&mut self, unit: u64) -> Result<(), EngineError>;
}

/// Engine surface a computation sees in its master hook.
pub trait MasterEngine {
    fn superstep(&self) -> u64;
    /// Requests termination. The current superstep still completes; no
    /// further superstep starts.
    fn halt_computation(&mut self);
    fn is_halted(&self) -> bool;
    fn aggregated_value(&self, name: &str) -> Result<Arc<AggregateMap>, EngineError>;
    /// Master-side bookkeeping write, visible to partitions from the next
    /// superstep on.
    fn set_aggregated_value(
        &mut self,
        name: &str,
        key: AggKey,
        value: AggValue,
    ) -> Result<(), EngineError>;
}

/// Domain logic plugged into the superstep loop.
pub trait Computation: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;
    /// Registers every aggregation the computation writes. Runs once,
    /// before superstep 0.
    fn register_aggregations(&self, context: &JobContext);
    /// Initial frontier of one partition.
    fn seed_units(&self, partition_id: usize, num_partitions: usize) -> Vec<u64>;
    /// One partition's work for one superstep.
    fn compute(&self, engine: &mut dyn WorkerEngine, units: &[u64]) -> Result<(), EngineError>;
    /// Master hook between barrier and release. The place to inspect merged
    /// values and decide on halting.
    fn master_step(
        &self,
        master: &mut dyn MasterEngine,
        report: &SuperstepReport,
    ) -> Result<(), EngineError>;
}

/// What one completed superstep looked like, as handed to the master hook.
#[derive(Debug, Clone)]
pub struct SuperstepReport {
    pub superstep: u64,
    /// Writes across all partitions this superstep.
    pub local_writes: u64,
    /// Work units emitted for the next superstep, before deduplication.
    pub emitted_units: usize,
    /// Entries across all aggregation maps published at this barrier.
    pub merged_entries: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub supersteps: u64,
    pub total_writes: u64,
    pub total_units_exchanged: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Computing,
    AwaitingBarrier,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Computing => "computing",
            Phase::AwaitingBarrier => "awaiting_barrier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MasterState {
    Running,
    Barrier,
    Halted,
}

fn merge_error(name: &str, superstep: u64, source: ReduceError) -> EngineError {
    EngineError::Merge {
        aggregation: name.to_string(),
        superstep,
        source,
    }
}

fn flush_error(path: &Path, source: std::io::Error) -> EngineError {
    EngineError::OutputFlush {
        path: path.display().to_string(),
        source,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker thread panicked".to_string()
    }
}

/// Everything a partition hands the barrier when it stops computing.
struct PartitionYield {
    shards: HashMap<String, Vec<AggregationStorage>>,
    outgoing: Vec<u64>,
    writes: u64,
}

/// One partition's engine. Owned exclusively by that partition's thread
/// while computing; the master only touches it between supersteps.
pub struct PartitionEngine {
    partition_id: usize,
    num_partitions: usize,
    superstep: u64,
    phase: Phase,
    context: Arc<JobContext>,
    published: SharedPublished,
    metadata_cache: HashMap<String, Arc<AggregationMetadata>>,
    shards: HashMap<String, Vec<AggregationStorage>>,
    outgoing: Vec<u64>,
    writes: u64,
}

impl PartitionEngine {
    fn new(
        partition_id: usize,
        num_partitions: usize,
        context: Arc<JobContext>,
        published: SharedPublished,
    ) -> Self {
        PartitionEngine {
            partition_id,
            num_partitions,
            superstep: 0,
            phase: Phase::Idle,
            context,
            published,
            metadata_cache: HashMap::new(),
            shards: HashMap::new(),
            outgoing: Vec::new(),
            writes: 0,
        }
    }

    fn begin_superstep(&mut self, superstep: u64) {
        self.superstep = superstep;
        self.phase = Phase::Computing;
    }

    /// Consolidates this superstep's shards and hands them over, leaving the
    /// engine awaiting the barrier.
    fn finish_computing(&mut self) -> Result<PartitionYield, EngineError> {
        for (name, splits) in &mut self.shards {
            for shard in splits {
                shard
                    .consolidate()
                    .map_err(|source| merge_error(name, self.superstep, source))?;
            }
        }
        self.phase = Phase::AwaitingBarrier;
        Ok(PartitionYield {
            shards: std::mem::take(&mut self.shards),
            outgoing: std::mem::take(&mut self.outgoing),
            writes: std::mem::replace(&mut self.writes, 0),
        })
    }

    fn trim_buffers(&mut self) {
        self.shards.shrink_to_fit();
        self.outgoing.shrink_to_fit();
    }

    fn ensure_phase(&self, operation: &'static str, expected: Phase) -> Result<(), EngineError> {
        if self.phase == expected {
            return Ok(());
        }
        Err(EngineError::InvalidPhase {
            operation,
            partition: self.partition_id,
            phase: self.phase.name(),
        })
    }

    fn metadata(&mut self, name: &str) -> Result<Arc<AggregationMetadata>, EngineError> {
        if let Some(metadata) = self.metadata_cache.get(name) {
            return Ok(Arc::clone(metadata));
        }
        let metadata = self.context.registry().metadata(name)?;
        self.metadata_cache
            .insert(name.to_string(), Arc::clone(&metadata));
        Ok(metadata)
    }

    fn write_value(
        &mut self,
        operation: &'static str,
        name: &str,
        key: AggKey,
        value: AggValue,
    ) -> Result<(), EngineError> {
        self.ensure_phase(operation, Phase::Computing)?;
        let metadata = self.metadata(name)?;
        if key.kind() != metadata.key_kind() {
            return Err(EngineError::KeyKindMismatch {
                aggregation: name.to_string(),
                expected: metadata.key_kind(),
                actual: key.kind(),
            });
        }
        if value.kind() != metadata.value_kind() {
            return Err(EngineError::KindMismatch {
                aggregation: name.to_string(),
                expected: metadata.value_kind(),
                actual: value.kind(),
            });
        }
        if !self.shards.contains_key(name) {
            let mut splits = Vec::with_capacity(metadata.num_splits());
            for split_id in 0..metadata.num_splits() {
                splits.push(self.context.factory().create_split(name, split_id)?);
            }
            self.shards.insert(name.to_string(), splits);
        }
        let split = split_of(&key, metadata.num_splits());
        let superstep = self.superstep;
        if let Some(splits) = self.shards.get_mut(name) {
            splits[split]
                .put(key, value)
                .map_err(|source| merge_error(name, superstep, source))?;
        }
        self.writes += 1;
        Ok(())
    }
}

impl WorkerEngine for PartitionEngine {
    fn partition_id(&self) -> usize {
        self.partition_id
    }

    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn superstep(&self) -> u64 {
        self.superstep
    }

    fn aggregate(&mut self, name: &str, value: AggValue) -> Result<(), EngineError> {
        self.write_value("aggregate", name, AggKey::Unit, value)
    }

    fn map(&mut self, name: &str, key: AggKey, value: AggValue) -> Result<(), EngineError> {
        self.write_value("map", name, key, value)
    }

    fn aggregated_value(&self, name: &str) -> Result<Arc<AggregateMap>, EngineError> {
        self.ensure_phase("aggregated_value", Phase::Computing)?;
        if !self.context.registry().is_registered(name) {
            return Err(EngineError::NotRegistered(name.to_string()));
        }
        Ok(read_lock(&self.published)
            .get(name)
            .map(Arc::clone)
            .unwrap_or_default())
    }

    fn emit_unit(&mut self, unit: u64) -> Result<(), EngineError> {
        self.ensure_phase("emit_unit", Phase::Computing)?;
        self.outgoing.push(unit);
        Ok(())
    }
}

/// Runs the whole job: superstep loop, barrier merges, frontier exchange,
/// and the finalization pass once halted.
pub struct SuperstepMaster {
    context: Arc<JobContext>,
    state: MasterState,
    superstep: u64,
    published: SharedPublished,
    carried: HashMap<String, AggregateMap>,
}

impl SuperstepMaster {
    pub fn new(context: Arc<JobContext>) -> Self {
        SuperstepMaster {
            context,
            state: MasterState::Running,
            superstep: 0,
            published: Arc::new(RwLock::new(HashMap::new())),
            carried: HashMap::new(),
        }
    }

    /// Drives `computation` to halt and runs finalization. Any partition,
    /// merge, or exchange failure aborts the job with the failing superstep
    /// still named in the error.
    pub fn run(&mut self, computation: &dyn Computation) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let mut last_info = Instant::now();
        let num_partitions = self.context.num_partitions();

        computation.register_aggregations(&self.context);
        info!(
            computation = computation.name(),
            num_partitions,
            strategy = %self.context.strategy(),
            "starting computation"
        );

        let mut engines: Vec<PartitionEngine> = (0..num_partitions)
            .map(|partition| {
                PartitionEngine::new(
                    partition,
                    num_partitions,
                    Arc::clone(&self.context),
                    Arc::clone(&self.published),
                )
            })
            .collect();
        let mut incoming: Vec<Vec<u64>> = (0..num_partitions)
            .map(|partition| normalize(computation.seed_units(partition, num_partitions)))
            .collect();

        let mut summary = RunSummary::default();

        while self.state != MasterState::Halted {
            let superstep = self.superstep;
            let step_started = Instant::now();

            self.state = MasterState::Running;
            let mut yields = run_partitions(&mut engines, &incoming, computation, superstep)?;

            self.state = MasterState::Barrier;
            let local_writes: u64 = yields.iter().map(|y| y.writes).sum();
            let merged_entries = self.merge_and_publish(&mut yields, superstep)?;

            let (next_incoming, emitted_units) =
                self.exchange_frontiers(&mut yields, num_partitions)?;
            incoming = next_incoming;

            if self.context.force_gc() {
                for engine in &mut engines {
                    engine.trim_buffers();
                }
                for map in self.carried.values_mut() {
                    map.shrink_to_fit();
                }
            }

            summary.supersteps = superstep + 1;
            summary.total_writes += local_writes;
            summary.total_units_exchanged += emitted_units as u64;

            let report = SuperstepReport {
                superstep,
                local_writes,
                emitted_units,
                merged_entries,
                elapsed: step_started.elapsed(),
            };
            debug!(
                superstep,
                local_writes, emitted_units, merged_entries, "superstep complete"
            );
            if last_info.elapsed() >= self.context.info_period() {
                info!(
                    superstep,
                    total_writes = summary.total_writes,
                    elapsed_secs = started.elapsed().as_secs(),
                    "computation progress"
                );
                last_info = Instant::now();
            }

            computation.master_step(self, &report)?;
            if self.state == MasterState::Halted {
                break;
            }
            self.superstep += 1;
        }

        self.state = MasterState::Halted;
        self.finalize()?;
        summary.elapsed = started.elapsed();
        info!(
            supersteps = summary.supersteps,
            total_writes = summary.total_writes,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "computation halted"
        );
        Ok(summary)
    }

    /// Folds every aggregation that received data this superstep and
    /// publishes the merged maps. Names with no fresh data keep their
    /// previous published value.
    fn merge_and_publish(
        &mut self,
        yields: &mut [PartitionYield],
        superstep: u64,
    ) -> Result<usize, EngineError> {
        let registry = Arc::clone(self.context.registry());
        let incremental = self.context.incremental_aggregation();
        let mut merged_entries = 0;

        for name in registry.registered_aggregations() {
            let metadata = registry.metadata(&name)?;
            let num_splits = metadata.num_splits();
            let mut per_split: Vec<Vec<AggregationStorage>> =
                (0..num_splits).map(|_| Vec::new()).collect();
            for partition_yield in yields.iter_mut() {
                if let Some(splits) = partition_yield.shards.remove(&name) {
                    for (split_id, shard) in splits.into_iter().enumerate() {
                        if !shard.is_empty() {
                            per_split[split_id].push(shard);
                        }
                    }
                }
            }
            if per_split.iter().all(Vec::is_empty) {
                continue;
            }

            let fresh = merge_splits(per_split)
                .map_err(|source| merge_error(&name, superstep, source))?;

            let mut snapshot = if metadata.is_persistent() {
                let carried = self.carried.entry(name.clone()).or_default();
                let reduce = metadata.reduce();
                if incremental {
                    for (key, value) in fresh {
                        fold_entry(carried, &reduce, key, value)
                            .map_err(|source| merge_error(&name, superstep, source))?;
                    }
                } else {
                    let mut rebuilt = carried.clone();
                    for (key, value) in fresh {
                        fold_entry(&mut rebuilt, &reduce, key, value)
                            .map_err(|source| merge_error(&name, superstep, source))?;
                    }
                    *carried = rebuilt;
                }
                carried.clone()
            } else {
                fresh
            };

            if let Some(end) = metadata.end_fn() {
                for value in snapshot.values_mut() {
                    *value =
                        end(value).map_err(|source| merge_error(&name, superstep, source))?;
                }
            }

            merged_entries += snapshot.len();
            debug!(
                aggregation = %name,
                entries = snapshot.len(),
                superstep,
                "published merged aggregation"
            );
            write_lock(&self.published).insert(name.clone(), Arc::new(snapshot));
        }
        Ok(merged_entries)
    }

    /// Routes every emitted unit to its owning partition and runs it through
    /// the job's wire codec, yielding each partition's next frontier.
    fn exchange_frontiers(
        &self,
        yields: &mut [PartitionYield],
        num_partitions: usize,
    ) -> Result<(Vec<Vec<u64>>, usize), EngineError> {
        let codec = self.context.frontier_codec();
        let mut outbound: Vec<Vec<Vec<u64>>> =
            vec![vec![Vec::new(); num_partitions]; num_partitions];
        let mut emitted = 0usize;
        for (source, partition_yield) in yields.iter_mut().enumerate() {
            for unit in partition_yield.outgoing.drain(..) {
                outbound[source][route(unit, num_partitions)].push(unit);
                emitted += 1;
            }
        }

        let mut next: Vec<Vec<u64>> = vec![Vec::new(); num_partitions];
        for source_frontiers in outbound {
            for (destination, units) in source_frontiers.into_iter().enumerate() {
                if units.is_empty() {
                    continue;
                }
                let bytes = codec.encode(&units)?;
                next[destination].extend(codec.decode(&bytes)?);
            }
        }
        for frontier in &mut next {
            *frontier = normalize(std::mem::take(frontier));
        }
        Ok((next, emitted))
    }

    /// Writes every persistent aggregation's published map as JSON lines
    /// under the configured output directory.
    fn finalize(&self) -> Result<(), EngineError> {
        if !self.context.output_active() {
            debug!("output inactive, skipping flush");
            return Ok(());
        }
        let registry = self.context.registry();
        let persistent: Vec<String> = registry
            .registered_aggregations()
            .into_iter()
            .filter(|name| {
                registry
                    .metadata(name)
                    .map(|metadata| metadata.is_persistent())
                    .unwrap_or(false)
            })
            .collect();
        if persistent.is_empty() {
            return Ok(());
        }

        let dir = Path::new(self.context.output_path());
        fs::create_dir_all(dir).map_err(|source| flush_error(dir, source))?;
        for name in persistent {
            let Some(map) = read_lock(&self.published).get(&name).map(Arc::clone) else {
                continue;
            };
            let path = dir.join(format!("{name}.jsonl"));
            let mut file =
                BufWriter::new(File::create(&path).map_err(|source| flush_error(&path, source))?);
            for (key, value) in map.iter() {
                let line = serde_json::json!({ "key": key, "value": value });
                writeln!(file, "{line}").map_err(|source| flush_error(&path, source))?;
            }
            file.flush().map_err(|source| flush_error(&path, source))?;
            info!(
                aggregation = %name,
                entries = map.len(),
                path = %path.display(),
                "flushed aggregation output"
            );
        }
        Ok(())
    }
}

impl MasterEngine for SuperstepMaster {
    fn superstep(&self) -> u64 {
        self.superstep
    }

    fn halt_computation(&mut self) {
        if self.state != MasterState::Halted {
            info!(superstep = self.superstep, "halt requested");
            self.state = MasterState::Halted;
        }
    }

    fn is_halted(&self) -> bool {
        self.state == MasterState::Halted
    }

    fn aggregated_value(&self, name: &str) -> Result<Arc<AggregateMap>, EngineError> {
        if !self.context.registry().is_registered(name) {
            return Err(EngineError::NotRegistered(name.to_string()));
        }
        Ok(read_lock(&self.published)
            .get(name)
            .map(Arc::clone)
            .unwrap_or_default())
    }

    fn set_aggregated_value(
        &mut self,
        name: &str,
        key: AggKey,
        value: AggValue,
    ) -> Result<(), EngineError> {
        let metadata = self.context.registry().metadata(name)?;
        if key.kind() != metadata.key_kind() {
            return Err(EngineError::KeyKindMismatch {
                aggregation: name.to_string(),
                expected: metadata.key_kind(),
                actual: key.kind(),
            });
        }
        if value.kind() != metadata.value_kind() {
            return Err(EngineError::KindMismatch {
                aggregation: name.to_string(),
                expected: metadata.value_kind(),
                actual: value.kind(),
            });
        }
        let mut published = write_lock(&self.published);
        let entry = published
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AggregateMap::new()));
        let mut map = (**entry).clone();
        map.insert(key, value);
        *entry = Arc::new(map);
        Ok(())
    }
}

/// Fans one superstep out across all partitions, one scoped thread each,
/// and joins them. A panicking partition fails the superstep.
fn run_partitions(
    engines: &mut [PartitionEngine],
    incoming: &[Vec<u64>],
    computation: &dyn Computation,
    superstep: u64,
) -> Result<Vec<PartitionYield>, EngineError> {
    let results: Vec<Result<PartitionYield, EngineError>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(engines.len());
        for (engine, units) in engines.iter_mut().zip(incoming) {
            handles.push(scope.spawn(move || {
                engine.begin_superstep(superstep);
                computation.compute(&mut *engine, units)?;
                engine.finish_computing()
            }));
        }
        handles
            .into_iter()
            .enumerate()
            .map(|(partition, handle)| {
                handle.join().unwrap_or_else(|payload| {
                    Err(EngineError::PartitionFailed {
                        partition,
                        superstep,
                        message: panic_message(payload),
                    })
                })
            })
            .collect()
    });
    results.into_iter().collect()
}

/// Folds each split's shards into a map, splits in parallel, then unions
/// the split maps. Splits never share keys, so the union is a plain extend.
fn merge_splits(per_split: Vec<Vec<AggregationStorage>>) -> Result<AggregateMap, ReduceError> {
    if per_split.len() == 1 {
        return fold_shards(per_split.into_iter().next().unwrap_or_default());
    }
    let folded: Vec<Result<AggregateMap, ReduceError>> = thread::scope(|scope| {
        let handles: Vec<_> = per_split
            .into_iter()
            .map(|shards| scope.spawn(move || fold_shards(shards)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(Err(ReduceError::WorkerPanicked)))
            .collect()
    });
    let mut merged = AggregateMap::new();
    for result in folded {
        merged.extend(result?);
    }
    Ok(merged)
}

fn fold_shards(mut shards: Vec<AggregationStorage>) -> Result<AggregateMap, ReduceError> {
    let mut base = match shards.pop() {
        Some(shard) => shard,
        None => return Ok(AggregateMap::new()),
    };
    for shard in shards {
        base.merge_from(shard)?;
    }
    base.into_entries()
}
