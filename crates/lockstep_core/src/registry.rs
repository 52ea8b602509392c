//! Aggregation registry, metadata, and the storage factory.
//!
//! Registration is idempotent with first-wins semantics: the first call for
//! a name fixes the aggregation's metadata for the lifetime of the job, and
//! later calls with the same name are ignored. Storages are only ever built
//! through the factory, from registered metadata.

use crate::aggregation::{AggregationStorage, StorageKind};
use crate::error::EngineError;
use crate::value::{EndFn, KeyKind, Reduction, ValueKind};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Name of one shard of a split aggregation. Split shards of the same
/// aggregation never share keys, so the barrier can fold them in parallel.
pub fn split_name(name: &str, split_id: usize) -> String {
    format!("{name}_{split_id}")
}

/// Everything registration fixes about one named aggregation.
pub struct AggregationMetadata {
    name: String,
    storage_kind: StorageKind,
    key_kind: KeyKind,
    value_kind: ValueKind,
    persistent: bool,
    num_splits: usize,
    reduce: Reduction,
    end_fn: Option<EndFn>,
}

impl AggregationMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.storage_kind
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    pub fn value_kind(&self) -> ValueKind {
        self.value_kind
    }

    /// Persistent aggregations carry their merged map across supersteps and
    /// are flushed to output at finalization. Non-persistent ones are
    /// rebuilt from scratch every superstep.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn num_splits(&self) -> usize {
        self.num_splits
    }

    pub fn reduce(&self) -> Reduction {
        Arc::clone(&self.reduce)
    }

    pub fn end_fn(&self) -> Option<EndFn> {
        self.end_fn.as_ref().map(Arc::clone)
    }
}

impl std::fmt::Debug for AggregationMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationMetadata")
            .field("name", &self.name)
            .field("storage_kind", &self.storage_kind)
            .field("key_kind", &self.key_kind)
            .field("value_kind", &self.value_kind)
            .field("persistent", &self.persistent)
            .field("num_splits", &self.num_splits)
            .field("end_fn", &self.end_fn.is_some())
            .finish()
    }
}

/// Name-keyed map of registered aggregations. Shared read-mostly across
/// partitions; writes only happen during job setup.
pub struct AggregationRegistry {
    entries: RwLock<HashMap<String, Arc<AggregationMetadata>>>,
    default_splits: usize,
}

impl AggregationRegistry {
    pub fn new(default_splits: usize) -> Self {
        AggregationRegistry {
            entries: RwLock::new(HashMap::new()),
            default_splits: default_splits.max(1),
        }
    }

    /// Canonical registration. Every convenience form funnels here.
    ///
    /// `end_fn` defaults to identity (no transform) and `num_splits` to the
    /// configured default split count. A name that is already registered is
    /// left untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        name: &str,
        storage_kind: StorageKind,
        key_kind: KeyKind,
        value_kind: ValueKind,
        persistent: bool,
        reduce: Reduction,
        end_fn: Option<EndFn>,
        num_splits: Option<usize>,
    ) {
        let mut entries = write_lock(&self.entries);
        if entries.contains_key(name) {
            debug!(aggregation = name, "already registered, keeping first registration");
            return;
        }
        let metadata = AggregationMetadata {
            name: name.to_string(),
            storage_kind,
            key_kind,
            value_kind,
            persistent,
            num_splits: num_splits.unwrap_or(self.default_splits).max(1),
            reduce,
            end_fn,
        };
        debug!(aggregation = name, ?metadata, "registered aggregation");
        entries.insert(name.to_string(), Arc::new(metadata));
    }

    /// Default storage, identity end function, default split count.
    pub fn register_simple(
        &self,
        name: &str,
        key_kind: KeyKind,
        value_kind: ValueKind,
        persistent: bool,
        reduce: Reduction,
    ) {
        self.register(
            name,
            StorageKind::default(),
            key_kind,
            value_kind,
            persistent,
            reduce,
            None,
            None,
        );
    }

    /// Default storage and split count, explicit end-aggregation function.
    pub fn register_with_end(
        &self,
        name: &str,
        key_kind: KeyKind,
        value_kind: ValueKind,
        persistent: bool,
        reduce: Reduction,
        end_fn: EndFn,
    ) {
        self.register(
            name,
            StorageKind::default(),
            key_kind,
            value_kind,
            persistent,
            reduce,
            Some(end_fn),
            None,
        );
    }

    pub fn metadata(&self, name: &str) -> Result<Arc<AggregationMetadata>, EngineError> {
        read_lock(&self.entries)
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| EngineError::NotRegistered(name.to_string()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        read_lock(&self.entries).contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn registered_aggregations(&self) -> Vec<String> {
        let mut names: Vec<String> = read_lock(&self.entries).keys().cloned().collect();
        names.sort();
        names
    }
}

/// Builds empty storage shards from registered metadata.
pub struct AggregationStorageFactory {
    registry: Arc<AggregationRegistry>,
    eager_writes: bool,
}

impl AggregationStorageFactory {
    pub fn new(registry: Arc<AggregationRegistry>, eager_writes: bool) -> Self {
        AggregationStorageFactory {
            registry,
            eager_writes,
        }
    }

    /// Fresh empty shard for `name`, typed per its metadata. Fails if the
    /// name was never registered.
    pub fn create(&self, name: &str) -> Result<AggregationStorage, EngineError> {
        let metadata = self.registry.metadata(name)?;
        Ok(self.build(name, &metadata))
    }

    /// Fresh empty shard for one split of `name`.
    pub fn create_split(
        &self,
        name: &str,
        split_id: usize,
    ) -> Result<AggregationStorage, EngineError> {
        let metadata = self.registry.metadata(name)?;
        Ok(self.build(&split_name(name, split_id), &metadata))
    }

    fn build(&self, shard_name: &str, metadata: &AggregationMetadata) -> AggregationStorage {
        match metadata.storage_kind() {
            StorageKind::InMemory => AggregationStorage::new(
                shard_name,
                metadata.key_kind(),
                metadata.value_kind(),
                metadata.reduce(),
                self.eager_writes,
            ),
        }
    }
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
