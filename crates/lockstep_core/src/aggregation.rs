//! Partition-local aggregation storage and the shard merge fold.
//!
//! Each partition owns its shards exclusively while computing, so writes are
//! lock-free. The barrier is the only reader of multiple shards: it folds
//! them pairwise per key, in any order, which is why reductions must be
//! associative and commutative.

use crate::error::{EngineError, ReduceError};
use crate::value::{AggKey, AggValue, KeyKind, Reduction, ValueKind};
use std::collections::HashMap;

/// Storage implementation selector. A single in-memory variant today; the
/// name is resolved from configuration so alternatives can slot in without
/// touching registration call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    #[default]
    InMemory,
}

impl StorageKind {
    pub fn parse(name: &str) -> Result<Self, EngineError> {
        match name {
            "in_memory" => Ok(StorageKind::InMemory),
            other => Err(EngineError::UnsupportedStorage(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::InMemory => "in_memory",
        }
    }
}

/// Routes a key to one of `num_splits` disjoint shards of the same
/// aggregation. Stable across partitions and runs.
pub fn split_of(key: &AggKey, num_splits: usize) -> usize {
    if num_splits <= 1 {
        return 0;
    }
    (key.route_hash() % num_splits as u64) as usize
}

/// Folds `value` into `map` under `key`: absent key takes the value as-is,
/// present key goes through the reduction.
pub(crate) fn fold_entry(
    map: &mut HashMap<AggKey, AggValue>,
    reduce: &Reduction,
    key: AggKey,
    value: AggValue,
) -> Result<(), ReduceError> {
    match map.get_mut(&key) {
        Some(existing) => {
            *existing = reduce(existing, &value)?;
        }
        None => {
            map.insert(key, value);
        }
    }
    Ok(())
}

/// One shard of one named aggregation: a key-value map folded with the
/// aggregation's reduction function.
///
/// Two write modes. Eager mode reduces each write into the map immediately,
/// keeping the shard small at the cost of a reduction per write. Buffered
/// mode appends raw writes and folds them on [`consolidate`], trading memory
/// for cheaper hot-loop writes. Both modes produce identical merged results.
///
/// [`consolidate`]: AggregationStorage::consolidate
pub struct AggregationStorage {
    name: String,
    key_kind: KeyKind,
    value_kind: ValueKind,
    reduce: Reduction,
    entries: HashMap<AggKey, AggValue>,
    pending: Vec<(AggKey, AggValue)>,
    eager: bool,
}

impl AggregationStorage {
    pub fn new(
        name: impl Into<String>,
        key_kind: KeyKind,
        value_kind: ValueKind,
        reduce: Reduction,
        eager: bool,
    ) -> Self {
        AggregationStorage {
            name: name.into(),
            key_kind,
            value_kind,
            reduce,
            entries: HashMap::new(),
            pending: Vec::new(),
            eager,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    pub fn value_kind(&self) -> ValueKind {
        self.value_kind
    }

    /// Folds `value` into the slot for `key`. Absent key takes the value
    /// as-is; present key goes through the reduction.
    pub fn put(&mut self, key: AggKey, value: AggValue) -> Result<(), ReduceError> {
        if !self.eager {
            self.pending.push((key, value));
            return Ok(());
        }
        fold_entry(&mut self.entries, &self.reduce, key, value)
    }

    /// Folds buffered writes into the map. No-op in eager mode. Must run
    /// before this shard is read or merged.
    pub fn consolidate(&mut self) -> Result<(), ReduceError> {
        for (key, value) in std::mem::take(&mut self.pending) {
            fold_entry(&mut self.entries, &self.reduce, key, value)?;
        }
        Ok(())
    }

    /// Folds every entry of `other` into this shard. A key present on only
    /// one side passes through untouched, matching a pairwise fold over the
    /// key union.
    pub fn merge_from(&mut self, mut other: AggregationStorage) -> Result<(), ReduceError> {
        other.consolidate()?;
        for (key, value) in other.entries.drain() {
            fold_entry(&mut self.entries, &self.reduce, key, value)?;
        }
        Ok(())
    }

    pub fn get(&self, key: &AggKey) -> Option<&AggValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AggKey, &AggValue)> {
        self.entries.iter()
    }

    pub fn into_entries(mut self) -> Result<HashMap<AggKey, AggValue>, ReduceError> {
        self.consolidate()?;
        Ok(self.entries)
    }

    /// Drops all contents. With `shrink`, also returns the backing capacity
    /// to the allocator instead of keeping it warm for the next superstep.
    pub fn clear(&mut self, shrink: bool) {
        self.entries.clear();
        self.pending.clear();
        if shrink {
            self.entries.shrink_to_fit();
            self.pending.shrink_to_fit();
        }
    }
}

impl std::fmt::Debug for AggregationStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationStorage")
            .field("name", &self.name)
            .field("key_kind", &self.key_kind)
            .field("value_kind", &self.value_kind)
            .field("entries", &self.entries.len())
            .field("pending", &self.pending.len())
            .field("eager", &self.eager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::sum;

    fn counter_shard(name: &str, eager: bool) -> AggregationStorage {
        AggregationStorage::new(name, KeyKind::Text, ValueKind::Int, sum(), eager)
    }

    #[test]
    fn test_put_folds_repeated_keys() {
        let mut shard = counter_shard("counts_0", true);
        for _ in 0..5 {
            shard.put(AggKey::Text("the".into()), AggValue::Int(1)).unwrap();
        }
        assert_eq!(shard.get(&AggKey::Text("the".into())), Some(&AggValue::Int(5)));
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_buffered_mode_matches_eager_mode() {
        let mut eager = counter_shard("counts_0", true);
        let mut buffered = counter_shard("counts_0", false);
        for i in 0..100i64 {
            let key = AggKey::Int(i % 7);
            eager.put(key.clone(), AggValue::Int(i)).unwrap();
            buffered.put(key, AggValue::Int(i)).unwrap();
        }
        buffered.consolidate().unwrap();
        for i in 0..7 {
            let key = AggKey::Int(i);
            assert_eq!(eager.get(&key), buffered.get(&key));
        }
    }

    #[test]
    fn test_merge_unions_keys_and_folds_overlap() {
        let mut left = counter_shard("counts_0", true);
        let mut right = counter_shard("counts_0", true);
        left.put(AggKey::Text("shared".into()), AggValue::Int(3)).unwrap();
        left.put(AggKey::Text("only_left".into()), AggValue::Int(1)).unwrap();
        right.put(AggKey::Text("shared".into()), AggValue::Int(4)).unwrap();
        right.put(AggKey::Text("only_right".into()), AggValue::Int(2)).unwrap();

        left.merge_from(right).unwrap();
        assert_eq!(left.get(&AggKey::Text("shared".into())), Some(&AggValue::Int(7)));
        assert_eq!(left.get(&AggKey::Text("only_left".into())), Some(&AggValue::Int(1)));
        assert_eq!(left.get(&AggKey::Text("only_right".into())), Some(&AggValue::Int(2)));
    }

    #[test]
    fn test_merging_empty_shard_changes_nothing() {
        let mut shard = counter_shard("counts_0", true);
        shard.put(AggKey::Unit, AggValue::Int(9)).unwrap();
        shard.merge_from(counter_shard("counts_0", true)).unwrap();
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.get(&AggKey::Unit), Some(&AggValue::Int(9)));
    }

    #[test]
    fn test_into_entries_folds_buffered_writes() {
        let mut shard = counter_shard("counts_0", false);
        shard.put(AggKey::Text("a".into()), AggValue::Int(10)).unwrap();
        shard.put(AggKey::Text("a".into()), AggValue::Int(20)).unwrap();
        let entries = shard.into_entries().unwrap();
        assert_eq!(entries.get(&AggKey::Text("a".into())), Some(&AggValue::Int(30)));
    }

    #[test]
    fn test_split_routing_is_disjoint_and_stable() {
        let keys: Vec<AggKey> = (0..64).map(|i| AggKey::Int(i)).collect();
        for key in &keys {
            let split = split_of(key, 4);
            assert!(split < 4);
            assert_eq!(split, split_of(key, 4));
        }
        assert_eq!(split_of(&AggKey::Text("x".into()), 1), 0);
    }

    #[test]
    fn test_unsupported_storage_name_fails() {
        assert_eq!(StorageKind::parse("in_memory").unwrap(), StorageKind::InMemory);
        assert!(matches!(
            StorageKind::parse("columnar"),
            Err(EngineError::UnsupportedStorage(_))
        ));
    }
}
