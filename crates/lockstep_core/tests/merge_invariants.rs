//! Order and sharding invariance of the merge fold.
//!
//! The barrier folds shards pairwise in whatever order suits it, so a
//! reduction's result must survive write permutation, arbitrary shard
//! assignment, and any shard count. These tests drive the storage layer
//! directly with seeded randomness.

use lockstep_core::aggregation::{split_of, AggregationStorage};
use lockstep_core::registry::{AggregationRegistry, AggregationStorageFactory};
use lockstep_core::value::{max, sum, KeyKind, ValueKind};
use lockstep_core::{AggKey, AggValue};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;

fn counter_shard(name: &str) -> AggregationStorage {
    AggregationStorage::new(name, KeyKind::Text, ValueKind::Int, sum(), true)
}

/// Folds `shards` into one map, consuming them in their current order.
fn fold_in_order(mut shards: Vec<AggregationStorage>) -> HashMap<AggKey, AggValue> {
    let mut base = shards.pop().expect("at least one shard");
    for shard in shards {
        base.merge_from(shard).unwrap();
    }
    base.into_entries().unwrap()
}

#[test]
fn test_merged_count_survives_permutation_and_arbitrary_sharding() {
    const WRITES: usize = 1_000;
    const SHARDS: usize = 4;

    for seed in 0..5u64 {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut shards: Vec<AggregationStorage> =
            (0..SHARDS).map(|i| counter_shard(&format!("count_{i}"))).collect();
        let mut assignments: Vec<usize> =
            (0..WRITES).map(|_| rng.gen_range(0..SHARDS)).collect();
        assignments.shuffle(&mut rng);

        for shard_index in assignments {
            shards[shard_index]
                .put(AggKey::Text("k".into()), AggValue::Int(1))
                .unwrap();
        }

        shards.shuffle(&mut rng);
        let merged = fold_in_order(shards);
        assert_eq!(
            merged.get(&AggKey::Text("k".into())),
            Some(&AggValue::Int(WRITES as i64)),
            "seed {seed}"
        );
    }
}

#[test]
fn test_merge_result_is_independent_of_shard_count() {
    const WRITES: usize = 300;

    // Deterministic mixed-key workload.
    let writes: Vec<(AggKey, AggValue)> = (0..WRITES)
        .map(|i| {
            (
                AggKey::Text(format!("w{}", i % 17)),
                AggValue::Int((i % 5) as i64 + 1),
            )
        })
        .collect();

    let mut reference: Option<HashMap<AggKey, AggValue>> = None;
    for shard_count in [1usize, 2, 8] {
        let mut shards: Vec<AggregationStorage> =
            (0..shard_count).map(|i| counter_shard(&format!("count_{i}"))).collect();
        for (i, (key, value)) in writes.iter().enumerate() {
            shards[i % shard_count].put(key.clone(), value.clone()).unwrap();
        }
        let merged = fold_in_order(shards);
        match &reference {
            None => reference = Some(merged),
            Some(expected) => {
                assert_eq!(&merged, expected, "shard count {shard_count}");
            }
        }
    }
}

#[test]
fn test_registered_splits_partition_keys_disjointly() {
    const SPLITS: usize = 4;
    const KEYS: usize = 200;

    let registry = Arc::new(AggregationRegistry::new(1));
    registry.register(
        "ranked",
        Default::default(),
        KeyKind::Text,
        ValueKind::Int,
        false,
        sum(),
        None,
        Some(SPLITS),
    );
    let factory = AggregationStorageFactory::new(Arc::clone(&registry), true);

    let mut splits: Vec<AggregationStorage> = (0..SPLITS)
        .map(|split_id| factory.create_split("ranked", split_id).unwrap())
        .collect();
    let mut single = counter_shard("ranked_all");

    for i in 0..KEYS {
        let key = AggKey::Text(format!("key{i}"));
        let value = AggValue::Int(i as i64);
        splits[split_of(&key, SPLITS)].put(key.clone(), value.clone()).unwrap();
        single.put(key, value).unwrap();
    }

    // Splits never share keys, so their union must be a plain disjoint merge
    // equal to the unsharded fold.
    let mut union: HashMap<AggKey, AggValue> = HashMap::new();
    let mut total = 0;
    for split in splits {
        let entries = split.into_entries().unwrap();
        total += entries.len();
        union.extend(entries);
    }
    assert_eq!(union.len(), total, "split maps must be key-disjoint");
    assert_eq!(union, single.into_entries().unwrap());
}

#[test]
fn test_max_reduction_is_order_insensitive() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut values: Vec<i64> = (0..64).map(|_| rng.gen_range(-1_000..1_000)).collect();
    let expected = values.iter().copied().max().unwrap_or(i64::MIN);

    let reduce = max();
    for _ in 0..4 {
        values.shuffle(&mut rng);
        let mut shard =
            AggregationStorage::new("peak", KeyKind::Unit, ValueKind::Int, Arc::clone(&reduce), true);
        for &value in &values {
            shard.put(AggKey::Unit, AggValue::Int(value)).unwrap();
        }
        assert_eq!(shard.get(&AggKey::Unit), Some(&AggValue::Int(expected)));
    }
}
