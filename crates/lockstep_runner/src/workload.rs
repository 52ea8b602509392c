//! Word frequency counting over a line-partitioned text.
//!
//! Each work unit is one line of the input. Partitions tokenize their lines
//! in superstep 0 and fold `(word, 1)` pairs into a persistent keyed
//! aggregation; the barrier merges the partition shards into the global
//! counts. Superstep 1 produces no writes, which is the halt signal.

use lockstep_core::engine::{Computation, MasterEngine, SuperstepReport, WorkerEngine};
use lockstep_core::error::EngineError;
use lockstep_core::value::{sum, KeyKind, ValueKind};
use lockstep_core::{AggKey, AggValue, JobContext};
use tracing::debug;

pub struct WordFrequency {
    lines: Vec<String>,
}

impl WordFrequency {
    /// Keyed word to occurrence-count aggregation, flushed at finalization.
    pub const AGGREGATION: &'static str = "word_freq";
    /// Scalar running total of words seen.
    pub const TOTAL: &'static str = "total_words";

    pub fn from_text(text: &str) -> Self {
        WordFrequency {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    fn tokens(line: &str) -> impl Iterator<Item = String> + '_ {
        line.split_whitespace()
            .map(|word| {
                word.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|word| !word.is_empty())
    }
}

impl Computation for WordFrequency {
    fn name(&self) -> &str {
        "word_frequency"
    }

    fn register_aggregations(&self, context: &JobContext) {
        context.registry().register_simple(
            Self::AGGREGATION,
            KeyKind::Text,
            ValueKind::Int,
            true,
            sum(),
        );
        context
            .registry()
            .register_simple(Self::TOTAL, KeyKind::Unit, ValueKind::Int, false, sum());
    }

    fn seed_units(&self, partition_id: usize, num_partitions: usize) -> Vec<u64> {
        (0..self.lines.len() as u64)
            .filter(|line| *line as usize % num_partitions == partition_id)
            .collect()
    }

    fn compute(&self, engine: &mut dyn WorkerEngine, units: &[u64]) -> Result<(), EngineError> {
        for &unit in units {
            let Some(line) = self.lines.get(unit as usize) else {
                continue;
            };
            let mut words_in_line = 0i64;
            for word in Self::tokens(line) {
                engine.map(Self::AGGREGATION, AggKey::Text(word), AggValue::Int(1))?;
                words_in_line += 1;
            }
            if words_in_line > 0 {
                engine.aggregate(Self::TOTAL, AggValue::Int(words_in_line))?;
            }
        }
        Ok(())
    }

    fn master_step(
        &self,
        master: &mut dyn MasterEngine,
        report: &SuperstepReport,
    ) -> Result<(), EngineError> {
        debug!(
            superstep = report.superstep,
            merged_entries = report.merged_entries,
            "word frequency barrier"
        );
        if report.local_writes == 0 {
            master.halt_computation();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::{EngineConfig, SuperstepMaster};
    use std::sync::Arc;

    const SAMPLE: &str = "the quick brown fox\njumps over the lazy dog\nThe fox again.";

    fn run_sample(config: EngineConfig) -> (SuperstepMaster, lockstep_core::engine::RunSummary) {
        let context = lockstep_core::JobContext::new(config).unwrap();
        let workload = WordFrequency::from_text(SAMPLE);
        let mut master = SuperstepMaster::new(Arc::clone(&context));
        let summary = master.run(&workload).unwrap();
        (master, summary)
    }

    #[test]
    fn test_tokens_normalize_case_and_punctuation() {
        let words: Vec<String> = WordFrequency::tokens("The fox, again!").collect();
        assert_eq!(words, vec!["the", "fox", "again"]);
    }

    #[test]
    fn test_seed_units_cover_all_lines_once() {
        let workload = WordFrequency::from_text(SAMPLE);
        let mut seen: Vec<u64> = (0..4)
            .flat_map(|partition| workload.seed_units(partition, 4))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_counts_merge_across_partitions_and_halt_follows_quiet_superstep() {
        let mut config = EngineConfig::default();
        config.engine.num_partitions = 3;
        config.output.active = false;
        let (master, summary) = run_sample(config);

        // Writes happen in superstep 0 only; superstep 1 is quiet and halts.
        assert_eq!(summary.supersteps, 2);
        assert!(master.is_halted());

        let counts = master.aggregated_value(WordFrequency::AGGREGATION).unwrap();
        assert_eq!(
            counts.get(&AggKey::Text("the".into())),
            Some(&AggValue::Int(3))
        );
        assert_eq!(
            counts.get(&AggKey::Text("fox".into())),
            Some(&AggValue::Int(2))
        );
        assert_eq!(
            counts.get(&AggKey::Text("dog".into())),
            Some(&AggValue::Int(1))
        );

        let total = master.aggregated_value(WordFrequency::TOTAL).unwrap();
        assert_eq!(total.get(&AggKey::Unit), Some(&AggValue::Int(12)));
    }

    #[test]
    fn test_finalization_flushes_persistent_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.engine.num_partitions = 2;
        config.output.path = dir.path().join("out").display().to_string();
        let (_, _) = run_sample(config);

        let flushed =
            std::fs::read_to_string(dir.path().join("out").join("word_freq.jsonl")).unwrap();
        // One JSON line per distinct word.
        assert_eq!(flushed.lines().count(), 9);
        assert!(flushed.contains("fox"));
    }
}
