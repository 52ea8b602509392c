pub mod config;
pub mod workload;

use crate::config::JobConfig;
use crate::workload::WordFrequency;
use anyhow::{bail, Context, Result};
use clap::Parser;
use lockstep_core::engine::MasterEngine;
use lockstep_core::{AggKey, AggValue, JobContext, SuperstepMaster};
use std::fs;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(about = "Superstep-synchronized aggregation engine")]
struct Cli {
    /// Path to the TOML job file
    config: String,
}

fn run_job(config_path: &str) -> Result<()> {
    let job = JobConfig::load(config_path)?;
    if job.job.execution != "local" {
        bail!("unsupported execution mode `{}`", job.job.execution);
    }
    let input = match &job.job.input {
        Some(path) => path.clone(),
        None => bail!("no input file configured under [job]"),
    };

    let context = JobContext::new(job.engine.clone())?;
    lockstep_core::context::set_current_if_unset(Arc::clone(&context));

    let text =
        fs::read_to_string(&input).with_context(|| format!("reading input file {input}"))?;
    let workload = WordFrequency::from_text(&text);
    info!(
        input_path = %input,
        lines = workload.num_lines(),
        "Loaded input"
    );

    let mut master = SuperstepMaster::new(Arc::clone(&context));
    let run_result = master.run(&workload);
    lockstep_core::context::unset_current();
    let summary = run_result?;

    let counts = master.aggregated_value(WordFrequency::AGGREGATION)?;
    let mut top: Vec<(String, i64)> = counts
        .iter()
        .filter_map(|(key, value)| match (key, value) {
            (AggKey::Text(word), AggValue::Int(count)) => Some((word.clone(), *count)),
            _ => None,
        })
        .collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top.truncate(10);
    for (word, count) in &top {
        info!(word = %word, count, "Top word");
    }

    info!(
        supersteps = summary.supersteps,
        total_writes = summary.total_writes,
        distinct_words = counts.len(),
        duration_secs = summary.elapsed.as_secs_f64(),
        "Job Complete"
    );
    Ok(())
}

fn main() {
    // Initialize structured logging
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();
    if let Err(e) = run_job(&cli.config) {
        error!(error = %e, "Fatal Error");
        std::process::exit(1);
    }
}
