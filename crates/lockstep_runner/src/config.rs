use anyhow::{Context, Result};
use lockstep_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;

/// One job file: the `[job]` section owned by the launcher plus the engine
/// sections passed through to the core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobConfig {
    #[serde(default)]
    pub job: JobSection,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSection {
    /// Execution mode; only "local" is supported
    #[serde(default = "default_execution")]
    pub execution: String,
    /// Text file the word frequency workload reads
    #[serde(default)]
    pub input: Option<String>,
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            execution: default_execution(),
            input: None,
        }
    }
}

fn default_execution() -> String {
    "local".to_string()
}

impl JobConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("reading job file {path}"))?;
        let config: JobConfig =
            toml::from_str(&content).with_context(|| format!("parsing job file {path}"))?;
        Ok(config)
    }
}
