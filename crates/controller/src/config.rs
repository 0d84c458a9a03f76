//! Controller configuration
//!
//! Loaded from an optional TOML file (`DRS_CONFIG`, default
//! `drs-controller.toml`) layered under `DRS__`-prefixed environment
//! variables, e.g. `DRS__API_PORT=9000` or `DRS__ALLOC__WINDOW_SIZE=5`.

use anyhow::{bail, Context, Result};
use controller_lib::control::DecisionPolicy;
use controller_lib::{AllocConfig, AllocationMap, Topology, TopologySpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "drs-controller.toml";

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Identifier attached to every log event
    #[serde(default = "default_controller_id")]
    pub controller_id: String,

    /// API server port for samples, decisions, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Evaluation interval in seconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Executor budget for processing stages
    pub max_available_executors: i64,

    #[serde(default)]
    pub decision_policy: DecisionPolicy,

    pub topology: TopologySpec,

    /// Allocation the pipeline starts with, one entry per stage
    pub initial_allocation: AllocationMap,

    #[serde(default)]
    pub alloc: AllocConfig,
}

fn default_controller_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "drs-controller".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_tick_interval() -> u64 {
    10
}

impl ControllerConfig {
    /// Load configuration from the file named by `DRS_CONFIG` and the environment
    pub fn load() -> Result<Self> {
        match std::env::var_os("DRS_CONFIG") {
            Some(path) => Self::load_from(&PathBuf::from(path), true),
            None => Self::load_from(Path::new(DEFAULT_CONFIG_PATH), false),
        }
    }

    /// Load configuration from `path`, which may be absent unless `required`
    pub fn load_from(path: &Path, required: bool) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(required))
            .add_source(
                config::Environment::with_prefix("DRS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        let config: ControllerConfig = settings
            .try_deserialize()
            .context("invalid controller configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the controller cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.max_available_executors < 0 {
            bail!(
                "max_available_executors must not be negative, got {}",
                self.max_available_executors
            );
        }
        if u32::try_from(self.max_available_executors).is_err() {
            bail!(
                "max_available_executors is too large: {}",
                self.max_available_executors
            );
        }
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be positive");
        }
        self.alloc.validate().context("invalid alloc settings")?;

        let topology = self.build_topology()?;
        if let Some(stage) = topology
            .all_stages()
            .find(|id| !self.initial_allocation.contains_key(*id))
        {
            bail!("initial_allocation has no entry for stage '{}'", stage);
        }
        Ok(())
    }

    /// Validated topology
    pub fn build_topology(&self) -> Result<Topology> {
        Topology::from_spec(&self.topology).context("invalid topology")
    }

    /// Executor budget as the engine takes it
    pub fn budget(&self) -> Result<u32> {
        u32::try_from(self.max_available_executors)
            .with_context(|| format!("invalid executor budget {}", self.max_available_executors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
controller_id = "drs-test"
api_port = 9100
tick_interval_secs = 5
max_available_executors = 8
decision_policy = "minimal"

[topology]
sources = [{ id = "spout", downstream = ["parse"] }]
stages = [
    { id = "parse", downstream = ["count"] },
    { id = "count" },
]

[initial_allocation]
spout = 1
parse = 2
count = 2

[alloc]
window_size = 4
target_latency_ms = 120.0
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(CONFIG);
        let config = tokio_test::assert_ok!(ControllerConfig::load_from(file.path(), true));

        assert_eq!(config.controller_id, "drs-test");
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.tick_interval_secs, 5);
        assert_eq!(config.budget().unwrap(), 8);
        assert_eq!(config.decision_policy, DecisionPolicy::Minimal);
        assert_eq!(config.initial_allocation["parse"], 2);
        assert_eq!(config.alloc.window_size, 4);
        assert_eq!(config.alloc.target_latency_ms, 120.0);
        assert_eq!(config.build_topology().unwrap().stage_count(), 3);
    }

    #[test]
    fn test_defaults_applied() {
        let minimal = CONFIG
            .replace("api_port = 9100\n", "")
            .replace("tick_interval_secs = 5\n", "")
            .replace("decision_policy = \"minimal\"\n", "");
        let file = write_config(&minimal);
        let config = ControllerConfig::load_from(file.path(), true).unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.tick_interval_secs, 10);
        assert_eq!(config.decision_policy, DecisionPolicy::BestEffort);
    }

    #[test]
    fn test_negative_budget_rejected() {
        let file = write_config(&CONFIG.replace(
            "max_available_executors = 8",
            "max_available_executors = -1",
        ));
        let err = ControllerConfig::load_from(file.path(), true).unwrap_err();
        assert!(err.to_string().contains("must not be negative"));
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let file = write_config(&CONFIG.replace(
            "tick_interval_secs = 5",
            "tick_interval_secs = 0",
        ));
        assert!(ControllerConfig::load_from(file.path(), true).is_err());
    }

    #[test]
    fn test_missing_initial_allocation_rejected() {
        let file = write_config(&CONFIG.replace("count = 2\n", ""));
        let err = ControllerConfig::load_from(file.path(), true).unwrap_err();
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn test_invalid_topology_rejected() {
        let file = write_config(&CONFIG.replace(
            "{ id = \"count\" },",
            "{ id = \"count\", downstream = [\"parse\"] },",
        ));
        assert!(ControllerConfig::load_from(file.path(), true).is_err());
    }

    #[test]
    fn test_required_file_must_exist() {
        let missing = Path::new("/nonexistent/drs-controller.toml");
        assert!(ControllerConfig::load_from(missing, true).is_err());
    }
}
