use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::schedule::{Schedule, Stage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scenario: ScenarioConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    /// Metric name to threshold expressions, e.g. `http_req_duration = ["p(95)<200"]`.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub options: OptionsConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn schedule(&self) -> Schedule {
        Schedule::new(
            self.stages
                .iter()
                .map(|s| Stage {
                    duration: Duration::from_millis(s.duration_ms),
                    target: s.target,
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Deterministic seed for the per-VU probability samplers.
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage duration in milliseconds.
    pub duration_ms: u64,
    /// VU count to ramp to by the end of the stage.
    pub target: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL the scenario builds endpoint paths on.
    pub base_url: String,
    /// Optional API key for authenticated endpoints.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsConfig {
    /// Scheduler tick in milliseconds; bounds how far the alive-VU count may
    /// lag the ramp target.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Hard cap on concurrent VUs regardless of the stage plan.
    #[serde(default = "default_max_vus")]
    pub max_vus: u64,
    /// Cancel the run as soon as a threshold with observed data is failing.
    #[serde(default)]
    pub abort_on_breach: bool,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_vus: default_max_vus(),
            abort_on_breach: false,
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_tick_ms() -> u64 {
    250
}

fn default_max_vus() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[scenario]
seed = 42

[target]
base_url = "https://api.example.com/v1"
api_key = "test-key"

[[stages]]
duration_ms = 30000
target = 10

[[stages]]
duration_ms = 30000
target = 0

[thresholds]
http_req_duration = ["p(95)<200"]
errors = ["rate<0.05"]

[options]
tick_ms = 100
abort_on_breach = true
        "#;

        let config: Config = toml::from_str(config_str).unwrap();
        assert_eq!(config.scenario.seed, 42);
        assert_eq!(config.target.base_url, "https://api.example.com/v1");
        assert_eq!(config.target.timeout_ms, 30_000);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[0].target, 10);
        assert_eq!(config.thresholds["errors"], vec!["rate<0.05"]);
        assert_eq!(config.options.tick_ms, 100);
        assert_eq!(config.options.max_vus, 10_000);
        assert!(config.options.abort_on_breach);
    }

    #[test]
    fn test_schedule_conversion() {
        let config_str = r#"
[scenario]
seed = 1

[target]
base_url = "http://localhost:8080"

[[stages]]
duration_ms = 5000
target = 100
        "#;

        let config: Config = toml::from_str(config_str).unwrap();
        let schedule = config.schedule();
        assert_eq!(schedule.total_duration(), Duration::from_secs(5));
        assert_eq!(schedule.target_at(Duration::from_millis(2500)), Some(50));
    }
}
