//! Engine configuration.
//!
//! Values come from defaults, optionally overridden by `CLOUDFLOW_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

/// What happens to sibling branches once a task fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Fail the flow as soon as any task exhausts its attempts; nothing
    /// further is claimed, in-flight attempts drain. The default.
    FailFast,

    /// Keep claiming tasks whose dependencies all succeeded; fail the
    /// flow once no task can make progress.
    BestEffort,
}

/// Scheduler and worker-pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay between scheduling passes, in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Max flows examined per pass
    #[serde(default = "default_flow_page_size")]
    pub flow_page_size: usize,

    /// Global bound on concurrently executing tasks
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Bound on concurrently executing tasks of a single flow;
    /// 0 disables the per-flow limit
    #[serde(default = "default_per_flow_workers")]
    pub per_flow_workers: usize,

    /// Sibling-branch policy after a permanent task failure
    #[serde(default = "default_failure_mode")]
    pub failure_mode: FailureMode,
}

fn default_tick_interval_ms() -> u64 {
    200
}

fn default_flow_page_size() -> usize {
    32
}

fn default_max_workers() -> usize {
    16
}

fn default_per_flow_workers() -> usize {
    4
}

fn default_failure_mode() -> FailureMode {
    FailureMode::FailFast
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            flow_page_size: default_flow_page_size(),
            max_workers: default_max_workers(),
            per_flow_workers: default_per_flow_workers(),
            failure_mode: default_failure_mode(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CLOUDFLOW_*` environment variables.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_u64("CLOUDFLOW_TICK_INTERVAL_MS") {
            config.tick_interval_ms = v;
        }
        if let Some(v) = env_u64("CLOUDFLOW_FLOW_PAGE_SIZE") {
            config.flow_page_size = v as usize;
        }
        if let Some(v) = env_u64("CLOUDFLOW_MAX_WORKERS") {
            config.max_workers = (v as usize).max(1);
        }
        if let Some(v) = env_u64("CLOUDFLOW_PER_FLOW_WORKERS") {
            config.per_flow_workers = v as usize;
        }
        if let Ok(v) = env::var("CLOUDFLOW_FAILURE_MODE") {
            match v.as_str() {
                "fail_fast" => config.failure_mode = FailureMode::FailFast,
                "best_effort" => config.failure_mode = FailureMode::BestEffort,
                other => warn!("ignoring unknown CLOUDFLOW_FAILURE_MODE: {}", other),
            }
        }

        config
    }

    /// Tick interval as a [`Duration`]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("ignoring non-numeric {}: {}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}
