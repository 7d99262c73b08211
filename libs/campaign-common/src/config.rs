// Campaign configuration shared by the planner and the runner
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Inclusive bounds for the desired number of runs per (service, tool) pair
pub const MIN_DESIRED_RUNS: u32 = 1;
pub const MAX_DESIRED_RUNS: u32 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub results_dir: PathBuf,
    pub services_dir: PathBuf,
    pub excluded_services: Vec<String>,
    /// Explicit service list; overrides discovery from `services_dir`
    pub services: Option<Vec<String>>,
    pub tools: Vec<String>,
    pub image_prefix: String,
    pub max_attempts: u32,
    pub sandbox: SandboxLimits,
    pub gate: GateConfig,
    pub timings: Timings,
    pub ports: PortRange,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            services_dir: PathBuf::from("apis"),
            excluded_services: vec!["CUSTOM-API".to_string()],
            services: None,
            tools: vec!["llamaresttest".to_string()],
            image_prefix: "llamaresttest-".to_string(),
            max_attempts: 3,
            sandbox: SandboxLimits::default(),
            gate: GateConfig::default(),
            timings: Timings::default(),
            ports: PortRange::default(),
        }
    }
}

/// Ceiling applied to each sandbox individually
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    pub memory_limit_bytes: i64,
    pub nano_cpus: i64,
    /// Port the service listens on inside its sandbox
    pub service_port: u16,
    pub results_mount: String,
    pub stop_timeout_secs: i64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 16 * 1024 * 1024 * 1024,
            nano_cpus: 8_000_000_000,
            service_port: 9090,
            results_mount: "/results/".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

impl SandboxLimits {
    pub fn cpus(&self) -> f64 {
        self.nano_cpus as f64 / 1_000_000_000.0
    }
}

/// Admission thresholds, sized for one paired run (both sandboxes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub required_free_memory_bytes: u64,
    pub required_free_cpus: f64,
    pub cpu_sample_window_ms: u64,
    pub poll_interval_secs: u64,
    pub consecutive_samples: u32,
    pub progress_log_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            required_free_memory_bytes: 32 * 1024 * 1024 * 1024,
            required_free_cpus: 14.0,
            cpu_sample_window_ms: 100,
            poll_interval_secs: 1,
            consecutive_samples: 10,
            progress_log_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub warmup_secs: u64,
    pub warmup_poll_secs: u64,
    pub monitor_intervals: u32,
    pub monitor_interval_secs: u64,
    pub drain_secs: u64,
    pub stagger_secs: u64,
    pub retry_pause_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            warmup_secs: 45,
            warmup_poll_secs: 5,
            monitor_intervals: 10,
            monitor_interval_secs: 60,
            drain_secs: 5,
            stagger_secs: 60,
            retry_pause_secs: 2,
        }
    }
}

impl Timings {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn warmup_poll(&self) -> Duration {
        Duration::from_secs(self.warmup_poll_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_secs(self.stagger_secs)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_secs(self.retry_pause_secs)
    }
}

/// Candidate host ports, `start` inclusive and `end` exclusive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub range_start: u16,
    pub range_end: u16,
    pub probe_budget: u32,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            range_start: 10_000,
            range_end: 60_000,
            probe_budget: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid campaign configuration: {0}")]
pub struct ConfigError(pub String);

impl CampaignConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.range_start >= self.ports.range_end {
            return Err(ConfigError(format!(
                "port range {}..{} is empty",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.ports.probe_budget == 0 {
            return Err(ConfigError("port probe budget must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError("max_attempts must be positive".into()));
        }
        if self.timings.monitor_intervals == 0 {
            return Err(ConfigError("monitor_intervals must be positive".into()));
        }
        if self.gate.consecutive_samples == 0 {
            return Err(ConfigError("consecutive_samples must be positive".into()));
        }
        if self.tools.is_empty() {
            return Err(ConfigError("at least one tool must be configured".into()));
        }
        if self.sandbox.memory_limit_bytes <= 0 || self.sandbox.nano_cpus <= 0 {
            return Err(ConfigError("sandbox limits must be positive".into()));
        }
        Ok(())
    }
}

/// Check the desired-runs-per-unit bound
pub fn validate_desired_runs(desired: u32) -> Result<u32, ConfigError> {
    if (MIN_DESIRED_RUNS..=MAX_DESIRED_RUNS).contains(&desired) {
        Ok(desired)
    } else {
        Err(ConfigError(format!(
            "number of runs must be in the range {}-{}, got {}",
            MIN_DESIRED_RUNS, MAX_DESIRED_RUNS, desired
        )))
    }
}
