use serde::{Deserialize, Serialize};
use std::fmt;

/// One (service, tool) pairing that still needs one more run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnit {
    pub service: String,
    pub tool: String,
}

impl WorkUnit {
    pub fn new(service: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            tool: tool.into(),
        }
    }

    /// True when either side of the pair is in `identifiers`
    pub fn references_any<'a, I>(&self, identifiers: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        identifiers
            .into_iter()
            .any(|id| *id == self.service || *id == self.tool)
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.tool, self.service)
    }
}

/// Point-in-time view of host memory and CPU
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub available_memory_bytes: u64,
    pub total_memory_bytes: u64,
    /// Idle share of the host expressed in logical CPUs
    pub available_cpus: f64,
    pub total_cpus: usize,
}

impl ResourceSnapshot {
    pub fn available_memory_gib(&self) -> f64 {
        self.available_memory_bytes as f64 / GIB
    }

    pub fn total_memory_gib(&self) -> f64 {
        self.total_memory_bytes as f64 / GIB
    }
}

pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Observed state of one sandbox.
///
/// `Missing` covers sandboxes the runtime can no longer find (auto-removed
/// after exit, or never created). It is kept apart from `Exited` even though
/// the lifecycle treats both as a dead sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Exited,
    Missing,
}

impl SandboxStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, SandboxStatus::Running)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxStatus::Running => "running",
            SandboxStatus::Exited => "exited",
            SandboxStatus::Missing => "missing",
        };
        write!(f, "{}", s)
    }
}

/// States of one run attempt, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    ServiceStarting,
    WarmingUp,
    ToolStarting,
    Monitoring,
    StoppingTool,
    StoppingService,
    Completed,
    /// Attempt failed, another attempt may follow
    Failed,
    /// Attempt budget exhausted
    Aborted,
    /// Operator or fatal shutdown cut the run short
    Interrupted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Aborted | RunStatus::Interrupted
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::ServiceStarting => "service-starting",
            RunStatus::WarmingUp => "warming-up",
            RunStatus::ToolStarting => "tool-starting",
            RunStatus::Monitoring => "monitoring",
            RunStatus::StoppingTool => "stopping-tool",
            RunStatus::StoppingService => "stopping-service",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
            RunStatus::Interrupted => "interrupted",
        };
        write!(f, "{}", s)
    }
}

/// Completion bookkeeping for one (service, tool) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairProgress {
    pub completed: u32,
    pub remaining: u32,
}

/// Outcome counts of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub planned: usize,
    pub launched: usize,
    pub completed: usize,
    pub aborted: usize,
    pub interrupted: usize,
}
