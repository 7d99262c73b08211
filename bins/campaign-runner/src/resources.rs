// Host resource sampling and the admission gate
use async_trait::async_trait;
use campaign_common::config::GateConfig;
use campaign_common::types::{ResourceSnapshot, GIB};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw host measurements
#[async_trait]
pub trait HostProbe: Send + Sync {
    fn available_memory_bytes(&self) -> io::Result<u64>;
    fn total_memory_bytes(&self) -> io::Result<u64>;
    /// Busy share of all CPUs over `window`, 0-100
    async fn cpu_utilization_percent(&self, window: Duration) -> io::Result<f64>;
    fn logical_cpu_count(&self) -> usize;
}

/// Linux host probe backed by /proc
pub struct ProcHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Extract a `kB` field from /proc/meminfo, in bytes.
/// Format: "MemAvailable:   16384000 kB"
fn meminfo_field(content: &str, field: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

/// Aggregate CPU line of /proc/stat.
/// Format: "cpu  user nice system idle iowait irq softirq steal guest guest_nice"
fn parse_cpu_times(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // guest time is already counted in user/nice
    let total = values.iter().take(8).sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes { idle, total })
}

fn count_cpu_lines(content: &str) -> usize {
    content
        .lines()
        .filter(|l| {
            l.strip_prefix("cpu")
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_digit())
        })
        .count()
}

fn utilization_between(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle.saturating_sub(before.idle);
    (1.0 - idle as f64 / total as f64) * 100.0
}

fn invalid(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("could not parse {}", what))
}

impl ProcHost {
    fn meminfo(field: &str) -> io::Result<u64> {
        let content = std::fs::read_to_string("/proc/meminfo")?;
        meminfo_field(&content, field).ok_or_else(|| invalid(field))
    }

    fn cpu_times() -> io::Result<CpuTimes> {
        let content = std::fs::read_to_string("/proc/stat")?;
        parse_cpu_times(&content).ok_or_else(|| invalid("/proc/stat"))
    }
}

#[async_trait]
impl HostProbe for ProcHost {
    fn available_memory_bytes(&self) -> io::Result<u64> {
        Self::meminfo("MemAvailable")
    }

    fn total_memory_bytes(&self) -> io::Result<u64> {
        Self::meminfo("MemTotal")
    }

    async fn cpu_utilization_percent(&self, window: Duration) -> io::Result<f64> {
        let before = Self::cpu_times()?;
        tokio::time::sleep(window).await;
        let after = Self::cpu_times()?;
        Ok(utilization_between(before, after))
    }

    fn logical_cpu_count(&self) -> usize {
        let counted = std::fs::read_to_string("/proc/stat")
            .map(|content| count_cpu_lines(&content))
            .unwrap_or(0);
        if counted > 0 {
            return counted;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Counts consecutive passing samples; any failing sample resets to zero
#[derive(Debug, Clone)]
pub struct SufficiencyStreak {
    required: u32,
    current: u32,
}

impl SufficiencyStreak {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            current: 0,
        }
    }

    /// Record one sample, returns true once the streak is long enough
    pub fn observe(&mut self, sufficient: bool) -> bool {
        if sufficient {
            self.current += 1;
        } else {
            self.current = 0;
        }
        self.current >= self.required
    }

    pub fn current(&self) -> u32 {
        self.current
    }
}

/// Admission gate against the host's free memory and CPU
pub struct ResourceMonitor {
    probe: Arc<dyn HostProbe>,
    gate: GateConfig,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn HostProbe>, gate: GateConfig) -> Self {
        Self { probe, gate }
    }

    pub async fn sample(&self) -> io::Result<ResourceSnapshot> {
        let available_memory_bytes = self.probe.available_memory_bytes()?;
        let total_memory_bytes = self.probe.total_memory_bytes()?;
        let window = Duration::from_millis(self.gate.cpu_sample_window_ms);
        let cpu_percent = self.probe.cpu_utilization_percent(window).await?;
        let total_cpus = self.probe.logical_cpu_count();
        let available_cpus = (1.0 - cpu_percent / 100.0).max(0.0) * total_cpus as f64;

        Ok(ResourceSnapshot {
            available_memory_bytes,
            total_memory_bytes,
            available_cpus,
            total_cpus,
        })
    }

    pub fn is_sufficient(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.available_memory_bytes > self.gate.required_free_memory_bytes
            && snapshot.available_cpus > self.gate.required_free_cpus
    }

    fn report(&self, snapshot: &ResourceSnapshot) {
        info!(
            available_gib = %format!("{:.1}", snapshot.available_memory_gib()),
            total_gib = %format!("{:.1}", snapshot.total_memory_gib()),
            required_gib = %format!("{:.1}", self.gate.required_free_memory_bytes as f64 / GIB),
            available_cpus = %format!("{:.1}", snapshot.available_cpus),
            total_cpus = snapshot.total_cpus,
            required_cpus = self.gate.required_free_cpus,
            "Resource check"
        );
    }

    /// Block until `consecutive_samples` samples in a row pass the gate.
    ///
    /// Waits indefinitely; returns false only when `cancel` fires.
    pub async fn await_sufficient(&self, cancel: &CancellationToken) -> bool {
        let poll = Duration::from_secs(self.gate.poll_interval_secs);
        let progress_every = Duration::from_secs(self.gate.progress_log_secs.max(1));
        let mut streak = SufficiencyStreak::new(self.gate.consecutive_samples);
        let started = Instant::now();
        let mut last_progress = started;
        let mut notified = false;

        loop {
            let sufficient = tokio::select! {
                _ = cancel.cancelled() => return false,
                sample = self.sample() => match sample {
                    Ok(snapshot) => {
                        let ok = self.is_sufficient(&snapshot);
                        if !ok && !notified {
                            warn!("Waiting for system resources to be released...");
                            self.report(&snapshot);
                            notified = true;
                        } else if !ok && last_progress.elapsed() >= progress_every {
                            info!(waited_secs = started.elapsed().as_secs(), "Still waiting for resources");
                            self.report(&snapshot);
                            last_progress = Instant::now();
                        }
                        ok
                    }
                    Err(e) => {
                        warn!(error = %e, "Resource sample failed; counting it as insufficient");
                        false
                    }
                },
            };

            if streak.observe(sufficient) {
                if notified {
                    info!(waited_secs = started.elapsed().as_secs(), "Resources available");
                }
                return true;
            }
            debug!(streak = streak.current(), required = self.gate.consecutive_samples, "Resource sample");

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
