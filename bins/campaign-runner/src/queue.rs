/// Work Queue Builder
///
/// Turns completion markers on disk into the list of runs still owed.
/// The count of `completed.txt` markers per (service, tool) pair is the only
/// record of progress, so rebuilding the queue after a crash or restart
/// picks up exactly where the batch left off.

use campaign_common::config::CampaignConfig;
use campaign_common::layout::{pair_dir, COMPLETED_MARKER};
use campaign_common::types::{PairProgress, WorkUnit};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Services are the sub-directories of `services_dir` holding a Dockerfile,
/// unless the configuration lists them explicitly
pub fn discover_services(config: &CampaignConfig) -> Vec<String> {
    if let Some(services) = &config.services {
        return services.clone();
    }

    let entries = match fs::read_dir(&config.services_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                services_dir = %config.services_dir.display(),
                error = %e,
                "Services directory not readable; no services to schedule"
            );
            return Vec::new();
        }
    };

    let mut services: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir() && entry.path().join("Dockerfile").exists())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !config.excluded_services.contains(name))
        .collect();
    services.sort();
    services
}

/// Number of runs of `unit` that left a completion marker.
/// An unreadable pair directory (never run) counts as zero.
pub fn count_completed(results_root: &Path, unit: &WorkUnit) -> u32 {
    let dir = pair_dir(results_root, &unit.service, &unit.tool);
    match fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(COMPLETED_MARKER).exists())
            .count() as u32,
        Err(_) => 0,
    }
}

pub struct WorkQueueBuilder {
    results_root: PathBuf,
    services: Vec<String>,
    tools: Vec<String>,
}

impl WorkQueueBuilder {
    pub fn new(results_root: impl Into<PathBuf>, services: Vec<String>, tools: Vec<String>) -> Self {
        Self {
            results_root: results_root.into(),
            services,
            tools,
        }
    }

    /// Completed and remaining runs for every (service, tool) pair
    pub fn progress(&self, desired_runs: u32) -> BTreeMap<WorkUnit, PairProgress> {
        let mut progress = BTreeMap::new();
        for service in &self.services {
            for tool in &self.tools {
                let unit = WorkUnit::new(service.clone(), tool.clone());
                let completed = count_completed(&self.results_root, &unit);
                let remaining = desired_runs.saturating_sub(completed);
                debug!(unit = %unit, completed, remaining, "Pair progress");
                progress.insert(unit, PairProgress { completed, remaining });
            }
        }
        progress
    }

    /// One entry per still-needed run
    pub fn build(&self, desired_runs: u32) -> Vec<WorkUnit> {
        expand(&self.progress(desired_runs))
    }
}

pub fn expand(progress: &BTreeMap<WorkUnit, PairProgress>) -> Vec<WorkUnit> {
    progress
        .iter()
        .flat_map(|(unit, pair)| std::iter::repeat(unit.clone()).take(pair.remaining as usize))
        .collect()
}
