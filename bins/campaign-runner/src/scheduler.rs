/// Scheduler Loop
///
/// **Core Responsibility:**
/// Admit the batch's remaining runs one at a time, in random order, each
/// behind the host resource gate and an inter-launch stagger.
///
/// **Concurrency:**
/// The admission loop is the only serialization point. Every admitted run
/// executes as its own task in a `JoinSet`; the loop never waits on a run.
/// Once the queue is empty the loop drains the set so the process stays up
/// until the last run finishes.
///
/// **Shutdown:**
/// The shared `CancellationToken` ends admission. Runs already in flight
/// observe the same token, stop their sandboxes and end `Interrupted`.

use crate::images::filter_units;
use crate::lifecycle::{RunContext, RunLifecycle};
use crate::ports::PortAllocationExhausted;
use crate::queue::{discover_services, expand, WorkQueueBuilder};
use crate::resources::ResourceMonitor;
use campaign_common::types::{BatchSummary, PairProgress, RunStatus, WorkUnit};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Per-pair view of the batch, for the `plan` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub unit: WorkUnit,
    pub progress: PairProgress,
    pub image_missing: bool,
}

pub struct Scheduler {
    ctx: Arc<RunContext>,
    monitor: ResourceMonitor,
}

impl Scheduler {
    pub fn new(ctx: Arc<RunContext>, monitor: ResourceMonitor) -> Self {
        Self { ctx, monitor }
    }

    fn queue_builder(&self) -> WorkQueueBuilder {
        WorkQueueBuilder::new(
            self.ctx.results_root.clone(),
            discover_services(&self.ctx.config),
            self.ctx.config.tools.clone(),
        )
    }

    /// Progress and image availability of every pair, without launching anything
    pub async fn plan(&self, desired_runs: u32) -> Vec<PlanEntry> {
        let progress = self.queue_builder().progress(desired_runs);
        let units: Vec<WorkUnit> = progress.keys().cloned().collect();
        let missing = self.ctx.images.find_missing(&units).await;

        progress
            .into_iter()
            .map(|(unit, progress)| PlanEntry {
                image_missing: unit.references_any(&missing),
                unit,
                progress,
            })
            .collect()
    }

    /// Run the batch until every owed run has been dispatched and has ended.
    ///
    /// Returns an error only when port allocation was exhausted.
    pub async fn execute(&self, desired_runs: u32) -> anyhow::Result<BatchSummary> {
        let progress = self.queue_builder().progress(desired_runs);
        for (unit, pair) in &progress {
            info!(
                unit = %unit,
                completed = pair.completed,
                remaining = pair.remaining,
                "Pair progress"
            );
        }

        let queue = expand(&progress);
        let missing = self.ctx.images.find_missing(&queue).await;
        for identifier in &missing {
            warn!(
                image = %self.ctx.images.image_for(identifier),
                "Image not found; skipping every run that needs it"
            );
        }
        let mut queue = filter_units(queue, &missing);

        let total = queue.len();
        let mut summary = BatchSummary {
            planned: total,
            ..Default::default()
        };
        if total == 0 {
            info!("Nothing to run");
            return Ok(summary);
        }
        info!(runs = total, desired_runs, "Starting batch");

        let stagger = self.ctx.config.timings.stagger();
        let mut runs = JoinSet::new();
        let mut sequence = 0;

        while !queue.is_empty() {
            if !self.monitor.await_sufficient(&self.ctx.shutdown).await {
                break;
            }

            let unit = queue.swap_remove(rand::rng().random_range(0..queue.len()));
            sequence += 1;
            debug!(unit = %unit, sequence, queued = queue.len(), "Dispatching run");

            let lifecycle = RunLifecycle::new(self.ctx.clone());
            runs.spawn(async move { lifecycle.run(unit, sequence, total).await });
            summary.launched += 1;

            if queue.is_empty() {
                break;
            }
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = tokio::time::sleep(stagger) => {}
            }
        }

        if !queue.is_empty() {
            warn!(undispatched = queue.len(), "Admission stopped before the queue was empty");
        }
        if !runs.is_empty() {
            info!(in_flight = runs.len(), "All runs dispatched; waiting for them to finish");
        }

        let mut fatal = None;
        while let Some(joined) = runs.join_next().await {
            if let Some(e) = tally(&mut summary, joined) {
                fatal = Some(e);
            }
        }

        info!(
            planned = summary.planned,
            launched = summary.launched,
            completed = summary.completed,
            aborted = summary.aborted,
            interrupted = summary.interrupted,
            "Batch finished"
        );

        match fatal {
            Some(e) => Err(e.into()),
            None => Ok(summary),
        }
    }
}

/// Fold one finished run into the summary, handing back a fatal error
fn tally(
    summary: &mut BatchSummary,
    joined: Result<Result<RunStatus, PortAllocationExhausted>, JoinError>,
) -> Option<PortAllocationExhausted> {
    match joined {
        Ok(Ok(RunStatus::Completed)) => summary.completed += 1,
        Ok(Ok(RunStatus::Interrupted)) => summary.interrupted += 1,
        Ok(Ok(status)) => {
            if !status.is_terminal() {
                warn!(%status, "Run ended in a non-terminal status");
            }
            summary.aborted += 1;
        }
        Ok(Err(e)) => return Some(e),
        Err(e) => {
            error!(error = %e, "Run task failed");
            summary.aborted += 1;
        }
    }
    None
}
