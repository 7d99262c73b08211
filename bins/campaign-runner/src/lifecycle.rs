/// Run Lifecycle Manager
///
/// **Core Responsibility:**
/// Drive one dispatched work unit through the paired-sandbox protocol,
/// retrying from scratch until it completes or the attempt budget runs out.
///
/// **Protocol (one attempt):**
/// 1. Reserve a host port, allocate a run id, write `started.txt`
/// 2. Re-check both images
/// 3. Start the service sandbox, wait out the warm-up
/// 4. Start the tool sandbox on the host network
/// 5. Health-check both sandboxes once per monitoring interval
/// 6. Stop the tool, drain, stop the service
/// 7. Write `completed.txt`
///
/// Every failure path stops whatever sandbox is still up before the attempt
/// ends. Failure reasons go to the attempt's `errors.txt`; only a fatal port
/// allocation failure escapes to the caller.

use crate::images::ImageRegistry;
use crate::markers::RunMarkers;
use crate::ports::{PortAllocationExhausted, PortAllocator, PortLease};
use crate::runtime::{PortMapping, RuntimeError, SandboxHandle, SandboxRuntime, SandboxSpec};
use campaign_common::config::CampaignConfig;
use campaign_common::layout::{
    service_sandbox_name, tool_sandbox_name, ENV_PORT, ENV_RUN, ENV_SERVICE, ENV_TOOL,
};
use campaign_common::types::{RunStatus, SandboxStatus, WorkUnit};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Everything a run shares with the rest of the batch
pub struct RunContext {
    pub runtime: Arc<dyn SandboxRuntime>,
    pub images: ImageRegistry,
    pub config: Arc<CampaignConfig>,
    /// Absolute path, mounted into service sandboxes
    pub results_root: PathBuf,
    pub ports: Arc<PortAllocator>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Service,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Service => write!(f, "service"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("Sandbox image(s) not found for service ({service}) or tool ({tool}).")]
    ImageMissing { service: String, tool: String },

    #[error("Could not start {role} ({identifier}) sandbox: {source}")]
    Launch {
        role: Role,
        identifier: String,
        source: RuntimeError,
    },

    #[error("The {role} sandbox was {status} at minute {minute}. Aborting.")]
    HealthCheck {
        role: Role,
        minute: u32,
        status: SandboxStatus,
    },

    #[error("Could not stop {role} ({identifier}) sandbox. It possibly crashed: {source}")]
    Stop {
        role: Role,
        identifier: String,
        source: RuntimeError,
    },

    #[error("Run interrupted while {stage}.")]
    Interrupted { stage: RunStatus },

    #[error("Could not write run markers: {0}")]
    Marker(#[from] io::Error),

    #[error(transparent)]
    PortsExhausted(#[from] PortAllocationExhausted),
}

/// One attempt at a work unit
pub struct Run {
    pub unit: WorkUnit,
    pub attempts_left: u32,
    markers: RunMarkers,
    lease: PortLease,
    service: Option<SandboxHandle>,
    tool: Option<SandboxHandle>,
    status: RunStatus,
}

impl Run {
    pub fn id(&self) -> &str {
        self.markers.run_id()
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    fn transition(&mut self, next: RunStatus) {
        debug!(
            run_id = %self.id(),
            from = %self.status,
            to = %next,
            attempts_left = self.attempts_left,
            "Run status"
        );
        self.status = next;
    }

    fn handle(&self, role: Role) -> Option<&SandboxHandle> {
        match role {
            Role::Service => self.service.as_ref(),
            Role::Tool => self.tool.as_ref(),
        }
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_SERVICE.to_string(), self.unit.service.clone()),
            (ENV_TOOL.to_string(), self.unit.tool.clone()),
            (ENV_RUN.to_string(), self.id().to_string()),
            (ENV_PORT.to_string(), self.port().to_string()),
        ]
    }
}

pub struct RunLifecycle {
    ctx: Arc<RunContext>,
}

impl RunLifecycle {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Run `unit` to a terminal status: `Completed`, `Aborted` or `Interrupted`.
    ///
    /// Only port exhaustion is returned as an error; it also cancels the
    /// batch's shutdown token.
    #[instrument(
        name = "run",
        skip(self, unit),
        fields(service = %unit.service, tool = %unit.tool, sequence = sequence)
    )]
    pub async fn run(
        &self,
        unit: WorkUnit,
        sequence: usize,
        total: usize,
    ) -> Result<RunStatus, PortAllocationExhausted> {
        let max_attempts = self.ctx.config.max_attempts;
        let mut attempts_left = max_attempts;
        let mut failures: Vec<String> = Vec::new();
        let mut last_markers: Option<RunMarkers> = None;
        // Kept reserved until the next attempt holds its own port
        let mut previous_lease: Option<PortLease> = None;

        while attempts_left > 0 {
            attempts_left -= 1;
            let label = if attempts_left + 1 == max_attempts { "START" } else { "RETRY" };

            let prepared = self.begin_attempt(&unit, attempts_left);
            drop(previous_lease.take());

            let failure = match prepared {
                Err(AttemptError::PortsExhausted(e)) => {
                    error!(error = %e, "Port allocation exhausted; stopping the batch");
                    self.ctx.shutdown.cancel();
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, attempts_left, "Could not prepare run");
                    e.to_string()
                }
                Ok(mut run) => {
                    info!(
                        run_id = %run.id(),
                        port = run.port(),
                        "[{}] ({}/{}) Running {} with service on port {}",
                        label,
                        sequence,
                        total,
                        unit,
                        run.port()
                    );

                    match self.attempt(&mut run).await {
                        Ok(()) => {
                            info!(
                                run_id = %run.id(),
                                results = %run.markers.dir().display(),
                                "[-END-] ({}/{}) Run of {} completed successfully",
                                sequence,
                                total,
                                unit
                            );
                            return Ok(RunStatus::Completed);
                        }
                        Err(e @ AttemptError::Interrupted { .. }) => {
                            self.record(&run, &e);
                            run.transition(RunStatus::Interrupted);
                            warn!(run_id = %run.id(), "{}", e);
                            return Ok(RunStatus::Interrupted);
                        }
                        Err(e) => {
                            self.record(&run, &e);
                            run.transition(RunStatus::Failed);
                            warn!(
                                run_id = %run.id(),
                                attempts_left,
                                error = %e,
                                "Attempt failed"
                            );
                            let failure = format!("{}: {}", run.id(), e);
                            last_markers = Some(run.markers);
                            previous_lease = Some(run.lease);
                            failure
                        }
                    }
                }
            };
            failures.push(failure);

            if attempts_left > 0 {
                tokio::select! {
                    _ = self.ctx.shutdown.cancelled() => return Ok(RunStatus::Interrupted),
                    _ = tokio::time::sleep(self.ctx.config.timings.retry_pause()) => {}
                }
            }
        }

        if let Some(markers) = &last_markers {
            let summary = format!(
                "Aborted after {} attempts:\n{}",
                failures.len(),
                failures
                    .iter()
                    .map(|f| format!("- {}", f))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            if let Err(e) = markers.append_error(&summary) {
                warn!(error = %e, "Could not write abort summary");
            }
        }
        error!(
            attempts = failures.len(),
            "[ERROR] ({}/{}) Run of {} terminated with errors",
            sequence,
            total,
            unit
        );
        Ok(RunStatus::Aborted)
    }

    fn begin_attempt(&self, unit: &WorkUnit, attempts_left: u32) -> Result<Run, AttemptError> {
        let lease = self.ctx.ports.allocate()?;
        let markers = RunMarkers::create(&self.ctx.results_root, unit)?;
        markers.write_started()?;

        Ok(Run {
            unit: unit.clone(),
            attempts_left,
            markers,
            lease,
            service: None,
            tool: None,
            status: RunStatus::Pending,
        })
    }

    async fn attempt(&self, run: &mut Run) -> Result<(), AttemptError> {
        let timings = &self.ctx.config.timings;

        let images = &self.ctx.images;
        if !images.exists(&run.unit.service).await || !images.exists(&run.unit.tool).await {
            return Err(AttemptError::ImageMissing {
                service: run.unit.service.clone(),
                tool: run.unit.tool.clone(),
            });
        }

        run.transition(RunStatus::ServiceStarting);
        let spec = self.service_spec(run);
        info!(
            sandbox = %spec.name,
            image = %spec.image,
            port = run.port(),
            memory_bytes = spec.memory_limit_bytes,
            cpus = self.ctx.config.sandbox.cpus(),
            "Starting service sandbox"
        );
        let handle = self
            .ctx
            .runtime
            .run(&spec)
            .await
            .map_err(|source| AttemptError::Launch {
                role: Role::Service,
                identifier: run.unit.service.clone(),
                source,
            })?;
        info!(id = %handle.short_id(), "Service sandbox started");
        run.service = Some(handle);

        run.transition(RunStatus::WarmingUp);
        self.warm_up(run).await?;

        run.transition(RunStatus::ToolStarting);
        let spec = self.tool_spec(run);
        info!(sandbox = %spec.name, image = %spec.image, "Starting tool sandbox (host network)");
        match self.ctx.runtime.run(&spec).await {
            Ok(handle) => {
                info!(id = %handle.short_id(), "Tool sandbox started");
                run.tool = Some(handle);
            }
            Err(source) => {
                warn!(error = %source, "Tool sandbox failed to start; stopping service sandbox");
                self.release(run).await;
                return Err(AttemptError::Launch {
                    role: Role::Tool,
                    identifier: run.unit.tool.clone(),
                    source,
                });
            }
        }

        run.transition(RunStatus::Monitoring);
        let intervals = timings.monitor_intervals;
        info!(intervals, interval_secs = timings.monitor_interval_secs, "Monitoring experiment");
        for minute in 1..=intervals {
            self.wait(run, timings.monitor_interval()).await?;

            for role in [Role::Service, Role::Tool] {
                let status = self.inspect(run, role).await;
                if !status.is_alive() {
                    error!(%role, minute, %status, "Sandbox stopped during monitoring");
                    self.release(run).await;
                    return Err(AttemptError::HealthCheck {
                        role,
                        minute,
                        status,
                    });
                }
            }

            if minute % 5 == 0 {
                info!("{}/{} intervals completed, sandboxes running normally", minute, intervals);
            } else {
                debug!(minute, "Health check passed");
            }
        }

        run.transition(RunStatus::StoppingTool);
        if let Some(tool) = run.tool.take() {
            if let Err(source) = self.ctx.runtime.stop(&tool).await {
                self.release(run).await;
                return Err(AttemptError::Stop {
                    role: Role::Tool,
                    identifier: run.unit.tool.clone(),
                    source,
                });
            }
            info!("Tool sandbox stopped");
        }

        // Let the service flush the state it owns
        self.wait(run, timings.drain()).await?;

        run.transition(RunStatus::StoppingService);
        if let Some(service) = run.service.take() {
            self.ctx
                .runtime
                .stop(&service)
                .await
                .map_err(|source| AttemptError::Stop {
                    role: Role::Service,
                    identifier: run.unit.service.clone(),
                    source,
                })?;
            info!("Service sandbox stopped");
        }

        run.markers.write_completed()?;
        run.transition(RunStatus::Completed);
        Ok(())
    }

    /// Sit out the warm-up, logging service liveness at each poll.
    /// A dead service is left for the first health check to catch.
    async fn warm_up(&self, run: &mut Run) -> Result<(), AttemptError> {
        let timings = &self.ctx.config.timings;
        let total = timings.warmup();
        let step = timings.warmup_poll();
        info!(secs = total.as_secs(), "Waiting for service to initialize");

        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            let pause = step.min(total - elapsed);
            self.wait(run, pause).await?;
            elapsed += pause;

            let status = self.inspect(run, Role::Service).await;
            info!(elapsed_secs = elapsed.as_secs(), %status, "Warm-up");
        }
        Ok(())
    }

    /// Sleep, unless the batch is shutting down
    async fn wait(&self, run: &mut Run, duration: Duration) -> Result<(), AttemptError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.ctx.shutdown.cancelled() => {
                let stage = run.status();
                self.release(run).await;
                Err(AttemptError::Interrupted { stage })
            }
        }
    }

    async fn inspect(&self, run: &Run, role: Role) -> SandboxStatus {
        match run.handle(role) {
            Some(handle) => self.ctx.runtime.inspect(handle).await,
            None => SandboxStatus::Missing,
        }
    }

    /// Best-effort stop of every sandbox the run still holds, tool first
    async fn release(&self, run: &mut Run) {
        for (role, handle) in [(Role::Tool, run.tool.take()), (Role::Service, run.service.take())] {
            let Some(handle) = handle else { continue };
            match self.ctx.runtime.stop(&handle).await {
                Ok(()) => info!(%role, sandbox = %handle.name, "Stopped sandbox during cleanup"),
                Err(e) => debug!(%role, error = %e, "Cleanup stop failed"),
            }
        }
    }

    fn record(&self, run: &Run, error: &AttemptError) {
        if let Err(e) = run.markers.append_error(&error.to_string()) {
            warn!(run_id = %run.id(), error = %e, "Could not write errors marker");
        }
    }

    fn service_spec(&self, run: &Run) -> SandboxSpec {
        let config = &self.ctx.config;
        SandboxSpec {
            image: self.ctx.images.image_for(&run.unit.service),
            name: service_sandbox_name(&run.unit.service, &run.unit.tool, run.id()),
            env: run.env(),
            port: Some(PortMapping {
                container_port: config.sandbox.service_port,
                host_port: run.port(),
            }),
            volumes: vec![format!(
                "{}:{}",
                self.ctx.results_root.display(),
                config.sandbox.results_mount
            )],
            memory_limit_bytes: config.sandbox.memory_limit_bytes,
            nano_cpus: config.sandbox.nano_cpus,
            network_mode: None,
            user: Some("root".to_string()),
            privileged: false,
        }
    }

    fn tool_spec(&self, run: &Run) -> SandboxSpec {
        let config = &self.ctx.config;
        SandboxSpec {
            image: self.ctx.images.image_for(&run.unit.tool),
            name: tool_sandbox_name(&run.unit.service, &run.unit.tool, run.id()),
            env: run.env(),
            port: None,
            volumes: Vec::new(),
            memory_limit_bytes: config.sandbox.memory_limit_bytes,
            nano_cpus: config.sandbox.nano_cpus,
            network_mode: Some("host".to_string()),
            user: None,
            privileged: true,
        }
    }
}
