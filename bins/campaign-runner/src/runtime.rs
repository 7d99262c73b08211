/// Sandbox Runtime - Container Backend Seam
///
/// **Core Responsibility:**
/// Look up images, launch detached sandboxes, report their state and stop them.
///
/// **Boundary:**
/// - Runtime knows HOW to talk to the container daemon
/// - Runtime does NOT know the run protocol (ordering, retries, markers)
/// - Lifecycle code only sees `SandboxRuntime`, so tests swap in an in-memory fake
///
/// Production uses `DockerRuntime`, constructed once in `main` and shared.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use campaign_common::types::SandboxStatus;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Host port published for a container port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Everything needed to launch one detached sandbox
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<(String, String)>,
    pub port: Option<PortMapping>,
    /// Bind mounts in `host:container` form
    pub volumes: Vec<String>,
    pub memory_limit_bytes: i64,
    pub nano_cpus: i64,
    pub network_mode: Option<String>,
    pub user: Option<String>,
    pub privileged: bool,
}

/// A launched sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    pub name: String,
}

impl SandboxHandle {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to launch sandbox {name}: {reason}")]
    Launch { name: String, reason: String },

    #[error("failed to stop sandbox {name}: {reason}")]
    Stop { name: String, reason: String },
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// True when the prebuilt image is present locally
    async fn image_exists(&self, image: &str) -> bool;

    /// Launch a detached, auto-removed sandbox
    async fn run(&self, spec: &SandboxSpec) -> Result<SandboxHandle, RuntimeError>;

    /// Current state; lookup failures surface as `Missing`
    async fn inspect(&self, handle: &SandboxHandle) -> SandboxStatus;

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), RuntimeError>;
}

fn is_status(error: &DockerError, code: u16) -> bool {
    matches!(error, DockerError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

/// Docker-backed runtime using Bollard
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: i64,
}

impl DockerRuntime {
    pub fn connect(stop_timeout_secs: i64) -> anyhow::Result<Self> {
        use anyhow::Context;

        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        Ok(Self {
            docker,
            stop_timeout_secs,
        })
    }

    /// Fail early when the daemon is unreachable (not running, socket permissions)
    pub async fn ping(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        self.docker
            .ping()
            .await
            .context("Docker daemon did not answer; is it running and is this user in the docker group?")?;
        Ok(())
    }

    fn container_config(spec: &SandboxSpec) -> Config<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();

        if let Some(mapping) = spec.port {
            let key = format!("{}/tcp", mapping.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }

        let env = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            user: spec.user.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_limit_bytes),
                nano_cpus: Some(spec.nano_cpus),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                binds: (!spec.volumes.is_empty()).then(|| spec.volumes.clone()),
                network_mode: spec.network_mode.clone(),
                privileged: Some(spec.privileged),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> bool {
        match self.docker.inspect_image(image).await {
            Ok(found) => {
                debug!(image = %image, id = ?found.id, "Image found");
                true
            }
            Err(e) if is_status(&e, 404) => false,
            Err(e) => {
                warn!(image = %image, error = %e, "Image lookup failed; treating image as missing");
                false
            }
        }
    }

    async fn run(&self, spec: &SandboxSpec) -> Result<SandboxHandle, RuntimeError> {
        let create_options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(create_options), Self::container_config(spec))
            .await
            .map_err(|e| RuntimeError::Launch {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Auto-remove only applies once a container has run
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(remove_err) = self
                .docker
                .remove_container(&created.id, Some(remove_options))
                .await
            {
                warn!(sandbox = %spec.name, error = %remove_err, "Failed to remove unstarted sandbox");
            }
            return Err(RuntimeError::Launch {
                name: spec.name.clone(),
                reason: e.to_string(),
            });
        }

        Ok(SandboxHandle {
            id: created.id,
            name: spec.name.clone(),
        })
    }

    async fn inspect(&self, handle: &SandboxHandle) -> SandboxStatus {
        match self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => match details.state.and_then(|state| state.status) {
                Some(ContainerStateStatusEnum::CREATED)
                | Some(ContainerStateStatusEnum::RUNNING)
                | Some(ContainerStateStatusEnum::PAUSED)
                | Some(ContainerStateStatusEnum::RESTARTING) => SandboxStatus::Running,
                Some(ContainerStateStatusEnum::EXITED)
                | Some(ContainerStateStatusEnum::DEAD)
                | Some(ContainerStateStatusEnum::REMOVING) => SandboxStatus::Exited,
                Some(ContainerStateStatusEnum::EMPTY) | None => SandboxStatus::Missing,
            },
            Err(e) if is_status(&e, 404) => SandboxStatus::Missing,
            Err(e) => {
                warn!(sandbox = %handle.name, error = %e, "Sandbox inspection failed");
                SandboxStatus::Missing
            }
        }
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: self.stop_timeout_secs,
        };

        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(RuntimeError::Stop {
                name: handle.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
