// In-memory stand-ins for the container daemon and the host, for tests
use crate::images::ImageRegistry;
use crate::lifecycle::RunContext;
use crate::ports::PortAllocator;
use crate::resources::HostProbe;
use crate::runtime::{RuntimeError, SandboxHandle, SandboxRuntime, SandboxSpec};
use async_trait::async_trait;
use campaign_common::config::CampaignConfig;
use campaign_common::types::SandboxStatus;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    Launched { name: String, image: String },
    Stopped { name: String, image: String },
}

struct FakeSandbox {
    spec: SandboxSpec,
    running: bool,
    inspections: usize,
    exit_after: Option<usize>,
}

#[derive(Default)]
struct FakeState {
    images: HashSet<String>,
    launch_failures: HashMap<String, usize>,
    stop_failures: HashMap<String, usize>,
    /// Per image, consumed one launch at a time
    exit_plans: HashMap<String, VecDeque<usize>>,
    launch_calls: HashMap<String, usize>,
    /// Images whose sandboxes vanish on exit, as with auto-removed containers
    removed_on_exit: HashSet<String>,
    sandboxes: HashMap<String, FakeSandbox>,
    launched: Vec<SandboxSpec>,
    events: Vec<FakeEvent>,
    next_id: usize,
}

/// Scriptable `SandboxRuntime` that keeps every sandbox in memory
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

fn take_one(counter: &mut HashMap<String, usize>, image: &str) -> bool {
    match counter.get_mut(image) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

impl FakeRuntime {
    pub fn with_images(images: &[&str]) -> Self {
        let runtime = Self::default();
        runtime.state.lock().unwrap().images = images.iter().map(|i| i.to_string()).collect();
        runtime
    }

    /// The next `times` launches of `image` fail
    pub fn fail_launches(&self, image: &str, times: usize) {
        self.state.lock().unwrap().launch_failures.insert(image.to_string(), times);
    }

    pub fn fail_stops(&self, image: &str, times: usize) {
        self.state.lock().unwrap().stop_failures.insert(image.to_string(), times);
    }

    /// The next sandbox launched from `image` reports running for
    /// `inspections` inspections, then exits
    pub fn exit_after_inspections(&self, image: &str, inspections: usize) {
        self.state
            .lock()
            .unwrap()
            .exit_plans
            .entry(image.to_string())
            .or_default()
            .push_back(inspections);
    }

    /// Sandboxes from `image` are removed when they exit, so later
    /// inspections report them missing
    pub fn remove_on_exit(&self, image: &str) {
        self.state.lock().unwrap().removed_on_exit.insert(image.to_string());
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Names of sandboxes still running
    pub fn running(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .sandboxes
            .values()
            .filter(|s| s.running)
            .map(|s| s.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn launch_attempts(&self, image: &str) -> usize {
        self.state.lock().unwrap().launch_calls.get(image).copied().unwrap_or(0)
    }

    pub fn launches(&self) -> usize {
        self.state.lock().unwrap().launched.len()
    }

    pub fn stops(&self, image: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| matches!(e, FakeEvent::Stopped { image: i, .. } if i == image))
            .count()
    }

    /// Spec of the first successful launch from `image`
    pub fn spec_for(&self, image: &str) -> Option<SandboxSpec> {
        self.state
            .lock()
            .unwrap()
            .launched
            .iter()
            .find(|spec| spec.image == image)
            .cloned()
    }

    pub fn launched_names(&self, image: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .launched
            .iter()
            .filter(|spec| spec.image == image)
            .map(|spec| spec.name.clone())
            .collect()
    }

    /// Host ports published by launched service sandboxes, in launch order
    pub fn service_ports(&self) -> Vec<u16> {
        self.state
            .lock()
            .unwrap()
            .launched
            .iter()
            .filter_map(|spec| spec.port.map(|p| p.host_port))
            .collect()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn image_exists(&self, image: &str) -> bool {
        self.state.lock().unwrap().images.contains(image)
    }

    async fn run(&self, spec: &SandboxSpec) -> Result<SandboxHandle, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        *state.launch_calls.entry(spec.image.clone()).or_default() += 1;

        if !state.images.contains(&spec.image) {
            return Err(RuntimeError::Launch {
                name: spec.name.clone(),
                reason: format!("No such image: {}", spec.image),
            });
        }
        if take_one(&mut state.launch_failures, &spec.image) {
            return Err(RuntimeError::Launch {
                name: spec.name.clone(),
                reason: "simulated launch failure".to_string(),
            });
        }

        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        let exit_after = state
            .exit_plans
            .get_mut(&spec.image)
            .and_then(|plan| plan.pop_front());
        state.sandboxes.insert(
            id.clone(),
            FakeSandbox {
                spec: spec.clone(),
                running: true,
                inspections: 0,
                exit_after,
            },
        );
        state.launched.push(spec.clone());
        state.events.push(FakeEvent::Launched {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });

        Ok(SandboxHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn inspect(&self, handle: &SandboxHandle) -> SandboxStatus {
        let mut state = self.state.lock().unwrap();
        let Some(sandbox) = state.sandboxes.get_mut(&handle.id) else {
            return SandboxStatus::Missing;
        };
        if !sandbox.running {
            return SandboxStatus::Exited;
        }
        sandbox.inspections += 1;
        if !sandbox.exit_after.is_some_and(|n| sandbox.inspections > n) {
            return SandboxStatus::Running;
        }

        sandbox.running = false;
        let image = sandbox.spec.image.clone();
        if state.removed_on_exit.contains(&image) {
            state.sandboxes.remove(&handle.id);
            return SandboxStatus::Missing;
        }
        SandboxStatus::Exited
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let image = match state.sandboxes.get(&handle.id) {
            Some(sandbox) => sandbox.spec.image.clone(),
            None => {
                return Err(RuntimeError::Stop {
                    name: handle.name.clone(),
                    reason: "No such container".to_string(),
                })
            }
        };
        if take_one(&mut state.stop_failures, &image) {
            return Err(RuntimeError::Stop {
                name: handle.name.clone(),
                reason: "simulated stop failure".to_string(),
            });
        }
        if let Some(sandbox) = state.sandboxes.get_mut(&handle.id) {
            sandbox.running = false;
        }
        state.events.push(FakeEvent::Stopped {
            name: handle.name.clone(),
            image,
        });
        Ok(())
    }
}

/// Host probe replaying (available memory, CPU busy %) samples.
/// The last sample repeats once the script runs out.
pub struct ScriptedHost {
    samples: Vec<(u64, f64)>,
    cpus: usize,
    cursor: Mutex<usize>,
    /// Sample positions whose memory read fails
    failing: HashSet<usize>,
}

impl ScriptedHost {
    pub fn sequence(samples: Vec<(u64, f64)>, cpus: usize) -> Self {
        assert!(!samples.is_empty());
        Self {
            samples,
            cpus,
            cursor: Mutex::new(0),
            failing: HashSet::new(),
        }
    }

    /// The sample at `index` (0-based) errors instead of reading
    pub fn failing_at(mut self, index: usize) -> Self {
        self.failing.insert(index);
        self
    }

    pub fn always(available_memory: u64, cpu_percent: f64, cpus: usize) -> Self {
        Self::sequence(vec![(available_memory, cpu_percent)], cpus)
    }

    pub fn samples_taken(&self) -> usize {
        *self.cursor.lock().unwrap()
    }

    fn current(&self) -> (u64, f64) {
        let cursor = *self.cursor.lock().unwrap();
        self.samples[cursor.saturating_sub(1).min(self.samples.len() - 1)]
    }
}

#[async_trait]
impl HostProbe for ScriptedHost {
    /// Read first in every sample, so it advances the script
    fn available_memory_bytes(&self) -> io::Result<u64> {
        let mut cursor = self.cursor.lock().unwrap();
        let index = *cursor;
        *cursor += 1;
        if self.failing.contains(&index) {
            return Err(io::Error::other("meminfo unreadable"));
        }
        Ok(self.samples[index.min(self.samples.len() - 1)].0)
    }

    fn total_memory_bytes(&self) -> io::Result<u64> {
        Ok(128 * 1024 * 1024 * 1024)
    }

    async fn cpu_utilization_percent(&self, _window: Duration) -> io::Result<f64> {
        Ok(self.current().1)
    }

    fn logical_cpu_count(&self) -> usize {
        self.cpus
    }
}

/// Run context over a temp results root with default timings
pub fn run_context(results_root: &Path, runtime: Arc<FakeRuntime>) -> Arc<RunContext> {
    let config = CampaignConfig {
        services: Some(vec!["svcA".to_string()]),
        tools: vec!["toolB".to_string()],
        ..Default::default()
    };
    let runtime: Arc<dyn SandboxRuntime> = runtime;

    Arc::new(RunContext {
        images: ImageRegistry::new(runtime.clone(), config.image_prefix.clone()),
        runtime,
        ports: PortAllocator::new(config.ports.clone()),
        config: Arc::new(config),
        results_root: results_root.to_path_buf(),
        shutdown: CancellationToken::new(),
    })
}
