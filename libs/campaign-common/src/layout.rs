use chrono::Utc;
use rand::Rng;
use std::path::{Path, PathBuf};

// Results tree naming - defines only names, not I/O
// Keeps the runner, the planner and external log collection in agreement:
// `results/<service>/<tool>/<run-id>/{started.txt, completed.txt, errors.txt}`

pub const STARTED_MARKER: &str = "started.txt";
pub const COMPLETED_MARKER: &str = "completed.txt";
pub const ERRORS_MARKER: &str = "errors.txt";

/// Environment keys handed to both sandboxes of a run
pub const ENV_SERVICE: &str = "API";
pub const ENV_TOOL: &str = "TOOL";
pub const ENV_RUN: &str = "RUN";
pub const ENV_PORT: &str = "PORT";

/// Directory holding every run of one (service, tool) pair
pub fn pair_dir(results_root: &Path, service: &str, tool: &str) -> PathBuf {
    results_root.join(service).join(tool)
}

pub fn run_dir(results_root: &Path, service: &str, tool: &str, run_id: &str) -> PathBuf {
    pair_dir(results_root, service, tool).join(run_id)
}

/// Generate a run id from the wall clock
///
/// Format: `run-{YYYYmmdd}-{HHMMSS}-{random_hex}`
/// Example: `run-20250114-093000-a1b2`
pub fn generate_run_id() -> String {
    let random: u16 = rand::rng().random();
    format!("run-{}-{:04x}", Utc::now().format("%Y%m%d-%H%M%S"), random)
}

/// Prebuilt image for a service or tool identifier
pub fn image_name(prefix: &str, identifier: &str) -> String {
    format!("{}{}", prefix, identifier)
}

pub fn service_sandbox_name(service: &str, tool: &str, run_id: &str) -> String {
    format!("{}_for_{}_{}", service, tool, run_id)
}

pub fn tool_sandbox_name(service: &str, tool: &str, run_id: &str) -> String {
    format!("{}_for_{}_{}", tool, service, run_id)
}
