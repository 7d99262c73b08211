// Per-run marker files under the results tree
use campaign_common::layout::{
    generate_run_id, pair_dir, run_dir, COMPLETED_MARKER, ERRORS_MARKER, STARTED_MARKER,
};
use campaign_common::types::WorkUnit;
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Collisions are only possible within the same second
const RUN_DIR_ATTEMPTS: u32 = 16;

/// Marker writer for one run directory.
///
/// Markers are append-only audit files, not locks: concurrent runs of the
/// same pair each own their own directory.
#[derive(Debug, Clone)]
pub struct RunMarkers {
    run_id: String,
    dir: PathBuf,
}

fn timestamp() -> String {
    Local::now().format("%a %b %e %H:%M:%S %Y").to_string()
}

impl RunMarkers {
    /// Allocate a fresh run id and create its directory
    pub fn create(results_root: &Path, unit: &WorkUnit) -> io::Result<Self> {
        let parent = pair_dir(results_root, &unit.service, &unit.tool);
        fs::create_dir_all(&parent)?;

        for _ in 0..RUN_DIR_ATTEMPTS {
            let run_id = generate_run_id();
            let dir = run_dir(results_root, &unit.service, &unit.tool, &run_id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(Self { run_id, dir }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no unused run id under {}", parent.display()),
        ))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append(&self, marker: &str, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(marker))?;
        writeln!(file, "{}", line)
    }

    pub fn write_started(&self) -> io::Result<()> {
        self.append(STARTED_MARKER, &format!("Run started on {}.", timestamp()))
    }

    pub fn write_completed(&self) -> io::Result<()> {
        self.append(COMPLETED_MARKER, &format!("Run completed on {}.", timestamp()))
    }

    /// Append one failure reason, separated by a blank line
    pub fn append_error(&self, reason: &str) -> io::Result<()> {
        self.append(ERRORS_MARKER, &format!("{}\n", reason))
    }
}
