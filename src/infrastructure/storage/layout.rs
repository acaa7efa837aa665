//! On-disk layout of a dispatch run.
//!
//! ```text
//! <base>/<timestamp>/[<target>/]
//!     trace/  test-case/  test-case-base/  profile/  guest-data/  graph/
//!     log/{vm,svm}/<n>  log/node_error.log  log/finish.log
//!     log/test_case_tree.log  exception_caught.log
//! <base>/last -> <timestamp>
//! ```

use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::harness::GuestData;
use crate::domain::models::target::Target;
use crate::domain::models::worker::{NodeError, WorkerKind};

pub const LAST_RUN_LINK: &str = "last";
pub const TRACE_DIR: &str = "trace";
pub const TEST_CASE_DIR: &str = "test-case";
pub const TEST_CASE_BASE_DIR: &str = "test-case-base";
pub const PROFILE_DIR: &str = "profile";
pub const GUEST_DATA_DIR: &str = "guest-data";
pub const GRAPH_DIR: &str = "graph";
pub const LOG_DIR: &str = "log";
pub const FINISH_LOG: &str = "finish.log";
pub const TEST_CASE_TREE_LOG: &str = "test_case_tree.log";
pub const NODE_ERROR_LOG: &str = "node_error.log";
pub const EXCEPTION_LOG: &str = "exception_caught.log";
pub const GUEST_CONFIG_FILE: &str = "guest-config.json";
pub const STAT_DATA: &str = "stat.dat";
pub const STAT_SCRIPT: &str = "stat.pg";

const STAT_SCRIPT_BODY: &str = r#"#!/usr/bin/gnuplot
reset
set terminal png

set title "Test cases and traces per second"
set grid
set key reverse Left outside
set style data linespoints

set ylabel "tcs/traces"
set xlabel "seconds"

plot "stat.dat" using 1:2 title "tc remaining", \
     "" using 1:3 title "tc total", \
     "" using 1:4 title "trace remaining", \
     "" using 1:5 title "trace total"
"#;

/// Directory name for a run started at `now`, e.g. `2026-Oct-18_09.15.02`.
pub fn timestamp_name(now: DateTime<Local>) -> String {
    now.format("%Y-%b-%d_%H.%M.%S").to_string()
}

fn create_dir(path: &Path) -> DomainResult<()> {
    fs::create_dir_all(path).map_err(|e| DomainError::resource(path, e))
}

fn append(path: &Path, text: &str) -> DomainResult<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(text.as_bytes()))
        .map_err(|e| DomainError::resource(path, e))
}

fn write(path: &Path, bytes: impl AsRef<[u8]>) -> DomainResult<()> {
    fs::write(path, bytes).map_err(|e| DomainError::resource(path, e))
}

/// First `dir/<n>` (n ≥ 1) that does not exist yet.
fn first_free(dir: &Path) -> PathBuf {
    (1u64..)
        .map(|n| dir.join(n.to_string()))
        .find(|p| !p.exists())
        .unwrap_or_else(|| dir.join("overflow"))
}

/// The timestamped directory of one dispatch run.
#[derive(Debug, Clone)]
pub struct RunRoot {
    base: PathBuf,
    dir: PathBuf,
}

impl RunRoot {
    /// Create `<base>/<timestamp>` and point `<base>/last` at it.
    pub fn create(base: &Path) -> DomainResult<Self> {
        let stamp = timestamp_name(Local::now());
        let mut dir = base.join(&stamp);
        let mut suffix = 1;
        while dir.exists() {
            suffix += 1;
            dir = base.join(format!("{stamp}-{suffix}"));
        }
        create_dir(&dir)?;
        let root = Self {
            base: base.to_path_buf(),
            dir,
        };
        root.link_last();
        Ok(root)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    #[cfg(unix)]
    fn link_last(&self) {
        let link = self.base.join(LAST_RUN_LINK);
        if link.symlink_metadata().is_ok() {
            if let Err(e) = fs::remove_file(&link) {
                warn!(link = %link.display(), error = %e, "cannot replace last-run link");
                return;
            }
        }
        let Some(name) = self.dir.file_name() else {
            return;
        };
        if let Err(e) = std::os::unix::fs::symlink(name, &link) {
            warn!(link = %link.display(), error = %e, "cannot create last-run link");
        }
    }

    #[cfg(not(unix))]
    fn link_last(&self) {}

    /// Layout for `target`, or for the run root itself in single-target mode.
    pub fn layout(&self, target: Option<&Target>) -> DomainResult<RunLayout> {
        let root = match target {
            Some(t) => self.dir.join(t.dir_name()),
            None => self.dir.clone(),
        };
        RunLayout::create(root)
    }
}

/// Directories and logs of one target within a run.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn create(root: impl Into<PathBuf>) -> DomainResult<Self> {
        let layout = Self { root: root.into() };
        for dir in [
            layout.trace_dir(),
            layout.test_case_dir(),
            layout.test_case_base_dir(),
            layout.profile_dir(),
            layout.guest_data_dir(),
            layout.worker_log_dir(WorkerKind::Concrete),
            layout.worker_log_dir(WorkerKind::Symbolic),
        ] {
            create_dir(&dir)?;
        }
        debug!(root = %layout.root.display(), "run layout created");
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.root.join(TRACE_DIR)
    }

    pub fn test_case_dir(&self) -> PathBuf {
        self.root.join(TEST_CASE_DIR)
    }

    pub fn test_case_base_dir(&self) -> PathBuf {
        self.root.join(TEST_CASE_BASE_DIR)
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.root.join(PROFILE_DIR)
    }

    pub fn guest_data_dir(&self) -> PathBuf {
        self.root.join(GUEST_DATA_DIR)
    }

    pub fn graph_dir(&self) -> PathBuf {
        self.root.join(GRAPH_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn worker_log_dir(&self, kind: WorkerKind) -> PathBuf {
        self.log_dir().join(kind.label())
    }

    /// Write a worker error to `log/<kind>/<n>`, its input next to it, and
    /// append it to the node error log. Returns the entry's path.
    pub fn record_node_error(&self, error: &NodeError) -> DomainResult<PathBuf> {
        let dir = self.worker_log_dir(error.kind);
        create_dir(&dir)?;
        let path = first_free(&dir);
        let log = error.log();
        write(&path, &log)?;
        if let Some(input) = &error.input {
            let mut name = path.clone().into_os_string();
            name.push(".input.bin");
            input.write_elements(Path::new(&name))?;
        }
        append(&self.log_dir().join(NODE_ERROR_LOG), &format!("{log}\n"))?;
        Ok(path)
    }

    /// Append a dispatch failure with its context to the exception log.
    pub fn record_exception(
        &self,
        target: Option<&Target>,
        worker: &str,
        state: &str,
        error: &dyn std::fmt::Display,
    ) -> DomainResult<()> {
        let entry = format!(
            "[{}] target: {} worker: {worker} state: {state}\n{error}\n\n",
            Local::now().to_rfc3339(),
            target.map_or("<none>", |t| t.name.as_str()),
        );
        append(&self.root.join(EXCEPTION_LOG), &entry)
    }

    pub fn write_guest_data(&self, data: &GuestData) -> DomainResult<PathBuf> {
        let path = self.guest_data_dir().join(GUEST_CONFIG_FILE);
        write(&path, serde_json::to_vec_pretty(data)?)?;
        Ok(path)
    }

    /// Final status table and test case tree of a finished target.
    pub fn write_finish(&self, status: &str, tree: &str) -> DomainResult<()> {
        create_dir(&self.log_dir())?;
        write(&self.log_dir().join(FINISH_LOG), status)?;
        write(&self.log_dir().join(TEST_CASE_TREE_LOG), tree)
    }

    /// Reclaim trace storage once a target is done.
    pub fn remove_traces(&self) -> DomainResult<()> {
        let dir = self.trace_dir();
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DomainError::resource(&dir, e)),
        }
    }
}

/// Queue sizes sampled into `stat.dat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSample {
    pub tests_left: usize,
    pub tests_total: u64,
    pub traces_left: usize,
    pub traces_total: usize,
}

/// Appends a sample to `profile/stat.dat` at most once per interval.
#[derive(Debug)]
pub struct StatsRecorder {
    dir: PathBuf,
    interval: Duration,
    last: Option<Duration>,
    script_written: bool,
}

impl StatsRecorder {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
            last: None,
            script_written: false,
        }
    }

    /// Record `sample` if an interval has passed. Returns whether it did.
    pub fn record(&mut self, elapsed: Duration, sample: StatSample) -> DomainResult<bool> {
        if self.last.is_some_and(|last| elapsed.saturating_sub(last) < self.interval) {
            return Ok(false);
        }
        self.last = Some(elapsed);
        if !self.script_written {
            write(&self.dir.join(STAT_SCRIPT), STAT_SCRIPT_BODY)?;
            self.script_written = true;
        }
        append(
            &self.dir.join(STAT_DATA),
            &format!(
                "{} {} {} {} {}\n",
                elapsed.as_secs(),
                sample.tests_left,
                sample.tests_total,
                sample.traces_left,
                sample.traces_total
            ),
        )?;
        Ok(true)
    }
}
