use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::models::strategy::SelectionStrategy;
use crate::domain::models::test_case::{TestCase, TestCaseElement};

/// Main configuration structure for the dispatcher and its workers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Target rotation mode
    #[serde(default)]
    pub mode: ModeConfig,

    /// Per-target quotas
    #[serde(default)]
    pub interval: IntervalConfig,

    /// Targets and seeds
    #[serde(default)]
    pub test: TestConfig,

    /// Guest image distributed to concrete workers
    #[serde(default)]
    pub image: ImageConfig,

    /// Concrete execution settings
    #[serde(default)]
    pub vm: VmConfig,

    /// Symbolic execution settings
    #[serde(default)]
    pub svm: SvmConfig,

    /// Trace deduplication and selection
    #[serde(default)]
    pub trace: TraceConfig,

    /// Test case pool
    #[serde(default)]
    pub test_pool: TestPoolConfig,

    /// Periodic statistics
    #[serde(default)]
    pub profile: ProfileConfig,

    /// Registration and transfer settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// In-process workers
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Dispatch loop
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Whether targets rotate through a queue (otherwise single-target mode).
    pub const fn is_distributed(&self) -> bool {
        self.mode.distributed
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModeConfig {
    /// Rotate through `test.items`; when false a single target is explored
    /// until it expires
    #[serde(default)]
    pub distributed: bool,
}

/// Quotas ending exploration of a target; absent means unbounded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IntervalConfig {
    /// Deduplicated traces
    #[serde(default)]
    pub trace: Option<u64>,

    /// Accepted test cases
    #[serde(default)]
    pub tc: Option<u64>,

    /// Wall-clock seconds
    #[serde(default)]
    pub time: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestConfig {
    /// Target names, explored in order
    #[serde(default)]
    pub items: Vec<String>,

    /// Seed test directories, paired with `items` by position
    #[serde(default)]
    pub seeds: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ImageConfig {
    /// Image file pushed to concrete workers
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Validate worker images and replace stale ones
    #[serde(default)]
    pub update: bool,
}

/// Element of an explicitly configured initial test case
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitialElement {
    pub name: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VmConfig {
    /// Guest architecture: x86 or x64
    #[serde(default = "default_arch")]
    pub arch: String,

    /// Snapshot name to restore before each test
    #[serde(default)]
    pub snapshot: String,

    /// Program launched once per test
    #[serde(default = "default_vm_executable")]
    pub executable: String,

    /// Arguments; `{input}`, `{trace_dir}`, `{image}` and `{snapshot}` are
    /// substituted
    #[serde(default)]
    pub args: Vec<String>,

    /// Harness description read when shared data is requested
    #[serde(default)]
    pub guest_config: Option<PathBuf>,

    /// Explicit initial test case used when a target has no seeds
    #[serde(default)]
    pub initial_tc: Vec<InitialElement>,
}

fn default_arch() -> String {
    "x64".to_string()
}

fn default_vm_executable() -> String {
    "qemu-system-x86_64".to_string()
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            arch: default_arch(),
            snapshot: String::new(),
            executable: default_vm_executable(),
            args: vec![],
            guest_config: None,
            initial_tc: vec![],
        }
    }
}

impl VmConfig {
    /// The configured initial test case, if any elements were given.
    pub fn initial_test_case(&self) -> Option<TestCase> {
        if self.initial_tc.is_empty() {
            return None;
        }
        Some(TestCase::new(
            self.initial_tc
                .iter()
                .map(|e| TestCaseElement::new(e.name.clone(), e.data.as_bytes()))
                .collect(),
        ))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SvmArgs {
    /// Arguments for concolic replay of a trace
    #[serde(default)]
    pub concolic: Vec<String>,

    /// Arguments for the symbolic search itself
    #[serde(default)]
    pub symbolic: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SvmConfig {
    /// Translates a trace into analyzable bitcode; `{trace_dir}` is substituted
    #[serde(default = "default_translator")]
    pub translator: String,

    /// Symbolic engine, run in the trace directory against `run.bc`
    #[serde(default = "default_svm_executable")]
    pub executable: String,

    #[serde(default)]
    pub args: SvmArgs,
}

fn default_translator() -> String {
    "concolic-translate".to_string()
}

fn default_svm_executable() -> String {
    "klee".to_string()
}

impl Default for SvmConfig {
    fn default() -> Self {
        Self {
            translator: default_translator(),
            executable: default_svm_executable(),
            args: SvmArgs::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TraceConfig {
    /// Trace selection strategy name
    #[serde(default = "default_trace_selection")]
    pub selection: String,

    /// Collapse repeated block ranges before insertion
    #[serde(default)]
    pub compress: bool,

    /// Export the trace graph after each insertion
    #[serde(default)]
    pub print_graph: bool,

    /// Export only branch points and leaves
    #[serde(default)]
    pub print_graph_only_branches: bool,
}

fn default_trace_selection() -> String {
    SelectionStrategy::Fifo.as_str().to_string()
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            selection: default_trace_selection(),
            compress: false,
            print_graph: false,
            print_graph_only_branches: false,
        }
    }
}

impl TraceConfig {
    pub fn strategy(&self) -> Option<SelectionStrategy> {
        SelectionStrategy::from_str(&self.selection)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestPoolConfig {
    /// Test ordering strategy name (fifo or bfs)
    #[serde(default = "default_test_strategy")]
    pub strategy: String,

    /// Base test cases held in memory before a full clear
    #[serde(default = "default_base_cache_capacity")]
    pub base_cache_capacity: usize,
}

fn default_test_strategy() -> String {
    SelectionStrategy::Fifo.as_str().to_string()
}

const fn default_base_cache_capacity() -> usize {
    1000
}

impl Default for TestPoolConfig {
    fn default() -> Self {
        Self {
            strategy: default_test_strategy(),
            base_cache_capacity: default_base_cache_capacity(),
        }
    }
}

impl TestPoolConfig {
    pub fn strategy(&self) -> Option<SelectionStrategy> {
        SelectionStrategy::from_str(&self.strategy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProfileConfig {
    /// Seconds between statistics samples
    #[serde(default = "default_profile_interval")]
    pub interval: u64,
}

const fn default_profile_interval() -> u64 {
    10
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            interval: default_profile_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NetworkConfig {
    /// Address the registrar listens on; no listener when absent
    #[serde(default)]
    pub listen: Option<String>,

    /// Dispatcher address a remote worker registers with
    #[serde(default = "default_master")]
    pub master: String,

    /// Frame size for streamed payloads
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum attempts when a worker connects to the dispatcher
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

fn default_master() -> String {
    "127.0.0.1:10012".to_string()
}

const fn default_chunk_size() -> usize {
    64 * 1024
}

const fn default_connect_retries() -> u32 {
    10
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: None,
            master: default_master(),
            chunk_size: default_chunk_size(),
            connect_retries: default_connect_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkersConfig {
    /// In-process concrete workers
    #[serde(default = "default_one")]
    pub concrete: usize,

    /// In-process symbolic workers
    #[serde(default = "default_one")]
    pub symbolic: usize,

    /// Scratch directory for worker state
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

const fn default_one() -> usize {
    1
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".concolic/workers")
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concrete: default_one(),
            symbolic: default_one(),
            work_dir: default_work_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DispatchConfig {
    /// Directory holding one timestamped root per run
    #[serde(default = "default_dispatch_root")]
    pub root: PathBuf,

    /// Delay between ticks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Tests queued per concrete worker
    #[serde(default = "default_one")]
    pub vm_test_multiplier: usize,

    /// Traces queued per symbolic worker
    #[serde(default = "default_trace_multiplier")]
    pub vm_trace_multiplier: usize,
}

fn default_dispatch_root() -> PathBuf {
    PathBuf::from("dispatch")
}

const fn default_poll_interval_ms() -> u64 {
    100
}

const fn default_trace_multiplier() -> usize {
    20
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            root: default_dispatch_root(),
            poll_interval_ms: default_poll_interval_ms(),
            vm_test_multiplier: default_one(),
            vm_trace_multiplier: default_trace_multiplier(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
            retention_days: default_retention_days(),
        }
    }
}
