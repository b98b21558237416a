//! Configuration schema definitions for convoy.
//!
//! Two layers live here:
//!
//! - the TOML-facing structs ([`ConfigFile`] and friends), deserialized with
//!   serde from a `convoy.toml`,
//! - the runtime [`Configuration`]: the already-parsed object graph the
//!   invocation engine consumes (build provider, preparers, tests, command
//!   options). The object graph is read-only for the duration of a run.
//!
//! # TOML Structure
//!
//! ```toml
//! [invocation]
//! test_tag = "cts-verifier"
//! shard_count = 4
//! replicate_setup = true
//!
//! [retry]
//! strategy = "retry_until_pass"
//! max_attempts = 3
//!
//! [delegation]
//! mode = "subprocess"
//!
//! [report]
//! junit = true
//! output_dir = "invocation-results"
//!
//! [[tests]]
//! name = "smoke"
//! cases = { boot = "true", network = "ping -c1 localhost" }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::build::{BuildInfo, BuildProvider};
use crate::prep::{MultiTargetPreparer, TargetPreparer};
use crate::testtype::RemoteTest;

/// How the test phases of an invocation are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Everything runs in this process.
    #[default]
    Regular,
    /// Spawn a child process of the same program and stream its results back.
    Subprocess,
    /// Push the work to a remote VM over a remote-shell transport.
    Remote,
}

/// Options that steer one invocation, independent of the test content.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub shard_count: Option<usize>,
    pub shard_index: Option<usize>,
    /// Run per-device setup in parallel, one worker per device.
    pub replicate_setup: bool,
    /// Hard deadline for the whole invocation, delegated runs included.
    pub invocation_timeout: Option<Duration>,
    pub bugreport_on_failure: bool,
    /// Cap for a single best-effort bugreport capture.
    pub bugreport_timeout: Duration,
    pub run_mode: RunMode,
    pub test_tag_suffix: Option<String>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            shard_count: None,
            shard_index: None,
            replicate_setup: false,
            invocation_timeout: None,
            bugreport_on_failure: false,
            bugreport_timeout: Duration::from_secs(300),
            run_mode: RunMode::Regular,
            test_tag_suffix: None,
        }
    }
}

/// Per-device slice of the object graph: logical name plus the ordered
/// preparers scoped to that device.
#[derive(Clone)]
pub struct DeviceSetup {
    pub name: String,
    pub preparers: Vec<Arc<dyn TargetPreparer>>,
}

impl DeviceSetup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            preparers: Vec::new(),
        }
    }

    pub fn with_preparer(mut self, preparer: Arc<dyn TargetPreparer>) -> Self {
        self.preparers.push(preparer);
        self
    }
}

/// The already-parsed object graph for one invocation.
pub struct Configuration {
    pub test_tag: String,
    pub command_line: Option<String>,
    /// Raw TOML this configuration was loaded from, carried so delegation
    /// can forward an allow-listed subset to the worker.
    pub source: Option<String>,
    pub options: CommandOptions,
    pub build_provider: Arc<dyn BuildProvider>,
    pub device_setups: Vec<DeviceSetup>,
    pub multi_preparers: Vec<Arc<dyn MultiTargetPreparer>>,
    pub tests: Vec<Box<dyn RemoteTest>>,
    /// Configurations declared non-shardable always run as a single shard.
    pub shardable: bool,
    /// Set on configurations produced by a parent split; their test list
    /// is already exactly one shard's slice and must not be trimmed again.
    pub sharded: bool,
    /// Build fetched by a parent invocation. Shard children carry it so
    /// they neither re-fetch nor clean up the shared build.
    pub prefetched_build: Option<BuildInfo>,
    pub retry: RetryOptions,
    pub delegation: DelegationOptions,
}

impl Configuration {
    pub fn new(test_tag: impl Into<String>, build_provider: Arc<dyn BuildProvider>) -> Self {
        Self {
            test_tag: test_tag.into(),
            command_line: None,
            source: None,
            options: CommandOptions::default(),
            build_provider,
            device_setups: Vec::new(),
            multi_preparers: Vec::new(),
            tests: Vec::new(),
            shardable: true,
            sharded: false,
            prefetched_build: None,
            retry: RetryOptions::default(),
            delegation: DelegationOptions::default(),
        }
    }

    /// Shallow copy sharing providers and preparers but carrying no tests.
    /// Sharding moves slices of the test list into these copies.
    pub fn clone_without_tests(&self) -> Self {
        Self {
            test_tag: self.test_tag.clone(),
            command_line: self.command_line.clone(),
            source: self.source.clone(),
            options: self.options.clone(),
            build_provider: Arc::clone(&self.build_provider),
            device_setups: self.device_setups.clone(),
            multi_preparers: self.multi_preparers.clone(),
            tests: Vec::new(),
            shardable: self.shardable,
            sharded: self.sharded,
            prefetched_build: self.prefetched_build.clone(),
            retry: self.retry.clone(),
            delegation: self.delegation.clone(),
        }
    }
}

/// Retry policy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    #[serde(default)]
    pub strategy: RetryStrategyKind,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyKind::NoRetry,
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyKind {
    #[default]
    NoRetry,
    RetryUntilPass,
}

/// Settings for delegated execution, both variants.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DelegationOptions {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub subprocess: SubprocessOptions,
    #[serde(default)]
    pub remote: RemoteOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessOptions {
    /// Binary to spawn; defaults to the current executable.
    pub binary: Option<PathBuf>,
    #[serde(default = "default_subprocess_timeout_secs")]
    pub timeout_secs: u64,
    /// Config sections forwarded to the child. Everything else is withheld
    /// so host-side state does not leak into the worker.
    #[serde(default = "default_config_allowlist")]
    pub config_allowlist: Vec<String>,
}

impl Default for SubprocessOptions {
    fn default() -> Self {
        Self {
            binary: None,
            timeout_secs: default_subprocess_timeout_secs(),
            config_allowlist: default_config_allowlist(),
        }
    }
}

fn default_subprocess_timeout_secs() -> u64 {
    3600
}

fn default_config_allowlist() -> Vec<String> {
    ["invocation", "retry", "tests"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteOptions {
    pub host: Option<String>,
    #[serde(default = "default_remote_user")]
    pub user: String,
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default = "default_push_retries")]
    pub push_retries: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_connection_failures")]
    pub max_connection_failures: usize,
    /// Pull numbered result files as they appear rather than one final file.
    #[serde(default)]
    pub incremental_results: bool,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            host: None,
            user: default_remote_user(),
            key_path: None,
            remote_dir: default_remote_dir(),
            push_retries: default_push_retries(),
            poll_interval_secs: default_poll_interval_secs(),
            max_connection_failures: default_max_connection_failures(),
            incremental_results: false,
        }
    }
}

fn default_remote_user() -> String {
    "vsoc-01".to_string()
}

fn default_remote_dir() -> String {
    "/home/vsoc-01/convoy".to_string()
}

fn default_push_retries() -> usize {
    3
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_connection_failures() -> usize {
    10
}

/// Root of the TOML configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub invocation: InvocationSection,
    #[serde(default)]
    pub retry: RetryOptions,
    #[serde(default)]
    pub delegation: DelegationOptions,
    #[serde(default)]
    pub report: ReportSection,
    #[serde(default)]
    pub tests: Vec<TestSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationSection {
    pub test_tag: String,
    pub test_tag_suffix: Option<String>,
    pub shard_count: Option<usize>,
    pub shard_index: Option<usize>,
    #[serde(default)]
    pub replicate_setup: bool,
    pub invocation_timeout_secs: Option<u64>,
    #[serde(default)]
    pub bugreport_on_failure: bool,
    #[serde(default = "default_bugreport_timeout_secs")]
    pub bugreport_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub shardable: bool,
}

fn default_bugreport_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl InvocationSection {
    pub fn to_command_options(&self, run_mode: RunMode) -> CommandOptions {
        CommandOptions {
            shard_count: self.shard_count,
            shard_index: self.shard_index,
            replicate_setup: self.replicate_setup,
            invocation_timeout: self.invocation_timeout_secs.map(Duration::from_secs),
            bugreport_on_failure: self.bugreport_on_failure,
            bugreport_timeout: Duration::from_secs(self.bugreport_timeout_secs),
            run_mode,
            test_tag_suffix: self.test_tag_suffix.clone(),
        }
    }
}

/// One declared test: a named run of host shell commands, one per case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSection {
    pub name: String,
    /// case name -> command line executed for it.
    pub cases: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub filterable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_true")]
    pub junit: bool,
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("invocation-results")
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
