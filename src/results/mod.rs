//! Test result model and the listener event protocol.
//!
//! Results are produced incrementally during execution: a listener receives
//! a `test_run_started` / per-case events / `test_run_ended` bracket for
//! every named run, plus invocation-level start/failure/end events. The
//! in-memory model ([`TestRunResult`]) mirrors that protocol so collectors
//! can replay what they buffered.
//!
//! # Key Components
//!
//! - [`InvocationListener`]: the event protocol (defined in one place,
//!   implemented by console, JUnit, shard and recording listeners)
//! - [`ListenerSet`]: fans one event out to many listeners
//! - [`RunRecorder`]: buffers events back into [`TestRunResult`]s
//! - [`merge_attempts`]: collapses per-attempt results into one final run

pub mod console;
pub mod junit;
pub mod shard;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::InvocationContext;
use crate::error::FailureDescription;

pub use console::ConsoleListener;
pub use junit::JunitListener;
pub use shard::ShardListener;

/// Identifies one test case inside a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestCaseId {
    /// Grouping name (suite class, module path, activity name).
    pub class_name: String,
    /// Case name within the group.
    pub case_name: String,
}

impl TestCaseId {
    pub fn new(class_name: impl Into<String>, case_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            case_name: case_name.into(),
        }
    }
}

impl std::fmt::Display for TestCaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.class_name, self.case_name)
    }
}

/// Terminal status of one test case in one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    AssumptionFailure,
    Ignored,
    /// Started but never ended (device loss, run abort).
    Incomplete,
}

impl TestStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Incomplete)
    }
}

/// Outcome of one test case in one attempt. Immutable once the case ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub status: TestStatus,
    /// Failure trace, present for failed / assumption-failure cases.
    pub trace: Option<String>,
    pub metrics: HashMap<String, String>,
}

impl TestCaseResult {
    pub fn passed() -> Self {
        Self {
            status: TestStatus::Passed,
            trace: None,
            metrics: HashMap::new(),
        }
    }

    pub fn failed(trace: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Failed,
            trace: Some(trace.into()),
            metrics: HashMap::new(),
        }
    }

    pub fn incomplete() -> Self {
        Self {
            status: TestStatus::Incomplete,
            trace: None,
            metrics: HashMap::new(),
        }
    }
}

/// Result of one named test run for one attempt.
///
/// Produced incrementally while the run executes; never mutated once the
/// attempt is finalized (`complete` set by `test_run_ended`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub name: String,
    pub expected_count: usize,
    /// Attempt index, 0 for the first execution.
    pub attempt: usize,
    pub start_ms: i64,
    pub end_ms: i64,
    /// Run-level failure (the whole run aborted), distinct from case failures.
    pub run_failure: Option<FailureDescription>,
    pub cases: BTreeMap<TestCaseId, TestCaseResult>,
    pub metrics: HashMap<String, String>,
    pub complete: bool,
}

impl TestRunResult {
    pub fn new(name: impl Into<String>, expected_count: usize, attempt: usize) -> Self {
        Self {
            name: name.into(),
            expected_count,
            attempt,
            start_ms: chrono::Utc::now().timestamp_millis(),
            end_ms: 0,
            run_failure: None,
            cases: BTreeMap::new(),
            metrics: HashMap::new(),
            complete: false,
        }
    }

    pub fn failed_cases(&self) -> Vec<TestCaseId> {
        self.cases
            .iter()
            .filter(|(_, r)| r.status.is_failure())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.run_failure.is_some() || self.cases.values().any(|r| r.status.is_failure())
    }

    pub fn count_with_status(&self, status: TestStatus) -> usize {
        self.cases.values().filter(|r| r.status == status).count()
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.end_ms.saturating_sub(self.start_ms).max(0) as u64)
    }
}

/// Merges per-attempt results of one named run into a single final result.
///
/// The last non-failing outcome per case wins; a case that failed in every
/// attempt stays failed and appears exactly once. Run-level failures clear
/// when a later attempt completed without one. Metrics are merged with
/// later attempts overriding earlier keys.
pub fn merge_attempts(attempts: &[TestRunResult]) -> Option<TestRunResult> {
    let first = attempts.first()?;
    let last = attempts.last()?;

    let mut merged = TestRunResult {
        name: first.name.clone(),
        expected_count: first.expected_count,
        attempt: 0,
        start_ms: first.start_ms,
        end_ms: last.end_ms,
        run_failure: last.run_failure.clone(),
        cases: BTreeMap::new(),
        metrics: HashMap::new(),
        complete: attempts.iter().all(|a| a.complete),
    };

    for attempt in attempts {
        merged.metrics.extend(attempt.metrics.clone());
        for (id, result) in &attempt.cases {
            match merged.cases.get(id) {
                Some(existing) if !existing.status.is_failure() => {
                    // Already succeeded in an earlier attempt; keep it.
                }
                _ => {
                    merged.cases.insert(id.clone(), result.clone());
                }
            }
        }
    }
    Some(merged)
}

/// Classification of a log blob forwarded through `test_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Text,
    HostLog,
    DeviceLog,
    Bugreport,
    ProtoResults,
}

/// A log payload: either bytes already in memory or a file on the host.
#[derive(Debug, Clone)]
pub enum LogSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl LogSource {
    /// Reads the payload, whatever its backing.
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        match self {
            LogSource::Bytes(b) => Ok(b.clone()),
            LogSource::File(p) => std::fs::read(p),
        }
    }
}

/// Receives the event stream of one invocation.
///
/// All methods have empty defaults so listeners only implement what they
/// care about. Events for a single run arrive strictly bracketed:
/// `test_run_started` .. case events .. `test_run_ended`. The invocation
/// itself is bracketed by exactly one `invocation_started` /
/// `invocation_ended` pair, including degenerate failed invocations.
#[async_trait]
pub trait InvocationListener: Send {
    /// Whether this listener wants per-attempt results rather than results
    /// merged across retry attempts.
    fn supports_granular_results(&self) -> bool {
        false
    }

    async fn invocation_started(&mut self, _context: &InvocationContext) {}

    async fn invocation_failed(&mut self, _failure: &FailureDescription) {}

    async fn invocation_ended(&mut self, _elapsed: Duration) {}

    async fn test_module_started(&mut self, _name: &str) {}

    async fn test_module_ended(&mut self) {}

    async fn test_run_started(&mut self, _name: &str, _expected_count: usize, _attempt: usize) {}

    async fn test_started(&mut self, _id: &TestCaseId) {}

    async fn test_failed(&mut self, _id: &TestCaseId, _trace: &str) {}

    async fn test_assumption_failure(&mut self, _id: &TestCaseId, _trace: &str) {}

    async fn test_ignored(&mut self, _id: &TestCaseId) {}

    async fn test_ended(&mut self, _id: &TestCaseId, _metrics: &HashMap<String, String>) {}

    async fn test_run_failed(&mut self, _failure: &FailureDescription) {}

    async fn test_run_ended(&mut self, _elapsed: Duration, _metrics: &HashMap<String, String>) {}

    async fn test_log(&mut self, _name: &str, _kind: LogKind, _source: &LogSource) {}

    /// Reports where a log-saving listener persisted a blob.
    async fn test_log_saved(&mut self, _name: &str, _kind: LogKind, _saved_path: &PathBuf) {}
}

/// Fans every event out to a list of listeners, in registration order.
pub struct ListenerSet {
    listeners: Vec<Box<dyn InvocationListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: impl InvocationListener + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    pub fn push(&mut self, listener: Box<dyn InvocationListener>) {
        self.listeners.push(listener);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! forward_all {
    ($self:ident, $($call:tt)*) => {
        for listener in &mut $self.listeners {
            listener.$($call)*.await;
        }
    };
}

#[async_trait]
impl InvocationListener for ListenerSet {
    fn supports_granular_results(&self) -> bool {
        // Granular (per-attempt) flushing is only safe when every consumer
        // understands attempts; otherwise flush merged.
        !self.listeners.is_empty()
            && self
                .listeners
                .iter()
                .all(|l| l.supports_granular_results())
    }

    async fn invocation_started(&mut self, context: &InvocationContext) {
        forward_all!(self, invocation_started(context));
    }

    async fn invocation_failed(&mut self, failure: &FailureDescription) {
        forward_all!(self, invocation_failed(failure));
    }

    async fn invocation_ended(&mut self, elapsed: Duration) {
        forward_all!(self, invocation_ended(elapsed));
    }

    async fn test_module_started(&mut self, name: &str) {
        forward_all!(self, test_module_started(name));
    }

    async fn test_module_ended(&mut self) {
        forward_all!(self, test_module_ended());
    }

    async fn test_run_started(&mut self, name: &str, expected_count: usize, attempt: usize) {
        forward_all!(self, test_run_started(name, expected_count, attempt));
    }

    async fn test_started(&mut self, id: &TestCaseId) {
        forward_all!(self, test_started(id));
    }

    async fn test_failed(&mut self, id: &TestCaseId, trace: &str) {
        forward_all!(self, test_failed(id, trace));
    }

    async fn test_assumption_failure(&mut self, id: &TestCaseId, trace: &str) {
        forward_all!(self, test_assumption_failure(id, trace));
    }

    async fn test_ignored(&mut self, id: &TestCaseId) {
        forward_all!(self, test_ignored(id));
    }

    async fn test_ended(&mut self, id: &TestCaseId, metrics: &HashMap<String, String>) {
        forward_all!(self, test_ended(id, metrics));
    }

    async fn test_run_failed(&mut self, failure: &FailureDescription) {
        forward_all!(self, test_run_failed(failure));
    }

    async fn test_run_ended(&mut self, elapsed: Duration, metrics: &HashMap<String, String>) {
        forward_all!(self, test_run_ended(elapsed, metrics));
    }

    async fn test_log(&mut self, name: &str, kind: LogKind, source: &LogSource) {
        forward_all!(self, test_log(name, kind, source));
    }

    async fn test_log_saved(&mut self, name: &str, kind: LogKind, saved_path: &PathBuf) {
        forward_all!(self, test_log_saved(name, kind, saved_path));
    }
}

/// Buffers the event stream back into [`TestRunResult`]s.
///
/// Used by the retry loop to capture per-attempt results and by
/// [`ShardListener`] as its local store. Log events are recorded as
/// (name, kind) so callers can forward them; payloads are not copied.
#[derive(Default)]
pub struct RunRecorder {
    current: Option<TestRunResult>,
    finished: Vec<TestRunResult>,
    invocation_failures: Vec<FailureDescription>,
    logs: Vec<(String, LogKind, LogSource)>,
}

impl RunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed runs, in completion order.
    pub fn runs(&self) -> &[TestRunResult] {
        &self.finished
    }

    pub fn take_runs(&mut self) -> Vec<TestRunResult> {
        std::mem::take(&mut self.finished)
    }

    /// Drops all buffered results for runs with the given name.
    pub fn clear_runs_named(&mut self, name: &str) {
        self.finished.retain(|r| r.name != name);
    }

    pub fn invocation_failures(&self) -> &[FailureDescription] {
        &self.invocation_failures
    }

    pub fn logs(&self) -> &[(String, LogKind, LogSource)] {
        &self.logs
    }

    fn current_mut(&mut self) -> Option<&mut TestRunResult> {
        self.current.as_mut()
    }
}

#[async_trait]
impl InvocationListener for RunRecorder {
    fn supports_granular_results(&self) -> bool {
        true
    }

    async fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.invocation_failures.push(failure.clone());
    }

    async fn test_run_started(&mut self, name: &str, expected_count: usize, attempt: usize) {
        self.current = Some(TestRunResult::new(name, expected_count, attempt));
    }

    async fn test_started(&mut self, id: &TestCaseId) {
        if let Some(run) = self.current_mut() {
            run.cases.insert(
                id.clone(),
                TestCaseResult {
                    status: TestStatus::Incomplete,
                    trace: None,
                    metrics: HashMap::new(),
                },
            );
        }
    }

    async fn test_failed(&mut self, id: &TestCaseId, trace: &str) {
        if let Some(run) = self.current_mut() {
            if let Some(case) = run.cases.get_mut(id) {
                case.status = TestStatus::Failed;
                case.trace = Some(trace.to_string());
            }
        }
    }

    async fn test_assumption_failure(&mut self, id: &TestCaseId, trace: &str) {
        if let Some(run) = self.current_mut() {
            if let Some(case) = run.cases.get_mut(id) {
                case.status = TestStatus::AssumptionFailure;
                case.trace = Some(trace.to_string());
            }
        }
    }

    async fn test_ignored(&mut self, id: &TestCaseId) {
        if let Some(run) = self.current_mut() {
            if let Some(case) = run.cases.get_mut(id) {
                case.status = TestStatus::Ignored;
            }
        }
    }

    async fn test_ended(&mut self, id: &TestCaseId, metrics: &HashMap<String, String>) {
        if let Some(run) = self.current_mut() {
            if let Some(case) = run.cases.get_mut(id) {
                if case.status == TestStatus::Incomplete {
                    case.status = TestStatus::Passed;
                }
                case.metrics.extend(metrics.clone());
            }
        }
    }

    async fn test_run_failed(&mut self, failure: &FailureDescription) {
        if let Some(run) = self.current_mut() {
            run.run_failure = Some(failure.clone());
        }
    }

    async fn test_run_ended(&mut self, _elapsed: Duration, metrics: &HashMap<String, String>) {
        if let Some(mut run) = self.current.take() {
            run.end_ms = chrono::Utc::now().timestamp_millis();
            run.metrics.extend(metrics.clone());
            run.complete = true;
            self.finished.push(run);
        }
    }

    async fn test_log(&mut self, name: &str, kind: LogKind, source: &LogSource) {
        self.logs.push((name.to_string(), kind, source.clone()));
    }
}

/// Replays a finished run as listener events, in bracket order.
pub async fn replay_run(run: &TestRunResult, listener: &mut dyn InvocationListener) {
    listener
        .test_run_started(&run.name, run.expected_count, run.attempt)
        .await;
    for (id, case) in &run.cases {
        listener.test_started(id).await;
        match case.status {
            TestStatus::Failed | TestStatus::Incomplete => {
                listener
                    .test_failed(id, case.trace.as_deref().unwrap_or("test did not complete"))
                    .await;
            }
            TestStatus::AssumptionFailure => {
                listener
                    .test_assumption_failure(id, case.trace.as_deref().unwrap_or(""))
                    .await;
            }
            TestStatus::Ignored => {
                listener.test_ignored(id).await;
            }
            TestStatus::Passed => {}
        }
        listener.test_ended(id, &case.metrics).await;
    }
    if let Some(failure) = &run.run_failure {
        listener.test_run_failed(failure).await;
    }
    listener.test_run_ended(run.elapsed(), &run.metrics).await;
}
