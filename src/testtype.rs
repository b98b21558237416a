//! Test types: the units of work the invocation engine executes.
//!
//! A [`RemoteTest`] owns one named test run. The engine drives it through
//! the listener callbacks; retry and sharding interact with it through the
//! optional [`TestFilter`] seam and the shard-awareness flag.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;

use crate::config::TestSection;
use crate::context::TestInformation;
use crate::error::{InvocationError, InvocationResult};
use crate::results::{InvocationListener, TestCaseId};

/// Restriction of a test to a subset of its cases. Tests that can re-run
/// individual cases expose this so the retry loop can target only the
/// failures of the previous attempt.
pub trait TestFilter {
    /// Limit the next run to exactly these cases.
    fn restrict_to(&mut self, cases: &[TestCaseId]);
}

/// One executable test run.
#[async_trait]
pub trait RemoteTest: Send + Sync {
    /// Run name reported through `test_run_started`.
    fn name(&self) -> &str;

    /// Number of cases the next run is expected to report.
    fn case_count(&self) -> usize;

    /// Execute the test, reporting every event to `listener`. The engine
    /// owns `test_run_started`/`test_run_ended` framing; the test reports
    /// only case-level events and run failures.
    async fn run(
        &mut self,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
    ) -> InvocationResult<()>;

    /// Case-level filtering seam, when the test supports it.
    fn as_filter(&mut self) -> Option<&mut dyn TestFilter> {
        None
    }

    /// Shard-aware tests read the shard attributes off the context and
    /// partition their own work; the engine then skips list partitioning
    /// for them.
    fn is_shard_aware(&self) -> bool {
        false
    }
}

/// Host-side test: each case is a shell command, pass/fail by exit status.
pub struct ShellTest {
    name: String,
    cases: BTreeMap<TestCaseId, String>,
    filterable: bool,
    restriction: Option<HashSet<TestCaseId>>,
}

impl ShellTest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cases: BTreeMap::new(),
            filterable: true,
            restriction: None,
        }
    }

    pub fn from_section(section: &TestSection) -> Self {
        let mut test = Self::new(&section.name);
        test.filterable = section.filterable;
        for (case, command) in &section.cases {
            test.add_case(case, command);
        }
        test
    }

    pub fn add_case(&mut self, case: impl Into<String>, command: impl Into<String>) {
        let id = TestCaseId::new(&self.name, case);
        self.cases.insert(id, command.into());
    }

    fn selected(&self) -> Vec<(TestCaseId, String)> {
        self.cases
            .iter()
            .filter(|(id, _)| match &self.restriction {
                Some(keep) => keep.contains(id),
                None => true,
            })
            .map(|(id, cmd)| (id.clone(), cmd.clone()))
            .collect()
    }
}

#[async_trait]
impl RemoteTest for ShellTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn case_count(&self) -> usize {
        self.selected().len()
    }

    async fn run(
        &mut self,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
    ) -> InvocationResult<()> {
        for (case, command) in self.selected() {
            listener.test_started(&case).await;

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(&command)
                .current_dir(info.work_dir())
                .stdin(std::process::Stdio::null());

            match cmd.output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let trace = format!(
                        "command exited with {}: {}",
                        output.status,
                        stderr.trim()
                    );
                    listener.test_failed(&case, &trace).await;
                }
                Err(err) => {
                    listener.test_ended(&case, &HashMap::new()).await;
                    return Err(InvocationError::Infra(format!(
                        "failed to spawn `{command}`: {err}"
                    )));
                }
            }

            listener.test_ended(&case, &HashMap::new()).await;
        }
        Ok(())
    }

    fn as_filter(&mut self) -> Option<&mut dyn TestFilter> {
        if self.filterable {
            Some(self)
        } else {
            None
        }
    }
}

impl TestFilter for ShellTest {
    fn restrict_to(&mut self, cases: &[TestCaseId]) {
        self.restriction = Some(cases.iter().cloned().collect());
    }
}

/// Scripted test for unit tests: declared case outcomes, failures that
/// clear themselves after a set number of attempts, optional run errors.
#[cfg(any(test, feature = "testing"))]
pub struct FakeTest {
    name: String,
    /// case -> number of attempts that fail before it passes.
    failing_attempts: BTreeMap<TestCaseId, usize>,
    cases: Vec<TestCaseId>,
    attempt: usize,
    filterable: bool,
    shard_aware: bool,
    restriction: Option<HashSet<TestCaseId>>,
    run_error: Option<InvocationError>,
}

#[cfg(any(test, feature = "testing"))]
impl FakeTest {
    pub fn passing(name: impl Into<String>, cases: &[&str]) -> Self {
        let name = name.into();
        let cases = cases
            .iter()
            .map(|c| TestCaseId::new(&name, *c))
            .collect();
        Self {
            name,
            failing_attempts: BTreeMap::new(),
            cases,
            attempt: 0,
            filterable: true,
            shard_aware: false,
            restriction: None,
            run_error: None,
        }
    }

    /// `case` fails for the first `attempts` runs and passes afterwards.
    pub fn failing_until(mut self, case: &str, attempts: usize) -> Self {
        let id = TestCaseId::new(&self.name, case);
        self.failing_attempts.insert(id, attempts);
        self
    }

    pub fn always_failing(self, case: &str) -> Self {
        self.failing_until(case, usize::MAX)
    }

    pub fn unfilterable(mut self) -> Self {
        self.filterable = false;
        self
    }

    pub fn shard_aware(mut self) -> Self {
        self.shard_aware = true;
        self
    }

    pub fn with_run_error(mut self, error: InvocationError) -> Self {
        self.run_error = Some(error);
        self
    }

    pub fn attempts_run(&self) -> usize {
        self.attempt
    }

    fn selected(&self) -> Vec<TestCaseId> {
        self.cases
            .iter()
            .filter(|id| match &self.restriction {
                Some(keep) => keep.contains(id),
                None => true,
            })
            .cloned()
            .collect()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl RemoteTest for FakeTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn case_count(&self) -> usize {
        self.selected().len()
    }

    async fn run(
        &mut self,
        _info: &TestInformation,
        listener: &mut dyn InvocationListener,
    ) -> InvocationResult<()> {
        if let Some(err) = self.run_error.take() {
            return Err(err);
        }
        let attempt = self.attempt;
        self.attempt += 1;
        for case in self.selected() {
            listener.test_started(&case).await;
            let fails = self
                .failing_attempts
                .get(&case)
                .map(|n| attempt < *n)
                .unwrap_or(false);
            if fails {
                listener.test_failed(&case, "scripted failure").await;
            }
            listener.test_ended(&case, &HashMap::new()).await;
        }
        Ok(())
    }

    fn as_filter(&mut self) -> Option<&mut dyn TestFilter> {
        if self.filterable {
            Some(self)
        } else {
            None
        }
    }

    fn is_shard_aware(&self) -> bool {
        self.shard_aware
    }
}

#[cfg(any(test, feature = "testing"))]
impl TestFilter for FakeTest {
    fn restrict_to(&mut self, cases: &[TestCaseId]) {
        self.restriction = Some(cases.iter().cloned().collect());
    }
}
