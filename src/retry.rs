//! Retry loop around a single test: attempts, targeting, time accounting.
//!
//! The loop owns the `test_run_started`/`test_run_ended` framing for every
//! attempt and records each attempt as its own [`TestRunResult`]. What to
//! re-run between attempts is the [`RetryDecision`]'s call; the loop only
//! applies it. Tests that expose no [`TestFilter`] seam cannot be targeted
//! and are never re-run, and their attempts never count toward the retry
//! time metric.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::config::{RetryOptions, RetryStrategyKind};
use crate::context::{keys, TestInformation};
use crate::error::{FailureDescription, InvocationError, InvocationResult};
use crate::results::{
    InvocationListener, LogKind, LogSource, RunRecorder, TestCaseId, TestRunResult,
};
use crate::testtype::RemoteTest;

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryVerdict {
    Stop,
    /// Re-run. An empty case list means the whole test runs again, which
    /// is the only option after a run-level failure.
    Retry { cases: Vec<TestCaseId> },
}

/// Policy deciding whether and what to re-run after each attempt.
pub trait RetryDecision: Send {
    /// Upper bound on attempts, first run included. At least 1.
    fn max_attempts(&self) -> usize;

    fn decide(&mut self, attempt: usize, run: &TestRunResult) -> RetryVerdict;
}

/// Single attempt, no matter the outcome.
pub struct NoRetry;

impl RetryDecision for NoRetry {
    fn max_attempts(&self) -> usize {
        1
    }

    fn decide(&mut self, _attempt: usize, _run: &TestRunResult) -> RetryVerdict {
        RetryVerdict::Stop
    }
}

/// Re-run failures until everything passed or attempts run out.
pub struct RetryUntilPass {
    max_attempts: usize,
}

impl RetryUntilPass {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryDecision for RetryUntilPass {
    fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn decide(&mut self, _attempt: usize, run: &TestRunResult) -> RetryVerdict {
        let failed = run.failed_cases();
        if !failed.is_empty() {
            return RetryVerdict::Retry { cases: failed };
        }
        if run.run_failure.is_some() {
            // Run-level failure leaves no per-case signal. Everything
            // runs again.
            return RetryVerdict::Retry { cases: Vec::new() };
        }
        RetryVerdict::Stop
    }
}

/// Decision instance for the configured strategy.
pub fn decision_for(options: &RetryOptions) -> Box<dyn RetryDecision> {
    match options.strategy {
        RetryStrategyKind::NoRetry => Box::new(NoRetry),
        RetryStrategyKind::RetryUntilPass => Box::new(RetryUntilPass::new(options.max_attempts)),
    }
}

/// Forwards every event to both wrapped listeners.
struct Tee<'a> {
    live: &'a mut dyn InvocationListener,
    recorder: &'a mut RunRecorder,
}

#[async_trait::async_trait]
impl InvocationListener for Tee<'_> {
    async fn test_run_started(&mut self, name: &str, expected_count: usize, attempt: usize) {
        self.live.test_run_started(name, expected_count, attempt).await;
        self.recorder
            .test_run_started(name, expected_count, attempt)
            .await;
    }

    async fn test_started(&mut self, id: &TestCaseId) {
        self.live.test_started(id).await;
        self.recorder.test_started(id).await;
    }

    async fn test_failed(&mut self, id: &TestCaseId, trace: &str) {
        self.live.test_failed(id, trace).await;
        self.recorder.test_failed(id, trace).await;
    }

    async fn test_assumption_failure(&mut self, id: &TestCaseId, trace: &str) {
        self.live.test_assumption_failure(id, trace).await;
        self.recorder.test_assumption_failure(id, trace).await;
    }

    async fn test_ignored(&mut self, id: &TestCaseId) {
        self.live.test_ignored(id).await;
        self.recorder.test_ignored(id).await;
    }

    async fn test_ended(&mut self, id: &TestCaseId, metrics: &HashMap<String, String>) {
        self.live.test_ended(id, metrics).await;
        self.recorder.test_ended(id, metrics).await;
    }

    async fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.live.test_run_failed(failure).await;
        self.recorder.test_run_failed(failure).await;
    }

    async fn test_run_ended(&mut self, elapsed: std::time::Duration, metrics: &HashMap<String, String>) {
        self.live.test_run_ended(elapsed, metrics).await;
        self.recorder.test_run_ended(elapsed, metrics).await;
    }

    async fn test_log(&mut self, name: &str, kind: LogKind, source: &LogSource) {
        self.live.test_log(name, kind, source).await;
        self.recorder.test_log(name, kind, source).await;
    }
}

/// Run one test through the retry loop.
///
/// Returns every attempt's result, first to last. Device loss,
/// cancellation and timeouts abort immediately after being reported as a
/// run failure; other run errors are recorded and left to the decision.
pub async fn run_with_retry(
    test: &mut dyn RemoteTest,
    info: &TestInformation,
    listener: &mut dyn InvocationListener,
    decision: &mut dyn RetryDecision,
) -> InvocationResult<Vec<TestRunResult>> {
    let context = info.context().clone();
    // Sharding-aware tests compute their own slice from the context and
    // must not be re-entered with a narrowed filter.
    let max_attempts = if test.is_shard_aware() {
        1
    } else {
        decision.max_attempts().max(1)
    };
    let mut recorder = RunRecorder::new();

    for attempt in 0..max_attempts {
        let started = Instant::now();
        let expected = test.case_count();
        let run_result;
        {
            let mut tee = Tee {
                live: listener,
                recorder: &mut recorder,
            };
            tee.test_run_started(test.name(), expected, attempt).await;
            run_result = test.run(info, &mut tee).await;
            if let Err(err) = &run_result {
                tee.test_run_failed(&err.describe()).await;
            }
            tee.test_run_ended(started.elapsed(), &HashMap::new()).await;
        }

        if attempt > 0 {
            context.accumulate_time_metric(keys::RETRY_TIME_MS, started.elapsed());
        }

        if let Err(err) = run_result {
            if aborts_invocation(&err) {
                return Err(err);
            }
            debug!(test = test.name(), attempt, "run failed: {err}");
        }

        let last = recorder
            .runs()
            .last()
            .cloned()
            .unwrap_or_else(|| TestRunResult::new(test.name(), expected, attempt));

        match decision.decide(attempt, &last) {
            RetryVerdict::Stop => break,
            RetryVerdict::Retry { cases } if cases.is_empty() => {
                // A full re-run still needs the filter seam; tests without
                // one run exactly once no matter what failed.
                if test.as_filter().is_none() {
                    debug!(test = test.name(), "test cannot be filtered, not retrying");
                    break;
                }
                debug!(test = test.name(), attempt, "retrying full test");
            }
            RetryVerdict::Retry { cases } => {
                let name = test.name().to_owned();
                match test.as_filter() {
                    Some(filter) => {
                        debug!(
                            test = name,
                            attempt,
                            failed = cases.len(),
                            "retrying failed cases"
                        );
                        filter.restrict_to(&cases);
                    }
                    None => {
                        debug!(test = name, "test cannot be filtered, not retrying");
                        break;
                    }
                }
            }
        }
    }

    Ok(recorder.take_runs())
}

fn aborts_invocation(err: &InvocationError) -> bool {
    matches!(
        err,
        InvocationError::DeviceUnavailable { .. }
            | InvocationError::Cancelled(_)
            | InvocationError::TimedOut { .. }
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::InvocationContext;
    use crate::results::{merge_attempts, TestStatus};
    use crate::testtype::FakeTest;

    fn info() -> (tempfile::TempDir, TestInformation) {
        let dir = tempfile::tempdir().unwrap();
        let info = TestInformation::new(
            Arc::new(InvocationContext::new("retry")),
            dir.path().to_path_buf(),
        );
        (dir, info)
    }

    #[tokio::test]
    async fn no_retry_runs_exactly_once() {
        let (_dir, info) = info();
        let mut test = FakeTest::passing("t", &["a"]).always_failing("a");
        let mut sink = RunRecorder::new();
        let attempts = run_with_retry(&mut test, &info, &mut sink, &mut NoRetry)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(test.attempts_run(), 1);
    }

    #[tokio::test]
    async fn retry_until_pass_stops_once_green() {
        let (_dir, info) = info();
        let mut test = FakeTest::passing("t", &["flaky", "solid"]).failing_until("flaky", 2);
        let mut sink = RunRecorder::new();
        let mut decision = RetryUntilPass::new(5);
        let attempts = run_with_retry(&mut test, &info, &mut sink, &mut decision)
            .await
            .unwrap();

        assert_eq!(attempts.len(), 3);
        assert!(attempts[0].has_failures());
        assert!(attempts[1].has_failures());
        assert!(!attempts[2].has_failures());
        // The second attempt only ran the failed case.
        assert_eq!(attempts[1].cases.len(), 1);

        let merged = merge_attempts(&attempts).unwrap();
        assert_eq!(
            merged.cases[&TestCaseId::new("t", "flaky")].status,
            TestStatus::Passed
        );
        assert_eq!(
            merged.cases[&TestCaseId::new("t", "solid")].status,
            TestStatus::Passed
        );
    }

    #[tokio::test]
    async fn retry_stops_at_max_attempts() {
        let (_dir, info) = info();
        let mut test = FakeTest::passing("t", &["bad"]).always_failing("bad");
        let mut sink = RunRecorder::new();
        let mut decision = RetryUntilPass::new(3);
        let attempts = run_with_retry(&mut test, &info, &mut sink, &mut decision)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| a.has_failures()));
    }

    #[tokio::test]
    async fn unfilterable_test_is_not_retried() {
        let (_dir, info) = info();
        let mut test = FakeTest::passing("t", &["bad"])
            .always_failing("bad")
            .unfilterable();
        let mut sink = RunRecorder::new();
        let mut decision = RetryUntilPass::new(4);
        let attempts = run_with_retry(&mut test, &info, &mut sink, &mut decision)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(info.context().metrics().get(keys::RETRY_TIME_MS), None);
    }

    #[tokio::test]
    async fn unfilterable_test_runs_once_even_on_run_failure() {
        let (_dir, info) = info();
        let mut test = FakeTest::passing("t", &["a"])
            .with_run_error(InvocationError::Infra("tooling hiccup".into()))
            .unfilterable();
        let mut sink = RunRecorder::new();
        let mut decision = RetryUntilPass::new(3);
        let attempts = run_with_retry(&mut test, &info, &mut sink, &mut decision)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(test.attempts_run(), 1);
    }

    #[tokio::test]
    async fn retry_time_counts_only_re_runs() {
        let (_dir, info) = info();
        let mut test = FakeTest::passing("t", &["flaky"]).failing_until("flaky", 1);
        let mut sink = RunRecorder::new();
        let mut decision = RetryUntilPass::new(3);
        run_with_retry(&mut test, &info, &mut sink, &mut decision)
            .await
            .unwrap();
        // Two attempts ran; only the second accrues retry time.
        assert!(info.context().metrics().contains_key(keys::RETRY_TIME_MS));
    }

    #[tokio::test]
    async fn device_loss_aborts_the_loop() {
        let (_dir, info) = info();
        let mut test = FakeTest::passing("t", &["a"]).with_run_error(
            InvocationError::DeviceUnavailable {
                message: "gone".into(),
                serial: "serial-1".into(),
                unresponsive: false,
            },
        );
        let mut sink = RunRecorder::new();
        let mut decision = RetryUntilPass::new(3);
        let err = run_with_retry(&mut test, &info, &mut sink, &mut decision)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::DeviceUnavailable { .. }));
        // The failed run was still reported before the abort.
        assert_eq!(sink.runs().len(), 1);
        assert!(sink.runs()[0].run_failure.is_some());
    }

    #[tokio::test]
    async fn run_failure_retries_whole_test() {
        let (_dir, info) = info();
        let mut test = FakeTest::passing("t", &["a", "b"])
            .with_run_error(InvocationError::Infra("tooling hiccup".into()));
        let mut sink = RunRecorder::new();
        let mut decision = RetryUntilPass::new(2);
        let attempts = run_with_retry(&mut test, &info, &mut sink, &mut decision)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].run_failure.is_some());
        // Second attempt ran the full case list again.
        assert_eq!(attempts[1].cases.len(), 2);
    }
}
