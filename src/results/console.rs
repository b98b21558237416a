//! Console output for interactive runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::{InvocationListener, LogKind, TestCaseId, TestRunResult, TestStatus};
use crate::context::InvocationContext;
use crate::error::FailureDescription;

/// Listener that shows progress in the terminal.
pub struct ConsoleListener {
    progress: Option<indicatif::ProgressBar>,
    verbose: bool,
    totals: Totals,
    failed: Vec<(TestCaseId, Option<String>)>,
    current_run: Option<TestRunResult>,
}

#[derive(Default)]
struct Totals {
    passed: usize,
    failed: usize,
    skipped: usize,
    run_failures: usize,
}

impl ConsoleListener {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: None,
            verbose,
            totals: Totals::default(),
            failed: Vec::new(),
            current_run: None,
        }
    }

    fn println(&self, line: String) {
        match &self.progress {
            Some(pb) => pb.println(line),
            None => println!("{line}"),
        }
    }
}

#[async_trait]
impl InvocationListener for ConsoleListener {
    async fn invocation_started(&mut self, context: &InvocationContext) {
        println!(
            "Invocation {} ({})",
            context.invocation_id(),
            context.test_tag()
        );
    }

    async fn test_run_started(&mut self, name: &str, expected_count: usize, attempt: usize) {
        if attempt > 0 {
            self.println(format!("Retrying {name} (attempt {})", attempt + 1));
        } else {
            self.println(format!("Running {name} ({expected_count} tests)"));
        }

        let pb = indicatif::ProgressBar::new(expected_count as u64);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        self.progress = Some(pb);
        self.current_run = Some(TestRunResult::new(name, expected_count, attempt));
    }

    async fn test_started(&mut self, id: &TestCaseId) {
        if self.verbose {
            self.println(format!("Running: {id}"));
        }
        if let Some(run) = &mut self.current_run {
            run.cases
                .entry(id.clone())
                .or_insert_with(super::TestCaseResult::incomplete);
        }
    }

    async fn test_failed(&mut self, id: &TestCaseId, trace: &str) {
        if let Some(run) = &mut self.current_run {
            run.cases
                .insert(id.clone(), super::TestCaseResult::failed(trace));
        }
    }

    async fn test_ignored(&mut self, id: &TestCaseId) {
        if let Some(run) = &mut self.current_run {
            run.cases.insert(
                id.clone(),
                super::TestCaseResult {
                    status: TestStatus::Ignored,
                    trace: None,
                    metrics: HashMap::new(),
                },
            );
        }
    }

    async fn test_assumption_failure(&mut self, id: &TestCaseId, trace: &str) {
        if let Some(run) = &mut self.current_run {
            run.cases.insert(
                id.clone(),
                super::TestCaseResult {
                    status: TestStatus::AssumptionFailure,
                    trace: Some(trace.to_string()),
                    metrics: HashMap::new(),
                },
            );
        }
    }

    async fn test_ended(&mut self, id: &TestCaseId, _metrics: &HashMap<String, String>) {
        let status = match &mut self.current_run {
            Some(run) => {
                let case = run
                    .cases
                    .entry(id.clone())
                    .or_insert_with(super::TestCaseResult::passed);
                if case.status == TestStatus::Incomplete {
                    case.status = TestStatus::Passed;
                }
                case.status
            }
            None => TestStatus::Passed,
        };

        let trace = self
            .current_run
            .as_ref()
            .and_then(|run| run.cases.get(id))
            .and_then(|case| case.trace.clone());

        match status {
            TestStatus::Passed => self.totals.passed += 1,
            TestStatus::Failed | TestStatus::Incomplete => {
                self.totals.failed += 1;
                self.failed.push((id.clone(), trace.clone()));
            }
            TestStatus::Ignored | TestStatus::AssumptionFailure => self.totals.skipped += 1,
        }

        if let Some(pb) = &self.progress {
            pb.inc(1);
            let label = match status {
                TestStatus::Passed => console::style("PASS").green(),
                TestStatus::Failed | TestStatus::Incomplete => console::style("FAIL").red(),
                TestStatus::Ignored => console::style("SKIP").yellow(),
                TestStatus::AssumptionFailure => console::style("ASSM").yellow(),
            };
            if self.verbose || status.is_failure() {
                pb.println(format!("{label} {id}"));
            }
        }
    }

    async fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.totals.run_failures += 1;
        self.println(format!(
            "{} {}",
            console::style("RUN FAILED").red().bold(),
            failure.message
        ));
    }

    async fn test_run_ended(&mut self, _elapsed: Duration, _metrics: &HashMap<String, String>) {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }
        self.current_run = None;
    }

    async fn test_log(&mut self, name: &str, kind: LogKind, _source: &super::LogSource) {
        if self.verbose {
            self.println(format!("Captured log {name} ({kind:?})"));
        }
    }

    async fn invocation_failed(&mut self, failure: &FailureDescription) {
        println!(
            "{} {}",
            console::style("INVOCATION FAILED").red().bold(),
            failure.message
        );
    }

    async fn invocation_ended(&mut self, elapsed: Duration) {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!(
            "  Total:   {}",
            self.totals.passed + self.totals.failed + self.totals.skipped
        );
        println!("  Passed:  {}", console::style(self.totals.passed).green());
        println!("  Failed:  {}", console::style(self.totals.failed).red());
        println!("  Skipped: {}", console::style(self.totals.skipped).yellow());
        println!("  Duration: {:?}", elapsed);

        if self.totals.failed == 0 && self.totals.run_failures == 0 {
            println!();
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            println!();
            println!("{}", console::style("Some tests failed.").red().bold());
            if !self.failed.is_empty() {
                println!();
                println!("Failed tests:");
                for (id, trace) in &self.failed {
                    println!("  - {id}");
                    if let Some(trace) = trace {
                        if let Some(first) = trace.lines().next() {
                            println!("    {}", console::style(first).dim());
                        }
                    }
                }
            }
        }
    }
}
