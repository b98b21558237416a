//! JUnit XML output.
//!
//! Buffers everything reported to it and writes a JUnit XML file when the
//! invocation ends. One `<testsuite>` is emitted per test run; attempts of
//! the same run are merged first so retried cases show their final status.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="0" time="1.234">
//!   <testsuite name="smoke" tests="3" failures="1" errors="0" skipped="0" time="1.234">
//!     <testcase classname="smoke" name="boot" time="0.100"/>
//!     <testcase classname="smoke" name="network" time="0.150">
//!       <failure message="ping failed">stack trace</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::{
    merge_attempts, InvocationListener, RunRecorder, TestCaseId, TestRunResult, TestStatus,
};
use crate::error::FailureDescription;

/// Listener that writes a JUnit XML file at the end of the invocation.
///
/// Parent directories are created automatically if they don't exist.
pub struct JunitListener {
    output_path: PathBuf,
    recorder: RunRecorder,
}

impl JunitListener {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            recorder: RunRecorder::new(),
        }
    }

    /// Merged view of everything recorded, one run per name.
    fn merged_runs(&self) -> Vec<TestRunResult> {
        let mut order: Vec<&str> = Vec::new();
        let mut by_name: HashMap<&str, Vec<TestRunResult>> = HashMap::new();
        for run in self.recorder.runs() {
            if !by_name.contains_key(run.name.as_str()) {
                order.push(&run.name);
            }
            by_name.entry(&run.name).or_default().push(run.clone());
        }
        order
            .iter()
            .filter_map(|name| merge_attempts(&by_name[name]))
            .collect()
    }

    fn generate_xml(&self, elapsed: Duration) -> anyhow::Result<String> {
        let runs = self.merged_runs();
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests: usize = runs.iter().map(|r| r.cases.len()).sum();
        let failures: usize = runs
            .iter()
            .map(|r| r.count_with_status(TestStatus::Failed))
            .sum();
        let errors = self.recorder.invocation_failures().len()
            + runs.iter().filter(|r| r.run_failure.is_some()).count();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("errors", errors.to_string().as_str()));
        testsuites.push_attribute(("time", format!("{:.3}", elapsed.as_secs_f64()).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        for run in &runs {
            self.write_testsuite(&mut writer, run)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        let xml = String::from_utf8(writer.into_inner())?;
        Ok(xml)
    }

    fn write_testsuite<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        run: &TestRunResult,
    ) -> anyhow::Result<()> {
        let failures = run.count_with_status(TestStatus::Failed);
        let skipped = run.count_with_status(TestStatus::Ignored)
            + run.count_with_status(TestStatus::AssumptionFailure);
        let errors = usize::from(run.run_failure.is_some());

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", run.name.as_str()));
        testsuite.push_attribute(("tests", run.cases.len().to_string().as_str()));
        testsuite.push_attribute(("failures", failures.to_string().as_str()));
        testsuite.push_attribute(("errors", errors.to_string().as_str()));
        testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuite.push_attribute((
            "time",
            format!("{:.3}", run.elapsed().as_secs_f64()).as_str(),
        ));
        writer.write_event(Event::Start(testsuite))?;

        if let Some(failure) = &run.run_failure {
            let mut error = BytesStart::new("error");
            error.push_attribute(("message", escape_xml(&failure.message).as_str()));
            writer.write_event(Event::Empty(error))?;
        }

        for (id, case) in &run.cases {
            self.write_testcase(writer, id, case)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        Ok(())
    }

    fn write_testcase<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        id: &TestCaseId,
        case: &super::TestCaseResult,
    ) -> anyhow::Result<()> {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", id.class_name.as_str()));
        testcase.push_attribute(("name", id.case_name.as_str()));

        match case.status {
            TestStatus::Passed => {
                writer.write_event(Event::Empty(testcase))?;
            }
            TestStatus::Failed | TestStatus::Incomplete => {
                writer.write_event(Event::Start(testcase))?;

                let mut failure = BytesStart::new("failure");
                if case.status == TestStatus::Incomplete {
                    failure.push_attribute(("message", "test did not complete"));
                }
                writer.write_event(Event::Start(failure))?;
                if let Some(trace) = &case.trace {
                    writer.write_event(Event::Text(BytesText::new(&escape_xml(trace))))?;
                }
                writer.write_event(Event::End(BytesEnd::new("failure")))?;

                writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            }
            TestStatus::AssumptionFailure | TestStatus::Ignored => {
                writer.write_event(Event::Start(testcase))?;
                writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
                writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl InvocationListener for JunitListener {
    async fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.recorder.invocation_failed(failure).await;
    }

    async fn test_run_started(&mut self, name: &str, expected_count: usize, attempt: usize) {
        self.recorder
            .test_run_started(name, expected_count, attempt)
            .await;
    }

    async fn test_started(&mut self, id: &TestCaseId) {
        self.recorder.test_started(id).await;
    }

    async fn test_failed(&mut self, id: &TestCaseId, trace: &str) {
        self.recorder.test_failed(id, trace).await;
    }

    async fn test_assumption_failure(&mut self, id: &TestCaseId, trace: &str) {
        self.recorder.test_assumption_failure(id, trace).await;
    }

    async fn test_ignored(&mut self, id: &TestCaseId) {
        self.recorder.test_ignored(id).await;
    }

    async fn test_ended(&mut self, id: &TestCaseId, metrics: &HashMap<String, String>) {
        self.recorder.test_ended(id, metrics).await;
    }

    async fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.recorder.test_run_failed(failure).await;
    }

    async fn test_run_ended(&mut self, elapsed: Duration, metrics: &HashMap<String, String>) {
        self.recorder.test_run_ended(elapsed, metrics).await;
    }

    async fn invocation_ended(&mut self, elapsed: Duration) {
        match self.generate_xml(elapsed) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent() {
                    if !parent.exists() {
                        if let Err(e) = std::fs::create_dir_all(parent) {
                            tracing::error!("Failed to create output directory: {}", e);
                            return;
                        }
                    }
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
        // Also remove invalid XML characters
        .chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn feed(listener: &mut JunitListener) {
        listener.test_run_started("suite", 2, 0).await;
        let pass = TestCaseId::new("suite", "good");
        let fail = TestCaseId::new("suite", "bad");
        listener.test_started(&pass).await;
        listener.test_ended(&pass, &HashMap::new()).await;
        listener.test_started(&fail).await;
        listener.test_failed(&fail, "boom <&>").await;
        listener.test_ended(&fail, &HashMap::new()).await;
        listener
            .test_run_ended(Duration::from_millis(1234), &HashMap::new())
            .await;
    }

    #[tokio::test]
    async fn writes_suite_with_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junit.xml");
        let mut listener = JunitListener::new(path.clone());
        feed(&mut listener).await;
        listener.invocation_ended(Duration::from_secs(2)).await;

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains("<testsuite name=\"suite\" tests=\"2\" failures=\"1\""));
        assert!(xml.contains("name=\"good\""));
        assert!(xml.contains("boom &lt;&amp;&gt;"));
    }

    #[tokio::test]
    async fn retried_attempts_merge_into_one_suite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junit.xml");
        let mut listener = JunitListener::new(path.clone());

        let flaky = TestCaseId::new("suite", "flaky");
        for attempt in 0..2 {
            listener.test_run_started("suite", 1, attempt).await;
            listener.test_started(&flaky).await;
            if attempt == 0 {
                listener.test_failed(&flaky, "first try").await;
            }
            listener.test_ended(&flaky, &HashMap::new()).await;
            listener
                .test_run_ended(Duration::from_millis(10), &HashMap::new())
                .await;
        }
        listener.invocation_ended(Duration::from_secs(1)).await;

        let xml = std::fs::read_to_string(&path).unwrap();
        assert_eq!(xml.matches("<testsuite ").count(), 1);
        assert!(xml.contains("failures=\"0\""));
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/results/junit.xml");
        let mut listener = JunitListener::new(path.clone());
        feed(&mut listener).await;
        listener.invocation_ended(Duration::from_secs(1)).await;
        assert!(path.exists());
    }
}
