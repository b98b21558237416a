//! Result forwarding from shard invocations to the parent listeners.
//!
//! Every shard gets its own [`ShardListener`] over the shared parent set.
//! Run events are buffered per shard and replayed into the parent in one
//! critical section when the shard finishes, so runs from different shards
//! never interleave. Logs skip the buffer and go out as they arrive, since
//! they carry their own names and need no run bracketing.
//!
//! The parent owns the `invocation_started` / `invocation_ended` pair;
//! shard-level occurrences of those events are swallowed here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    merge_attempts, replay_run, InvocationListener, ListenerSet, LogKind, LogSource, RunRecorder,
    TestCaseId, TestRunResult,
};
use crate::error::FailureDescription;

/// Per-shard buffering listener over a shared parent listener set.
pub struct ShardListener {
    shard_index: usize,
    parent: Arc<Mutex<ListenerSet>>,
    recorder: RunRecorder,
}

impl ShardListener {
    pub fn new(shard_index: usize, parent: Arc<Mutex<ListenerSet>>) -> Self {
        Self {
            shard_index,
            parent,
            recorder: RunRecorder::new(),
        }
    }

    /// Replay buffered runs into the parent under a single lock hold.
    ///
    /// Granular parents get every attempt verbatim. Otherwise the attempts
    /// of each run merge into one final result before replay.
    async fn flush(&mut self) {
        let runs = self.recorder.take_runs();
        let failures: Vec<FailureDescription> =
            self.recorder.invocation_failures().to_vec();
        if runs.is_empty() && failures.is_empty() {
            return;
        }

        let mut parent = self.parent.lock().await;
        debug!(shard = self.shard_index, runs = runs.len(), "flushing shard results");

        if parent.supports_granular_results() {
            for run in &runs {
                replay_run(run, &mut *parent).await;
            }
        } else {
            for run in merged_by_name(&runs) {
                replay_run(&run, &mut *parent).await;
            }
        }

        for failure in &failures {
            parent.invocation_failed(failure).await;
        }
    }
}

fn merged_by_name(runs: &[TestRunResult]) -> Vec<TestRunResult> {
    let mut order: Vec<&str> = Vec::new();
    let mut by_name: HashMap<&str, Vec<TestRunResult>> = HashMap::new();
    for run in runs {
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

#[async_trait]
impl InvocationListener for ShardListener {
    fn supports_granular_results(&self) -> bool {
        // Always buffer granular attempts; the flush decides how to
        // present them.
        true
    }

    // The parent invocation brackets itself. Shard-level start/end events
    // only trigger the flush.
    async fn invocation_started(&mut self, _context: &crate::context::InvocationContext) {}

    async fn invocation_ended(&mut self, _elapsed: Duration) {
        self.flush().await;
    }

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

    async fn test_log(&mut self, name: &str, kind: LogKind, source: &LogSource) {
        // Logs go straight through; the lock keeps the parent call atomic.
        let name = format!("shard{}-{}", self.shard_index, name);
        self.parent.lock().await.test_log(&name, kind, source).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Records the order of run names it sees, tagged by listener.
    struct OrderProbe {
        granular: bool,
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl InvocationListener for OrderProbe {
        fn supports_granular_results(&self) -> bool {
            self.granular
        }

        async fn test_run_started(&mut self, name: &str, _expected: usize, attempt: usize) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("start:{name}@{attempt}"));
        }

        async fn test_run_ended(&mut self, _elapsed: Duration, _metrics: &HashMap<String, String>) {
            self.seen.lock().unwrap().push("end".to_string());
        }
    }

    fn parent_with_spy(granular: bool) -> (Arc<Mutex<ListenerSet>>, Arc<StdMutex<Vec<String>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let set = ListenerSet::new().with_listener(OrderProbe {
            granular,
            seen: Arc::clone(&seen),
        });
        (Arc::new(Mutex::new(set)), seen)
    }

    async fn drive_shard(listener: &mut ShardListener, run_name: &str, attempts: usize) {
        for attempt in 0..attempts {
            listener.test_run_started(run_name, 1, attempt).await;
            let id = TestCaseId::new(run_name, "case");
            listener.test_started(&id).await;
            if attempt + 1 < attempts {
                listener.test_failed(&id, "flaky").await;
            }
            listener.test_ended(&id, &HashMap::new()).await;
            listener
                .test_run_ended(Duration::from_millis(5), &HashMap::new())
                .await;
        }
        listener.invocation_ended(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn shards_never_interleave_in_parent() {
        let (parent, seen) = parent_with_spy(true);
        let mut a = ShardListener::new(0, Arc::clone(&parent));
        let mut b = ShardListener::new(1, Arc::clone(&parent));

        tokio::join!(drive_shard(&mut a, "run-a", 1), drive_shard(&mut b, "run-b", 1));

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 4);
        // Whatever shard flushed first, each run's start/end pair is
        // contiguous.
        assert!(events[0].starts_with("start:"));
        assert_eq!(events[1], "end");
        assert!(events[2].starts_with("start:"));
        assert_eq!(events[3], "end");
    }

    #[tokio::test]
    async fn granular_parent_sees_every_attempt() {
        let (parent, seen) = parent_with_spy(true);
        let mut shard = ShardListener::new(0, Arc::clone(&parent));
        drive_shard(&mut shard, "flaky-run", 3).await;

        let events = seen.lock().unwrap().clone();
        let starts: Vec<&String> = events.iter().filter(|e| e.starts_with("start:")).collect();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[2], "start:flaky-run@2");
    }

    #[tokio::test]
    async fn merged_parent_sees_single_final_run() {
        let (parent, seen) = parent_with_spy(false);
        let mut shard = ShardListener::new(0, Arc::clone(&parent));
        drive_shard(&mut shard, "flaky-run", 3).await;

        let events = seen.lock().unwrap().clone();
        let starts: Vec<&String> = events.iter().filter(|e| e.starts_with("start:")).collect();
        assert_eq!(starts.len(), 1);
    }

    #[tokio::test]
    async fn merged_flush_reports_final_status() {
        let seen = Arc::new(StdMutex::new(Vec::new()));

        struct StatusProbe {
            seen: Arc<StdMutex<Vec<String>>>,
        }

        #[async_trait]
        impl InvocationListener for StatusProbe {
            async fn test_failed(&mut self, id: &TestCaseId, _trace: &str) {
                self.seen.lock().unwrap().push(format!("failed:{id}"));
            }

            async fn test_ended(&mut self, id: &TestCaseId, _m: &HashMap<String, String>) {
                self.seen.lock().unwrap().push(format!("ended:{id}"));
            }
        }

        let set = ListenerSet::new().with_listener(StatusProbe {
            seen: Arc::clone(&seen),
        });
        let parent = Arc::new(Mutex::new(set));
        let mut shard = ShardListener::new(0, Arc::clone(&parent));
        // Fails on attempt 0, passes on attempt 1; merged output is a pass.
        drive_shard(&mut shard, "run", 2).await;

        let events = seen.lock().unwrap().clone();
        assert!(events.iter().all(|e| !e.starts_with("failed:")));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn logs_forward_immediately_with_shard_prefix() {
        let seen = Arc::new(StdMutex::new(Vec::new()));

        struct LogProbe {
            seen: Arc<StdMutex<Vec<String>>>,
        }

        #[async_trait]
        impl InvocationListener for LogProbe {
            async fn test_log(&mut self, name: &str, _kind: LogKind, _source: &LogSource) {
                self.seen.lock().unwrap().push(name.to_string());
            }
        }

        let set = ListenerSet::new().with_listener(LogProbe {
            seen: Arc::clone(&seen),
        });
        let parent = Arc::new(Mutex::new(set));
        let mut shard = ShardListener::new(2, Arc::clone(&parent));

        shard
            .test_log("host_log", LogKind::HostLog, &LogSource::Bytes(vec![1, 2]))
            .await;

        // No flush happened yet; the log still reached the parent.
        assert_eq!(seen.lock().unwrap().clone(), vec!["shard2-host_log"]);
    }
}
