//! Delegated execution in a child process of this program.
//!
//! The parent binds an ephemeral TCP port, passes it to the child through
//! an environment variable, and replays the event stream the child
//! connects back with. The child runs an ordinary invocation whose only
//! listener is a [`StreamingListener`] over that socket.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire::{deliver, EventStreamReader, ResultEvent, StreamingListener};
use crate::config::SubprocessOptions;
use crate::context::TestInformation;
use crate::error::{InvocationError, InvocationResult};
use crate::results::{InvocationListener, LogKind, LogSource};

/// Port the worker must connect its result stream to.
pub const REPORT_PORT_ENV: &str = "CONVOY_REPORT_PORT";

/// Reads the report port out of the environment. Set means this process
/// is a delegated worker.
pub fn report_port_from_env() -> Option<u16> {
    std::env::var(REPORT_PORT_ENV).ok()?.parse().ok()
}

/// Connect the worker-side result stream.
pub async fn connect_reporter(port: u16) -> std::io::Result<StreamingListener<TcpStream>> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    Ok(StreamingListener::new(stream))
}

/// Reports a captured stdio file when it holds anything.
async fn report_stdio(listener: &mut dyn InvocationListener, name: &str, path: &Path) {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => {
            listener
                .test_log(name, LogKind::HostLog, &LogSource::File(path.to_path_buf()))
                .await;
        }
        _ => {}
    }
}

/// Runs one invocation in a spawned child process.
pub struct SubprocessDelegate {
    options: SubprocessOptions,
}

impl SubprocessDelegate {
    pub fn new(options: SubprocessOptions) -> Self {
        Self { options }
    }

    fn binary(&self) -> InvocationResult<PathBuf> {
        match &self.options.binary {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|e| InvocationError::Infra(format!("cannot locate own binary: {e}"))),
        }
    }

    /// Spawn the child against `config_path` and forward its event stream
    /// into `listener` until the child exits.
    ///
    /// The receiver is always drained before this returns, so no event
    /// that reached the socket is lost, timeout and cancellation included.
    /// The child's stdout and stderr are captured to files in the work
    /// folder and reported on every exit path. Timeouts kill the child and
    /// surface as a fatal error; cancellation kills it and rethrows.
    pub async fn run(
        &self,
        config_path: &Path,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
        cancel: &CancellationToken,
    ) -> InvocationResult<()> {
        let socket = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = socket.local_addr()?.port();
        debug!(port, "listening for subprocess results");

        let (tx, mut rx) = mpsc::unbounded_channel::<ResultEvent>();
        let receiver = tokio::spawn(async move {
            let (stream, _) = match socket.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("subprocess never connected: {e}");
                    return;
                }
            };
            let mut reader = EventStreamReader::new(stream);
            loop {
                match reader.next().await {
                    Ok(Some(event)) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("result stream error: {e}");
                        break;
                    }
                }
            }
        });

        let binary = self.binary()?;
        let stdout_path = info.work_dir().join("worker-stdout.log");
        let stderr_path = info.work_dir().join("worker-stderr.log");
        let stdout_file = std::fs::File::create(&stdout_path)?;
        let stderr_file = std::fs::File::create(&stderr_path)?;

        let mut cmd = tokio::process::Command::new(&binary);
        cmd.arg("run")
            .arg("--config")
            .arg(config_path)
            .env(REPORT_PORT_ENV, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);
        info!(binary = %binary.display(), "spawning delegated invocation");

        let mut child = cmd
            .spawn()
            .map_err(|e| InvocationError::Infra(format!("failed to spawn worker: {e}")))?;

        let timeout = Duration::from_secs(self.options.timeout_secs);
        let deadline = Instant::now() + timeout;
        let mut events_done = false;
        let mut received_any = false;

        let outcome = loop {
            tokio::select! {
                maybe = rx.recv(), if !events_done => {
                    match maybe {
                        Some(event) => {
                            received_any = true;
                            deliver(&event, info, listener).await;
                        }
                        None => events_done = true,
                    }
                }
                status = child.wait() => {
                    break status.map_err(|e| {
                        InvocationError::Infra(format!("failed to wait for worker: {e}"))
                    });
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    break Err(InvocationError::Cancelled(
                        "subprocess invocation cancelled".to_string(),
                    ));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    break Err(InvocationError::TimedOut {
                        message: "subprocess invocation exceeded its deadline".to_string(),
                        timeout,
                    });
                }
            }
        };

        // The socket hits EOF once the child is gone, killed or not. Join
        // the receiver, then drain whatever is still queued. A worker that
        // never connected leaves the receiver stuck in accept; give up on
        // it.
        let mut receiver = receiver;
        if tokio::time::timeout(Duration::from_secs(10), &mut receiver)
            .await
            .is_err()
        {
            warn!("result receiver did not finish after worker exit");
            receiver.abort();
        }
        while let Ok(event) = rx.try_recv() {
            received_any = true;
            deliver(&event, info, listener).await;
        }

        // Console output is the main diagnostic for a hung or crashed
        // worker; it goes out on every exit path.
        report_stdio(listener, "worker-stdout", &stdout_path).await;
        report_stdio(listener, "worker-stderr", &stderr_path).await;

        let status = outcome?;

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            if received_any {
                debug!(code, "worker exited non-zero after reporting results");
                return Ok(());
            }
            return Err(InvocationError::Infra(format!(
                "worker exited with code {code} without reporting any results"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use prost::Message;

    use super::*;
    use crate::context::InvocationContext;
    use crate::delegate::wire::{dispatch_event, EventKind};
    use crate::results::{RunRecorder, TestCaseId};

    // The full spawn path needs the built binary, so most tests drive the
    // delegate against shell scripts standing in for a worker.

    fn info() -> (tempfile::TempDir, TestInformation) {
        let dir = tempfile::tempdir().unwrap();
        let info = TestInformation::new(
            Arc::new(InvocationContext::new("delegate")),
            dir.path().to_path_buf(),
        );
        (dir, info)
    }

    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Script that ignores its arguments and hangs, standing in for a
    /// stuck worker that never connects back.
    fn hang_script(dir: &tempfile::TempDir) -> PathBuf {
        script(dir, "hang.sh", "#!/bin/sh\nsleep 30\n")
    }

    fn delegate_with(binary: PathBuf, timeout_secs: u64) -> SubprocessDelegate {
        SubprocessDelegate::new(SubprocessOptions {
            binary: Some(binary),
            timeout_secs,
            config_allowlist: Vec::new(),
        })
    }

    #[tokio::test]
    async fn worker_stream_reaches_listener() {
        let socket = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let writer = tokio::spawn(async move {
            let mut reporter = connect_reporter(port).await.unwrap();
            reporter.test_run_started("delegated", 1, 0).await;
            let id = TestCaseId::new("delegated", "case");
            reporter.test_started(&id).await;
            reporter.test_ended(&id, &HashMap::new()).await;
            reporter
                .test_run_ended(Duration::from_millis(7), &HashMap::new())
                .await;
        });

        let (stream, _) = socket.accept().await.unwrap();
        let mut reader = EventStreamReader::new(stream);
        let mut recorder = RunRecorder::new();
        while let Some(event) = reader.next().await.unwrap() {
            dispatch_event(&event, &mut recorder).await;
        }
        writer.await.unwrap();

        assert_eq!(recorder.runs().len(), 1);
        assert_eq!(recorder.runs()[0].name, "delegated");
        assert!(recorder.runs()[0].complete);
    }

    #[tokio::test]
    async fn missing_binary_is_an_infra_error() {
        let (_dir, info) = info();
        let delegate = delegate_with(PathBuf::from("/nonexistent/convoy-worker"), 5);
        let mut sink = RunRecorder::new();
        let cancel = CancellationToken::new();
        let err = delegate
            .run(Path::new("/tmp/none.toml"), &info, &mut sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Infra(_)));
    }

    #[tokio::test]
    async fn cancellation_kills_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (_work, info) = info();
        let delegate = delegate_with(hang_script(&dir), 600);
        let mut sink = RunRecorder::new();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });
        let err = delegate
            .run(Path::new("/tmp/none.toml"), &info, &mut sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Cancelled(_)));
    }

    #[tokio::test]
    async fn hung_worker_times_out_fatally() {
        let dir = tempfile::tempdir().unwrap();
        let (_work, info) = info();
        let delegate = delegate_with(hang_script(&dir), 1);
        let mut sink = RunRecorder::new();
        let cancel = CancellationToken::new();
        let err = delegate
            .run(Path::new("/tmp/none.toml"), &info, &mut sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn timed_out_worker_stdio_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (_work, info) = info();
        let chatty = script(
            &dir,
            "chatty.sh",
            "#!/bin/sh\necho out line\necho err line >&2\nsleep 30\n",
        );
        let delegate = delegate_with(chatty, 1);
        let mut recorder = RunRecorder::new();
        let cancel = CancellationToken::new();
        let err = delegate
            .run(Path::new("/tmp/none.toml"), &info, &mut recorder, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::TimedOut { .. }));

        let names: Vec<&str> = recorder.logs().iter().map(|(n, _, _)| n.as_str()).collect();
        assert!(names.contains(&"worker-stdout"));
        assert!(names.contains(&"worker-stderr"));
    }

    /// Length-delimited events a scripted worker feeds back: a context
    /// record plus one complete run.
    fn event_bytes() -> Vec<u8> {
        let worker = InvocationContext::new("delegate");
        worker.add_attribute("worker_host", "local").unwrap();

        let mut data = Vec::new();
        let mut started = ResultEvent::default();
        started.kind = EventKind::InvocationStarted as i32;
        started.context_json = serde_json::to_string(&worker.to_wire_record()).unwrap();
        data.extend_from_slice(&started.encode_length_delimited_to_vec());

        let mut run = ResultEvent::default();
        run.kind = EventKind::RunStarted as i32;
        run.run_name = "delegated".to_string();
        run.expected_count = 1;
        data.extend_from_slice(&run.encode_length_delimited_to_vec());

        let mut end = ResultEvent::default();
        end.kind = EventKind::RunEnded as i32;
        data.extend_from_slice(&end.encode_length_delimited_to_vec());
        data
    }

    #[tokio::test]
    async fn events_before_cancellation_are_drained_and_context_restored() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.bin");
        std::fs::write(&events_path, event_bytes()).unwrap();

        // Connects back, streams the canned events, then hangs until the
        // cancellation kills it.
        let worker = script(
            &dir,
            "report.sh",
            &format!(
                "#!/bin/bash\nexec 3<>/dev/tcp/127.0.0.1/${{{REPORT_PORT_ENV}}}\ncat {} >&3\nsleep 30\n",
                events_path.display()
            ),
        );

        let (_work, info) = info();
        let delegate = delegate_with(worker, 600);
        let mut recorder = RunRecorder::new();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel_clone.cancel();
        });

        let err = delegate
            .run(Path::new("/tmp/none.toml"), &info, &mut recorder, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Cancelled(_)));

        // Everything that reached the socket survived the cancellation.
        assert_eq!(recorder.runs().len(), 1);
        assert_eq!(recorder.runs()[0].name, "delegated");
        // And the worker's context attributes came back to the parent.
        assert_eq!(info.context().attributes("worker_host"), vec!["local"]);
    }
}
