//! Delegated execution on a remote VM.
//!
//! The whole invocation moves to the remote machine: the config is pushed
//! up, the worker is launched detached, and the host polls for liveness
//! and result files until a completion marker appears. Results come back
//! as length-delimited event files, numbered so replay stays ordered.
//! Worker logs are pulled no matter how the run ended.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire::{decode_all, deliver};
use crate::config::RemoteOptions;
use crate::context::TestInformation;
use crate::error::{InvocationError, InvocationResult};
use crate::results::{InvocationListener, LogKind, LogSource};

/// File the remote worker touches when its invocation is over.
pub const DONE_MARKER: &str = "invocation.done";
/// Result event files, numbered: `events_0.bin`, `events_1.bin`, ...
pub const EVENT_FILE_PATTERN: &str = r"^events_(\d+)\.bin$";
/// Worker log pulled back after the run.
pub const WORKER_LOG: &str = "worker.log";
/// Remote check that the worker process still exists.
const LIVENESS_CHECK: &str = "pgrep -f 'convoy run'";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Shell-level access to the remote machine.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn push(&self, local: &Path, remote: &str) -> InvocationResult<()>;

    async fn pull(&self, remote: &str, local: &Path) -> InvocationResult<()>;

    async fn run_command(&self, command: &str) -> InvocationResult<CommandOutput>;

    async fn is_alive(&self) -> bool {
        matches!(self.run_command("true").await, Ok(out) if out.success())
    }
}

/// Transport over the system ssh/scp binaries.
pub struct SshTransport {
    host: String,
    user: String,
    key_path: Option<PathBuf>,
    timeout: Duration,
}

impl SshTransport {
    pub fn from_options(options: &RemoteOptions) -> InvocationResult<Self> {
        let host = options
            .host
            .clone()
            .ok_or_else(|| InvocationError::Infra("remote host not configured".to_string()))?;
        let key_path = match &options.key_path {
            Some(path) => {
                let expanded = shellexpand::tilde(&path.to_string_lossy()).to_string();
                Some(PathBuf::from(expanded))
            }
            None => None,
        };
        Ok(Self {
            host,
            user: options.user.clone(),
            key_path,
            timeout: Duration::from_secs(120),
        })
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        args
    }

    async fn exec(&self, program: &str, args: Vec<String>) -> InvocationResult<CommandOutput> {
        debug!(program, ?args, "remote transport command");
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| InvocationError::TimedOut {
                message: format!("{program} did not return"),
                timeout: self.timeout,
            })?
            .map_err(|e| InvocationError::Infra(format!("failed to run {program}: {e}")))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn push(&self, local: &Path, remote: &str) -> InvocationResult<()> {
        let mut args = self.base_args();
        args.push(local.to_string_lossy().to_string());
        args.push(format!("{}:{}", self.target(), remote));
        let out = self.exec("scp", args).await?;
        if !out.success() {
            return Err(InvocationError::Infra(format!(
                "push to {remote} failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn pull(&self, remote: &str, local: &Path) -> InvocationResult<()> {
        let mut args = self.base_args();
        args.push(format!("{}:{}", self.target(), remote));
        args.push(local.to_string_lossy().to_string());
        let out = self.exec("scp", args).await?;
        if !out.success() {
            return Err(InvocationError::Infra(format!(
                "pull of {remote} failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn run_command(&self, command: &str) -> InvocationResult<CommandOutput> {
        let mut args = self.base_args();
        args.push(self.target());
        args.push(command.to_string());
        self.exec("ssh", args).await
    }
}

/// Runs one invocation on a remote VM and replays its results locally.
pub struct RemoteDelegate<T> {
    options: RemoteOptions,
    transport: T,
    /// Independent cap on the whole remote run.
    global_timeout: Option<Duration>,
}

impl<T: RemoteTransport> RemoteDelegate<T> {
    pub fn new(options: RemoteOptions, transport: T, global_timeout: Option<Duration>) -> Self {
        Self {
            options,
            transport,
            global_timeout,
        }
    }

    pub async fn run(
        &self,
        config_path: &Path,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
        cancel: &CancellationToken,
    ) -> InvocationResult<()> {
        let deadline = self.global_timeout.map(|t| Instant::now() + t);
        let remote_dir = &self.options.remote_dir;

        self.transport
            .run_command(&format!("mkdir -p {remote_dir}"))
            .await?;
        self.push_with_retries(config_path, &format!("{remote_dir}/convoy.toml"))
            .await?;
        self.launch(remote_dir).await?;

        let poll_result = self.poll(remote_dir, info, listener, cancel, deadline).await;

        // Logs come back regardless of how the run ended.
        self.fetch_worker_log(remote_dir, info.work_dir(), listener).await;

        poll_result
    }

    /// Bounded retries around the config upload. Transient connection
    /// loss during push is the most common remote failure.
    async fn push_with_retries(&self, local: &Path, remote: &str) -> InvocationResult<()> {
        let mut last_err = None;
        for attempt in 0..self.options.push_retries.max(1) {
            match self.transport.push(local, remote).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, "push failed: {err}");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| InvocationError::Infra("push failed".to_string())))
    }

    async fn launch(&self, remote_dir: &str) -> InvocationResult<()> {
        let command = format!(
            "cd {remote_dir} && nohup convoy run --config convoy.toml \
             --event-dir . > {WORKER_LOG} 2>&1 & echo started"
        );
        let out = self.transport.run_command(&command).await?;
        if !out.success() {
            return Err(InvocationError::Infra(format!(
                "failed to launch remote worker: {}",
                out.stderr.trim()
            )));
        }
        info!(remote_dir, "remote worker launched");
        Ok(())
    }

    async fn poll(
        &self,
        remote_dir: &str,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> InvocationResult<()> {
        let interval = Duration::from_secs(self.options.poll_interval_secs.max(1));
        let mut consecutive_failures = 0usize;
        // Per-file count of events already replayed. Event files grow
        // between polls; the count marks where the next replay resumes.
        let mut replayed: HashMap<String, usize> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                // Best effort stop; the worker cleans itself up on signal.
                let _ = self
                    .transport
                    .run_command(&format!("pkill -f 'convoy run' || true; rm -rf {remote_dir}"))
                    .await;
                return Err(InvocationError::Cancelled(
                    "remote invocation cancelled".to_string(),
                ));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(InvocationError::TimedOut {
                        message: "remote invocation exceeded its deadline".to_string(),
                        timeout: self.global_timeout.unwrap_or_default(),
                    });
                }
            }

            match self.transport.run_command(&format!("ls {remote_dir}")).await {
                Ok(out) if out.success() => {
                    consecutive_failures = 0;
                    let names: Vec<&str> = out.stdout.lines().map(str::trim).collect();

                    if self.options.incremental_results {
                        self.pull_events(remote_dir, info, &names, &mut replayed, listener)
                            .await?;
                    }

                    if names.contains(&DONE_MARKER) {
                        self.pull_events(remote_dir, info, &names, &mut replayed, listener)
                            .await?;
                        debug!(files = replayed.len(), "remote invocation complete");
                        return Ok(());
                    }

                    // Reachable host, no marker: make sure the worker
                    // process itself is still there.
                    if let Ok(check) = self.transport.run_command(LIVENESS_CHECK).await {
                        if !check.success() {
                            return self
                                .finish_after_worker_exit(remote_dir, info, &mut replayed, listener)
                                .await;
                        }
                    }
                }
                Ok(out) => {
                    consecutive_failures += 1;
                    warn!(
                        consecutive_failures,
                        "remote listing failed: {}",
                        out.stderr.trim()
                    );
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(consecutive_failures, "remote unreachable: {err}");
                }
            }

            if consecutive_failures >= self.options.max_connection_failures.max(1) {
                return Err(InvocationError::Infra(format!(
                    "lost contact with remote worker after {consecutive_failures} failed polls"
                )));
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// The liveness check found no worker process. It may have finished
    /// between the listing and the check; one more listing settles whether
    /// this is a clean exit or a crash without a marker.
    async fn finish_after_worker_exit(
        &self,
        remote_dir: &str,
        info: &TestInformation,
        replayed: &mut HashMap<String, usize>,
        listener: &mut dyn InvocationListener,
    ) -> InvocationResult<()> {
        if let Ok(out) = self.transport.run_command(&format!("ls {remote_dir}")).await {
            if out.success() {
                let names: Vec<&str> = out.stdout.lines().map(str::trim).collect();
                if names.contains(&DONE_MARKER) {
                    self.pull_events(remote_dir, info, &names, replayed, listener)
                        .await?;
                    return Ok(());
                }
            }
        }
        Err(InvocationError::Infra(
            "remote worker is no longer running and left no completion marker".to_string(),
        ))
    }

    /// Pull every visible event file and replay what has not been replayed
    /// yet. Files grow between polls and may appear out of numeric order;
    /// re-pulling each one and skipping its already-replayed prefix keeps
    /// the replay idempotent and gap-tolerant.
    async fn pull_events(
        &self,
        remote_dir: &str,
        info: &TestInformation,
        names: &[&str],
        replayed: &mut HashMap<String, usize>,
        listener: &mut dyn InvocationListener,
    ) -> InvocationResult<()> {
        let pattern = Regex::new(EVENT_FILE_PATTERN).expect("valid event file pattern");
        let mut numbered: BTreeMap<usize, &str> = BTreeMap::new();
        for name in names {
            if let Some(caps) = pattern.captures(name) {
                if let Ok(n) = caps[1].parse::<usize>() {
                    numbered.insert(n, name);
                }
            }
        }

        for (_, name) in numbered {
            let local = info.work_dir().join(name);
            self.transport
                .pull(&format!("{remote_dir}/{name}"), &local)
                .await?;
            let data = std::fs::read(&local)?;
            let events = decode_all(&data)?;
            let seen = replayed.entry(name.to_string()).or_insert(0);
            for event in events.iter().skip(*seen) {
                deliver(event, info, listener).await;
            }
            *seen = (*seen).max(events.len());
        }
        Ok(())
    }

    async fn fetch_worker_log(
        &self,
        remote_dir: &str,
        work_dir: &Path,
        listener: &mut dyn InvocationListener,
    ) {
        let local = work_dir.join(WORKER_LOG);
        match self
            .transport
            .pull(&format!("{remote_dir}/{WORKER_LOG}"), &local)
            .await
        {
            Ok(()) => {
                listener
                    .test_log(WORKER_LOG, LogKind::HostLog, &LogSource::File(local))
                    .await;
            }
            Err(err) => warn!("could not fetch worker log: {err}"),
        }
    }
}
