//! The invocation sequencer.
//!
//! [`TestInvocation::invoke`] drives one configuration through the fixed
//! stage pipeline: fetch build, resolve dynamic references, shard check,
//! device pre-setup, setup, test, teardown, device post-teardown, cleanup
//! and finalization. Every stage has a defined failure policy; whatever
//! happens, the listeners see exactly one `invocation_started` /
//! `invocation_ended` pair and every allocated device gets its
//! post-teardown call.
//!
//! How the middle stages execute is the [`ExecutionPath`]'s business:
//! regular in-process execution, a subprocess worker, or a remote VM.
//! The sequencer stays the same for all three.

mod execution;

pub use execution::{path_for, ExecutionPath, RegularPath, RemotePath, SubprocessPath};

use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::context::{keys, InvocationContext, TestInformation};
use crate::device::{Device, RecoveryMode};
use crate::error::{ExitCode, InvocationError, InvocationResult};
use crate::prep::PreparerRunner;
use crate::results::{InvocationListener, ListenerSet, LogKind, LogSource, ShardListener};
use crate::shard::{shard_config, CollectingRescheduler};

/// Cancellation signal for a running invocation.
///
/// The first `request_stop` wins; its cause and timestamp are what the
/// cancellation failure and the stop-latency metric report. Stage
/// boundaries poll this via [`StopHandle::check`]; long stages also hand
/// the underlying token to their delegates.
#[derive(Clone)]
pub struct StopHandle {
    token: CancellationToken,
    cause: Arc<Mutex<Option<StopCause>>>,
}

struct StopCause {
    reason: String,
    requested_at: Instant,
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(Mutex::new(None)),
        }
    }

    /// Requests the invocation to stop. Later requests keep the first cause.
    pub fn request_stop(&self, reason: impl Into<String>) {
        let mut cause = self.cause.lock().unwrap();
        if cause.is_none() {
            *cause = Some(StopCause {
                reason: reason.into(),
                requested_at: Instant::now(),
            });
        }
        drop(cause);
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stage-boundary poll. On a pending stop this records the stop
    /// latency metric and returns the cancellation as an error.
    pub fn check(&self, context: &InvocationContext) -> InvocationResult<()> {
        if !self.token.is_cancelled() {
            return Ok(());
        }
        let cause = self.cause.lock().unwrap();
        let reason = cause
            .as_ref()
            .map(|c| c.reason.clone())
            .unwrap_or_else(|| "stop requested".to_string());
        if let Some(c) = cause.as_ref() {
            context.accumulate_time_metric(keys::STOP_LATENCY_MS, c.requested_at.elapsed());
        }
        Err(InvocationError::Cancelled(reason))
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates devices for one configuration, parent or shard.
pub trait DeviceAllocator: Send + Sync {
    fn allocate(
        &self,
        config: &Configuration,
    ) -> InvocationResult<Vec<(String, Arc<dyn Device>)>>;
}

/// Hands out one in-memory stub device per declared device setup.
pub struct StubDeviceAllocator;

impl DeviceAllocator for StubDeviceAllocator {
    fn allocate(
        &self,
        config: &Configuration,
    ) -> InvocationResult<Vec<(String, Arc<dyn Device>)>> {
        use crate::device::StubDevice;
        Ok(config
            .device_setups
            .iter()
            .enumerate()
            .map(|(i, setup)| {
                let device: Arc<dyn Device> = Arc::new(StubDevice::new(format!("stub-{i}")));
                (setup.name.clone(), device)
            })
            .collect())
    }
}

/// Forwards every event into a shared listener set, locking per event.
///
/// The parent invocation reports through this so shard listeners over the
/// same set can interleave their flushes safely.
struct SharedListener {
    set: Arc<tokio::sync::Mutex<ListenerSet>>,
}

macro_rules! forward_shared {
    ($self:ident, $($call:tt)*) => {
        $self.set.lock().await.$($call)*.await
    };
}

#[async_trait::async_trait]
impl InvocationListener for SharedListener {
    async fn invocation_started(&mut self, context: &InvocationContext) {
        forward_shared!(self, invocation_started(context));
    }

    async fn invocation_failed(&mut self, failure: &crate::error::FailureDescription) {
        forward_shared!(self, invocation_failed(failure));
    }

    async fn invocation_ended(&mut self, elapsed: std::time::Duration) {
        forward_shared!(self, invocation_ended(elapsed));
    }

    async fn test_module_started(&mut self, name: &str) {
        forward_shared!(self, test_module_started(name));
    }

    async fn test_module_ended(&mut self) {
        forward_shared!(self, test_module_ended());
    }

    async fn test_run_started(&mut self, name: &str, expected_count: usize, attempt: usize) {
        forward_shared!(self, test_run_started(name, expected_count, attempt));
    }

    async fn test_started(&mut self, id: &crate::results::TestCaseId) {
        forward_shared!(self, test_started(id));
    }

    async fn test_failed(&mut self, id: &crate::results::TestCaseId, trace: &str) {
        forward_shared!(self, test_failed(id, trace));
    }

    async fn test_assumption_failure(&mut self, id: &crate::results::TestCaseId, trace: &str) {
        forward_shared!(self, test_assumption_failure(id, trace));
    }

    async fn test_ignored(&mut self, id: &crate::results::TestCaseId) {
        forward_shared!(self, test_ignored(id));
    }

    async fn test_ended(
        &mut self,
        id: &crate::results::TestCaseId,
        metrics: &std::collections::HashMap<String, String>,
    ) {
        forward_shared!(self, test_ended(id, metrics));
    }

    async fn test_run_failed(&mut self, failure: &crate::error::FailureDescription) {
        forward_shared!(self, test_run_failed(failure));
    }

    async fn test_run_ended(
        &mut self,
        elapsed: std::time::Duration,
        metrics: &std::collections::HashMap<String, String>,
    ) {
        forward_shared!(self, test_run_ended(elapsed, metrics));
    }

    async fn test_log(&mut self, name: &str, kind: LogKind, source: &LogSource) {
        forward_shared!(self, test_log(name, kind, source));
    }

    async fn test_log_saved(&mut self, name: &str, kind: LogKind, saved_path: &std::path::PathBuf) {
        forward_shared!(self, test_log_saved(name, kind, saved_path));
    }
}

/// What the stage pipeline produced, short of an error.
enum PipelineOutcome {
    /// All stages ran locally.
    Completed,
    /// The shard check split the invocation; the children carry the tests.
    Sharded(Vec<Configuration>),
}

/// One invocation of one configuration.
pub struct TestInvocation {
    config: Configuration,
    context: Arc<InvocationContext>,
    stop: StopHandle,
}

impl TestInvocation {
    pub fn new(config: Configuration, stop: StopHandle) -> Self {
        let context = Arc::new(InvocationContext::new(config.test_tag.clone()));
        Self {
            config,
            context,
            stop,
        }
    }

    pub fn context(&self) -> &Arc<InvocationContext> {
        &self.context
    }

    /// Runs the invocation to completion and reports through `listeners`.
    ///
    /// The set goes behind a mutex so shard sub-invocations can forward
    /// into it without interleaving runs.
    pub async fn invoke(
        self,
        allocator: &dyn DeviceAllocator,
        listeners: ListenerSet,
    ) -> ExitCode {
        let shared = Arc::new(tokio::sync::Mutex::new(listeners));
        let mut proxy = SharedListener {
            set: Arc::clone(&shared),
        };
        self.invoke_with(allocator, &mut proxy, &shared).await
    }

    /// Core sequencer. Exactly one started/ended pair reaches `listener`,
    /// no matter which stage fails.
    ///
    /// Returns a boxed future because the function is recursive through
    /// shard children; boxing breaks the `Send` inference cycle.
    fn invoke_with<'a>(
        mut self,
        allocator: &'a dyn DeviceAllocator,
        listener: &'a mut dyn InvocationListener,
        shared: &'a Arc<tokio::sync::Mutex<ListenerSet>>,
    ) -> BoxFuture<'a, ExitCode> {
        Box::pin(async move {
        if let Some(suffix) = &self.config.options.test_tag_suffix {
            self.context
                .set_test_tag(format!("{}-{}", self.config.test_tag, suffix));
        }
        if let Some(command_line) = &self.config.command_line {
            let _ = self
                .context
                .add_attribute(keys::COMMAND_ARGS, command_line.clone());
        }

        let devices = match allocator.allocate(&self.config) {
            Ok(devices) => devices,
            Err(err) => {
                // Degenerate invocation: still bracketed, still reported.
                let started = Instant::now();
                listener.invocation_started(&self.context).await;
                listener.invocation_failed(&err.describe()).await;
                listener.invocation_ended(started.elapsed()).await;
                return ExitCode::from_error(&err);
            }
        };
        for (name, device) in &devices {
            self.context.add_device(name.clone(), Arc::clone(device));
        }

        let started = Instant::now();
        listener.invocation_started(&self.context).await;
        info!(
            invocation = self.context.invocation_id(),
            tag = self.context.test_tag(),
            devices = devices.len(),
            "invocation started"
        );

        let work_dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                let err = InvocationError::Io(e);
                listener.invocation_failed(&err.describe()).await;
                listener.invocation_ended(started.elapsed()).await;
                return ExitCode::from_error(&err);
            }
        };
        let info = TestInformation::new(
            Arc::clone(&self.context),
            work_dir.path().to_path_buf(),
        );

        let path = path_for(&self.config);
        let result = self.pipeline(path.as_ref(), &info, listener).await;

        let mut exit = ExitCode::NoError;
        match result {
            Ok(PipelineOutcome::Completed) => {}
            Ok(PipelineOutcome::Sharded(children)) => {
                exit = run_shards(children, allocator, shared, &self.stop).await;
                // The parent never prepared its devices; releasing them and
                // the build its shards shared is still on it.
                for device in self.context.devices() {
                    device.post_invocation_teardown(None).await;
                }
                path.do_clean_up(&self.config, &info).await;
            }
            Err(err) => {
                warn!(
                    invocation = self.context.invocation_id(),
                    "invocation failed: {err}"
                );
                listener.invocation_failed(&err.describe()).await;
                exit = ExitCode::from_error(&err);
            }
        }

        path.report_logs(&info, listener).await;
        report_host_log(&self.context, listener).await;
        listener.invocation_ended(started.elapsed()).await;
        info!(
            invocation = self.context.invocation_id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "invocation ended"
        );
        // The work folder goes away here, after everything that could
        // reference files in it has reported.
        drop(work_dir);
        exit
        })
    }

    /// The stage pipeline proper. Returns the first terminal failure;
    /// teardown-side stages run regardless and only contribute an error
    /// when nothing failed before them.
    async fn pipeline(
        &mut self,
        path: &dyn ExecutionPath,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
    ) -> InvocationResult<PipelineOutcome> {
        let context = Arc::clone(&self.context);
        let runner = PreparerRunner::new();
        let mut failure: Option<InvocationError> = None;

        // FETCH_BUILD through SHARD_CHECK. A failure in these stages
        // still falls through to the teardown side below, so every
        // allocated device gets released and artifacts get cleaned.
        match self.front_stages(path, info).await {
            Ok(Some(children)) => return Ok(PipelineOutcome::Sharded(children)),
            Ok(None) => {}
            Err(err) => failure = Some(err),
        }

        // DEVICE_PRE_SETUP
        if failure.is_none() {
            if let Err(err) = pre_setup_devices(&context).await {
                failure = Some(err);
            }
        }

        if failure.is_none() {
            // SETUP
            match path.do_setup(&self.config, &runner, info).await {
                Ok(()) => {
                    log_battery_levels(&context, "setup").await;
                    // The attribute store freezes here; the test phase and
                    // everything after it only read.
                    context.lock();

                    // TEST
                    let test_result = match self.stop.check(&context) {
                        Ok(()) => {
                            path.run_tests(&mut self.config, info, listener, &self.stop)
                                .await
                        }
                        Err(err) => Err(err),
                    };
                    if let Err(err) = test_result {
                        failure = Some(err);
                    }
                    log_battery_levels(&context, "test").await;
                }
                Err(err) => failure = Some(err),
            }
        }

        // Bugreport before teardown so the device state that failed is
        // still what gets captured.
        if let Some(err) = &failure {
            disable_recovery_for(&context, err);
            capture_failure_bugreport(&self.config, &context, err, listener).await;
        }

        // TEARDOWN: only the preparers that ran, reverse order.
        if let Err(err) = path.do_teardown(&runner, info, failure.as_ref()).await {
            warn!("teardown failed: {err}");
            if failure.is_none() {
                failure = Some(err);
            }
        }
        log_battery_levels(&context, "teardown").await;

        // DEVICE_POST_TEARDOWN: always, failure or not.
        for device in context.devices() {
            device.post_invocation_teardown(failure.as_ref()).await;
        }

        // CLEANUP: shard children leave the shared build to their parent.
        if self.config.prefetched_build.is_none() {
            path.do_clean_up(&self.config, info).await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(PipelineOutcome::Completed),
        }
    }

    /// FETCH_BUILD, RESOLVE_DYNAMIC_REFS and SHARD_CHECK.
    /// `Ok(Some(children))` means the invocation split and the children
    /// now carry the tests and the fetched build.
    async fn front_stages(
        &mut self,
        path: &dyn ExecutionPath,
        info: &TestInformation,
    ) -> InvocationResult<Option<Vec<Configuration>>> {
        let context = Arc::clone(&self.context);
        self.stop.check(&context)?;

        // FETCH_BUILD: a shard child reuses what its parent fetched.
        let build = match self.config.prefetched_build.clone() {
            Some(build) => build,
            None => {
                let fetch_started = Instant::now();
                let build = match path.fetch_build(&self.config).await? {
                    Some(build) => build,
                    None => {
                        return Err(InvocationError::BuildRetrieval(
                            "no build available to test".into(),
                        ))
                    }
                };
                context
                    .accumulate_time_metric(keys::FETCH_BUILD_TIME_MS, fetch_started.elapsed());
                info!(build = %build, "build fetched");
                build
            }
        };
        for name in context.device_names() {
            context.add_build_info(name, build.clone());
        }
        log_battery_levels(&context, "initial").await;
        self.stop.check(&context)?;

        // RESOLVE_DYNAMIC_REFS
        resolve_dynamic_refs(&context, info)?;
        self.stop.check(&context)?;

        // SHARD_CHECK
        let rescheduler = CollectingRescheduler::new();
        if shard_config(&mut self.config, info, &rescheduler)? {
            let mut children = rescheduler.take();
            for child in children.iter_mut() {
                // Shards share the parent's build and never fetch one.
                child.prefetched_build = Some(build.clone());
                if let Some(index) = child.options.shard_index {
                    context.record_shard(index, context.serials());
                }
            }
            return Ok(Some(children));
        }
        Ok(None)
    }
}

/// Runs shard children, each reporting into the shared parent set through
/// its own buffering listener. The parent exit reflects the worst child.
async fn run_shards(
    children: Vec<Configuration>,
    allocator: &dyn DeviceAllocator,
    shared: &Arc<tokio::sync::Mutex<ListenerSet>>,
    stop: &StopHandle,
) -> ExitCode {
    info!(shards = children.len(), "running shard invocations");
    let exits: Mutex<Vec<ExitCode>> = Mutex::new(Vec::new());

    tokio_scoped::scope(|scope| {
        for child in children {
            let exits = &exits;
            let shared = Arc::clone(shared);
            let stop = stop.clone();
            scope.spawn(async move {
                let index = child.options.shard_index.unwrap_or(0);
                let mut shard_listener = ShardListener::new(index, shared);
                let invocation = TestInvocation::new(child, stop);
                // Shards have both count and index set, so they run inline
                // and never split again; boxing breaks the type recursion.
                let unused = Arc::new(tokio::sync::Mutex::new(ListenerSet::new()));
                let fut: BoxFuture<'_, ExitCode> =
                    invocation.invoke_with(allocator, &mut shard_listener, &unused);
                let exit = fut.await;
                debug!(shard = index, "shard finished");
                exits.lock().unwrap().push(exit);
            });
        }
    });

    let exits = exits.into_inner().unwrap();
    exits
        .into_iter()
        .max_by_key(|e| *e as i32)
        .unwrap_or(ExitCode::NoError)
}

/// Expands `${...}` references in context attribute values.
///
/// Supported references are the fetched build's identity fields and the
/// invocation work folder. An unknown reference fails the stage.
fn resolve_dynamic_refs(
    context: &InvocationContext,
    info: &TestInformation,
) -> InvocationResult<()> {
    let build = context
        .device_names()
        .first()
        .and_then(|name| context.build_info(name));
    let pattern = regex::Regex::new(r"\$\{([a-z_]+)\}").unwrap();
    let work_dir = info.work_dir().display().to_string();

    context.rewrite_attribute_values(|value| {
        if !value.contains("${") {
            return Ok(value.to_string());
        }
        let mut resolved = String::with_capacity(value.len());
        let mut last = 0;
        for capture in pattern.captures_iter(value) {
            let whole = capture.get(0).unwrap();
            let key = &capture[1];
            resolved.push_str(&value[last..whole.start()]);
            let replacement = match key {
                "work_dir" => Some(work_dir.clone()),
                "build_id" => build.as_ref().map(|b| b.build_id.clone()),
                "build_flavor" => build.as_ref().map(|b| b.build_flavor.clone()),
                "branch" => build.as_ref().map(|b| b.branch.clone()),
                _ => None,
            };
            match replacement {
                Some(replacement) => resolved.push_str(&replacement),
                None => {
                    return Err(InvocationError::Infra(format!(
                        "unresolvable dynamic reference ${{{key}}}"
                    )))
                }
            }
            last = whole.end();
        }
        resolved.push_str(&value[last..]);
        Ok(resolved)
    })
}

/// A lost device keeps its state for diagnostics; recovery attempts during
/// teardown and cleanup would destroy it.
fn disable_recovery_for(context: &InvocationContext, err: &InvocationError) {
    let serial = match err {
        InvocationError::DeviceUnavailable { serial, .. } => Some(serial.as_str()),
        InvocationError::Build {
            serial,
            disable_recovery: true,
            ..
        } => serial.as_deref(),
        _ => None,
    };
    if let Some(serial) = serial {
        if let Some(device) = context.device_by_serial(serial) {
            warn!(serial, "disabling device recovery after failure");
            device.set_recovery_mode(RecoveryMode::None);
        }
    }
}

async fn pre_setup_devices(context: &InvocationContext) -> InvocationResult<()> {
    for (name, device) in context.named_devices() {
        let build = context.build_info(&name);
        device.start_log_capture().await;
        device.pre_invocation_setup(build.as_ref()).await?;
    }
    Ok(())
}

/// Best-effort battery snapshot per device, recorded on its build.
/// Virtual devices report no level and contribute nothing.
async fn log_battery_levels(context: &InvocationContext, checkpoint: &str) {
    for (name, device) in context.named_devices() {
        if let Some(level) = device.battery_level().await {
            context.add_build_attribute(
                &name,
                &format!("battery_{checkpoint}"),
                level.to_string(),
            );
        }
    }
}

/// Best-effort bugreport from the device the failure points at, or the
/// first device when the failure carries no serial.
async fn capture_failure_bugreport(
    config: &Configuration,
    context: &InvocationContext,
    err: &InvocationError,
    listener: &mut dyn InvocationListener,
) {
    if !config.options.bugreport_on_failure {
        return;
    }
    let device = err
        .serial()
        .and_then(|serial| context.device_by_serial(serial))
        .or_else(|| context.devices().into_iter().next());
    let device = match device {
        Some(device) => device,
        None => return,
    };
    let serial = device.serial().to_string();
    match tokio::time::timeout(config.options.bugreport_timeout, device.capture_bugreport())
        .await
    {
        Ok(Some(bytes)) => {
            listener
                .test_log(
                    &format!("bugreport-{serial}"),
                    LogKind::Bugreport,
                    &LogSource::Bytes(bytes),
                )
                .await;
        }
        Ok(None) => debug!(serial, "device produced no bugreport"),
        Err(_) => warn!(serial, "bugreport capture timed out"),
    }
}

/// Attaches a host-side summary of the invocation as a log blob.
async fn report_host_log(context: &InvocationContext, listener: &mut dyn InvocationListener) {
    let mut body = String::new();
    body.push_str(&format!("invocation: {}\n", context.invocation_id()));
    body.push_str(&format!("test_tag: {}\n", context.test_tag()));
    for serial in context.serials() {
        body.push_str(&format!("device: {serial}\n"));
    }
    for (key, value) in context.all_attributes() {
        body.push_str(&format!("attribute: {key}={value}\n"));
    }
    let mut metrics: Vec<_> = context.metrics().into_iter().collect();
    metrics.sort();
    for (key, value) in metrics {
        body.push_str(&format!("metric: {key}={value}\n"));
    }
    listener
        .test_log(
            "host_log",
            LogKind::HostLog,
            &LogSource::Bytes(body.into_bytes()),
        )
        .await;
}
