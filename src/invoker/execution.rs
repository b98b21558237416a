//! Execution strategies for the middle stages of an invocation.
//!
//! The sequencer calls the same six hooks no matter how the invocation
//! executes; [`path_for`] picks the concrete strategy from the configured
//! run mode. Regular runs do everything in-process. The delegated paths
//! hand the whole test phase to a worker and only stream results back, so
//! their host-side setup and teardown hooks are deliberately empty.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::build::BuildInfo;
use crate::config::{
    filter_for_delegation, Configuration, RemoteOptions, RunMode, SubprocessOptions,
};
use crate::context::TestInformation;
use crate::delegate::{RemoteDelegate, SshTransport, SubprocessDelegate};
use crate::error::{InvocationError, InvocationResult};
use crate::prep::PreparerRunner;
use crate::results::{InvocationListener, LogKind, LogSource};
use crate::retry::{decision_for, run_with_retry};

use super::StopHandle;

/// The stage hooks one run mode implements.
#[async_trait]
pub trait ExecutionPath: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means no build was available, which the sequencer turns
    /// into a bracketed failed invocation.
    async fn fetch_build(&self, config: &Configuration) -> InvocationResult<Option<BuildInfo>>;

    async fn do_setup(
        &self,
        config: &Configuration,
        runner: &PreparerRunner,
        info: &TestInformation,
    ) -> InvocationResult<()>;

    async fn run_tests(
        &self,
        config: &mut Configuration,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
        stop: &StopHandle,
    ) -> InvocationResult<()>;

    async fn do_teardown(
        &self,
        runner: &PreparerRunner,
        info: &TestInformation,
        error: Option<&InvocationError>,
    ) -> InvocationResult<()>;

    /// Best-effort artifact release. Never fails the invocation.
    async fn do_clean_up(&self, config: &Configuration, info: &TestInformation);

    /// Reports whatever logs this path accumulated, right before the
    /// invocation ends.
    async fn report_logs(&self, info: &TestInformation, listener: &mut dyn InvocationListener);
}

/// Strategy table keyed by the configured run mode.
pub fn path_for(config: &Configuration) -> Box<dyn ExecutionPath> {
    match config.options.run_mode {
        RunMode::Regular => Box::new(RegularPath),
        RunMode::Subprocess => Box::new(SubprocessPath {
            options: config.delegation.subprocess.clone(),
        }),
        RunMode::Remote => Box::new(RemotePath {
            options: config.delegation.remote.clone(),
            global_timeout: config.options.invocation_timeout,
        }),
    }
}

/// Everything in this process: the provider fetches, preparers run on the
/// allocated devices, tests execute through the retry loop.
pub struct RegularPath;

#[async_trait]
impl ExecutionPath for RegularPath {
    fn name(&self) -> &'static str {
        "regular"
    }

    async fn fetch_build(&self, config: &Configuration) -> InvocationResult<Option<BuildInfo>> {
        config.build_provider.fetch_build().await
    }

    async fn do_setup(
        &self,
        config: &Configuration,
        runner: &PreparerRunner,
        info: &TestInformation,
    ) -> InvocationResult<()> {
        runner
            .run_setup(
                &config.device_setups,
                &info.context().named_devices(),
                &config.multi_preparers,
                info,
                config.options.replicate_setup,
            )
            .await
    }

    async fn run_tests(
        &self,
        config: &mut Configuration,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
        stop: &StopHandle,
    ) -> InvocationResult<()> {
        for test in config.tests.iter_mut() {
            stop.check(info.context())?;
            let mut decision = decision_for(&config.retry);
            run_with_retry(test.as_mut(), info, listener, decision.as_mut()).await?;
        }
        Ok(())
    }

    async fn do_teardown(
        &self,
        runner: &PreparerRunner,
        info: &TestInformation,
        error: Option<&InvocationError>,
    ) -> InvocationResult<()> {
        runner.run_teardown(info, error).await
    }

    async fn do_clean_up(&self, config: &Configuration, info: &TestInformation) {
        let context = info.context();
        let mut released = HashSet::new();
        for name in context.device_names() {
            if let Some(build) = context.build_info(&name) {
                if released.insert(build.build_id.clone()) {
                    config.build_provider.clean_up(&build).await;
                }
            }
        }
    }

    async fn report_logs(&self, info: &TestInformation, listener: &mut dyn InvocationListener) {
        for device in info.context().devices() {
            if let Some(bytes) = device.fetch_log_capture().await {
                listener
                    .test_log(
                        &format!("{}-device-log", device.serial()),
                        LogKind::DeviceLog,
                        &LogSource::Bytes(bytes),
                    )
                    .await;
            }
        }
    }
}

/// Writes the allow-listed slice of the source configuration into the
/// work folder for a delegated worker.
fn write_delegated_config(
    config: &Configuration,
    allowlist: &[String],
    info: &TestInformation,
) -> InvocationResult<std::path::PathBuf> {
    let source = config.source.as_deref().ok_or_else(|| {
        InvocationError::Infra("delegation requires the source configuration text".into())
    })?;
    let filtered = filter_for_delegation(source, allowlist)
        .map_err(|e| InvocationError::Infra(format!("failed to filter configuration: {e}")))?;
    let path = info.work_dir().join("delegated.toml");
    std::fs::write(&path, filtered)?;
    debug!(path = %path.display(), "delegated configuration written");
    Ok(path)
}

/// A stand-in build for delegated runs; the worker fetches the real one.
fn delegated_build() -> BuildInfo {
    BuildInfo::new("delegated", "delegated", "local")
}

/// Hands the test phase to a subprocess of this program.
pub struct SubprocessPath {
    pub options: SubprocessOptions,
}

#[async_trait]
impl ExecutionPath for SubprocessPath {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn fetch_build(&self, _config: &Configuration) -> InvocationResult<Option<BuildInfo>> {
        Ok(Some(delegated_build()))
    }

    async fn do_setup(
        &self,
        _config: &Configuration,
        _runner: &PreparerRunner,
        _info: &TestInformation,
    ) -> InvocationResult<()> {
        // The worker owns device preparation.
        Ok(())
    }

    async fn run_tests(
        &self,
        config: &mut Configuration,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
        stop: &StopHandle,
    ) -> InvocationResult<()> {
        let path = write_delegated_config(config, &self.options.config_allowlist, info)?;
        info!("delegating invocation to a subprocess worker");
        let delegate = SubprocessDelegate::new(self.options.clone());
        delegate.run(&path, info, listener, stop.token()).await
    }

    async fn do_teardown(
        &self,
        _runner: &PreparerRunner,
        _info: &TestInformation,
        _error: Option<&InvocationError>,
    ) -> InvocationResult<()> {
        Ok(())
    }

    async fn do_clean_up(&self, _config: &Configuration, _info: &TestInformation) {}

    async fn report_logs(&self, _info: &TestInformation, _listener: &mut dyn InvocationListener) {
        // Events stream over the socket; the delegate reports the
        // worker's captured stdio itself.
    }
}

/// Hands the test phase to a worker on a remote VM.
pub struct RemotePath {
    pub options: RemoteOptions,
    pub global_timeout: Option<std::time::Duration>,
}

#[async_trait]
impl ExecutionPath for RemotePath {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn fetch_build(&self, _config: &Configuration) -> InvocationResult<Option<BuildInfo>> {
        Ok(Some(delegated_build()))
    }

    async fn do_setup(
        &self,
        _config: &Configuration,
        _runner: &PreparerRunner,
        _info: &TestInformation,
    ) -> InvocationResult<()> {
        Ok(())
    }

    async fn run_tests(
        &self,
        config: &mut Configuration,
        info: &TestInformation,
        listener: &mut dyn InvocationListener,
        stop: &StopHandle,
    ) -> InvocationResult<()> {
        // Remote workers get the full retry and test sections too; only
        // the delegation section is withheld to stop re-delegation.
        let path = write_delegated_config(config, &self.options_allowlist(), info)?;
        let host = self.options.host.as_deref().unwrap_or("<unset>");
        info!(host, "delegating invocation to a remote worker");
        let transport = SshTransport::from_options(&self.options)?;
        let delegate =
            RemoteDelegate::new(self.options.clone(), transport, self.global_timeout);
        delegate.run(&path, info, listener, stop.token()).await
    }

    async fn do_teardown(
        &self,
        _runner: &PreparerRunner,
        _info: &TestInformation,
        _error: Option<&InvocationError>,
    ) -> InvocationResult<()> {
        Ok(())
    }

    async fn do_clean_up(&self, _config: &Configuration, _info: &TestInformation) {}

    async fn report_logs(&self, _info: &TestInformation, _listener: &mut dyn InvocationListener) {
        // Worker logs are pulled by the delegate itself.
    }
}

impl RemotePath {
    fn options_allowlist(&self) -> Vec<String> {
        ["invocation", "retry", "report", "tests"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::build::StubBuildProvider;
    use crate::config::DelegationOptions;
    use crate::context::InvocationContext;
    use crate::results::RunRecorder;

    fn info() -> (tempfile::TempDir, TestInformation) {
        let dir = tempfile::tempdir().unwrap();
        let info = TestInformation::new(
            Arc::new(InvocationContext::new("paths")),
            dir.path().to_path_buf(),
        );
        (dir, info)
    }

    #[test]
    fn strategy_table_selects_by_run_mode() {
        let mut config = Configuration::new("t", Arc::new(StubBuildProvider::empty()));
        assert_eq!(path_for(&config).name(), "regular");
        config.options.run_mode = RunMode::Subprocess;
        assert_eq!(path_for(&config).name(), "subprocess");
        config.options.run_mode = RunMode::Remote;
        assert_eq!(path_for(&config).name(), "remote");
    }

    #[tokio::test]
    async fn delegated_paths_skip_host_setup_and_teardown() {
        let (_dir, info) = info();
        let config = Configuration::new("t", Arc::new(StubBuildProvider::empty()));
        let runner = PreparerRunner::new();
        let path = SubprocessPath {
            options: SubprocessOptions::default(),
        };
        path.do_setup(&config, &runner, &info).await.unwrap();
        // Nothing ran, so teardown has nothing to do and succeeds.
        path.do_teardown(&runner, &info, None).await.unwrap();
        runner.run_teardown(&info, None).await.unwrap();
    }

    #[tokio::test]
    async fn delegation_without_source_text_is_an_infra_error() {
        let (_dir, info) = info();
        let mut config = Configuration::new("t", Arc::new(StubBuildProvider::empty()));
        config.delegation = DelegationOptions::default();
        let path = SubprocessPath {
            options: SubprocessOptions::default(),
        };
        let mut sink = RunRecorder::new();
        let err = path
            .run_tests(&mut config, &info, &mut sink, &StopHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Infra(_)));
    }

    #[tokio::test]
    async fn delegated_config_is_filtered_to_the_allowlist() {
        let (_dir, info) = info();
        let mut config = Configuration::new("t", Arc::new(StubBuildProvider::empty()));
        config.source = Some(
            r#"
[invocation]
test_tag = "delegated"

[delegation]
mode = "subprocess"

[[tests]]
name = "smoke"
cases = { a = "true" }
"#
            .to_string(),
        );
        let path = write_delegated_config(
            &config,
            &["invocation".to_string(), "tests".to_string()],
            &info,
        )
        .unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("test_tag"));
        // The worker must not re-delegate.
        assert!(!written.contains("delegation"));
    }

    #[tokio::test]
    async fn regular_run_tests_stops_on_cancellation() {
        use crate::testtype::FakeTest;

        let (_dir, info) = info();
        let mut config = Configuration::new("t", Arc::new(StubBuildProvider::empty()));
        config
            .tests
            .push(Box::new(FakeTest::passing("smoke", &["a"])));
        let stop = StopHandle::new();
        stop.request_stop("shutdown");
        let mut sink = RunRecorder::new();
        let err = RegularPath
            .run_tests(&mut config, &info, &mut sink, &stop)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Cancelled(_)));
    }
}
