//! Target preparers: setup and teardown units around test execution.
//!
//! A preparer runs once per device (or once per invocation for the
//! multi-device variant). The [`PreparerRunner`] tracks exactly which
//! preparers had their setup invoked so teardown touches only those, in
//! reverse order of setup.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::DeviceSetup;
use crate::context::TestInformation;
use crate::device::Device;
use crate::error::{InvocationError, InvocationResult};

/// Setup/teardown unit scoped to one device.
#[async_trait]
pub trait TargetPreparer: Send + Sync {
    fn name(&self) -> &str;

    /// Disabled preparers are skipped entirely, setup and teardown both.
    fn is_disabled(&self) -> bool {
        false
    }

    fn is_teardown_disabled(&self) -> bool {
        false
    }

    async fn set_up(
        &self,
        device: &Arc<dyn Device>,
        info: &TestInformation,
    ) -> InvocationResult<()>;

    /// `error` is the failure that ended the invocation, if any. Preparers
    /// can use it to skip recovery work for doomed runs.
    async fn tear_down(
        &self,
        _device: &Arc<dyn Device>,
        _info: &TestInformation,
        _error: Option<&InvocationError>,
    ) -> InvocationResult<()> {
        Ok(())
    }
}

/// Setup/teardown unit spanning all devices of the invocation.
#[async_trait]
pub trait MultiTargetPreparer: Send + Sync {
    fn name(&self) -> &str;

    fn is_disabled(&self) -> bool {
        false
    }

    async fn set_up(&self, info: &TestInformation) -> InvocationResult<()>;

    async fn tear_down(
        &self,
        _info: &TestInformation,
        _error: Option<&InvocationError>,
    ) -> InvocationResult<()> {
        Ok(())
    }
}

enum RanStep {
    Device {
        device: Arc<dyn Device>,
        preparer: Arc<dyn TargetPreparer>,
    },
    Multi(Arc<dyn MultiTargetPreparer>),
}

/// Drives preparer setup and the matching teardown.
///
/// A step joins the ran list only once its setup returned cleanly; a
/// preparer that fails mid-setup never gets a teardown call. Teardown
/// walks the list in reverse, runs every step even after failures, and
/// returns the first failure encountered.
pub struct PreparerRunner {
    ran: Mutex<Vec<RanStep>>,
}

impl PreparerRunner {
    pub fn new() -> Self {
        Self {
            ran: Mutex::new(Vec::new()),
        }
    }

    /// Run per-device preparers for every device setup, then the
    /// invocation-wide multi preparers.
    ///
    /// With `replicate_setup` the per-device chains run in parallel, one
    /// worker per device; each chain stays sequential internally. The
    /// scoped spawn is the join barrier: no chain outlives this call.
    pub async fn run_setup(
        &self,
        setups: &[DeviceSetup],
        devices: &[(String, Arc<dyn Device>)],
        multi: &[Arc<dyn MultiTargetPreparer>],
        info: &TestInformation,
        replicate_setup: bool,
    ) -> InvocationResult<()> {
        let pairs: Vec<(&DeviceSetup, Arc<dyn Device>)> = setups
            .iter()
            .filter_map(|setup| {
                devices
                    .iter()
                    .find(|(name, _)| *name == setup.name)
                    .map(|(_, device)| (setup, Arc::clone(device)))
            })
            .collect();

        if replicate_setup && pairs.len() > 1 {
            let failures: Mutex<Vec<InvocationError>> = Mutex::new(Vec::new());
            tokio_scoped::scope(|scope| {
                for (setup, device) in &pairs {
                    let failures = &failures;
                    scope.spawn(async move {
                        if let Err(err) = self.device_chain(setup, device, info).await {
                            failures.lock().await.push(err);
                        }
                    });
                }
            });
            if let Some(err) = failures.into_inner().into_iter().next() {
                return Err(err);
            }
        } else {
            for (setup, device) in &pairs {
                self.device_chain(setup, device, info).await?;
            }
        }

        for preparer in multi {
            if preparer.is_disabled() {
                debug!(preparer = preparer.name(), "skipping disabled multi preparer");
                continue;
            }
            debug!(preparer = preparer.name(), "multi preparer setup");
            preparer.set_up(info).await?;
            self.ran
                .lock()
                .await
                .push(RanStep::Multi(Arc::clone(preparer)));
        }

        Ok(())
    }

    async fn device_chain(
        &self,
        setup: &DeviceSetup,
        device: &Arc<dyn Device>,
        info: &TestInformation,
    ) -> InvocationResult<()> {
        for preparer in &setup.preparers {
            if preparer.is_disabled() {
                debug!(preparer = preparer.name(), "skipping disabled preparer");
                continue;
            }
            debug!(
                preparer = preparer.name(),
                device = setup.name,
                "preparer setup"
            );
            preparer.set_up(device, info).await?;
            self.ran.lock().await.push(RanStep::Device {
                device: Arc::clone(device),
                preparer: Arc::clone(preparer),
            });
        }
        Ok(())
    }

    /// Tear down every step that ran, newest first. All teardowns execute
    /// regardless of earlier teardown failures; the first failure wins.
    pub async fn run_teardown(
        &self,
        info: &TestInformation,
        error: Option<&InvocationError>,
    ) -> InvocationResult<()> {
        let mut ran = std::mem::take(&mut *self.ran.lock().await);
        let mut first_failure = None;

        while let Some(step) = ran.pop() {
            let result = match &step {
                RanStep::Device { device, preparer } => {
                    if preparer.is_teardown_disabled() {
                        continue;
                    }
                    debug!(preparer = preparer.name(), "preparer teardown");
                    preparer.tear_down(device, info, error).await
                }
                RanStep::Multi(preparer) => {
                    debug!(preparer = preparer.name(), "multi preparer teardown");
                    preparer.tear_down(info, error).await
                }
            };
            if let Err(err) = result {
                warn!("teardown failed: {err}");
                if first_failure.is_none() {
                    first_failure = Some(err);
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for PreparerRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::context::InvocationContext;
    use crate::device::StubDevice;

    #[derive(Default)]
    struct Log {
        entries: StdMutex<Vec<String>>,
    }

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.entries.lock().unwrap().push(entry.into());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.entries.lock().unwrap())
        }
    }

    struct ScriptedPreparer {
        name: String,
        log: Arc<Log>,
        fail_setup: bool,
        fail_teardown: bool,
        disabled: bool,
    }

    impl ScriptedPreparer {
        fn new(name: &str, log: &Arc<Log>) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
                fail_setup: false,
                fail_teardown: false,
                disabled: false,
            }
        }
    }

    #[async_trait]
    impl TargetPreparer for ScriptedPreparer {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_disabled(&self) -> bool {
            self.disabled
        }

        async fn set_up(
            &self,
            _device: &Arc<dyn Device>,
            _info: &TestInformation,
        ) -> InvocationResult<()> {
            self.log.push(format!("setup:{}", self.name));
            if self.fail_setup {
                return Err(InvocationError::TargetSetup {
                    message: format!("{} setup failed", self.name),
                    serial: None,
                });
            }
            Ok(())
        }

        async fn tear_down(
            &self,
            _device: &Arc<dyn Device>,
            _info: &TestInformation,
            _error: Option<&InvocationError>,
        ) -> InvocationResult<()> {
            self.log.push(format!("teardown:{}", self.name));
            if self.fail_teardown {
                return Err(InvocationError::Infra(format!(
                    "{} teardown failed",
                    self.name
                )));
            }
            Ok(())
        }
    }

    struct ScriptedMulti {
        log: Arc<Log>,
    }

    #[async_trait]
    impl MultiTargetPreparer for ScriptedMulti {
        fn name(&self) -> &str {
            "multi"
        }

        async fn set_up(&self, _info: &TestInformation) -> InvocationResult<()> {
            self.log.push("setup:multi");
            Ok(())
        }

        async fn tear_down(
            &self,
            _info: &TestInformation,
            _error: Option<&InvocationError>,
        ) -> InvocationResult<()> {
            self.log.push("teardown:multi");
            Ok(())
        }
    }

    fn test_info() -> (tempfile::TempDir, TestInformation) {
        let dir = tempfile::tempdir().unwrap();
        let info = TestInformation::new(
            Arc::new(InvocationContext::new("prep")),
            dir.path().to_path_buf(),
        );
        (dir, info)
    }

    fn one_device() -> Vec<(String, Arc<dyn Device>)> {
        vec![(
            "device1".to_string(),
            Arc::new(StubDevice::new("serial-1")) as Arc<dyn Device>,
        )]
    }

    #[tokio::test]
    async fn teardown_runs_in_reverse_setup_order() {
        let log = Arc::new(Log::default());
        let setup = DeviceSetup::new("device1")
            .with_preparer(Arc::new(ScriptedPreparer::new("a", &log)))
            .with_preparer(Arc::new(ScriptedPreparer::new("b", &log)));
        let multi: Vec<Arc<dyn MultiTargetPreparer>> =
            vec![Arc::new(ScriptedMulti { log: Arc::clone(&log) })];

        let (_dir, info) = test_info();
        let runner = PreparerRunner::new();
        runner
            .run_setup(&[setup], &one_device(), &multi, &info, false)
            .await
            .unwrap();
        runner.run_teardown(&info, None).await.unwrap();

        assert_eq!(
            log.take(),
            vec![
                "setup:a",
                "setup:b",
                "setup:multi",
                "teardown:multi",
                "teardown:b",
                "teardown:a"
            ]
        );
    }

    #[tokio::test]
    async fn failed_setup_is_not_torn_down_and_later_steps_never_run() {
        let log = Arc::new(Log::default());
        let mut failing = ScriptedPreparer::new("boom", &log);
        failing.fail_setup = true;
        let setup = DeviceSetup::new("device1")
            .with_preparer(Arc::new(ScriptedPreparer::new("a", &log)))
            .with_preparer(Arc::new(failing))
            .with_preparer(Arc::new(ScriptedPreparer::new("never", &log)));

        let (_dir, info) = test_info();
        let runner = PreparerRunner::new();
        let err = runner
            .run_setup(&[setup], &one_device(), &[], &info, false)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::TargetSetup { .. }));

        // Only the preparer whose setup completed is torn down; the one
        // that failed mid-setup and everything after it are skipped.
        runner.run_teardown(&info, Some(&err)).await.unwrap();
        assert_eq!(log.take(), vec!["setup:a", "setup:boom", "teardown:a"]);
    }

    #[tokio::test]
    async fn all_teardowns_run_and_first_failure_is_returned() {
        let log = Arc::new(Log::default());
        let mut fail_b = ScriptedPreparer::new("b", &log);
        fail_b.fail_teardown = true;
        let mut fail_c = ScriptedPreparer::new("c", &log);
        fail_c.fail_teardown = true;
        let setup = DeviceSetup::new("device1")
            .with_preparer(Arc::new(ScriptedPreparer::new("a", &log)))
            .with_preparer(Arc::new(fail_b))
            .with_preparer(Arc::new(fail_c));

        let (_dir, info) = test_info();
        let runner = PreparerRunner::new();
        runner
            .run_setup(&[setup], &one_device(), &[], &info, false)
            .await
            .unwrap();

        // Teardown order is c, b, a. The first failure seen is c's.
        let err = runner.run_teardown(&info, None).await.unwrap_err();
        assert!(err.to_string().contains("c teardown failed"));
        assert_eq!(log.take(), vec![
            "setup:a",
            "setup:b",
            "setup:c",
            "teardown:c",
            "teardown:b",
            "teardown:a"
        ]);
    }

    #[tokio::test]
    async fn disabled_preparer_is_skipped_entirely() {
        let log = Arc::new(Log::default());
        let mut disabled = ScriptedPreparer::new("off", &log);
        disabled.disabled = true;
        let setup = DeviceSetup::new("device1")
            .with_preparer(Arc::new(disabled))
            .with_preparer(Arc::new(ScriptedPreparer::new("on", &log)));

        let (_dir, info) = test_info();
        let runner = PreparerRunner::new();
        runner
            .run_setup(&[setup], &one_device(), &[], &info, false)
            .await
            .unwrap();
        runner.run_teardown(&info, None).await.unwrap();

        assert_eq!(log.take(), vec!["setup:on", "teardown:on"]);
    }

    // Multi-thread runtime: the replicated fan-out blocks the calling
    // thread until every per-device chain joins.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replicated_setup_covers_every_device() {
        struct Counting {
            count: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl TargetPreparer for Counting {
            fn name(&self) -> &str {
                "counting"
            }

            async fn set_up(
                &self,
                _device: &Arc<dyn Device>,
                _info: &TestInformation,
            ) -> InvocationResult<()> {
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let setups: Vec<DeviceSetup> = (1..=3)
            .map(|i| {
                DeviceSetup::new(format!("device{i}")).with_preparer(Arc::new(Counting {
                    count: Arc::clone(&count),
                }))
            })
            .collect();
        let devices: Vec<(String, Arc<dyn Device>)> = (1..=3)
            .map(|i| {
                (
                    format!("device{i}"),
                    Arc::new(StubDevice::new(format!("serial-{i}"))) as Arc<dyn Device>,
                )
            })
            .collect();

        let (_dir, info) = test_info();
        let runner = PreparerRunner::new();
        runner
            .run_setup(&setups, &devices, &[], &info, true)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
