//! Device collaborator contract.
//!
//! The orchestrator never talks to hardware directly; it drives devices
//! through the [`Device`] trait. Transport details (adb-like protocols,
//! virtual device control planes) live behind implementations supplied by
//! the embedding harness. [`StubDevice`] is the in-memory implementation
//! used by tests and local dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::build::BuildInfo;
use crate::error::{InvocationError, InvocationResult};

/// Recovery behavior when a device misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Attempt full recovery (reconnect, reboot).
    Available,
    /// Recovery disabled; leave the device alone so diagnostics survive.
    None,
}

/// Connection state as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Offline,
    Unresponsive,
}

/// One allocated device for the duration of an invocation.
///
/// Implementations must be safe to share across the setup fan-out
/// (`Send + Sync`); mutable state (recovery mode, capture buffers) is the
/// implementation's to synchronize.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable serial number used in logs and failure attribution.
    fn serial(&self) -> &str;

    fn state(&self) -> DeviceState;

    fn recovery_mode(&self) -> RecoveryMode;

    /// Disabling recovery is sticky for the rest of the invocation.
    fn set_recovery_mode(&self, mode: RecoveryMode);

    /// Whether this is a virtual device (no physical battery, no bugreport).
    fn is_virtual(&self) -> bool {
        false
    }

    /// Battery level in percent. Best-effort; `None` on virtual devices or
    /// query failure.
    async fn battery_level(&self) -> Option<u32>;

    /// Device-side bring-up before the invocation proper (boot checks,
    /// connection warm-up).
    async fn pre_invocation_setup(&self, build: Option<&BuildInfo>) -> InvocationResult<()>;

    /// Device-side release, always attempted regardless of how the
    /// invocation ended. `error` is the invocation's terminal failure, if any.
    async fn post_invocation_teardown(&self, error: Option<&InvocationError>);

    /// Starts capturing the device log stream.
    async fn start_log_capture(&self);

    /// Clears any buffered device log.
    async fn clear_log_capture(&self);

    /// Fetches the captured device log since capture started.
    async fn fetch_log_capture(&self) -> Option<Vec<u8>>;

    /// Captures a bugreport. Best-effort; `None` when unsupported (virtual
    /// devices) or when capture fails.
    async fn capture_bugreport(&self) -> Option<Vec<u8>>;
}

/// In-memory device used by tests and local dry runs.
///
/// Records the calls made against it so tests can assert on ordering and
/// can be scripted to fail setup or report as unresponsive.
pub struct StubDevice {
    serial: String,
    state: Mutex<DeviceState>,
    recovery: Mutex<RecoveryMode>,
    virtual_device: bool,
    battery: Option<u32>,
    fail_pre_setup: AtomicBool,
    capturing: AtomicBool,
    log_buffer: Mutex<Vec<u8>>,
    calls: Mutex<Vec<String>>,
}

impl StubDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: Mutex::new(DeviceState::Online),
            recovery: Mutex::new(RecoveryMode::Available),
            virtual_device: false,
            battery: Some(80),
            fail_pre_setup: AtomicBool::new(false),
            capturing: AtomicBool::new(false),
            log_buffer: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn virtual_device(mut self) -> Self {
        self.virtual_device = true;
        self.battery = None;
        self
    }

    pub fn with_battery(mut self, level: Option<u32>) -> Self {
        self.battery = level;
        self
    }

    /// Scripts `pre_invocation_setup` to fail with a device-unavailable error.
    pub fn fail_pre_setup(self) -> Self {
        self.fail_pre_setup.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn push_log(&self, bytes: &[u8]) {
        self.log_buffer.lock().unwrap().extend_from_slice(bytes);
    }

    /// Calls recorded so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl Device for StubDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn state(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    fn recovery_mode(&self) -> RecoveryMode {
        *self.recovery.lock().unwrap()
    }

    fn set_recovery_mode(&self, mode: RecoveryMode) {
        self.record("set_recovery_mode");
        *self.recovery.lock().unwrap() = mode;
    }

    fn is_virtual(&self) -> bool {
        self.virtual_device
    }

    async fn battery_level(&self) -> Option<u32> {
        self.battery
    }

    async fn pre_invocation_setup(&self, _build: Option<&BuildInfo>) -> InvocationResult<()> {
        self.record("pre_invocation_setup");
        if self.fail_pre_setup.load(Ordering::SeqCst) {
            return Err(InvocationError::DeviceUnavailable {
                message: "scripted pre-setup failure".into(),
                serial: self.serial.clone(),
                unresponsive: false,
            });
        }
        Ok(())
    }

    async fn post_invocation_teardown(&self, _error: Option<&InvocationError>) {
        self.record("post_invocation_teardown");
    }

    async fn start_log_capture(&self) {
        self.record("start_log_capture");
        self.capturing.store(true, Ordering::SeqCst);
    }

    async fn clear_log_capture(&self) {
        self.log_buffer.lock().unwrap().clear();
    }

    async fn fetch_log_capture(&self) -> Option<Vec<u8>> {
        if !self.capturing.load(Ordering::SeqCst) {
            return None;
        }
        let buffer = self.log_buffer.lock().unwrap();
        if buffer.is_empty() {
            None
        } else {
            Some(buffer.clone())
        }
    }

    async fn capture_bugreport(&self) -> Option<Vec<u8>> {
        self.record("capture_bugreport");
        if self.virtual_device {
            return None;
        }
        Some(format!("bugreport for {}", self.serial).into_bytes())
    }
}

/// Helper holding per-serial extra metadata not owned by the device itself.
#[derive(Debug, Default, Clone)]
pub struct DeviceAttributes {
    attributes: HashMap<String, String>,
}

impl DeviceAttributes {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_device_records_lifecycle_calls() {
        let device = StubDevice::new("SER1");
        device.pre_invocation_setup(None).await.unwrap();
        device.post_invocation_teardown(None).await;
        assert_eq!(
            device.calls(),
            vec!["pre_invocation_setup", "post_invocation_teardown"]
        );
    }

    #[tokio::test]
    async fn scripted_pre_setup_failure_is_device_unavailable() {
        let device = StubDevice::new("SER1").fail_pre_setup();
        let err = device.pre_invocation_setup(None).await.unwrap_err();
        assert!(matches!(err, InvocationError::DeviceUnavailable { .. }));
    }

    #[tokio::test]
    async fn virtual_device_has_no_battery_or_bugreport() {
        let device = StubDevice::new("VIRT1").virtual_device();
        assert_eq!(device.battery_level().await, None);
        assert!(device.capture_bugreport().await.is_none());
    }

    #[tokio::test]
    async fn log_capture_requires_start() {
        let device = StubDevice::new("SER1");
        device.push_log(b"early");
        assert!(device.fetch_log_capture().await.is_none());
        device.start_log_capture().await;
        device.push_log(b" lines");
        assert!(device.fetch_log_capture().await.is_some());
    }
}
