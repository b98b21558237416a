//! Invocation context: devices, builds and attributes for one invocation.
//!
//! The context is created at invocation start, appended to until
//! [`InvocationContext::lock`] is called right before test execution, and
//! read-only afterwards. Locking is what makes the attribute store safe
//! for concurrent readers (preparers, listeners) without extra
//! synchronization on their side. Devices are never owned by the context;
//! it only holds a lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::build::BuildInfo;
use crate::device::Device;
use crate::error::{InvocationError, InvocationResult};

/// Well-known attribute and metric keys.
pub mod keys {
    /// Command line the invocation was started with.
    pub const COMMAND_ARGS: &str = "command_line_args";
    pub const SHARD_COUNT: &str = "shard_count";
    pub const SHARD_INDEX: &str = "shard_index";
    /// Cumulative milliseconds spent in retry re-runs.
    pub const RETRY_TIME_MS: &str = "retry_time_ms";
    /// Milliseconds between a stop request and the actual halt.
    pub const STOP_LATENCY_MS: &str = "shutdown_latency_ms";
    pub const FETCH_BUILD_TIME_MS: &str = "fetch_build_time_ms";
}

/// Immutable-after-lock record of devices, builds and attributes.
pub struct InvocationContext {
    invocation_id: String,
    test_tag: Mutex<String>,
    /// Logical device-name -> allocated handle, insertion-ordered.
    devices: Mutex<Vec<(String, Arc<dyn Device>)>>,
    /// Logical device-name -> fetched build. Back-filled in either order
    /// relative to `add_device`.
    builds: Mutex<HashMap<String, BuildInfo>>,
    /// Multimap: keys may repeat, insertion order preserved.
    attributes: Mutex<Vec<(String, String)>>,
    locked: AtomicBool,
    /// Parent module context, at most one level of nesting.
    module: Mutex<Option<ModuleContext>>,
    /// Shard-index -> device serials, write-once at dispatch. Diagnostics only.
    shards: Mutex<HashMap<usize, Vec<String>>>,
    metrics: Mutex<HashMap<String, String>>,
}

/// Context of a suite module this invocation is nested inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleContext {
    pub module_name: String,
    pub abi: Option<String>,
}

impl InvocationContext {
    pub fn new(test_tag: impl Into<String>) -> Self {
        Self {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            test_tag: Mutex::new(test_tag.into()),
            devices: Mutex::new(Vec::new()),
            builds: Mutex::new(HashMap::new()),
            attributes: Mutex::new(Vec::new()),
            locked: AtomicBool::new(false),
            module: Mutex::new(None),
            shards: Mutex::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn test_tag(&self) -> String {
        self.test_tag.lock().unwrap().clone()
    }

    pub fn set_test_tag(&self, tag: impl Into<String>) {
        *self.test_tag.lock().unwrap() = tag.into();
    }

    pub fn add_device(&self, name: impl Into<String>, device: Arc<dyn Device>) {
        self.devices.lock().unwrap().push((name.into(), device));
    }

    /// Records the build for a logical device name. Order relative to
    /// `add_device` does not matter; the map is keyed by name.
    pub fn add_build_info(&self, name: impl Into<String>, build: BuildInfo) {
        self.builds.lock().unwrap().insert(name.into(), build);
    }

    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .map(|(_, d)| Arc::clone(d))
            .collect()
    }

    /// Logical names paired with their device handles, insertion-ordered.
    pub fn named_devices(&self) -> Vec<(String, Arc<dyn Device>)> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .map(|(n, d)| (n.clone(), Arc::clone(d)))
            .collect()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn device(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| Arc::clone(d))
    }

    pub fn device_by_serial(&self, serial: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|(_, d)| d.serial() == serial)
            .map(|(_, d)| Arc::clone(d))
    }

    pub fn serials(&self) -> Vec<String> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .map(|(_, d)| d.serial().to_string())
            .collect()
    }

    pub fn build_info(&self, name: &str) -> Option<BuildInfo> {
        self.builds.lock().unwrap().get(name).cloned()
    }

    /// Build for a device handle, resolved through its logical name.
    pub fn build_for_device(&self, device: &dyn Device) -> Option<BuildInfo> {
        let devices = self.devices.lock().unwrap();
        let name = devices
            .iter()
            .find(|(_, d)| d.serial() == device.serial())
            .map(|(n, _)| n.clone())?;
        drop(devices);
        self.build_info(&name)
    }

    /// Patches an attribute onto the recorded build of a device.
    pub fn add_build_attribute(&self, name: &str, key: &str, value: impl Into<String>) {
        if let Some(build) = self.builds.lock().unwrap().get_mut(name) {
            build.add_attribute(key, value.into());
        }

    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Freezes the attribute store. Irreversible for the lifetime of the
    /// context except through [`InvocationContext::unlock_for_delegation`].
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    /// Re-opens the attribute store for delegated re-entry, where the worker
    /// needs to restore attributes decoded from the wire record. Deliberately
    /// crate-private.
    pub(crate) fn unlock_for_delegation(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    /// Appends an attribute. Keys are not unique; adding the same key twice
    /// keeps both values.
    pub fn add_attribute(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> InvocationResult<()> {
        if self.is_locked() {
            return Err(InvocationError::Unclassified(
                "attributes cannot be added once the context is locked".into(),
            ));
        }
        self.attributes
            .lock()
            .unwrap()
            .push((key.into(), value.into()));
        Ok(())
    }

    pub fn add_attributes<I, K, V>(&self, entries: I) -> InvocationResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in entries {
            self.add_attribute(k, v)?;
        }
        Ok(())
    }

    /// Rewrites every attribute value in place. Used by the dynamic
    /// reference resolution stage, which runs before the store locks.
    pub(crate) fn rewrite_attribute_values(
        &self,
        mut f: impl FnMut(&str) -> InvocationResult<String>,
    ) -> InvocationResult<()> {
        let mut attributes = self.attributes.lock().unwrap();
        for (_, value) in attributes.iter_mut() {
            *value = f(value)?;
        }
        Ok(())
    }

    /// All values recorded for a key, in insertion order.
    pub fn attributes(&self, key: &str) -> Vec<String> {
        self.attributes
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn all_attributes(&self) -> Vec<(String, String)> {
        self.attributes.lock().unwrap().clone()
    }

    /// Attaches this invocation to a suite module. At most one level of
    /// nesting; attaching twice is an error.
    pub fn set_module_context(&self, module: ModuleContext) -> InvocationResult<()> {
        let mut slot = self.module.lock().unwrap();
        if slot.is_some() {
            return Err(InvocationError::Unclassified(
                "invocation context is already attached to a module context".into(),
            ));
        }
        *slot = Some(module);
        Ok(())
    }

    pub fn module_context(&self) -> Option<ModuleContext> {
        self.module.lock().unwrap().clone()
    }

    /// Records the device serials a shard was dispatched with. Write-once
    /// per index; later writes for the same index are ignored.
    pub fn record_shard(&self, index: usize, serials: Vec<String>) {
        self.shards.lock().unwrap().entry(index).or_insert(serials);
    }

    pub fn shard_record(&self, index: usize) -> Option<Vec<String>> {
        self.shards.lock().unwrap().get(&index).cloned()
    }

    /// Adds or replaces an invocation metric. Metrics stay writable past
    /// `lock()`; they are operational measurements, not configuration.
    pub fn add_metric(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metrics.lock().unwrap().insert(key.into(), value.into());
    }

    /// Accumulates a duration metric in milliseconds.
    pub fn accumulate_time_metric(&self, key: &str, elapsed: Duration) {
        let mut metrics = self.metrics.lock().unwrap();
        let prior: u128 = metrics
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        metrics.insert(key.to_string(), (prior + elapsed.as_millis()).to_string());
    }

    pub fn metrics(&self) -> HashMap<String, String> {
        self.metrics.lock().unwrap().clone()
    }

    /// Serializes to the wire record. Live device handles do not cross the
    /// wire; only logical names and serials do.
    pub fn to_wire_record(&self) -> ContextWireRecord {
        let devices = self.devices.lock().unwrap();
        let builds = self.builds.lock().unwrap();
        let entries = devices
            .iter()
            .map(|(name, device)| DeviceWireEntry {
                name: name.clone(),
                serial: device.serial().to_string(),
                build: builds.get(name).cloned(),
            })
            .collect();
        ContextWireRecord {
            invocation_id: self.invocation_id.clone(),
            test_tag: self.test_tag(),
            devices: entries,
            attributes: self.attributes.lock().unwrap().clone(),
            module: self.module.lock().unwrap().clone(),
            shards: self.shards.lock().unwrap().clone(),
        }
    }

    /// Merges a delegated worker's context record back into this one.
    ///
    /// The worker runs with its own context; what it recorded there comes
    /// back over the wire and is folded in here so the parent's reports
    /// carry the worker's attributes and builds. Attributes the parent
    /// already holds are not duplicated, and a locked store re-locks once
    /// the merge is done.
    pub(crate) fn restore_from_delegate(&self, record: &ContextWireRecord) {
        let was_locked = self.is_locked();
        if was_locked {
            self.unlock_for_delegation();
        }
        let existing = self.all_attributes();
        for (key, value) in &record.attributes {
            if !existing.contains(&(key.clone(), value.clone())) {
                let _ = self.add_attribute(key.clone(), value.clone());
            }
        }
        for entry in &record.devices {
            if let Some(build) = &entry.build {
                if self.build_info(&entry.name).is_none() {
                    self.add_build_info(entry.name.clone(), build.clone());
                }
            }
        }
        if was_locked {
            self.lock();
        }
    }
}

/// Serializable snapshot of a context, exchanged with delegated workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextWireRecord {
    pub invocation_id: String,
    pub test_tag: String,
    pub devices: Vec<DeviceWireEntry>,
    pub attributes: Vec<(String, String)>,
    pub module: Option<ModuleContext>,
    #[serde(default)]
    pub shards: HashMap<usize, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceWireEntry {
    pub name: String,
    pub serial: String,
    pub build: Option<BuildInfo>,
}

/// Everything a running test gets handed: the shared context plus a
/// scratch directory that outlives the individual attempt.
#[derive(Clone)]
pub struct TestInformation {
    context: Arc<InvocationContext>,
    work_dir: PathBuf,
}

impl TestInformation {
    pub fn new(context: Arc<InvocationContext>, work_dir: PathBuf) -> Self {
        Self { context, work_dir }
    }

    pub fn context(&self) -> &Arc<InvocationContext> {
        &self.context
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// First device of the invocation, if any. Most single-device tests
    /// only ever need this one.
    pub fn device(&self) -> Option<Arc<dyn Device>> {
        self.context.devices().into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StubDevice;

    fn context_with_device() -> InvocationContext {
        let context = InvocationContext::new("cts-verifier");
        context.add_device("device1", Arc::new(StubDevice::new("SER1")));
        context
    }

    #[test]
    fn add_attribute_after_lock_fails() {
        let context = context_with_device();
        context.add_attribute("branch", "main").unwrap();
        context.lock();
        assert!(context.add_attribute("late", "nope").is_err());
        // Values added before lock stay visible.
        assert_eq!(context.attributes("branch"), vec!["main"]);
    }

    #[test]
    fn unlock_for_delegation_reopens_store() {
        let context = context_with_device();
        context.lock();
        context.unlock_for_delegation();
        context.add_attribute("restored", "yes").unwrap();
        assert_eq!(context.attributes("restored"), vec!["yes"]);
    }

    #[test]
    fn duplicate_attribute_keys_are_legal() {
        let context = context_with_device();
        context.add_attribute("owner", "alice").unwrap();
        context.add_attribute("owner", "bob").unwrap();
        assert_eq!(context.attributes("owner"), vec!["alice", "bob"]);
    }

    #[test]
    fn build_info_order_does_not_matter() {
        let build = BuildInfo::new("1", "flavor", "main");

        let before = InvocationContext::new("t");
        before.add_build_info("device1", build.clone());
        before.add_device("device1", Arc::new(StubDevice::new("A")));
        assert_eq!(before.build_info("device1"), Some(build.clone()));

        let after = InvocationContext::new("t");
        after.add_device("device1", Arc::new(StubDevice::new("A")));
        after.add_build_info("device1", build.clone());
        assert_eq!(after.build_info("device1"), Some(build));
    }

    #[test]
    fn module_context_nests_at_most_once() {
        let context = context_with_device();
        context
            .set_module_context(ModuleContext {
                module_name: "CtsAudioTestCases".into(),
                abi: Some("arm64-v8a".into()),
            })
            .unwrap();
        assert!(context
            .set_module_context(ModuleContext {
                module_name: "again".into(),
                abi: None,
            })
            .is_err());
    }

    #[test]
    fn shard_record_is_write_once() {
        let context = context_with_device();
        context.record_shard(2, vec!["SER1".into()]);
        context.record_shard(2, vec!["SER9".into()]);
        assert_eq!(context.shard_record(2), Some(vec!["SER1".into()]));
    }

    #[test]
    fn wire_record_round_trip_preserves_everything() {
        let context = context_with_device();
        context.add_build_info("device1", BuildInfo::new("42", "flavor", "release"));
        context.add_attribute("owner", "alice").unwrap();
        context.add_attribute("owner", "bob").unwrap();
        context
            .set_module_context(ModuleContext {
                module_name: "CtsMidiTestCases".into(),
                abi: None,
            })
            .unwrap();
        context.record_shard(0, vec!["SER1".into()]);

        let record = context.to_wire_record();
        assert_eq!(record.test_tag, "cts-verifier");
        assert_eq!(record.invocation_id, context.invocation_id());
        assert_eq!(record.devices[0].build.as_ref().unwrap().build_id, "42");

        // Round-trip through JSON like the delegated worker does.
        let json = serde_json::to_string(&record).unwrap();
        let decoded: ContextWireRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn delegate_record_merges_into_a_locked_context() {
        let parent = context_with_device();
        parent.add_attribute("owner", "alice").unwrap();
        parent.lock();

        let worker = InvocationContext::new("cts-verifier");
        worker.add_device("device1", Arc::new(StubDevice::new("SER1")));
        worker.add_build_info("device1", BuildInfo::new("42", "flavor", "release"));
        worker.add_attribute("owner", "alice").unwrap();
        worker.add_attribute("worker_host", "vm-7").unwrap();

        parent.restore_from_delegate(&worker.to_wire_record());

        // Worker additions came back, pre-existing values did not double.
        assert_eq!(parent.attributes("worker_host"), vec!["vm-7"]);
        assert_eq!(parent.attributes("owner"), vec!["alice"]);
        assert_eq!(parent.build_info("device1").unwrap().build_id, "42");
        // The store stays frozen for everyone else.
        assert!(parent.is_locked());
        assert!(parent.add_attribute("late", "nope").is_err());
    }

    #[test]
    fn retry_time_metric_accumulates() {
        let context = context_with_device();
        context.accumulate_time_metric(keys::RETRY_TIME_MS, Duration::from_millis(120));
        context.accumulate_time_metric(keys::RETRY_TIME_MS, Duration::from_millis(80));
        assert_eq!(context.metrics()[keys::RETRY_TIME_MS], "200");
    }
}
