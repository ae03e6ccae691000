//! In-memory VM provider for tests.
//!
//! Records every power-off and destroy per path, tracks how many actions are
//! in flight at once, and can inject failures, panics and latency per VM.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::ProviderError;
use crate::provider::{VirtualMachine, VmHandle, VmLister};

/// Fixture describing one fake VM.
#[derive(Debug, Clone, Default)]
pub struct VmData {
    pub id: String,
    pub name: String,
    pub uptime: Duration,
    pub boot_time: Option<DateTime<Utc>>,
    pub powered_on: bool,
    pub fail_power_off: bool,
    pub fail_destroy: bool,
    pub panic_on_destroy: bool,
    pub panic_on_uptime: bool,
    pub action_delay: Option<Duration>,
}

impl VmData {
    /// A powered-off, never-booted VM whose identity equals its name.
    pub fn new(name: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Booted `uptime` before `now`, with matching uptime.
    #[must_use]
    pub fn booted(mut self, now: DateTime<Utc>, uptime: Duration) -> Self {
        self.uptime = uptime;
        self.boot_time = chrono::Duration::from_std(uptime).ok().map(|ago| now - ago);
        self
    }

    #[must_use]
    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime = uptime;
        self
    }

    #[must_use]
    pub fn powered_on(mut self, powered_on: bool) -> Self {
        self.powered_on = powered_on;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    #[must_use]
    pub fn failing_power_off(mut self) -> Self {
        self.fail_power_off = true;
        self
    }

    #[must_use]
    pub fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    #[must_use]
    pub fn panicking_on_destroy(mut self) -> Self {
        self.panic_on_destroy = true;
        self
    }

    #[must_use]
    pub fn panicking_on_uptime(mut self) -> Self {
        self.panic_on_uptime = true;
        self
    }

    #[must_use]
    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
struct Inner {
    vms: Mutex<HashMap<String, Vec<VmData>>>,
    failing_paths: Mutex<HashSet<String>>,
    powered_off: Mutex<HashMap<String, Vec<String>>>,
    destroyed: Mutex<HashMap<String, Vec<String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    list_calls: AtomicUsize,
}

/// Fake [`VmLister`] backed by per-path fixtures.
#[derive(Debug, Clone, Default)]
pub struct MockVmLister {
    inner: Arc<Inner>,
}

impl MockVmLister {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(self, path: &str, vms: Vec<VmData>) -> Self {
        self.set_vms(path, vms);
        self
    }

    /// Replace the listing for `path`.
    pub fn set_vms(&self, path: &str, vms: Vec<VmData>) {
        self.inner.vms.lock().insert(path.to_string(), vms);
    }

    /// Make listing `path` fail until cleared with [`MockVmLister::heal_listing`].
    pub fn fail_listing(&self, path: &str) {
        self.inner.failing_paths.lock().insert(path.to_string());
    }

    pub fn heal_listing(&self, path: &str) {
        self.inner.failing_paths.lock().remove(path);
    }

    pub fn powered_off(&self, path: &str, name: &str) -> bool {
        Self::contains(&self.inner.powered_off, path, name)
    }

    pub fn destroyed(&self, path: &str, name: &str) -> bool {
        Self::contains(&self.inner.destroyed, path, name)
    }

    pub fn power_off_count(&self) -> usize {
        self.inner.powered_off.lock().values().map(Vec::len).sum()
    }

    pub fn destroy_count(&self) -> usize {
        self.inner.destroyed.lock().values().map(Vec::len).sum()
    }

    /// Highest number of power-off/destroy calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    fn contains(log: &Mutex<HashMap<String, Vec<String>>>, path: &str, name: &str) -> bool {
        log.lock()
            .get(path)
            .is_some_and(|names| names.iter().any(|n| n == name))
    }
}

#[async_trait]
impl VmLister for MockVmLister {
    async fn list_vms(&self, path: &str) -> Result<Vec<VmHandle>, ProviderError> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);

        if self.inner.failing_paths.lock().contains(path) {
            return Err(ProviderError::injected(format!("listing {path} failed")));
        }

        let vms = self.inner.vms.lock();
        let data = vms
            .get(path)
            .ok_or_else(|| ProviderError::FolderNotFound(path.to_string()))?;

        Ok(data
            .iter()
            .cloned()
            .map(|data| {
                Arc::new(MockVm {
                    inner: Arc::clone(&self.inner),
                    path: path.to_string(),
                    data,
                }) as VmHandle
            })
            .collect())
    }
}

/// A fake VM handed out by [`MockVmLister`].
#[derive(Debug)]
pub struct MockVm {
    inner: Arc<Inner>,
    path: String,
    data: VmData,
}

/// Counts an action as in flight until dropped.
struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockVm {
    async fn delay(&self) {
        if let Some(delay) = self.data.action_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, log: &Mutex<HashMap<String, Vec<String>>>) {
        log.lock()
            .entry(self.path.clone())
            .or_default()
            .push(self.data.name.clone());
    }
}

#[async_trait]
impl VirtualMachine for MockVm {
    fn id(&self) -> &str {
        &self.data.id
    }

    fn name(&self) -> &str {
        &self.data.name
    }

    fn uptime(&self) -> Duration {
        assert!(!self.data.panic_on_uptime, "uptime unavailable for {}", self.data.name);
        self.data.uptime
    }

    fn boot_time(&self) -> Option<DateTime<Utc>> {
        self.data.boot_time
    }

    fn powered_on(&self) -> bool {
        self.data.powered_on
    }

    async fn power_off(&self) -> Result<(), ProviderError> {
        let _in_flight = InFlight::enter(&self.inner);
        self.delay().await;

        if self.data.fail_power_off {
            return Err(ProviderError::injected(format!(
                "power off of {} failed",
                self.data.name
            )));
        }

        self.record(&self.inner.powered_off);
        if let Some(vms) = self.inner.vms.lock().get_mut(&self.path) {
            for vm in vms.iter_mut().filter(|vm| vm.name == self.data.name) {
                vm.powered_on = false;
            }
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ProviderError> {
        let _in_flight = InFlight::enter(&self.inner);
        self.delay().await;

        assert!(!self.data.panic_on_destroy, "destroy exploded for {}", self.data.name);

        if self.data.fail_destroy {
            return Err(ProviderError::injected(format!(
                "destroy of {} failed",
                self.data.name
            )));
        }

        self.record(&self.inner.destroyed);
        if let Some(vms) = self.inner.vms.lock().get_mut(&self.path) {
            vms.retain(|vm| vm.name != self.data.name);
        }
        Ok(())
    }
}
