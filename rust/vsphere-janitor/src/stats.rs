//! Outcome report for a single cleanup run.

use std::time::Duration;

use crate::error::JanitorError;

/// A per-VM error recorded during a run. Never aborts the batch.
#[derive(Debug)]
pub struct VmFailure {
    pub vm: String,
    pub error: JanitorError,
}

/// Counters for one `cleanup(path, now)` invocation.
#[derive(Debug, Default)]
pub struct RunStats {
    pub path: String,
    /// VMs that went through the decision policy.
    pub evaluated: usize,
    pub skipped: usize,
    /// VMs handed to the action coordinator.
    pub dispatched: usize,
    pub powered_off: usize,
    pub destroyed: usize,
    pub failures: Vec<VmFailure>,
    pub elapsed: Duration,
}

impl RunStats {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn record_failure(&mut self, vm: impl Into<String>, error: JanitorError) {
        self.failures.push(VmFailure {
            vm: vm.into(),
            error,
        });
    }

    pub fn error_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether a failure was recorded for the named VM.
    pub fn failed(&self, vm: &str) -> bool {
        self.failures.iter().any(|f| f.vm == vm)
    }
}
