//! Capability traits the janitor needs from a virtualization platform.
//!
//! The live implementation lives in [`crate::vsphere`]; tests use
//! [`crate::mock`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ProviderError;

/// Shared handle to a VM returned by a [`VmLister`].
pub type VmHandle = Arc<dyn VirtualMachine>;

/// Lists the VMs below an inventory path.
#[async_trait]
pub trait VmLister: Send + Sync {
    async fn list_vms(&self, path: &str) -> Result<Vec<VmHandle>, ProviderError>;
}

/// A VM as seen at listing time, plus the destructive actions on it.
#[async_trait]
pub trait VirtualMachine: Send + Sync + fmt::Debug {
    /// Stable platform identity. Empty until the platform assigns one.
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn uptime(&self) -> Duration;

    /// `None` when the VM has not booted (or the platform doesn't know).
    fn boot_time(&self) -> Option<DateTime<Utc>>;

    fn powered_on(&self) -> bool;

    async fn power_off(&self) -> Result<(), ProviderError>;

    async fn destroy(&self) -> Result<(), ProviderError>;
}

/// Plain-data copy of the fields the decision policy reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSnapshot {
    pub id: String,
    pub name: String,
    pub uptime: Duration,
    pub boot_time: Option<DateTime<Utc>>,
    pub powered_on: bool,
}

impl VmSnapshot {
    pub fn capture(vm: &dyn VirtualMachine) -> Self {
        Self {
            id: vm.id().to_string(),
            name: vm.name().to_string(),
            uptime: vm.uptime(),
            boot_time: vm.boot_time(),
            powered_on: vm.powered_on(),
        }
    }
}
