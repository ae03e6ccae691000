//! VirtualMachine handle backed by a vSphere summary snapshot.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{ManagedObjectReference, PowerState, VirtualMachineSummary};
use super::Client;
use crate::error::ProviderError;
use crate::provider::VirtualMachine;

const UNNAMED: &str = "<unnamed>";

/// A VM as listed from vSphere. Power state and uptime are as of listing time.
#[derive(Debug)]
pub struct VSphereVm {
    client: Client,
    reference: ManagedObjectReference,
    id: String,
    name: String,
    uptime: Duration,
    boot_time: Option<DateTime<Utc>>,
    powered_on: bool,
}

impl VSphereVm {
    pub fn new(
        client: Client,
        reference: ManagedObjectReference,
        summary: &VirtualMachineSummary,
    ) -> Self {
        let config = summary.config.clone().unwrap_or_default();
        let uptime_secs = summary.quick_stats.uptime_seconds.unwrap_or(0).max(0);

        Self {
            client,
            reference,
            id: config.instance_uuid.unwrap_or_default(),
            name: config.name.unwrap_or_else(|| UNNAMED.to_string()),
            uptime: Duration::from_secs(uptime_secs.unsigned_abs()),
            boot_time: summary.runtime.boot_time,
            powered_on: summary.runtime.power_state == PowerState::PoweredOn,
        }
    }
}

#[async_trait]
impl VirtualMachine for VSphereVm {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn uptime(&self) -> Duration {
        self.uptime
    }

    fn boot_time(&self) -> Option<DateTime<Utc>> {
        self.boot_time
    }

    fn powered_on(&self) -> bool {
        self.powered_on
    }

    async fn power_off(&self) -> Result<(), ProviderError> {
        self.client
            .run_vm_task(&self.reference, "PowerOffVM_Task")
            .await
    }

    async fn destroy(&self) -> Result<(), ProviderError> {
        self.client.run_vm_task(&self.reference, "Destroy_Task").await
    }
}
