//! vSphere janitor
//!
//! Periodically scans inventory folders, powers off VMs that have been up for
//! too long (or are stuck un-booted past a grace period) and destroys them.
//! The decision engine only depends on the [`provider`] traits; the live
//! vSphere client lives in [`vsphere`] and an in-memory fake in [`mock`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod janitor;
pub mod logging;
pub mod metrics;
pub mod mock;
pub mod options;
pub mod policy;
pub mod provider;
pub mod stats;
pub mod tracker;
pub mod vsphere;

pub use error::{JanitorError, JanitorResult, ProviderError};
pub use janitor::Janitor;
pub use options::JanitorOptions;
pub use provider::{VirtualMachine, VmHandle, VmLister, VmSnapshot};
pub use stats::{RunStats, VmFailure};
pub use tracker::DebounceTracker;
