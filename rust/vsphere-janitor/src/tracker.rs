//! First-seen tracking for VMs stuck at zero uptime with no boot time.
//!
//! A VM in that state might be mid-provisioning, so it is only reclaimed once
//! it has stayed that way for the zero-uptime grace period. The tracker holds
//! the first time each such VM was observed and is pruned whenever a VM drops
//! out of the listing.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Identity → first time the VM was seen with zero uptime and no boot time.
#[derive(Debug, Default)]
pub struct DebounceTracker {
    first_seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DebounceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        self.first_seen.lock().get(id).copied()
    }

    /// Overwrites any existing entry.
    pub fn record_first_seen(&self, id: &str, at: DateTime<Utc>) {
        self.first_seen.lock().insert(id.to_string(), at);
    }

    /// Returns the recorded timestamp, or records `now` and returns `None`.
    ///
    /// Lookup and insert happen under one lock acquisition.
    pub fn observe(&self, id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut first_seen = self.first_seen.lock();
        if let Some(at) = first_seen.get(id) {
            return Some(*at);
        }
        first_seen.insert(id.to_string(), now);
        None
    }

    pub fn forget(&self, id: &str) -> bool {
        self.first_seen.lock().remove(id).is_some()
    }

    /// Drops every entry whose identity is not in `current`. Returns how many were removed.
    pub fn reconcile(&self, current: &HashSet<String>) -> usize {
        let mut first_seen = self.first_seen.lock();
        let before = first_seen.len();
        first_seen.retain(|id, _| current.contains(id));
        before - first_seen.len()
    }

    pub fn len(&self) -> usize {
        self.first_seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.lock().is_empty()
    }
}
