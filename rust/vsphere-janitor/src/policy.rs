//! Per-VM decision policy.
//!
//! Rules, in precedence order:
//!
//! 1. Zero uptime and no boot time: debounce on identity. Skip until the VM
//!    has been in that state for `zero_uptime_cutoff`, then reclaim it
//!    regardless of `cutoff`.
//! 2. Otherwise: skip VMs without boot time when `skip_no_boot_time` is set,
//!    skip powered-on VMs younger than `cutoff`, reclaim everything else.
//!    A powered-off VM below the cutoff is still reclaimed.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::options::JanitorOptions;
use crate::provider::VmSnapshot;
use crate::tracker::DebounceTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Reclaim(ReclaimReason),
}

impl Decision {
    pub fn is_reclaim(&self) -> bool {
        matches!(self, Decision::Reclaim(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Zero uptime, no boot time, and no identity to debounce on yet.
    NoIdentity,
    /// Zero uptime, no boot time, first sighting recorded this run.
    FirstSeen,
    /// Zero uptime, no boot time, grace period still running.
    GracePending { stuck_for: Duration },
    NoBootTime,
    UnderCutoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    /// Stuck un-booted past the zero-uptime grace period.
    StuckUnbooted { stuck_for: Duration },
    OverCutoff,
    /// Powered off with uptime below the cutoff.
    PoweredOff,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoIdentity => write!(f, "instance has 0 uptime and no identity yet"),
            SkipReason::FirstSeen => write!(f, "instance has 0 uptime, first sighting"),
            SkipReason::GracePending { stuck_for } => {
                write!(f, "instance has had 0 uptime for {stuck_for:?}")
            }
            SkipReason::NoBootTime => write!(f, "instance has no boot time"),
            SkipReason::UnderCutoff => write!(f, "instance is powered on and under cutoff"),
        }
    }
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReclaimReason::StuckUnbooted { stuck_for } => {
                write!(f, "instance stuck with 0 uptime for {stuck_for:?}")
            }
            ReclaimReason::OverCutoff => write!(f, "instance uptime exceeds cutoff"),
            ReclaimReason::PoweredOff => write!(f, "instance is powered off"),
        }
    }
}

/// Decide what to do with one VM, updating the debounce tracker as a side effect.
pub fn evaluate(
    vm: &VmSnapshot,
    opts: &JanitorOptions,
    tracker: &DebounceTracker,
    now: DateTime<Utc>,
) -> Decision {
    if vm.uptime.is_zero() && vm.boot_time.is_none() {
        if vm.id.is_empty() {
            return Decision::Skip(SkipReason::NoIdentity);
        }

        let Some(first_seen) = tracker.observe(&vm.id, now) else {
            return Decision::Skip(SkipReason::FirstSeen);
        };

        // Clock going backwards reads as "no time elapsed"
        let stuck_for = (now - first_seen).to_std().unwrap_or_default();
        if stuck_for < opts.zero_uptime_cutoff {
            return Decision::Skip(SkipReason::GracePending { stuck_for });
        }

        tracker.forget(&vm.id);
        return Decision::Reclaim(ReclaimReason::StuckUnbooted { stuck_for });
    }

    if !vm.id.is_empty() {
        tracker.forget(&vm.id);
    }

    if vm.boot_time.is_none() && opts.skip_no_boot_time {
        return Decision::Skip(SkipReason::NoBootTime);
    }

    if vm.uptime < opts.cutoff {
        if vm.powered_on {
            return Decision::Skip(SkipReason::UnderCutoff);
        }
        return Decision::Reclaim(ReclaimReason::PoweredOff);
    }

    Decision::Reclaim(ReclaimReason::OverCutoff)
}
