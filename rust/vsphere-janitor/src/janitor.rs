//! The cleanup decision engine.
//!
//! `cleanup(path, now)` lists the VMs below `path`, walks them at no more than
//! `rate_per_second` evaluations per second, hands qualifying VMs to the
//! [`ActionCoordinator`], prunes the debounce tracker for VMs that left the
//! listing, and waits for every dispatched worker before returning.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{ActionCoordinator, ActionOutcome};
use crate::error::{JanitorError, JanitorResult};
use crate::metrics;
use crate::options::JanitorOptions;
use crate::policy::{self, Decision};
use crate::provider::{VmLister, VmSnapshot};
use crate::stats::RunStats;
use crate::tracker::DebounceTracker;

pub struct Janitor {
    lister: Arc<dyn VmLister>,
    opts: JanitorOptions,
    /// One tracker per inventory path, so reconciling one path never prunes another's entries.
    trackers: Mutex<HashMap<String, Arc<DebounceTracker>>>,
    limiter: DefaultDirectRateLimiter,
    coordinator: ActionCoordinator,
    shutdown: CancellationToken,
}

impl fmt::Debug for Janitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Janitor")
            .field("lister", &"<dyn VmLister>")
            .field("opts", &self.opts)
            .field("tracked_vms", &self.tracked_vms())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl Janitor {
    pub fn new(lister: Arc<dyn VmLister>, opts: JanitorOptions) -> JanitorResult<Self> {
        opts.validate()?;

        // One evaluation per 1/rate seconds, no bursting
        let quota = Quota::per_second(opts.rate()?).allow_burst(std::num::NonZeroU32::MIN);

        Ok(Self {
            lister,
            coordinator: ActionCoordinator::new(&opts),
            limiter: RateLimiter::direct(quota),
            trackers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            opts,
        })
    }

    /// Tie every cleanup to `token`: cancelling it stops the walk and aborts in-flight calls.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Debounce state for `path`.
    pub fn tracker(&self, path: &str) -> Arc<DebounceTracker> {
        let mut trackers = self.trackers.lock();
        Arc::clone(trackers.entry(path.to_string()).or_default())
    }

    /// VMs waiting out the zero-uptime grace period, across all paths.
    pub fn tracked_vms(&self) -> usize {
        self.trackers.lock().values().map(|t| t.len()).sum()
    }

    /// Run one cleanup pass over `path` as of `now`.
    ///
    /// Only a listing failure is returned as an error; per-VM failures are
    /// collected into [`RunStats::failures`].
    pub async fn cleanup(&self, path: &str, now: DateTime<Utc>) -> JanitorResult<RunStats> {
        let timer = metrics::CleanupTimer::new(path);
        let started = Instant::now();
        let scope = self.shutdown.child_token();
        let _scope_guard = scope.clone().drop_guard();
        let mut stats = RunStats::new(path);

        let listed = tokio::select! {
            biased;
            () = scope.cancelled() => {
                warn!(path = %path, "cleanup cancelled before listing");
                return Ok(stats);
            }
            listed = self.lister.list_vms(path) => listed,
        };

        let vms = listed.map_err(|source| {
            metrics::record_error(path, "list");
            JanitorError::ListVms {
                path: path.to_string(),
                source,
            }
        })?;

        let tracker = self.tracker(path);
        let path_label: Arc<str> = Arc::from(path);
        let mut workers: JoinSet<ActionOutcome> = JoinSet::new();
        let mut seen: HashSet<String> = HashSet::with_capacity(vms.len());
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut interrupted = false;

        for (index, vm) in vms.into_iter().enumerate() {
            tokio::select! {
                biased;
                () = scope.cancelled() => {
                    warn!(path = %path, "cleanup cancelled, stopping evaluation");
                    interrupted = true;
                    break;
                }
                () = self.limiter.until_ready() => {}
            }

            stats.evaluated += 1;

            // Read the identity on its own so a VM whose evaluation panics still counts as listed
            let id = catch_unwind(AssertUnwindSafe(|| vm.id().to_string())).unwrap_or_default();
            if !id.is_empty() {
                seen.insert(id.clone());

                if dispatched.contains(&id) {
                    stats.skipped += 1;
                    warn!(
                        vm = %vm.name(),
                        id = %id,
                        "instance listed twice, already dispatched"
                    );
                    continue;
                }
            }

            let evaluated = catch_unwind(AssertUnwindSafe(|| {
                let snapshot = VmSnapshot::capture(vm.as_ref());
                let decision = policy::evaluate(&snapshot, &self.opts, &tracker, now);
                (snapshot, decision)
            }));

            let (snapshot, decision) = match evaluated {
                Ok(evaluated) => evaluated,
                Err(payload) => {
                    let label = format!("vm #{index} in {path}");
                    let err = JanitorError::from_panic(&label, payload.as_ref());
                    error!(error = %err, "error handling VM");
                    metrics::record_error(path, err.kind());
                    stats.record_failure(label, err);
                    continue;
                }
            };

            match decision {
                Decision::Skip(reason) => {
                    stats.skipped += 1;
                    info!(
                        vm = %snapshot.name,
                        uptime_secs = snapshot.uptime.as_secs(),
                        powered_on = snapshot.powered_on,
                        reason = %reason,
                        "skipping instance"
                    );
                }
                Decision::Reclaim(reason) => {
                    if !snapshot.id.is_empty() {
                        dispatched.insert(snapshot.id.clone());
                    }

                    if let Some(boot_time) = snapshot.boot_time {
                        debug!(
                            vm = %snapshot.name,
                            booted_ago_secs = (now - boot_time).num_seconds(),
                            "instance booted ago"
                        );
                    }
                    info!(vm = %snapshot.name, reason = %reason, "instance qualifies for cleanup");

                    stats.dispatched += 1;
                    self.coordinator.dispatch(
                        &mut workers,
                        vm,
                        snapshot,
                        Arc::clone(&path_label),
                        scope.clone(),
                    );
                }
            }
        }

        // A partial walk hasn't seen every VM, so it can't tell which ones left
        if !interrupted {
            let pruned = tracker.reconcile(&seen);
            if pruned > 0 {
                debug!(path = %path, pruned, "forgot VMs that left the inventory");
            }
        }

        metrics::record_vms_total(path, stats.evaluated);
        metrics::record_debounce_tracked(self.tracked_vms());

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => {
                    stats.powered_off += usize::from(outcome.powered_off);
                    stats.destroyed += usize::from(outcome.destroyed);
                    if let Some(err) = outcome.error {
                        stats.record_failure(outcome.vm, err);
                    }
                }
                Err(join_err) => {
                    error!(error = %join_err, "worker task failed to complete");
                    stats.record_failure(
                        "<unknown>",
                        JanitorError::Other(anyhow::anyhow!("worker task failed: {join_err}")),
                    );
                }
            }
        }

        stats.elapsed = started.elapsed();
        timer.complete();

        info!(
            path = %path,
            evaluated = stats.evaluated,
            skipped = stats.skipped,
            powered_off = stats.powered_off,
            destroyed = stats.destroyed,
            errors = stats.error_count(),
            elapsed_ms = stats.elapsed.as_millis(),
            "cleanup finished"
        );

        Ok(stats)
    }
}
