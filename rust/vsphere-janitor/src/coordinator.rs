//! Bounded, panic-isolated execution of power-off and destroy actions.
//!
//! Every qualifying VM becomes one task on the caller's [`JoinSet`]. A task
//! holds a semaphore permit for exactly as long as it talks to the provider;
//! the permit is an owned guard, so it is returned on success, on error and
//! while unwinding from a panic.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::error::{JanitorError, JanitorResult, ProviderError};
use crate::metrics;
use crate::options::JanitorOptions;
use crate::provider::{VmHandle, VmSnapshot};

/// What happened to one dispatched VM.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    pub vm: String,
    pub powered_off: bool,
    pub destroyed: bool,
    pub error: Option<JanitorError>,
}

impl ActionOutcome {
    fn new(vm: &str) -> Self {
        Self {
            vm: vm.to_string(),
            ..Self::default()
        }
    }

    fn failed(mut self, error: JanitorError) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    PowerOff,
    Destroy,
}

impl Action {
    const fn as_str(self) -> &'static str {
        match self {
            Action::PowerOff => "power off",
            Action::Destroy => "destroy",
        }
    }

    fn error(self, vm: &str, source: ProviderError) -> JanitorError {
        let vm = vm.to_string();
        match self {
            Action::PowerOff => JanitorError::PowerOff { vm, source },
            Action::Destroy => JanitorError::Destroy { vm, source },
        }
    }
}

/// Runs power-off/destroy for qualifying VMs under a concurrency budget.
#[derive(Debug, Clone)]
pub struct ActionCoordinator {
    semaphore: Arc<Semaphore>,
    skip_destroy: bool,
    action_timeout: Option<Duration>,
}

impl ActionCoordinator {
    pub fn new(opts: &JanitorOptions) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(opts.concurrency)),
            skip_destroy: opts.skip_destroy,
            action_timeout: opts.action_timeout,
        }
    }

    /// Spawn the power-off/destroy task for `vm` onto `workers`.
    pub fn dispatch(
        &self,
        workers: &mut JoinSet<ActionOutcome>,
        vm: VmHandle,
        snapshot: VmSnapshot,
        path: Arc<str>,
        scope: CancellationToken,
    ) {
        let coordinator = self.clone();
        let span = info_span!("vm_action", vm = %snapshot.name, path = %path);

        workers.spawn(
            async move {
                let name = snapshot.name.clone();
                let work = coordinator.power_off_and_destroy(vm, snapshot, &path, &scope);

                match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let err = JanitorError::from_panic(&name, payload.as_ref());
                        error!(error = %err, "worker panicked");
                        metrics::record_error(&path, err.kind());
                        ActionOutcome::new(&name).failed(err)
                    }
                }
            }
            .instrument(span),
        );
    }

    async fn power_off_and_destroy(
        &self,
        vm: VmHandle,
        snapshot: VmSnapshot,
        path: &str,
        scope: &CancellationToken,
    ) -> ActionOutcome {
        let mut outcome = ActionOutcome::new(&snapshot.name);

        let _permit = tokio::select! {
            biased;
            () = scope.cancelled() => {
                return outcome.failed(JanitorError::Cancelled { vm: snapshot.name });
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_closed) => {
                    return outcome.failed(JanitorError::Cancelled { vm: snapshot.name });
                }
            },
        };

        info!(
            uptime_secs = snapshot.uptime.as_secs(),
            "handling poweroff and destroy of instance"
        );

        if snapshot.powered_on {
            info!("powering off instance");

            if let Err(err) = self
                .bounded(scope, &snapshot.name, Action::PowerOff, vm.power_off())
                .await
            {
                error!(error = %err, "error powering off instance");
                metrics::record_error(path, err.kind());
                return outcome.failed(err);
            }

            outcome.powered_off = true;
            metrics::record_poweroff(path);
        }

        if self.skip_destroy {
            info!("skipping destroy step");
            return outcome;
        }

        info!("destroying instance");

        if let Err(err) = self
            .bounded(scope, &snapshot.name, Action::Destroy, vm.destroy())
            .await
        {
            error!(error = %err, "error destroying instance");
            metrics::record_error(path, err.kind());
            return outcome.failed(err);
        }

        info!("destroyed instance");
        outcome.destroyed = true;
        metrics::record_destroy(path);

        outcome
    }

    /// Run one provider call, racing it against cancellation and the optional timeout.
    async fn bounded<F>(
        &self,
        scope: &CancellationToken,
        vm: &str,
        action: Action,
        call: F,
    ) -> JanitorResult<()>
    where
        F: Future<Output = Result<(), ProviderError>>,
    {
        let timed = async {
            match self.action_timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.ok(),
                None => Some(call.await),
            }
        };

        let result = tokio::select! {
            biased;
            () = scope.cancelled() => {
                return Err(JanitorError::Cancelled { vm: vm.to_string() });
            }
            result = timed => result,
        };

        match result {
            Some(Ok(())) => Ok(()),
            Some(Err(source)) => Err(action.error(vm, source)),
            None => Err(JanitorError::Timeout {
                vm: vm.to_string(),
                action: action.as_str(),
                after: self.action_timeout.unwrap_or_default(),
            }),
        }
    }
}
