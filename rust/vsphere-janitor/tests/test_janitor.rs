// End-to-end cleanup runs against the in-memory provider
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use vsphere_janitor::mock::{MockVmLister, VmData};
use vsphere_janitor::{Janitor, JanitorError, JanitorOptions, ProviderError};

const HOUR: Duration = Duration::from_secs(3600);
const MINUTE: Duration = Duration::from_secs(60);

fn a_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 1, 15, 12, 0, 0).unwrap()
}

fn opts() -> JanitorOptions {
    JanitorOptions {
        cutoff: HOUR,
        zero_uptime_cutoff: MINUTE,
        skip_destroy: false,
        concurrency: 1,
        rate_per_second: 100,
        skip_no_boot_time: true,
        action_timeout: None,
    }
}

fn janitor(lister: &MockVmLister, opts: JanitorOptions) -> Janitor {
    Janitor::new(Arc::new(lister.clone()), opts).unwrap()
}

fn old(name: &str) -> VmData {
    VmData::new(name).booted(a_time(), 2 * HOUR).powered_on(true)
}

fn young(name: &str) -> VmData {
    VmData::new(name).booted(a_time(), 30 * MINUTE).powered_on(true)
}

fn mixed_fleet() -> Vec<VmData> {
    vec![old("old-powered-on"), young("new-powered-on"), VmData::new("powered-off")]
}

#[tokio::test]
async fn test_cleanup_reclaims_old_and_debounces_unbooted() {
    let lister = MockVmLister::new().with_path("/", mixed_fleet());
    let janitor = janitor(&lister, opts());

    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    assert!(lister.powered_off("/", "old-powered-on"));
    assert!(lister.destroyed("/", "old-powered-on"));
    assert!(!lister.powered_off("/", "new-powered-on"));
    assert!(!lister.destroyed("/", "new-powered-on"));
    assert!(!lister.destroyed("/", "powered-off"));

    assert_eq!(stats.evaluated, 3);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.powered_off, 1);
    assert_eq!(stats.destroyed, 1);
    assert!(stats.is_clean());

    let tracker = janitor.tracker("/");
    assert_eq!(tracker.first_seen("powered-off"), Some(a_time()));
    assert_eq!(tracker.len(), 1);
}

#[tokio::test]
async fn test_unbooted_vm_is_destroyed_after_grace_period() {
    let lister = MockVmLister::new().with_path("/", mixed_fleet());
    let janitor = janitor(&lister, opts());

    janitor.cleanup("/", a_time()).await.unwrap();
    let stats = janitor
        .cleanup("/", a_time() + chrono::Duration::minutes(2))
        .await
        .unwrap();

    // Already powered off: destroy only
    assert!(!lister.powered_off("/", "powered-off"));
    assert!(lister.destroyed("/", "powered-off"));
    assert!(!lister.destroyed("/", "new-powered-on"));
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.powered_off, 0);
    assert!(janitor.tracker("/").is_empty());
}

#[tokio::test]
async fn test_unbooted_vm_within_grace_period_is_left_alone() {
    let lister = MockVmLister::new().with_path("/", vec![VmData::new("booting")]);
    let janitor = janitor(&lister, opts());

    janitor.cleanup("/", a_time()).await.unwrap();
    janitor
        .cleanup("/", a_time() + chrono::Duration::seconds(30))
        .await
        .unwrap();

    assert_eq!(lister.destroy_count(), 0);
    assert_eq!(janitor.tracker("/").first_seen("booting"), Some(a_time()));
}

#[tokio::test]
async fn test_vms_that_leave_the_listing_are_forgotten() {
    let lister = MockVmLister::new().with_path("/", vec![VmData::new("ghost"), young("keep")]);
    let janitor = janitor(&lister, opts());

    janitor.cleanup("/", a_time()).await.unwrap();
    assert_eq!(janitor.tracked_vms(), 1);

    lister.set_vms("/", vec![young("keep")]);
    janitor.cleanup("/", a_time()).await.unwrap();

    assert_eq!(janitor.tracked_vms(), 0);
}

#[tokio::test]
async fn test_reconcile_is_scoped_to_the_cleaned_path() {
    let lister = MockVmLister::new()
        .with_path("/a", vec![VmData::new("waiting")])
        .with_path("/b", vec![]);
    let janitor = janitor(&lister, opts());

    janitor.cleanup("/a", a_time()).await.unwrap();
    janitor.cleanup("/b", a_time()).await.unwrap();

    assert_eq!(janitor.tracker("/a").first_seen("waiting"), Some(a_time()));
}

#[tokio::test]
async fn test_skip_destroy_only_powers_off() {
    let lister = MockVmLister::new().with_path("/", mixed_fleet());
    let janitor = janitor(
        &lister,
        JanitorOptions {
            skip_destroy: true,
            ..opts()
        },
    );

    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    assert!(lister.powered_off("/", "old-powered-on"));
    assert_eq!(lister.destroy_count(), 0);
    assert_eq!(stats.powered_off, 1);
    assert_eq!(stats.destroyed, 0);
}

#[tokio::test]
async fn test_no_boot_time_with_uptime_is_skipped_unless_disabled() {
    let vm = VmData::new("odd").with_uptime(3 * HOUR).powered_on(true);
    let lister = MockVmLister::new().with_path("/", vec![vm]);

    janitor(&lister, opts()).cleanup("/", a_time()).await.unwrap();
    assert_eq!(lister.destroy_count(), 0);

    let permissive = JanitorOptions {
        skip_no_boot_time: false,
        ..opts()
    };
    janitor(&lister, permissive).cleanup("/", a_time()).await.unwrap();
    assert!(lister.destroyed("/", "odd"));
}

#[tokio::test]
async fn test_young_powered_off_vm_is_reclaimed() {
    let vm = VmData::new("stopped").booted(a_time(), 10 * MINUTE);
    let lister = MockVmLister::new().with_path("/", vec![vm]);

    janitor(&lister, opts()).cleanup("/", a_time()).await.unwrap();

    assert!(!lister.powered_off("/", "stopped"));
    assert!(lister.destroyed("/", "stopped"));
}

#[tokio::test]
async fn test_concurrency_bounds_in_flight_actions() {
    let vms = (0..6)
        .map(|i| old(&format!("vm-{i}")).with_action_delay(Duration::from_millis(50)))
        .collect();
    let lister = MockVmLister::new().with_path("/", vms);
    let janitor = janitor(
        &lister,
        JanitorOptions {
            concurrency: 2,
            rate_per_second: 1000,
            ..opts()
        },
    );

    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    assert_eq!(stats.destroyed, 6);
    assert_eq!(lister.destroy_count(), 6);
    assert!(lister.max_in_flight() >= 1);
    assert!(lister.max_in_flight() <= 2, "max in flight was {}", lister.max_in_flight());
}

#[tokio::test]
async fn test_rate_limit_spaces_out_evaluations() {
    let vms = (0..5).map(|i| young(&format!("vm-{i}"))).collect();
    let lister = MockVmLister::new().with_path("/", vms);
    let janitor = janitor(
        &lister,
        JanitorOptions {
            rate_per_second: 10,
            ..opts()
        },
    );

    let started = Instant::now();
    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    assert_eq!(stats.evaluated, 5);
    // First evaluation is immediate, the other four wait 100ms each
    assert!(
        started.elapsed() >= Duration::from_millis(350),
        "took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_failure_on_one_vm_does_not_stop_others() {
    let lister = MockVmLister::new().with_path(
        "/",
        vec![old("broken").failing_power_off(), old("fine"), old("sticky").failing_destroy()],
    );
    let janitor = janitor(&lister, opts());

    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    assert!(lister.destroyed("/", "fine"));
    assert!(!lister.destroyed("/", "broken"));
    assert!(lister.powered_off("/", "sticky"));
    assert_eq!(stats.error_count(), 2);

    let broken = stats.failures.iter().find(|f| f.vm == "broken").unwrap();
    assert!(matches!(broken.error, JanitorError::PowerOff { .. }));
    let sticky = stats.failures.iter().find(|f| f.vm == "sticky").unwrap();
    assert!(matches!(sticky.error, JanitorError::Destroy { .. }));
}

#[tokio::test]
async fn test_panicking_worker_is_isolated_and_releases_its_permit() {
    let lister = MockVmLister::new().with_path(
        "/",
        vec![old("boom").panicking_on_destroy(), old("after-1"), old("after-2")],
    );
    let janitor = janitor(&lister, opts());

    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    // Concurrency 1: the later VMs only run if the panicking worker gave its permit back
    assert!(lister.destroyed("/", "after-1"));
    assert!(lister.destroyed("/", "after-2"));
    assert_eq!(stats.error_count(), 1);

    let boom = &stats.failures[0];
    assert_eq!(boom.vm, "boom");
    match &boom.error {
        JanitorError::Panicked { message, .. } => assert!(message.contains("destroy exploded")),
        other => panic!("expected a panic failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_panicking_evaluation_is_recorded_and_walk_continues() {
    let lister = MockVmLister::new()
        .with_path("/", vec![old("cursed").panicking_on_uptime(), old("normal")]);
    let janitor = janitor(&lister, opts());

    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    assert!(lister.destroyed("/", "normal"));
    assert!(!lister.destroyed("/", "cursed"));
    assert!(stats.failed("vm #0 in /"));
    assert_eq!(stats.evaluated, 2);
}

#[tokio::test]
async fn test_panicking_evaluation_keeps_listed_vm_tracked() {
    let lister = MockVmLister::new().with_path("/", vec![VmData::new("stuck")]);
    let janitor = janitor(&lister, opts());

    janitor.cleanup("/", a_time()).await.unwrap();

    lister.set_vms("/", vec![VmData::new("stuck").panicking_on_uptime()]);
    let stats = janitor
        .cleanup("/", a_time() + chrono::Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(stats.error_count(), 1);
    assert_eq!(janitor.tracker("/").first_seen("stuck"), Some(a_time()));

    // Still listed the whole time, so the grace period counts from the first run
    lister.set_vms("/", vec![VmData::new("stuck")]);
    janitor
        .cleanup("/", a_time() + chrono::Duration::minutes(2))
        .await
        .unwrap();

    assert!(lister.destroyed("/", "stuck"));
    assert!(janitor.tracker("/").is_empty());
}

#[tokio::test]
async fn test_listing_failure_is_returned() {
    let lister = MockVmLister::new().with_path("/", mixed_fleet());
    lister.fail_listing("/");
    let janitor = janitor(&lister, opts());

    match janitor.cleanup("/", a_time()).await {
        Err(JanitorError::ListVms { path, source }) => {
            assert_eq!(path, "/");
            assert!(matches!(source, ProviderError::Injected(_)));
        }
        other => panic!("expected listing error, got {other:?}"),
    }
    assert_eq!(lister.destroy_count(), 0);

    lister.heal_listing("/");
    assert!(janitor.cleanup("/", a_time()).await.is_ok());
    assert_eq!(lister.list_calls(), 2);
}

#[tokio::test]
async fn test_unknown_path_is_a_listing_error() {
    let lister = MockVmLister::new();
    let janitor = janitor(&lister, opts());

    let err = janitor.cleanup("/nope", a_time()).await.unwrap_err();
    assert!(matches!(
        err,
        JanitorError::ListVms {
            source: ProviderError::FolderNotFound(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_duplicate_identity_is_dispatched_once() {
    let lister = MockVmLister::new().with_path(
        "/",
        vec![old("first").with_id("same-uuid"), old("second").with_id("same-uuid")],
    );
    let janitor = janitor(&lister, opts());

    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    assert_eq!(stats.dispatched, 1);
    assert_eq!(lister.destroy_count(), 1);
    assert!(lister.destroyed("/", "first"));
}

#[tokio::test]
async fn test_duplicate_unbooted_identity_is_reclaimed_once_and_forgotten() {
    let lister = MockVmLister::new().with_path(
        "/",
        vec![
            VmData::new("copy-a").with_id("shared"),
            VmData::new("copy-b").with_id("shared"),
        ],
    );
    let janitor = janitor(&lister, opts());

    janitor.cleanup("/", a_time()).await.unwrap();
    assert_eq!(janitor.tracker("/").first_seen("shared"), Some(a_time()));

    let stats = janitor
        .cleanup("/", a_time() + chrono::Duration::minutes(2))
        .await
        .unwrap();

    assert_eq!(stats.dispatched, 1);
    assert_eq!(lister.destroy_count(), 1);
    assert!(lister.destroyed("/", "copy-a"));
    assert_eq!(janitor.tracker("/").first_seen("shared"), None);
}

#[tokio::test]
async fn test_vm_without_identity_is_never_reclaimed_while_unbooted() {
    let lister = MockVmLister::new().with_path("/", vec![VmData::new("anon").with_id("")]);
    let janitor = janitor(&lister, opts());

    janitor.cleanup("/", a_time()).await.unwrap();
    janitor
        .cleanup("/", a_time() + chrono::Duration::hours(1))
        .await
        .unwrap();

    assert_eq!(lister.destroy_count(), 0);
    assert_eq!(janitor.tracked_vms(), 0);
}

#[tokio::test]
async fn test_slow_action_times_out() {
    let lister = MockVmLister::new().with_path(
        "/",
        vec![old("slow").with_action_delay(Duration::from_millis(500))],
    );
    let janitor = janitor(
        &lister,
        JanitorOptions {
            action_timeout: Some(Duration::from_millis(50)),
            ..opts()
        },
    );

    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    assert_eq!(stats.error_count(), 1);
    assert!(matches!(
        stats.failures[0].error,
        JanitorError::Timeout {
            action: "power off",
            ..
        }
    ));
    assert!(!lister.destroyed("/", "slow"));
}

#[tokio::test]
async fn test_cancelled_before_listing_does_nothing() {
    let lister = MockVmLister::new().with_path("/", mixed_fleet());
    let token = CancellationToken::new();
    token.cancel();
    let janitor = janitor(&lister, opts()).with_shutdown(token);

    let stats = janitor.cleanup("/", a_time()).await.unwrap();

    assert_eq!(stats.evaluated, 0);
    assert_eq!(lister.list_calls(), 0);
    assert_eq!(lister.destroy_count(), 0);
}

#[tokio::test]
async fn test_shutdown_aborts_in_flight_actions() {
    let lister = MockVmLister::new().with_path(
        "/",
        vec![old("stuck").with_action_delay(Duration::from_secs(30))],
    );
    let token = CancellationToken::new();
    let janitor = janitor(&lister, opts()).with_shutdown(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let started = Instant::now();
    let stats = janitor.cleanup("/", a_time()).await.unwrap();
    canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(stats.error_count(), 1);
    assert!(matches!(stats.failures[0].error, JanitorError::Cancelled { .. }));
    assert!(!lister.destroyed("/", "stuck"));
}

#[test]
fn test_invalid_options_are_rejected() {
    let lister = MockVmLister::new();

    for bad in [
        JanitorOptions {
            concurrency: 0,
            ..opts()
        },
        JanitorOptions {
            rate_per_second: 0,
            ..opts()
        },
    ] {
        assert!(matches!(
            Janitor::new(Arc::new(lister.clone()), bad),
            Err(JanitorError::InvalidOptions(_))
        ));
    }
}
