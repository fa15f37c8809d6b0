//! End-to-end tests: the full harness against the `sitl-stub` binary.
//!
//! These exercise the complete composition — port allocation, process
//! startup, readiness gating, client connection, test body, and ordered
//! teardown — with a real child process speaking the ground-control protocol.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mavrig_core::events::RunnerEventKind;
use mavrig_core::harness::SitlHarness;
use mavrig_core::runner::{StartupError, GRACE_PERIOD};

#[tokio::test]
async fn full_scenario_against_the_stub() {
    common::init_tracing();
    let harness = SitlHarness::new(common::stub_binary_config(&[], Duration::from_secs(5)));
    let mut rx = harness.subscribe();

    let started = Instant::now();
    harness
        .with_vehicle(|mut vehicle| async move {
            vehicle
                .wait_ready("system_status", Duration::from_secs(2))
                .await?;

            assert!(!vehicle.armed());
            vehicle.arm().await?;
            assert!(vehicle.armed());
            vehicle.disarm().await?;
            assert!(!vehicle.armed());

            assert_eq!(vehicle.battery_level(), Some(100));
            anyhow::Ok(())
        })
        .await
        .unwrap();

    // Ready in well under the startup timeout, torn down gracefully.
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "scenario took {:?}",
        started.elapsed()
    );

    let kinds = common::drain_events(&mut rx);
    assert!(kinds.contains(&RunnerEventKind::Ready), "events: {kinds:?}");
    assert_eq!(
        common::count_kind(&kinds, &RunnerEventKind::Stopped { forced: false }),
        1,
        "events: {kinds:?}"
    );
}

#[tokio::test]
async fn failing_body_still_stops_the_simulator_exactly_once() {
    common::init_tracing();
    let harness = SitlHarness::new(common::stub_binary_config(&[], Duration::from_secs(5)));
    let mut rx = harness.subscribe();

    let result: anyhow::Result<()> = harness
        .with_vehicle(|_vehicle| async move { Err(anyhow::anyhow!("injected failure")) })
        .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("injected failure"));

    let kinds = common::drain_events(&mut rx);
    let stopped = common::count_kind(&kinds, &RunnerEventKind::Stopped { forced: false })
        + common::count_kind(&kinds, &RunnerEventKind::Stopped { forced: true });
    assert_eq!(stopped, 1, "events: {kinds:?}");
}

#[tokio::test]
async fn startup_failure_propagates_and_cleans_up() {
    common::init_tracing();
    let harness = SitlHarness::new(common::stub_binary_config(
        &["--mute"],
        Duration::from_secs(1),
    ));
    let mut rx = harness.subscribe();

    let body_ran = Arc::new(AtomicBool::new(false));
    let body_flag = body_ran.clone();

    let result: anyhow::Result<()> = harness
        .with_vehicle(|_vehicle| {
            let body_flag = body_flag.clone();
            async move {
                body_flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

    let err = result.unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<StartupError>(),
            Some(StartupError::NotReady(_))
        ),
        "got: {err:?}"
    );
    assert!(!body_ran.load(Ordering::SeqCst), "body ran after failed startup");

    let kinds = common::drain_events(&mut rx);
    assert!(kinds.contains(&RunnerEventKind::StartupFailed), "events: {kinds:?}");
    let stopped = common::count_kind(&kinds, &RunnerEventKind::Stopped { forced: false })
        + common::count_kind(&kinds, &RunnerEventKind::Stopped { forced: true });
    assert_eq!(stopped, 1, "events: {kinds:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn term_ignoring_simulator_is_force_killed() {
    common::init_tracing();
    let harness = SitlHarness::new(common::stub_binary_config(
        &["--ignore-term"],
        Duration::from_secs(5),
    ));
    let mut rx = harness.subscribe();

    let started = Instant::now();
    harness
        .with_vehicle(|vehicle| async move {
            drop(vehicle);
            anyhow::Ok(())
        })
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Teardown must ride out the full grace period, then escalate promptly.
    assert!(elapsed >= GRACE_PERIOD, "stopped too early: {elapsed:?}");
    assert!(
        elapsed < GRACE_PERIOD + Duration::from_secs(3),
        "forced teardown took {elapsed:?}"
    );

    let kinds = common::drain_events(&mut rx);
    assert_eq!(common::count_kind(&kinds, &RunnerEventKind::GraceExpired), 1);
    assert!(kinds.contains(&RunnerEventKind::Stopped { forced: true }));
}

#[tokio::test]
async fn marker_on_stderr_is_honored_end_to_end() {
    common::init_tracing();
    let harness = SitlHarness::new(common::stub_binary_config(
        &["--marker-to-stderr"],
        Duration::from_secs(5),
    ));

    harness
        .with_vehicle(|mut vehicle| async move {
            vehicle.wait_ready("mode", Duration::from_secs(2)).await?;
            anyhow::Ok(())
        })
        .await
        .unwrap();
}
