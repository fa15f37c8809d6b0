//! Lifecycle tests for [`SitlRunner`] against fake simulator processes.
//!
//! The fakes are `/bin/sh` one-liners, so this suite is unix-only; the
//! readiness and teardown semantics they exercise are platform-independent.

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use mavrig_core::events::{EventLog, RunnerEventKind};
use mavrig_core::runner::{RunnerState, StartupError, GRACE_PERIOD};

const MARKER_LINE: &str = "echo '[mavlink] mode: Onboard'";

#[tokio::test]
async fn start_succeeds_when_marker_appears() {
    common::init_tracing();
    let script = format!("sleep 0.2; {MARKER_LINE}; sleep 30");
    let mut runner = common::shell_runner(&script, Duration::from_secs(5), EventLog::new());

    let started = Instant::now();
    runner.start().await.unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(1),
        "readiness took {:?}",
        started.elapsed()
    );
    assert_eq!(runner.state(), RunnerState::Ready);
    assert!(runner.is_running());

    runner.stop().await;
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert!(!runner.is_running());
}

#[tokio::test]
async fn marker_on_stderr_counts_as_ready() {
    common::init_tracing();
    let script = format!("{MARKER_LINE} 1>&2; sleep 30");
    let mut runner = common::shell_runner(&script, Duration::from_secs(5), EventLog::new());

    runner.start().await.unwrap();
    assert_eq!(runner.state(), RunnerState::Ready);

    runner.stop().await;
}

#[tokio::test]
async fn mute_process_times_out_without_hanging() {
    common::init_tracing();
    let mut runner = common::shell_runner("sleep 30", Duration::from_secs(1), EventLog::new());

    let started = Instant::now();
    let err = runner.start().await.unwrap_err();

    assert!(matches!(err, StartupError::NotReady(_)), "got: {err:?}");
    assert!(
        started.elapsed() < Duration::from_millis(2500),
        "timeout took {:?}",
        started.elapsed()
    );
    assert_eq!(runner.state(), RunnerState::Failed);

    runner.stop().await;
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert!(!runner.is_running());
}

#[tokio::test]
async fn silent_death_fails_immediately() {
    common::init_tracing();
    // Generous timeout: the failure must come from the closed stream, not
    // from waiting it out.
    let mut runner = common::shell_runner("exit 0", Duration::from_secs(10), EventLog::new());

    let started = Instant::now();
    let err = runner.start().await.unwrap_err();

    assert!(matches!(err, StartupError::ProcessExited), "got: {err:?}");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "EOF detection took {:?}",
        started.elapsed()
    );

    runner.stop().await;
}

#[tokio::test]
async fn spawn_failure_surfaces_as_error() {
    common::init_tracing();
    let config = mavrig_core::config::RunnerConfig {
        command: mavrig_core::config::SimCommand::Custom {
            program: "/nonexistent/simulator-binary".to_string(),
            args: vec![],
        },
        ready_marker: "ready".to_string(),
        startup_timeout: Duration::from_secs(1),
    };
    let mut runner = mavrig_core::runner::SitlRunner::new(14550, config, EventLog::new());

    let err = runner.start().await.unwrap_err();
    assert!(matches!(err, StartupError::Spawn(_)), "got: {err:?}");

    runner.stop().await;
    assert_eq!(runner.state(), RunnerState::Stopped);
}

#[tokio::test]
async fn double_start_is_rejected() {
    common::init_tracing();
    let script = format!("{MARKER_LINE}; sleep 30");
    let mut runner = common::shell_runner(&script, Duration::from_secs(5), EventLog::new());

    runner.start().await.unwrap();
    let err = runner.start().await.unwrap_err();
    assert!(matches!(err, StartupError::AlreadyStarted));

    runner.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_emits_one_stopped_event() {
    common::init_tracing();
    let events = EventLog::new();
    let mut rx = events.subscribe();
    let script = format!("{MARKER_LINE}; sleep 30");
    let mut runner = common::shell_runner(&script, Duration::from_secs(5), events);

    runner.start().await.unwrap();
    runner.stop().await;
    runner.stop().await;

    assert_eq!(runner.state(), RunnerState::Stopped);

    let kinds = common::drain_events(&mut rx);
    assert_eq!(
        common::count_kind(&kinds, &RunnerEventKind::Stopped { forced: false }),
        1,
        "events: {kinds:?}"
    );
    assert_eq!(
        common::count_kind(&kinds, &RunnerEventKind::Stopping),
        1,
        "events: {kinds:?}"
    );
}

#[tokio::test]
async fn cooperative_process_is_never_force_killed() {
    common::init_tracing();
    let events = EventLog::new();
    let mut rx = events.subscribe();
    // Plain sh exits promptly on SIGTERM.
    let script = format!("{MARKER_LINE}; sleep 30");
    let mut runner = common::shell_runner(&script, Duration::from_secs(5), events);

    runner.start().await.unwrap();

    let stop_started = Instant::now();
    runner.stop().await;

    assert!(
        stop_started.elapsed() < Duration::from_secs(1),
        "graceful stop took {:?}",
        stop_started.elapsed()
    );

    let kinds = common::drain_events(&mut rx);
    assert_eq!(common::count_kind(&kinds, &RunnerEventKind::GraceExpired), 0);
    assert!(kinds.contains(&RunnerEventKind::Stopped { forced: false }));
}

#[tokio::test]
async fn term_ignoring_process_is_killed_after_the_grace_period() {
    common::init_tracing();
    let events = EventLog::new();
    let mut rx = events.subscribe();
    let script = format!("trap '' TERM; {MARKER_LINE}; while true; do sleep 1; done");
    let mut runner = common::shell_runner(&script, Duration::from_secs(5), events);

    runner.start().await.unwrap();

    let stop_started = Instant::now();
    runner.stop().await;
    let stop_elapsed = stop_started.elapsed();

    assert!(
        stop_elapsed >= GRACE_PERIOD,
        "escalated before the grace period: {stop_elapsed:?}"
    );
    assert!(
        stop_elapsed < GRACE_PERIOD + Duration::from_millis(1500),
        "forced stop took {stop_elapsed:?}"
    );
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert!(!runner.is_running());

    let kinds = common::drain_events(&mut rx);
    assert_eq!(common::count_kind(&kinds, &RunnerEventKind::GraceExpired), 1);
    assert!(kinds.contains(&RunnerEventKind::Stopped { forced: true }));
}

#[tokio::test]
async fn stop_after_voluntary_exit_skips_signaling() {
    common::init_tracing();
    let events = EventLog::new();
    let mut rx = events.subscribe();
    // The fake exits on its own right after signaling readiness.
    let script = format!("{MARKER_LINE}; sleep 0.2");
    let mut runner = common::shell_runner(&script, Duration::from_secs(5), events);

    runner.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!runner.is_running());

    let stop_started = Instant::now();
    runner.stop().await;

    assert!(stop_started.elapsed() < Duration::from_millis(500));
    assert_eq!(runner.state(), RunnerState::Stopped);

    let kinds = common::drain_events(&mut rx);
    assert!(kinds.contains(&RunnerEventKind::Stopped { forced: false }));
}
