//! Shared helpers for mavrig-core integration tests.
//!
//! Provides fake simulator processes (shell one-liners and the `sitl-stub`
//! binary), an in-process stub autopilot, and event-stream utilities.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use mavrig_core::config::{RunnerConfig, SimCommand, READY_MARKER};
use mavrig_core::events::{EventLog, RunnerEvent, RunnerEventKind};
use mavrig_core::runner::SitlRunner;
use mavrig_core::stub::StubAutopilot;

/// Install a test-friendly tracing subscriber (idempotent).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Start an in-process stub autopilot on an ephemeral UDP port.
///
/// Returns its address and a token that stops the serve loop.
pub async fn spawn_stub_autopilot() -> (SocketAddr, CancellationToken) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let token = CancellationToken::new();

    let serve_token = token.clone();
    tokio::spawn(async move {
        let _ = StubAutopilot::new().serve(socket, serve_token).await;
    });

    (addr, token)
}

/// A runner configuration driving `/bin/sh -c <script>` as the simulator.
pub fn shell_config(script: &str, startup_timeout: Duration) -> RunnerConfig {
    RunnerConfig {
        command: SimCommand::Custom {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        },
        ready_marker: READY_MARKER.to_string(),
        startup_timeout,
    }
}

/// A runner over a shell script, wired to the given event log.
pub fn shell_runner(script: &str, startup_timeout: Duration, events: EventLog) -> SitlRunner {
    // Shell fakes never bind the port, so any number will do.
    SitlRunner::new(14550, shell_config(script, startup_timeout), events)
}

/// A runner configuration launching the `sitl-stub` binary; the runner
/// substitutes `{port}` with the allocated host port.
pub fn stub_binary_config(extra_args: &[&str], startup_timeout: Duration) -> RunnerConfig {
    let mut args = vec!["--port".to_string(), "{port}".to_string()];
    args.extend(extra_args.iter().map(|s| s.to_string()));

    RunnerConfig {
        command: SimCommand::Custom {
            program: env!("CARGO_BIN_EXE_sitl-stub").to_string(),
            args,
        },
        ready_marker: READY_MARKER.to_string(),
        startup_timeout,
    }
}

/// Collect all events currently buffered on the receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<RunnerEvent>) -> Vec<RunnerEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

/// Count occurrences of one event kind.
pub fn count_kind(kinds: &[RunnerEventKind], wanted: &RunnerEventKind) -> usize {
    kinds.iter().filter(|kind| *kind == wanted).count()
}
