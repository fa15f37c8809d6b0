//! Lifecycle management for the SITL simulator process.
//!
//! [`SitlRunner`] owns exactly one simulator child process for the duration of
//! one test: it spawns the process bound to an allocated UDP port, gates on a
//! readiness marker in the combined stdout/stderr output, and tears the
//! process down with a graceful-then-forced two-phase stop.
//!
//! # Overview
//!
//! 1. **Spawn** the configured [`SimCommand`](crate::config::SimCommand) with
//!    both output streams captured and `kill_on_drop` as a last-resort guard
//! 2. **Wait for ready** by scanning output lines for the marker, bounded by
//!    the startup timeout; end-of-stream before the marker fails immediately
//! 3. **Drain** remaining output in a background task once ready
//! 4. **Stop** with a termination request, a fixed grace period, and a forced
//!    kill if the process does not exit voluntarily
//!
//! Every state transition is emitted on the injected [`EventLog`], so tests
//! can assert on the exact teardown path taken.
//!
//! # Example
//!
//! ```no_run
//! use mavrig_core::config::RunnerConfig;
//! use mavrig_core::events::EventLog;
//! use mavrig_core::runner::SitlRunner;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut runner = SitlRunner::new(14550, RunnerConfig::default(), EventLog::new());
//! runner.start().await?;
//! // ... drive the simulator through runner.endpoint() ...
//! runner.stop().await;
//! # Ok(())
//! # }
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RunnerConfig;
use crate::events::{EventLog, RunnerEventKind};

/// How long a termination request may go unanswered before escalating to a
/// forced kill.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while starting the simulator.
#[derive(Error, Debug)]
pub enum StartupError {
    /// The simulator process could not be spawned.
    #[error("failed to spawn simulator process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The readiness marker did not appear within the timeout.
    #[error("simulator did not become ready within {0:?}")]
    NotReady(Duration),

    /// The process exited (or closed its output) before signaling readiness.
    #[error("simulator exited before signaling readiness")]
    ProcessExited,

    /// `start()` was called on a runner that already ran.
    #[error("simulator was already started")]
    AlreadyStarted,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of the simulator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// No process has been spawned.
    Idle,
    /// The process is running but has not signaled readiness.
    Starting,
    /// The readiness marker was observed.
    Ready,
    /// Startup failed; the process may still need cleanup via [`SitlRunner::stop`].
    Failed,
    /// Teardown is in progress.
    Stopping,
    /// Teardown finished. Terminal.
    Stopped,
}

// ---------------------------------------------------------------------------
// SitlRunner
// ---------------------------------------------------------------------------

/// Captured output streams of the simulator process.
struct SimOutput {
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
}

/// Owns one simulator child process from spawn to teardown.
///
/// A runner is single-use: it drives one process through
/// [`RunnerState::Idle`] → `Starting` → `Ready` → `Stopped` and is not
/// reused across tests. [`stop`](Self::stop) is safe to call from any state,
/// any number of times.
pub struct SitlRunner {
    host_port: u16,
    config: RunnerConfig,
    state: RunnerState,
    child: Option<Child>,
    output: Option<SimOutput>,
    drain: Option<(CancellationToken, JoinHandle<()>)>,
    events: EventLog,
}

impl SitlRunner {
    /// Create a runner for the given allocated host port.
    pub fn new(host_port: u16, config: RunnerConfig, events: EventLog) -> Self {
        Self {
            host_port,
            config,
            state: RunnerState::Idle,
            child: None,
            output: None,
            drain: None,
            events,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// The allocated host port the simulator is bound to.
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// The address a ground-control client must send to (`udp-out`): the
    /// harness is the active sender, the simulator the passive listener.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.host_port))
    }

    /// Whether the child process is currently alive (non-blocking poll).
    pub fn is_running(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Spawn the simulator and block until it signals readiness.
    ///
    /// On failure the process may still be running; the caller must invoke
    /// [`stop`](Self::stop) (the scoped harness does this unconditionally).
    ///
    /// # Errors
    ///
    /// - [`StartupError::AlreadyStarted`] if this runner already ran
    /// - [`StartupError::Spawn`] if the process could not be launched
    /// - [`StartupError::NotReady`] if the marker did not appear in time
    /// - [`StartupError::ProcessExited`] if the process died silently first
    pub async fn start(&mut self) -> Result<(), StartupError> {
        if self.state != RunnerState::Idle {
            return Err(StartupError::AlreadyStarted);
        }

        info!(port = self.host_port, "starting simulator");

        let mut command = self.config.command.to_process_command(self.host_port);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state = RunnerState::Failed;
                self.events.emit(RunnerEventKind::StartupFailed);
                return Err(StartupError::Spawn(e));
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            self.state = RunnerState::Failed;
            self.events.emit(RunnerEventKind::StartupFailed);
            return Err(StartupError::Spawn(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulator output was not captured",
            )));
        };

        self.child = Some(child);
        self.output = Some(SimOutput {
            stdout: BufReader::new(stdout).lines(),
            stderr: BufReader::new(stderr).lines(),
        });
        self.state = RunnerState::Starting;
        self.events.emit(RunnerEventKind::Started {
            port: self.host_port,
        });

        self.wait_for_ready(self.config.startup_timeout).await
    }

    /// Scan output lines for the readiness marker, bounded by `timeout`.
    ///
    /// Reads stdout and stderr as one merged stream. End-of-stream on both
    /// pipes before the marker means the process died silently and fails the
    /// wait immediately rather than sitting out the timeout.
    pub async fn wait_for_ready(&mut self, timeout: Duration) -> Result<(), StartupError> {
        let Some(mut output) = self.output.take() else {
            return Err(StartupError::ProcessExited);
        };

        let deadline = Instant::now() + timeout;
        let mut stdout_open = true;
        let mut stderr_open = true;
        let marker = self.config.ready_marker.clone();

        let outcome = loop {
            if !stdout_open && !stderr_open {
                break Err(StartupError::ProcessExited);
            }

            let line = tokio::select! {
                biased;
                () = tokio::time::sleep_until(deadline) => {
                    break Err(StartupError::NotReady(timeout));
                }
                line = output.stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => Some(line),
                    _ => {
                        stdout_open = false;
                        None
                    }
                },
                line = output.stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => Some(line),
                    _ => {
                        stderr_open = false;
                        None
                    }
                },
            };

            if let Some(line) = line {
                trace!(target: "mavrig_core::sitl", "{line}");
                if line.contains(marker.as_str()) {
                    break Ok(());
                }
            }
        };

        match outcome {
            Ok(()) => {
                info!(port = self.host_port, "simulator ready");
                self.state = RunnerState::Ready;
                self.events.emit(RunnerEventKind::Ready);

                // Keep the pipes empty so the simulator never blocks on a
                // full buffer; lines stay visible at trace level.
                let token = CancellationToken::new();
                let handle = tokio::spawn(drain_output(output, token.clone()));
                self.drain = Some((token, handle));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "simulator failed to become ready");
                self.state = RunnerState::Failed;
                self.events.emit(RunnerEventKind::StartupFailed);
                // stop() closes the captured stream.
                self.output = Some(output);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Tear the simulator down.
    ///
    /// No-op if the runner never started or already stopped. Otherwise sends
    /// a termination request, waits up to [`GRACE_PERIOD`] for a voluntary
    /// exit, and escalates to a forced kill if the process holds out. The
    /// captured output stream is closed last on every path. Errors during
    /// teardown are logged, never propagated.
    pub async fn stop(&mut self) {
        match self.state {
            RunnerState::Idle | RunnerState::Stopped => return,
            _ => {}
        }

        self.state = RunnerState::Stopping;
        self.events.emit(RunnerEventKind::Stopping);
        info!("stopping simulator");

        let mut forced = false;
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "simulator already exited");
                }
                _ => {
                    request_termination(&mut child);
                    match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
                        Ok(Ok(status)) => {
                            debug!(%status, "simulator exited gracefully");
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "error waiting for simulator exit");
                        }
                        Err(_) => {
                            warn!(
                                grace = ?GRACE_PERIOD,
                                "graceful shutdown timed out; killing simulator"
                            );
                            self.events.emit(RunnerEventKind::GraceExpired);
                            forced = true;
                            if let Err(e) = child.kill().await {
                                warn!(error = %e, "failed to kill simulator");
                            }
                        }
                    }
                }
            }
        }

        if let Some((token, handle)) = self.drain.take() {
            token.cancel();
            let _ = handle.await;
        }
        self.output.take();

        self.state = RunnerState::Stopped;
        self.events.emit(RunnerEventKind::Stopped { forced });
    }
}

/// Forward remaining simulator output to the trace log until the pipes close
/// or the runner stops.
async fn drain_output(mut output: SimOutput, token: CancellationToken) {
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        tokio::select! {
            () = token.cancelled() => break,
            line = output.stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => trace!(target: "mavrig_core::sitl", "{line}"),
                _ => stdout_open = false,
            },
            line = output.stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => trace!(target: "mavrig_core::sitl", "{line}"),
                _ => stderr_open = false,
            },
        }
    }
}

/// Ask the child to exit voluntarily.
#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(error = %e, "failed to deliver termination signal");
        }
    }
}

/// No portable graceful signal exists here; rely on the kill escalation.
#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
