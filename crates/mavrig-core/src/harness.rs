//! Scoped acquisition of a running simulator plus connected client.
//!
//! [`SitlHarness::with_vehicle`] is the per-test entry point: it allocates a
//! port, starts the simulator, connects a [`Vehicle`], hands it to the test
//! body, and stops the simulator afterwards on every exit path. The teardown
//! order is fixed: the vehicle (owned by the body) is dropped when the body's
//! future resolves, strictly before the simulator stop sequence begins.
//!
//! If the body panics and unwinds past the harness, the child process is
//! still reaped by `kill_on_drop`; the graceful path is reserved for normal
//! and error returns.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mavrig_core::harness::SitlHarness;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let harness = SitlHarness::default();
//! harness
//!     .with_vehicle(|mut vehicle| async move {
//!         vehicle.wait_ready("system_status", Duration::from_secs(10)).await?;
//!         vehicle.arm().await?;
//!         vehicle.disarm().await?;
//!         anyhow::Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::RunnerConfig;
use crate::events::{EventLog, RunnerEvent};
use crate::port::allocate_udp_port;
use crate::runner::SitlRunner;
use crate::vehicle::Vehicle;

/// Per-test composition of port allocator, lifecycle manager, and client.
pub struct SitlHarness {
    config: RunnerConfig,
    events: EventLog,
}

impl SitlHarness {
    /// Create a harness with the given runner configuration and an in-memory
    /// event log.
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            events: EventLog::new(),
        }
    }

    /// Create a harness with an explicit event log (e.g. a persistent one).
    pub fn with_event_log(config: RunnerConfig, events: EventLog) -> Self {
        Self { config, events }
    }

    /// Subscribe to lifecycle events of runs started after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    /// Run `body` against a freshly started simulator.
    ///
    /// Allocates a port, starts a [`SitlRunner`] scoped to it, connects a
    /// [`Vehicle`] to `127.0.0.1:<port>`, and passes it to `body`. The
    /// simulator is stopped exactly once afterwards, whether the body
    /// succeeds or fails; a startup failure stops the partially started
    /// process before propagating.
    ///
    /// # Errors
    ///
    /// Startup failures carry a
    /// [`StartupError`](crate::runner::StartupError) that remains
    /// downcastable through the returned [`anyhow::Error`].
    pub async fn with_vehicle<F, Fut, T>(&self, body: F) -> anyhow::Result<T>
    where
        F: FnOnce(Vehicle) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let port = allocate_udp_port().context("allocating simulator port")?;
        let mut runner = SitlRunner::new(port, self.config.clone(), self.events.clone());

        if let Err(e) = runner.start().await {
            // Cleanup of the partially started process still runs.
            runner.stop().await;
            return Err(anyhow::Error::new(e).context("simulator not ready"));
        }

        let vehicle = match Vehicle::connect(runner.endpoint()).await {
            Ok(vehicle) => vehicle,
            Err(e) => {
                runner.stop().await;
                return Err(anyhow::Error::new(e).context("connecting ground-control client"));
            }
        };

        debug!(port, "simulator up, running test body");

        // The body owns the vehicle; its link closes when the future
        // resolves, before the simulator stop sequence begins.
        let result = body(vehicle).await;
        runner.stop().await;
        result
    }
}

impl Default for SitlHarness {
    /// Harness with on-disk configuration overrides and a persistent event
    /// log under `~/.mavrig/logs/`.
    fn default() -> Self {
        Self::with_event_log(RunnerConfig::load(), EventLog::persistent())
    }
}

/// Run a test body against a simulator using the on-disk configuration.
pub async fn with_vehicle<F, Fut, T>(body: F) -> anyhow::Result<T>
where
    F: FnOnce(Vehicle) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    SitlHarness::default().with_vehicle(body).await
}
