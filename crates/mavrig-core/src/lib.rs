//! # mavrig-core
//!
//! Process-isolated integration-test harness for a drone-autopilot SITL
//! simulator.
//!
//! The harness owns a simulator child process for the duration of one test:
//! it allocates an ephemeral UDP port, starts the simulator bound to that
//! port, blocks until a readiness marker appears in the process output, hands
//! a connected ground-control client to the test body, and tears the process
//! down afterwards — gracefully first, forcibly after a fixed grace period —
//! on every exit path.
//!
//! ## Modules
//!
//! - [`port`] - Ephemeral UDP port allocation
//! - [`config`] - Runner configuration and simulator process invocation
//! - [`runner`] - Simulator process lifecycle (spawn, readiness gate, two-phase stop)
//! - [`events`] - Structured lifecycle events for assertions and post-mortems
//! - [`proto`] - Datagram wire messages for the ground-control link
//! - [`vehicle`] - Connected client with the vehicle command surface
//! - [`stub`] - Protocol-speaking fake autopilot (also built as `sitl-stub`)
//! - [`harness`] - Scoped acquisition tying the pieces together per test
//!
//! ## Example
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
//!         assert!(!vehicle.armed());
//!         vehicle.arm().await?;
//!         vehicle.disarm().await?;
//!         anyhow::Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod events;
pub mod harness;
pub mod port;
pub mod proto;
pub mod runner;
pub mod stub;
pub mod vehicle;
