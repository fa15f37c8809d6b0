//! Runner configuration and simulator process invocation.
//!
//! [`RunnerConfig`] carries everything the lifecycle manager needs to start a
//! simulator: the process to launch ([`SimCommand`]), the readiness marker to
//! scan for in its output, and the startup timeout. Defaults target the
//! published SITL container image; `~/.mavrig/config.json` can override the
//! image and timeout for local setups.
//!
//! # Example
//!
//! ```no_run
//! use mavrig_core::config::RunnerConfig;
//!
//! // Load (returns defaults if the file doesn't exist)
//! let config = RunnerConfig::load();
//! println!("startup timeout: {:?}", config.startup_timeout);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command as ProcessCommand;

/// Container image running the autopilot SITL simulation.
pub const DEFAULT_IMAGE: &str = "pietrodn/px4_gazebo_docker:latest";

/// UDP port the simulator listens on inside the container.
pub const SITL_UDP_PORT: u16 = 14556;

/// Line fragment the simulator prints once the autopilot has attached to the
/// onboard MAVLink channel. Sole readiness signal; there is no health socket.
pub const READY_MARKER: &str = "[mavlink] mode: Onboard";

/// Default time to wait for the readiness marker.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

const CONFIG_FILENAME: &str = "config.json";

/// Returns the harness state directory (`~/.mavrig`).
pub fn harness_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mavrig")
}

// ---------------------------------------------------------------------------
// SimCommand
// ---------------------------------------------------------------------------

/// The process the lifecycle manager launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCommand {
    /// Run the simulator container, publishing the allocated host port onto
    /// the container's fixed UDP port.
    Docker { image: String, container_port: u16 },

    /// Run an arbitrary program (a locally built SITL binary, or the
    /// `sitl-stub` helper). Occurrences of `{port}` in the arguments are
    /// replaced with the allocated host port.
    Custom { program: String, args: Vec<String> },
}

impl SimCommand {
    /// Build the process command for the given allocated host port.
    pub fn to_process_command(&self, host_port: u16) -> ProcessCommand {
        match self {
            SimCommand::Docker {
                image,
                container_port,
            } => {
                let mut cmd = ProcessCommand::new("docker");
                cmd.args(["run", "-i", "--init", "-p"])
                    .arg(format!("{host_port}:{container_port}/udp"))
                    .arg(image);
                cmd
            }
            SimCommand::Custom { program, args } => {
                let mut cmd = ProcessCommand::new(program);
                for arg in args {
                    cmd.arg(arg.replace("{port}", &host_port.to_string()));
                }
                cmd
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RunnerConfig
// ---------------------------------------------------------------------------

/// Configuration for one simulator lifecycle.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// The simulator process to launch.
    pub command: SimCommand,
    /// Substring of a process output line that signals readiness.
    pub ready_marker: String,
    /// Maximum time to wait for the readiness marker.
    pub startup_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: SimCommand::Docker {
                image: DEFAULT_IMAGE.to_string(),
                container_port: SITL_UDP_PORT,
            },
            ready_marker: READY_MARKER.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

/// On-disk overrides (`~/.mavrig/config.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConfigFile {
    /// Alternative simulator image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,

    /// Startup timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    startup_timeout_secs: Option<u64>,
}

impl RunnerConfig {
    /// Load the default configuration with `~/.mavrig/config.json` overrides.
    ///
    /// Returns [`Default`] values if the file does not exist or cannot be
    /// parsed.
    pub fn load() -> Self {
        let path = harness_dir().join(CONFIG_FILENAME);
        let file: ConfigFile = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self::default().with_overrides(file)
    }

    fn with_overrides(mut self, file: ConfigFile) -> Self {
        if let Some(new_image) = file.image {
            if let SimCommand::Docker { image, .. } = &mut self.command {
                *image = new_image;
            }
        }
        if let Some(secs) = file.startup_timeout_secs {
            self.startup_timeout = Duration::from_secs(secs);
        }
        self
    }
}
