//! Ground-control client for the simulated vehicle.
//!
//! [`Vehicle`] is the connected client handle the harness yields to test
//! bodies. It sends [`Command`]s over a datagram link, consumes the
//! autopilot's [`Telemetry`] stream into an attribute cache, and exposes the
//! command surface the behavioral tests drive: arming, mode switching, home
//! location, reboot, battery and system status, per-message listeners, and
//! readiness waits on named subsystems.
//!
//! The client is deliberately single-threaded: command methods pump inbound
//! datagrams inline until the matching acknowledgement (or a deadline), so
//! there is no background task to race with and listeners always fire on the
//! calling task.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mavrig_core::vehicle::Vehicle;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut vehicle = Vehicle::connect("127.0.0.1:14550".parse()?).await?;
//! vehicle.wait_ready("system_status", Duration::from_secs(10)).await?;
//! vehicle.arm().await?;
//! assert!(vehicle.armed());
//! vehicle.disarm().await?;
//! vehicle.close();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::proto::{self, command_id, Command, Telemetry};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Timeout for the first autopilot heartbeat after connecting.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a command acknowledgement.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest datagram the link will accept.
const MAX_DATAGRAM: usize = 512;

// ---------------------------------------------------------------------------
// Attribute types
// ---------------------------------------------------------------------------

/// A named flight mode, compared by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleMode(pub String);

impl VehicleMode {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named overall system status (e.g. `STANDBY`), compared by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemStatus(pub String);

impl SystemStatus {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A global position triple (degrees, degrees, meters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationGlobal {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// A local NED position estimate in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalPosition {
    pub north: f32,
    pub east: f32,
    pub down: f32,
}

/// Attribute cache filled from the telemetry stream.
#[derive(Debug, Clone, Default)]
pub struct VehicleState {
    pub armed: bool,
    pub mode: Option<VehicleMode>,
    pub system_status: Option<SystemStatus>,
    pub battery_level: Option<u8>,
    pub home_location: Option<LocationGlobal>,
    pub local_position: Option<LocalPosition>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while driving the vehicle.
#[derive(Error, Debug)]
pub enum VehicleError {
    /// The link was closed with [`Vehicle::close`].
    #[error("not connected to autopilot")]
    NotConnected,

    /// No autopilot heartbeat arrived after connecting.
    #[error("no autopilot heartbeat within {0:?}")]
    ConnectFailed(Duration),

    /// A response or telemetry wait exceeded its deadline.
    #[error("timed out waiting for autopilot response")]
    Timeout,

    /// The autopilot acknowledged a command with a non-success result.
    #[error("command {command} rejected with result {result}")]
    Rejected { command: u16, result: u8 },

    /// An unknown name was passed to [`Vehicle::wait_ready`].
    #[error("unknown subsystem: {0}")]
    UnknownSubsystem(String),

    /// An I/O error occurred on the link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// VehicleLink trait
// ---------------------------------------------------------------------------

/// A datagram transport to the autopilot.
///
/// Production code uses a connected [`UdpSocket`]; tests substitute an
/// in-memory pair via [`Vehicle::from_link`].
#[async_trait]
pub trait VehicleLink: Send {
    /// Send one datagram.
    async fn send(&mut self, datagram: &[u8]) -> std::io::Result<()>;

    /// Receive one datagram into `buf`, returning its length.
    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

#[async_trait]
impl VehicleLink for UdpSocket {
    async fn send(&mut self, datagram: &[u8]) -> std::io::Result<()> {
        UdpSocket::send(self, datagram).await.map(|_| ())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Handle returned by [`Vehicle::add_message_listener`], used to remove the
/// listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&Telemetry) + Send>;

// ---------------------------------------------------------------------------
// Vehicle
// ---------------------------------------------------------------------------

/// Connected ground-control client handle.
pub struct Vehicle {
    link: Option<Box<dyn VehicleLink>>,
    state: VehicleState,
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
    next_listener_id: u64,
}

impl Vehicle {
    /// Connect to a simulator listening on `addr`.
    ///
    /// Binds an ephemeral UDP socket, sends a heartbeat so the simulator
    /// learns the return address (the harness is the active sender), and
    /// waits up to 5 seconds for the first autopilot heartbeat.
    ///
    /// # Errors
    ///
    /// - [`VehicleError::ConnectFailed`] if no heartbeat arrives in time
    /// - [`VehicleError::Io`] if the socket cannot be created or used
    pub async fn connect(addr: SocketAddr) -> Result<Self, VehicleError> {
        debug!(%addr, "connecting ground-control link");

        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        socket.connect(addr).await?;

        let mut vehicle = Self::from_link(Box::new(socket));
        vehicle.send(&Command::Heartbeat).await?;

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        while vehicle.state.mode.is_none() {
            match vehicle.recv_message(deadline).await {
                Ok(_) => {}
                Err(VehicleError::Timeout) => {
                    return Err(VehicleError::ConnectFailed(CONNECT_TIMEOUT));
                }
                Err(e) => return Err(e),
            }
        }

        debug!("autopilot heartbeat received");
        Ok(vehicle)
    }

    /// Create a client over a pre-connected link (e.g. an in-memory pair).
    ///
    /// The attribute cache starts empty; no handshake is performed.
    pub fn from_link(link: Box<dyn VehicleLink>) -> Self {
        Self {
            link: Some(link),
            state: VehicleState::default(),
            listeners: HashMap::new(),
            next_listener_id: 0,
        }
    }

    /// Close the link. Further operations return
    /// [`VehicleError::NotConnected`].
    pub fn close(&mut self) {
        self.link.take();
    }

    /// Returns `true` while the link is open.
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    // -----------------------------------------------------------------------
    // Attribute access
    // -----------------------------------------------------------------------

    /// Whether the vehicle is armed (from the latest heartbeat).
    pub fn armed(&self) -> bool {
        self.state.armed
    }

    /// The current flight mode, if a heartbeat has been seen.
    pub fn mode(&self) -> Option<VehicleMode> {
        self.state.mode.clone()
    }

    /// The overall system status, if reported yet.
    pub fn system_status(&self) -> Option<SystemStatus> {
        self.state.system_status.clone()
    }

    /// Battery level percentage, if reported yet.
    pub fn battery_level(&self) -> Option<u8> {
        self.state.battery_level
    }

    /// The home position, if known.
    pub fn home_location(&self) -> Option<LocationGlobal> {
        self.state.home_location
    }

    /// The local position estimate, if reported yet.
    pub fn local_position(&self) -> Option<LocalPosition> {
        self.state.local_position
    }

    /// Snapshot of the full attribute cache.
    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Arm the vehicle and wait for the acknowledgement.
    pub async fn arm(&mut self) -> Result<(), VehicleError> {
        self.command(Command::Arm { arm: true }, command_id::ARM_DISARM)
            .await
    }

    /// Disarm the vehicle and wait for the acknowledgement.
    pub async fn disarm(&mut self) -> Result<(), VehicleError> {
        self.command(Command::Arm { arm: false }, command_id::ARM_DISARM)
            .await
    }

    /// Switch to the named flight mode and wait for the acknowledgement.
    ///
    /// The mode attribute updates from the telemetry stream; use
    /// [`wait_for_mode`](Self::wait_for_mode) to block until the switch is
    /// reflected.
    pub async fn set_mode(&mut self, mode: &str) -> Result<(), VehicleError> {
        self.command(
            Command::SetMode {
                mode: mode.to_string(),
            },
            command_id::SET_MODE,
        )
        .await
    }

    /// Pump telemetry until the vehicle reports the named mode.
    pub async fn wait_for_mode(&mut self, mode: &str, timeout: Duration) -> Result<(), VehicleError> {
        let deadline = Instant::now() + timeout;
        while self.state.mode.as_ref().map(VehicleMode::as_str) != Some(mode) {
            self.recv_message(deadline).await?;
        }
        Ok(())
    }

    /// Set the home position and wait for the acknowledgement.
    pub async fn set_home_location(
        &mut self,
        location: LocationGlobal,
    ) -> Result<(), VehicleError> {
        self.command(
            Command::SetHome {
                lat: location.lat,
                lon: location.lon,
                alt: location.alt,
            },
            command_id::SET_HOME,
        )
        .await
    }

    /// Ask the autopilot for its current home position and wait for the
    /// answer.
    pub async fn request_home(&mut self, timeout: Duration) -> Result<LocationGlobal, VehicleError> {
        self.send(&Command::RequestHome).await?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Telemetry::HomePosition { lat, lon, alt } = self.recv_message(deadline).await? {
                return Ok(LocationGlobal { lat, lon, alt });
            }
        }
    }

    /// Reboot the autopilot and wait for the acknowledgement.
    pub async fn reboot(&mut self) -> Result<(), VehicleError> {
        self.command(Command::Reboot, command_id::REBOOT_SHUTDOWN)
            .await
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// Pump telemetry until the named subsystem has reported at least once.
    ///
    /// Known subsystems: `mode`, `system_status`, `battery`, `home_location`,
    /// `local_position`.
    pub async fn wait_ready(&mut self, subsystem: &str, timeout: Duration) -> Result<(), VehicleError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.subsystem_ready(subsystem)? {
                return Ok(());
            }
            self.recv_message(deadline).await?;
        }
    }

    fn subsystem_ready(&self, subsystem: &str) -> Result<bool, VehicleError> {
        match subsystem {
            "mode" => Ok(self.state.mode.is_some()),
            "system_status" => Ok(self.state.system_status.is_some()),
            "battery" => Ok(self.state.battery_level.is_some()),
            "home_location" => Ok(self.state.home_location.is_some()),
            "local_position" => Ok(self.state.local_position.is_some()),
            other => Err(VehicleError::UnknownSubsystem(other.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Register a listener for the named telemetry message (e.g.
    /// `"COMMAND_ACK"`). The listener fires for every matching message the
    /// client consumes, including acks consumed by command methods.
    pub fn add_message_listener<F>(&mut self, name: &str, listener: F) -> ListenerId
    where
        F: FnMut(&Telemetry) + Send + 'static,
    {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners
            .entry(name.to_string())
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    /// Remove a previously registered listener. Returns `true` if it was
    /// still registered.
    pub fn remove_message_listener(&mut self, name: &str, id: ListenerId) -> bool {
        match self.listeners.get_mut(name) {
            Some(listeners) => {
                let before = listeners.len();
                listeners.retain(|(listener_id, _)| *listener_id != id);
                listeners.len() < before
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Internal pump
    // -----------------------------------------------------------------------

    /// Send a command and pump telemetry until its acknowledgement.
    async fn command(&mut self, command: Command, id: u16) -> Result<(), VehicleError> {
        self.send(&command).await?;
        let deadline = Instant::now() + ACK_TIMEOUT;
        loop {
            if let Telemetry::CommandAck {
                command: acked,
                result,
            } = self.recv_message(deadline).await?
            {
                if acked == id {
                    if result == proto::ACK_ACCEPTED {
                        return Ok(());
                    }
                    return Err(VehicleError::Rejected {
                        command: acked,
                        result,
                    });
                }
            }
        }
    }

    async fn send(&mut self, command: &Command) -> Result<(), VehicleError> {
        let link = self.link.as_mut().ok_or(VehicleError::NotConnected)?;
        trace!(command = command.name(), "sending command");
        link.send(&proto::encode_command(command)).await?;
        Ok(())
    }

    /// Receive, apply, and dispatch the next telemetry message, bounded by
    /// `deadline`. Undecodable datagrams are discarded.
    async fn recv_message(&mut self, deadline: Instant) -> Result<Telemetry, VehicleError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let len = {
                let link = self.link.as_mut().ok_or(VehicleError::NotConnected)?;
                match tokio::time::timeout_at(deadline, link.recv(&mut buf)).await {
                    Err(_) => return Err(VehicleError::Timeout),
                    Ok(Err(e)) => return Err(VehicleError::Io(e)),
                    Ok(Ok(len)) => len,
                }
            };

            match proto::decode_telemetry(&buf[..len]) {
                Ok(message) => {
                    trace!(message = message.name(), "received telemetry");
                    self.apply(&message);
                    self.dispatch(&message);
                    return Ok(message);
                }
                Err(e) => {
                    warn!(error = %e, "discarding undecodable datagram");
                }
            }
        }
    }

    fn apply(&mut self, message: &Telemetry) {
        match message {
            Telemetry::Heartbeat { armed, mode } => {
                self.state.armed = *armed;
                self.state.mode = Some(VehicleMode(mode.clone()));
            }
            Telemetry::SysStatus {
                status,
                battery_level,
            } => {
                self.state.system_status = Some(SystemStatus(status.clone()));
                self.state.battery_level = Some(*battery_level);
            }
            Telemetry::HomePosition { lat, lon, alt } => {
                self.state.home_location = Some(LocationGlobal {
                    lat: *lat,
                    lon: *lon,
                    alt: *alt,
                });
            }
            Telemetry::LocalPosition { north, east, down } => {
                self.state.local_position = Some(LocalPosition {
                    north: *north,
                    east: *east,
                    down: *down,
                });
            }
            Telemetry::StatusText { text } => {
                debug!(%text, "autopilot status");
            }
            Telemetry::CommandAck { .. } => {}
        }
    }

    fn dispatch(&mut self, message: &Telemetry) {
        if let Some(listeners) = self.listeners.get_mut(message.name()) {
            for (_, listener) in listeners.iter_mut() {
                listener(message);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
