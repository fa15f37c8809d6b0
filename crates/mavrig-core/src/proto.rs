//! Datagram wire messages for the ground-control link.
//!
//! This module defines the compact binary messages exchanged between the
//! harness (acting as a ground-control station) and the simulated autopilot
//! over UDP. One datagram carries exactly one message, so no length framing is
//! needed; every message starts with a single opcode byte followed by
//! little-endian fields.
//!
//! # String Encoding
//!
//! Strings are length-prefixed: a `u32` LE byte count followed by UTF-8 bytes.
//!
//! # Command acknowledgements
//!
//! State-changing commands are acknowledged with [`Telemetry::CommandAck`]
//! carrying the numeric id of the acknowledged command (see [`command_id`])
//! and a result byte (`0` = accepted).
//!
//! # Example
//!
//! ```
//! use mavrig_core::proto::{encode_command, decode_command, Command};
//!
//! let cmd = Command::Arm { arm: true };
//! let wire = encode_command(&cmd);
//! assert_eq!(decode_command(&wire).unwrap(), cmd);
//! ```

use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during message encoding or decoding.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// The opcode byte does not correspond to any known message.
    #[error("invalid opcode: 0x{0:02X}")]
    InvalidOpCode(u8),

    /// The datagram does not contain enough bytes for the expected fields.
    #[error("insufficient data in datagram")]
    InsufficientData,

    /// A string field contains invalid UTF-8.
    #[error("invalid UTF-8 in string field")]
    Utf8Error,
}

// ---------------------------------------------------------------------------
// Command ids and ack results
// ---------------------------------------------------------------------------

/// Numeric command ids carried in [`Telemetry::CommandAck`].
///
/// These match the autopilot's command set so callers can filter acks the same
/// way they would against a real vehicle.
pub mod command_id {
    /// Component arm/disarm.
    pub const ARM_DISARM: u16 = 400;
    /// Flight-mode change.
    pub const SET_MODE: u16 = 176;
    /// Set the home position.
    pub const SET_HOME: u16 = 179;
    /// Autopilot reboot/shutdown.
    pub const REBOOT_SHUTDOWN: u16 = 246;
}

/// Ack result: the command was accepted and executed.
pub const ACK_ACCEPTED: u8 = 0;

/// Ack result: the command was rejected or failed to execute.
pub const ACK_FAILED: u8 = 4;

// ---------------------------------------------------------------------------
// OpCode
// ---------------------------------------------------------------------------

/// On-the-wire opcodes.
///
/// Ground-control messages occupy the low range, autopilot messages the high
/// range, so a misdirected datagram decodes to an error instead of a
/// plausible-but-wrong message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Ground-control keep-alive; also opens the return path for telemetry.
    GcsHeartbeat = 0x01,
    /// Arm or disarm the vehicle (bool).
    Arm = 0x02,
    /// Switch flight mode (length-prefixed mode name).
    SetMode = 0x03,
    /// Set the home position (f64 lat, lon, alt).
    SetHome = 0x04,
    /// Ask the autopilot to send its current home position (no payload).
    RequestHome = 0x05,
    /// Reboot the autopilot (no payload).
    Reboot = 0x06,

    /// Autopilot heartbeat (bool armed + mode name).
    ApHeartbeat = 0x81,
    /// Command acknowledgement (u16 command id + u8 result).
    CommandAck = 0x82,
    /// Current home position (f64 lat, lon, alt).
    HomePosition = 0x83,
    /// System status name + battery level percentage.
    SysStatus = 0x84,
    /// Local NED position estimate (f32 north, east, down).
    LocalPosition = 0x85,
    /// Free-form status text from the autopilot.
    StatusText = 0x86,
}

impl OpCode {
    /// Try to convert a raw byte into an `OpCode`.
    pub fn from_u8(byte: u8) -> Result<Self, ProtoError> {
        match byte {
            0x01 => Ok(OpCode::GcsHeartbeat),
            0x02 => Ok(OpCode::Arm),
            0x03 => Ok(OpCode::SetMode),
            0x04 => Ok(OpCode::SetHome),
            0x05 => Ok(OpCode::RequestHome),
            0x06 => Ok(OpCode::Reboot),
            0x81 => Ok(OpCode::ApHeartbeat),
            0x82 => Ok(OpCode::CommandAck),
            0x83 => Ok(OpCode::HomePosition),
            0x84 => Ok(OpCode::SysStatus),
            0x85 => Ok(OpCode::LocalPosition),
            0x86 => Ok(OpCode::StatusText),
            other => Err(ProtoError::InvalidOpCode(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Command / Telemetry enums
// ---------------------------------------------------------------------------

/// A message sent by the ground-control client to the autopilot.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Keep-alive; the first one a client sends teaches the autopilot where
    /// to direct telemetry.
    Heartbeat,
    /// Arm (`true`) or disarm (`false`) the vehicle.
    Arm { arm: bool },
    /// Switch to the named flight mode.
    SetMode { mode: String },
    /// Set the home position.
    SetHome { lat: f64, lon: f64, alt: f64 },
    /// Request the current home position.
    RequestHome,
    /// Reboot the autopilot.
    Reboot,
}

impl Command {
    /// Short static name for tracing span metadata.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Heartbeat => "heartbeat",
            Command::Arm { .. } => "arm",
            Command::SetMode { .. } => "set_mode",
            Command::SetHome { .. } => "set_home",
            Command::RequestHome => "request_home",
            Command::Reboot => "reboot",
        }
    }
}

/// A message sent by the autopilot to the ground-control client.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    /// Periodic vehicle heartbeat with the armed flag and current mode.
    Heartbeat { armed: bool, mode: String },
    /// Acknowledgement for a state-changing command.
    CommandAck { command: u16, result: u8 },
    /// The current home position.
    HomePosition { lat: f64, lon: f64, alt: f64 },
    /// Overall system status plus battery level percentage.
    SysStatus { status: String, battery_level: u8 },
    /// Local NED position estimate.
    LocalPosition { north: f32, east: f32, down: f32 },
    /// Free-form status text.
    StatusText { text: String },
}

impl Telemetry {
    /// Upper-snake message name, used as the listener registry key.
    pub fn name(&self) -> &'static str {
        match self {
            Telemetry::Heartbeat { .. } => "HEARTBEAT",
            Telemetry::CommandAck { .. } => "COMMAND_ACK",
            Telemetry::HomePosition { .. } => "HOME_POSITION",
            Telemetry::SysStatus { .. } => "SYS_STATUS",
            Telemetry::LocalPosition { .. } => "LOCAL_POSITION",
            Telemetry::StatusText { .. } => "STATUSTEXT",
        }
    }
}

// ---------------------------------------------------------------------------
// Low-level payload helpers
// ---------------------------------------------------------------------------

/// Write a length-prefixed UTF-8 string into `buf`.
///
/// Format: `[u32 LE byte_count] [UTF-8 bytes]`
fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Write a bool as a single `u8` (0 = false, 1 = true).
fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(if v { 1u8 } else { 0u8 });
}

/// A cursor over a byte slice for sequential reads.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8, ProtoError> {
        if self.remaining() < 1 {
            return Err(ProtoError::InsufficientData);
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_bool(&mut self) -> Result<bool, ProtoError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u16(&mut self) -> Result<u16, ProtoError> {
        if self.remaining() < 2 {
            return Err(ProtoError::InsufficientData);
        }
        let bytes: [u8; 2] = self.data[self.pos..self.pos + 2]
            .try_into()
            .map_err(|_| ProtoError::InsufficientData)?;
        self.pos += 2;
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_u32(&mut self) -> Result<u32, ProtoError> {
        if self.remaining() < 4 {
            return Err(ProtoError::InsufficientData);
        }
        let bytes: [u8; 4] = self.data[self.pos..self.pos + 4]
            .try_into()
            .map_err(|_| ProtoError::InsufficientData)?;
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_f32(&mut self) -> Result<f32, ProtoError> {
        if self.remaining() < 4 {
            return Err(ProtoError::InsufficientData);
        }
        let bytes: [u8; 4] = self.data[self.pos..self.pos + 4]
            .try_into()
            .map_err(|_| ProtoError::InsufficientData)?;
        self.pos += 4;
        Ok(f32::from_le_bytes(bytes))
    }

    fn read_f64(&mut self) -> Result<f64, ProtoError> {
        if self.remaining() < 8 {
            return Err(ProtoError::InsufficientData);
        }
        let bytes: [u8; 8] = self.data[self.pos..self.pos + 8]
            .try_into()
            .map_err(|_| ProtoError::InsufficientData)?;
        self.pos += 8;
        Ok(f64::from_le_bytes(bytes))
    }

    /// Read a length-prefixed UTF-8 string.
    fn read_string(&mut self) -> Result<String, ProtoError> {
        let len = self.read_u32()? as usize;
        if self.remaining() < len {
            return Err(ProtoError::InsufficientData);
        }
        let s = std::str::from_utf8(&self.data[self.pos..self.pos + len])
            .map_err(|_| ProtoError::Utf8Error)?;
        self.pos += len;
        Ok(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Encode / decode: Command
// ---------------------------------------------------------------------------

/// Encode a [`Command`] into a datagram.
pub fn encode_command(command: &Command) -> Vec<u8> {
    let mut buf = Vec::new();

    match command {
        Command::Heartbeat => {
            buf.push(OpCode::GcsHeartbeat as u8);
        }
        Command::Arm { arm } => {
            buf.push(OpCode::Arm as u8);
            write_bool(&mut buf, *arm);
        }
        Command::SetMode { mode } => {
            buf.push(OpCode::SetMode as u8);
            write_string(&mut buf, mode);
        }
        Command::SetHome { lat, lon, alt } => {
            buf.push(OpCode::SetHome as u8);
            buf.extend_from_slice(&lat.to_le_bytes());
            buf.extend_from_slice(&lon.to_le_bytes());
            buf.extend_from_slice(&alt.to_le_bytes());
        }
        Command::RequestHome => {
            buf.push(OpCode::RequestHome as u8);
        }
        Command::Reboot => {
            buf.push(OpCode::Reboot as u8);
        }
    }

    buf
}

/// Decode a datagram into a [`Command`].
pub fn decode_command(data: &[u8]) -> Result<Command, ProtoError> {
    let mut cur = Cursor::new(data);
    let opcode = OpCode::from_u8(cur.read_u8()?)?;

    match opcode {
        OpCode::GcsHeartbeat => Ok(Command::Heartbeat),

        OpCode::Arm => {
            let arm = cur.read_bool()?;
            Ok(Command::Arm { arm })
        }

        OpCode::SetMode => {
            let mode = cur.read_string()?;
            Ok(Command::SetMode { mode })
        }

        OpCode::SetHome => {
            let lat = cur.read_f64()?;
            let lon = cur.read_f64()?;
            let alt = cur.read_f64()?;
            Ok(Command::SetHome { lat, lon, alt })
        }

        OpCode::RequestHome => Ok(Command::RequestHome),

        OpCode::Reboot => Ok(Command::Reboot),

        other => Err(ProtoError::InvalidOpCode(other as u8)),
    }
}

// ---------------------------------------------------------------------------
// Encode / decode: Telemetry
// ---------------------------------------------------------------------------

/// Encode a [`Telemetry`] message into a datagram.
pub fn encode_telemetry(message: &Telemetry) -> Vec<u8> {
    let mut buf = Vec::new();

    match message {
        Telemetry::Heartbeat { armed, mode } => {
            buf.push(OpCode::ApHeartbeat as u8);
            write_bool(&mut buf, *armed);
            write_string(&mut buf, mode);
        }
        Telemetry::CommandAck { command, result } => {
            buf.push(OpCode::CommandAck as u8);
            buf.extend_from_slice(&command.to_le_bytes());
            buf.push(*result);
        }
        Telemetry::HomePosition { lat, lon, alt } => {
            buf.push(OpCode::HomePosition as u8);
            buf.extend_from_slice(&lat.to_le_bytes());
            buf.extend_from_slice(&lon.to_le_bytes());
            buf.extend_from_slice(&alt.to_le_bytes());
        }
        Telemetry::SysStatus {
            status,
            battery_level,
        } => {
            buf.push(OpCode::SysStatus as u8);
            write_string(&mut buf, status);
            buf.push(*battery_level);
        }
        Telemetry::LocalPosition { north, east, down } => {
            buf.push(OpCode::LocalPosition as u8);
            buf.extend_from_slice(&north.to_le_bytes());
            buf.extend_from_slice(&east.to_le_bytes());
            buf.extend_from_slice(&down.to_le_bytes());
        }
        Telemetry::StatusText { text } => {
            buf.push(OpCode::StatusText as u8);
            write_string(&mut buf, text);
        }
    }

    buf
}

/// Decode a datagram into a [`Telemetry`] message.
pub fn decode_telemetry(data: &[u8]) -> Result<Telemetry, ProtoError> {
    let mut cur = Cursor::new(data);
    let opcode = OpCode::from_u8(cur.read_u8()?)?;

    match opcode {
        OpCode::ApHeartbeat => {
            let armed = cur.read_bool()?;
            let mode = cur.read_string()?;
            Ok(Telemetry::Heartbeat { armed, mode })
        }

        OpCode::CommandAck => {
            let command = cur.read_u16()?;
            let result = cur.read_u8()?;
            Ok(Telemetry::CommandAck { command, result })
        }

        OpCode::HomePosition => {
            let lat = cur.read_f64()?;
            let lon = cur.read_f64()?;
            let alt = cur.read_f64()?;
            Ok(Telemetry::HomePosition { lat, lon, alt })
        }

        OpCode::SysStatus => {
            let status = cur.read_string()?;
            let battery_level = cur.read_u8()?;
            Ok(Telemetry::SysStatus {
                status,
                battery_level,
            })
        }

        OpCode::LocalPosition => {
            let north = cur.read_f32()?;
            let east = cur.read_f32()?;
            let down = cur.read_f32()?;
            Ok(Telemetry::LocalPosition { north, east, down })
        }

        OpCode::StatusText => {
            let text = cur.read_string()?;
            Ok(Telemetry::StatusText { text })
        }

        other => Err(ProtoError::InvalidOpCode(other as u8)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
