//! In-process fake autopilot for protocol testing without Docker.
//!
//! [`StubAutopilot`] is a pure state machine over the wire messages: it arms
//! and disarms, tracks the flight mode, stores the home position, and
//! acknowledges every command. [`serve`](StubAutopilot::serve) binds it to a
//! UDP socket so it can stand in for the simulator container; the `sitl-stub`
//! binary wraps that loop with readiness-marker output for end-to-end harness
//! tests.
//!
//! State-changing commands push the updated telemetry *before* the
//! acknowledgement, so a client that pumps messages until the ack always
//! observes the new state by the time the command returns.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::proto::{self, command_id, Command, Telemetry, ACK_ACCEPTED};

/// Interval between unsolicited telemetry pushes.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Ticks before the stub reports a home position on its own (a stand-in for
/// the position fix a real autopilot needs before home is valid).
const HOME_LOCK_TICKS: u32 = 3;

/// Home position reported once the simulated fix is acquired.
const DEFAULT_HOME: (f64, f64, f64) = (47.397742, 8.545594, 488.0);

/// Minimal autopilot behavior behind the ground-control link.
pub struct StubAutopilot {
    armed: bool,
    mode: String,
    system_status: String,
    battery_level: u8,
    home: Option<(f64, f64, f64)>,
    ticks: u32,
}

impl StubAutopilot {
    /// Create a disarmed vehicle in `MANUAL` mode with a full battery.
    pub fn new() -> Self {
        Self {
            armed: false,
            mode: "MANUAL".to_string(),
            system_status: "STANDBY".to_string(),
            battery_level: 100,
            home: None,
            ticks: 0,
        }
    }

    fn heartbeat(&self) -> Telemetry {
        Telemetry::Heartbeat {
            armed: self.armed,
            mode: self.mode.clone(),
        }
    }

    fn home_position(&self) -> Option<Telemetry> {
        self.home.map(|(lat, lon, alt)| Telemetry::HomePosition { lat, lon, alt })
    }

    /// React to one ground-control command.
    ///
    /// Returns the telemetry to send back, state updates first, the
    /// acknowledgement last.
    pub fn handle(&mut self, command: &Command) -> Vec<Telemetry> {
        match command {
            Command::Heartbeat => vec![self.heartbeat()],

            Command::Arm { arm } => {
                self.armed = *arm;
                vec![self.heartbeat(), ack(command_id::ARM_DISARM)]
            }

            Command::SetMode { mode } => {
                self.mode = mode.clone();
                vec![self.heartbeat(), ack(command_id::SET_MODE)]
            }

            Command::SetHome { lat, lon, alt } => {
                self.home = Some((*lat, *lon, *alt));
                let mut out = Vec::new();
                out.extend(self.home_position());
                out.push(ack(command_id::SET_HOME));
                out
            }

            Command::RequestHome => self.home_position().into_iter().collect(),

            Command::Reboot => {
                // A rebooting autopilot comes back disarmed.
                self.armed = false;
                vec![ack(command_id::REBOOT_SHUTDOWN)]
            }
        }
    }

    /// Produce one round of unsolicited telemetry.
    pub fn tick(&mut self) -> Vec<Telemetry> {
        self.ticks += 1;
        if self.home.is_none() && self.ticks >= HOME_LOCK_TICKS {
            self.home = Some(DEFAULT_HOME);
        }

        let mut out = vec![
            self.heartbeat(),
            Telemetry::SysStatus {
                status: self.system_status.clone(),
                battery_level: self.battery_level,
            },
            Telemetry::LocalPosition {
                north: 0.0,
                east: 0.0,
                down: 0.0,
            },
        ];
        out.extend(self.home_position());
        out
    }

    /// Serve the stub on a bound UDP socket until `shutdown` is cancelled.
    ///
    /// Telemetry is directed at whichever peer sent the most recent datagram;
    /// nothing is pushed until a client has made contact.
    pub async fn serve(
        mut self,
        socket: UdpSocket,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let mut peer: Option<SocketAddr> = None;
        let mut buf = [0u8; 512];
        let mut interval = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("stub autopilot shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    if let Some(addr) = peer {
                        for message in self.tick() {
                            socket.send_to(&proto::encode_telemetry(&message), addr).await?;
                        }
                    }
                }

                received = socket.recv_from(&mut buf) => {
                    let (len, addr) = received?;
                    peer = Some(addr);
                    match proto::decode_command(&buf[..len]) {
                        Ok(command) => {
                            trace!(command = command.name(), "stub handling command");
                            for message in self.handle(&command) {
                                socket.send_to(&proto::encode_telemetry(&message), addr).await?;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "stub discarding undecodable datagram");
                        }
                    }
                }
            }
        }
    }
}

impl Default for StubAutopilot {
    fn default() -> Self {
        Self::new()
    }
}

fn ack(command: u16) -> Telemetry {
    Telemetry::CommandAck {
        command,
        result: ACK_ACCEPTED,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_pushes_state_before_the_ack() {
        let mut autopilot = StubAutopilot::new();
        let out = autopilot.handle(&Command::Arm { arm: true });

        assert_eq!(out.len(), 2);
        assert!(matches!(
            out[0],
            Telemetry::Heartbeat { armed: true, .. }
        ));
        assert_eq!(
            out[1],
            Telemetry::CommandAck {
                command: command_id::ARM_DISARM,
                result: ACK_ACCEPTED,
            }
        );
    }

    #[test]
    fn set_home_is_returned_by_request_home() {
        let mut autopilot = StubAutopilot::new();
        autopilot.handle(&Command::SetHome {
            lat: -35.0,
            lon: 149.0,
            alt: 600.0,
        });

        let out = autopilot.handle(&Command::RequestHome);
        assert_eq!(
            out,
            vec![Telemetry::HomePosition {
                lat: -35.0,
                lon: 149.0,
                alt: 600.0,
            }]
        );
    }

    #[test]
    fn request_home_before_lock_returns_nothing() {
        let mut autopilot = StubAutopilot::new();
        assert!(autopilot.handle(&Command::RequestHome).is_empty());
    }

    #[test]
    fn reboot_disarms_and_acks() {
        let mut autopilot = StubAutopilot::new();
        autopilot.handle(&Command::Arm { arm: true });

        let out = autopilot.handle(&Command::Reboot);
        assert_eq!(
            out,
            vec![Telemetry::CommandAck {
                command: command_id::REBOOT_SHUTDOWN,
                result: ACK_ACCEPTED,
            }]
        );
        assert!(matches!(
            autopilot.handle(&Command::Heartbeat)[0],
            Telemetry::Heartbeat { armed: false, .. }
        ));
    }

    #[test]
    fn home_appears_after_simulated_fix() {
        let mut autopilot = StubAutopilot::new();

        for _ in 0..HOME_LOCK_TICKS {
            autopilot.tick();
        }

        let has_home = autopilot
            .tick()
            .iter()
            .any(|m| matches!(m, Telemetry::HomePosition { .. }));
        assert!(has_home);
    }

    #[test]
    fn tick_reports_status_and_battery() {
        let mut autopilot = StubAutopilot::new();
        let out = autopilot.tick();

        assert!(out.iter().any(|m| matches!(
            m,
            Telemetry::SysStatus { status, battery_level: 100 } if status == "STANDBY"
        )));
        assert!(out
            .iter()
            .any(|m| matches!(m, Telemetry::LocalPosition { .. })));
    }
}
