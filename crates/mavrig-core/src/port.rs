//! Ephemeral UDP port allocation for concurrent simulator instances.
//!
//! Each test run binds its simulator to a port the operating system considers
//! free at allocation time, so parallel runs on one machine do not collide.
//!
//! The allocated port is released before the simulator rebinds it, which
//! leaves a small time-of-check/time-of-use window. Another process could
//! claim the port in that window; the race is accepted because the window is
//! short and collisions are rare in test environments.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

/// Errors that can occur while reserving a port.
#[derive(Error, Debug)]
pub enum AllocationError {
    /// The operating system refused the probe socket (e.g. port exhaustion).
    #[error("failed to reserve an ephemeral UDP port: {0}")]
    Io(#[from] std::io::Error),
}

/// Reserve an ephemeral UDP port and return its number.
///
/// Binds a transient datagram socket to port 0 on the loopback interface,
/// reads back the port the OS assigned, and closes the socket. The port is
/// free for immediate reuse by the simulator's own socket.
///
/// # Errors
///
/// [`AllocationError::Io`] if the probe socket cannot be created or bound.
/// Allocation is not retried; OS-level failure is fatal to the caller.
pub fn allocate_udp_port() -> Result<u16, AllocationError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    let bind_addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    socket.bind(&bind_addr.into())?;

    let port = socket
        .local_addr()?
        .as_socket()
        .map(|addr| addr.port())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "probe socket has no inet address",
            )
        })?;

    // Dropping the socket releases the port for the simulator to rebind.
    drop(socket);
    Ok(port)
}
