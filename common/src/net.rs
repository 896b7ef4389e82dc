//! UDP socket construction.
//!
//! All sockets are built with `socket2` so they can carry `SO_REUSEADDR`
//! and multicast options before bind, then handed to tokio.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

/// True for 224.0.0.0 through 239.255.255.255.
pub fn is_multicast(ip: Ipv4Addr) -> bool {
    // ---
    (224..=239).contains(&ip.octets()[0])
}

/// Binds a non-blocking, address-reusable UDP socket on `INADDR_ANY:port`.
///
/// # Errors
///
/// Returns error if socket creation, option setup or bind fails.
pub fn bind_reusable(port: u16) -> Result<UdpSocket> {
    // ---
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create UDP socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    socket
        .set_nonblocking(true)
        .context("failed to set non-blocking mode")?;

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind UDP socket to {}", addr))?;

    let socket = UdpSocket::from_std(socket.into()).context("failed to register socket")?;
    debug!("UDP socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

/// Binds on `INADDR_ANY:port` and joins `group` on the default interface.
///
/// # Errors
///
/// Returns error if bind or `IP_ADD_MEMBERSHIP` fails.
pub fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    // ---
    let socket = bind_reusable(port)?;
    socket
        .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
        .with_context(|| format!("failed to join multicast group {}", group))?;
    debug!("Joined multicast group {} on port {}", group, port);
    Ok(socket)
}

/// Creates an ephemeral send socket with the given multicast TTL.
///
/// # Errors
///
/// Returns error if socket creation or option setup fails.
pub fn bind_sender(ttl: u32) -> Result<UdpSocket> {
    // ---
    let socket = bind_reusable(0)?;
    socket
        .set_multicast_ttl_v4(ttl)
        .context("failed to set IP_MULTICAST_TTL")?;
    socket
        .set_multicast_loop_v4(true)
        .context("failed to set IP_MULTICAST_LOOP")?;
    Ok(socket)
}

/// Leaves a multicast group, ignoring "not a member" errors.
pub fn leave_multicast(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<()> {
    // ---
    match socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
        Err(e) if e.kind() == io::ErrorKind::AddrNotAvailable => Ok(()),
        other => other,
    }
}
