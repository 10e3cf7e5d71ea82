//! Host network identity.

use std::net::{IpAddr, UdpSocket};

use crate::errors::{InstallerError, InstallerResult};

/// IP of the interface that carries the default route.
///
/// Connecting a UDP socket does not send traffic; it only asks the kernel
/// which local address would be used to reach the target.
pub fn primary_interface_ip() -> InstallerResult<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80").map_err(|e| {
        InstallerError::Config(format!("cannot determine primary interface ip: {e}"))
    })?;
    Ok(socket.local_addr()?.ip())
}
