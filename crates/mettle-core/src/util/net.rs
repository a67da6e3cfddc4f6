//! Local network address discovery.

use std::io;
use std::net::{IpAddr, UdpSocket};

/// Probe address used to pick the outbound interface. Nothing is sent.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Returns the IP address of the interface used for outbound traffic.
///
/// Connecting a UDP socket only selects a route; no packet leaves the host.
pub fn external_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(PROBE_ADDR)?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no routable interface address (got {ip})"),
        ));
    }
    Ok(ip)
}
