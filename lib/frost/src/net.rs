//! Socket-opening helpers shared by the server and the toy clients.

use std::io;
use std::net::{TcpListener, UdpSocket};

/// Opens the server listening socket. A dual-stack IPv6 bind is attempted
/// first so both address families are accepted on hosts that support it;
/// IPv4-only hosts fall back to an IPv4 bind.
pub fn listen(port: u16) -> io::Result<TcpListener> {
    match TcpListener::bind(("::", port)) {
        Ok(listener) => Ok(listener),
        Err(_) => TcpListener::bind(("0.0.0.0", port)),
    }
}

/// Binds the UDP socket a listener process receives a station stream on.
pub fn udp_listener(port: u16) -> io::Result<UdpSocket> {
    match UdpSocket::bind(("::", port)) {
        Ok(socket) => Ok(socket),
        Err(_) => UdpSocket::bind(("0.0.0.0", port)),
    }
}

/// Binds the pair of sending sockets a station broadcasts from, one per
/// address family. Both use ephemeral ports; the destination decides which
/// of the two carries a given chunk.
pub fn udp_sender_pair() -> io::Result<(UdpSocket, UdpSocket)> {
    let v4 = UdpSocket::bind(("0.0.0.0", 0))?;
    let v6 = UdpSocket::bind(("::", 0))?;
    Ok((v4, v6))
}
