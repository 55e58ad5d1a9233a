//! The datagram socket a tunnel attempt talks to the server through.

use crate::error::{VpnError, VpnResult};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Non-blocking, connected datagram endpoint.
///
/// Both calls return immediately. `recv_datagram` returns `Ok(0)` when no
/// datagram is pending, `send_datagram` returns `Ok(0)` when the socket
/// buffer is full and the datagram was not queued.
pub trait DatagramSocket: Send + Sync {
    fn send_datagram(&self, buf: &[u8]) -> io::Result<usize>;

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl DatagramSocket for UdpSocket {
    fn send_datagram(&self, buf: &[u8]) -> io::Result<usize> {
        match self.try_send(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.try_recv(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }
}

/// Open an unconnected UDP socket in the server's address family.
///
/// Failure is reported as [`VpnError::SocketUnavailable`].
pub async fn open_tunnel_socket(server: SocketAddr) -> VpnResult<UdpSocket> {
    let local: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    UdpSocket::bind(local).await.map_err(|e| {
        VpnError::socket_unavailable_with_source(format!("Failed to bind tunnel socket {}", local), e)
    })
}

/// Connect a protected socket to the server and wait until it is writable,
/// so the first non-blocking sends are not dropped.
pub async fn connect_tunnel_socket(socket: &UdpSocket, server: SocketAddr) -> VpnResult<()> {
    socket.connect(server).await.map_err(|e| {
        VpnError::socket_unavailable_with_source(format!("Failed to connect to {}", server), e)
    })?;
    socket.writable().await.map_err(|e| {
        VpnError::socket_unavailable_with_source("Tunnel socket never became writable", e)
    })
}
