//! Packet relay between the virtual interface and the tunnel socket.
//!
//! One tick polls both endpoints without blocking:
//!
//! - interface -> socket: the IP packet goes out untagged.
//! - socket -> interface: a datagram with a non-zero first byte is written
//!   to the interface as received, tag byte included. Zero-tagged datagrams
//!   are control echoes and are dropped.
//!
//! A tick that moved nothing sleeps 100 ms and then checks liveness: after
//! 15 s without outbound traffic three one-byte keepalives go out, after
//! 20 s without inbound traffic the tunnel is declared dead.

use crate::device::InterfaceDescriptor;
use crate::error::{VpnError, VpnResult};
use crate::handshake::{CONTROL_TAG, REDUNDANT_SENDS};
use crate::socket::DatagramSocket;
use crate::supervisor::sleep_or_cancel;
use std::convert::Infallible;
use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receive buffer size; large enough for any IP packet the interface hands us.
pub const MAX_PACKET_SIZE: usize = i16::MAX as usize;

/// Liveness timing for the relay loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderTimings {
    /// Outbound silence after which keepalives are sent.
    pub keepalive_interval: Duration,
    /// Inbound silence after which the tunnel is considered dead.
    pub receive_timeout: Duration,
    /// Sleep after a tick that moved no packets.
    pub idle_interval: Duration,
}

impl Default for ForwarderTimings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            receive_timeout: Duration::from_secs(20),
            idle_interval: Duration::from_millis(100),
        }
    }
}

pub struct PacketForwarder<'a, S: DatagramSocket + ?Sized> {
    interface: &'a InterfaceDescriptor,
    socket: &'a S,
    cancel: &'a CancellationToken,
    timings: ForwarderTimings,
}

impl<'a, S: DatagramSocket + ?Sized> PacketForwarder<'a, S> {
    pub fn new(
        interface: &'a InterfaceDescriptor,
        socket: &'a S,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            interface,
            socket,
            cancel,
            timings: ForwarderTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: ForwarderTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Relay until the tunnel times out, an endpoint fails, or the worker
    /// is cancelled. Never returns success.
    pub async fn run(&self) -> VpnResult<Infallible> {
        let mut packet = vec![0u8; MAX_PACKET_SIZE];
        let mut last_send = Instant::now();
        let mut last_receive = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return Err(VpnError::Cancelled);
            }
            let mut idle = true;

            let len = self
                .interface
                .read_packet(&mut packet)
                .map_err(|e| self.interface_error(e))?;
            if len > 0 {
                self.socket
                    .send_datagram(&packet[..len])
                    .map_err(VpnError::from_socket_io)?;
                idle = false;
                last_send = Instant::now();
            }

            let len = self
                .socket
                .recv_datagram(&mut packet)
                .map_err(VpnError::from_socket_io)?;
            if len > 0 {
                if packet[0] != CONTROL_TAG {
                    self.interface
                        .write_packet(&packet[..len])
                        .map_err(|e| self.interface_error(e))?;
                }
                idle = false;
                last_receive = Instant::now();
            }

            if !idle {
                tokio::task::yield_now().await;
                continue;
            }

            sleep_or_cancel(self.cancel, self.timings.idle_interval).await?;
            let now = Instant::now();
            if now.duration_since(last_send) >= self.timings.keepalive_interval {
                for _ in 0..REDUNDANT_SENDS {
                    self.socket
                        .send_datagram(&[CONTROL_TAG])
                        .map_err(VpnError::from_socket_io)?;
                }
                log::debug!("Sent keepalive on {}", self.interface.name());
                last_send = now;
            } else if now.duration_since(last_receive) >= self.timings.receive_timeout {
                return Err(VpnError::TunnelTimeout(self.timings.receive_timeout));
            }
        }
    }

    /// Interface I/O fails once the registry closes it; report that as the
    /// cancellation it is.
    fn interface_error(&self, err: io::Error) -> VpnError {
        if self.cancel.is_cancelled() {
            VpnError::Cancelled
        } else {
            VpnError::Io(err)
        }
    }
}
