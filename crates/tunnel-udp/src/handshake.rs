//! Shared-secret handshake over the connected tunnel socket.
//!
//! ```text
//! client -> server   0x00 <secret bytes>          (sent 3 times)
//! server -> client   0x00 <ASCII parameter line>
//! ```
//!
//! The client polls for the reply every 100 ms, up to 50 times. Datagrams
//! with a non-zero first byte are data that arrived early and are dropped.

use crate::config::SharedSecret;
use crate::error::{VpnError, VpnResult};
use crate::params::{parse_parameters, TunnelConfig};
use crate::socket::DatagramSocket;
use crate::supervisor::sleep_or_cancel;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// First byte of every control frame (handshake, reply, keepalive).
pub const CONTROL_TAG: u8 = 0x00;

/// How many copies of each control frame are sent back-to-back.
pub const REDUNDANT_SENDS: usize = 3;

/// Delay between reply polls.
pub const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of reply polls before giving up.
pub const MAX_HANDSHAKE_ATTEMPTS: u32 = 50;

/// Receive buffer size for the handshake reply.
pub const HANDSHAKE_BUFFER_SIZE: usize = 1024;

/// Successful handshake result.
#[derive(Debug, Clone)]
pub struct HandshakeReply {
    /// The trimmed parameter line as the server sent it.
    pub parameters: String,
    pub config: TunnelConfig,
}

/// Runs the handshake on an already-connected socket.
pub struct HandshakeClient<'a, S: DatagramSocket + ?Sized> {
    socket: &'a S,
    secret: &'a SharedSecret,
    cancel: &'a CancellationToken,
    poll_interval: Duration,
    max_attempts: u32,
}

impl<'a, S: DatagramSocket + ?Sized> HandshakeClient<'a, S> {
    pub fn new(socket: &'a S, secret: &'a SharedSecret, cancel: &'a CancellationToken) -> Self {
        Self {
            socket,
            secret,
            cancel,
            poll_interval: HANDSHAKE_POLL_INTERVAL,
            max_attempts: MAX_HANDSHAKE_ATTEMPTS,
        }
    }

    /// Override the poll budget.
    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_attempts = max_attempts;
        self
    }

    /// Authenticate and wait for the server's parameter line.
    pub async fn run(&self) -> VpnResult<HandshakeReply> {
        let mut frame = Vec::with_capacity(1 + self.secret.len());
        frame.push(CONTROL_TAG);
        frame.extend_from_slice(self.secret.as_bytes());

        // No per-datagram acknowledgement; the copies cover loss.
        for _ in 0..REDUNDANT_SENDS {
            self.socket
                .send_datagram(&frame)
                .map_err(VpnError::from_socket_io)?;
        }

        let mut buf = vec![0u8; HANDSHAKE_BUFFER_SIZE];
        for _ in 0..self.max_attempts {
            sleep_or_cancel(self.cancel, self.poll_interval).await?;

            let len = self
                .socket
                .recv_datagram(&mut buf)
                .map_err(VpnError::from_socket_io)?;
            if len > 0 && buf[0] == CONTROL_TAG {
                let parameters = decode_parameters(&buf[1..len]);
                let config = parse_parameters(&parameters)?;
                return Ok(HandshakeReply { parameters, config });
            }
        }

        Err(VpnError::HandshakeTimeout {
            attempts: self.max_attempts,
        })
    }
}

/// ASCII payload with surrounding spaces and control bytes stripped.
fn decode_parameters(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_matches(|c: char| c <= ' ')
        .to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory socket.

    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSocket {
        /// Datagrams handed out by successive `recv_datagram` calls; `None`
        /// entries are polls that find nothing.
        pub inbound: Mutex<VecDeque<Option<Vec<u8>>>>,
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub recv_calls: AtomicUsize,
        pub recv_error: Mutex<Option<io::ErrorKind>>,
    }

    impl FakeSocket {
        pub fn push_inbound(&self, datagram: &[u8]) {
            self.inbound.lock().unwrap().push_back(Some(datagram.to_vec()));
        }

        pub fn push_silence(&self, polls: usize) {
            let mut inbound = self.inbound.lock().unwrap();
            for _ in 0..polls {
                inbound.push_back(None);
            }
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        pub fn recv_calls(&self) -> usize {
            self.recv_calls.load(Ordering::SeqCst)
        }
    }

    impl DatagramSocket for FakeSocket {
        fn send_datagram(&self, buf: &[u8]) -> io::Result<usize> {
            self.sent.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.recv_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(kind) = *self.recv_error.lock().unwrap() {
                return Err(io::Error::from(kind));
            }
            match self.inbound.lock().unwrap().pop_front().flatten() {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok(datagram.len())
                }
                None => Ok(0),
            }
        }
    }
}
