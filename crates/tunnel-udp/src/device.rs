//! Virtual interface and platform collaborator seams.
//!
//! The engine never creates network interfaces or touches routing itself.
//! It asks a [`Platform`] to exempt its socket from the tunnel and to
//! provision an interface from a [`TunnelConfig`], then reads and writes raw
//! IP packets through the returned [`VirtualInterface`].

use crate::error::VpnResult;
use crate::params::TunnelConfig;
use async_trait::async_trait;
use std::io;
use tokio::net::UdpSocket;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Raw packet endpoint of a provisioned interface.
///
/// Dropping the value closes the underlying descriptor.
pub trait VirtualInterface: Send {
    /// Interface name for logging (e.g. "tun0").
    fn name(&self) -> &str;

    /// Non-blocking read of one packet; `Ok(0)` when nothing is pending.
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet.
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// Which applications the interface applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppFilter {
    /// Only these applications use the tunnel (empty means everyone).
    Allow(Vec<String>),
    /// Everyone except these applications uses the tunnel.
    Disallow(Vec<String>),
}

impl Default for AppFilter {
    fn default() -> Self {
        AppFilter::Allow(Vec::new())
    }
}

/// Everything the platform needs to provision an interface.
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    pub config: &'a TunnelConfig,
    pub session_name: &'a str,
    pub apps: &'a AppFilter,
}

/// Host services the engine depends on.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Exempt `socket` from being routed through the tunnel it carries.
    fn protect(&self, socket: &UdpSocket) -> bool;

    /// Create the virtual interface described by `request`.
    async fn provision(&self, request: &ProvisionRequest<'_>) -> VpnResult<Box<dyn VirtualInterface>>;
}

/// A provisioned interface shared by the attempt that forwards through it
/// and the registry handle that may tear it down.
///
/// Closing is idempotent: the interface is dropped by the first `close`
/// and later reads/writes fail with `NotConnected`.
pub struct InterfaceDescriptor {
    name: String,
    inner: Mutex<Option<Box<dyn VirtualInterface>>>,
}

impl InterfaceDescriptor {
    pub fn new(interface: Box<dyn VirtualInterface>) -> Self {
        Self {
            name: interface.name().to_string(),
            inner: Mutex::new(Some(interface)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.lock().as_mut() {
            Some(interface) => interface.read_packet(buf),
            None => Err(closed_error()),
        }
    }

    pub fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(interface) => interface.write_packet(packet),
            None => Err(closed_error()),
        }
    }

    /// Close the interface. Returns true if this call did the closing.
    pub fn close(&self) -> bool {
        let interface = self.lock().take();
        match interface {
            Some(interface) => {
                drop(interface);
                log::debug!("Closed interface {}", self.name);
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn VirtualInterface>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for InterfaceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceDescriptor")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "interface closed")
}


#[cfg(test)]
mod tests {
    use super::testing::FakeInterface;
    use super::*;

    #[test]
    fn test_descriptor_close_is_idempotent() {
        let (interface, state) = FakeInterface::new();
        let descriptor = InterfaceDescriptor::new(Box::new(interface));

        assert_eq!(descriptor.name(), "fake0");
        assert!(descriptor.close());
        assert!(!descriptor.close());
        assert!(descriptor.is_closed());
        assert_eq!(state.drops(), 1);
    }

    #[test]
    fn test_descriptor_io_after_close_fails() {
        let (interface, state) = FakeInterface::new();
        let descriptor = InterfaceDescriptor::new(Box::new(interface));
        state.push_outbound(&[0x45, 0x00]);

        let mut buf = [0u8; 8];
        assert_eq!(descriptor.read_packet(&mut buf).unwrap(), 2);
        descriptor.close();

        let err = descriptor.read_packet(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(descriptor.write_packet(&[1]).is_err());
    }
}
