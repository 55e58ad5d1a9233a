//! Client-side tunnel engine for a shared-secret UDP VPN.
//!
//! The engine authenticates to the server with a pre-shared secret, receives
//! the interface parameters (addresses, routes, DNS, MTU) in the reply, and
//! relays raw IP packets between a virtual interface and the UDP socket.
//! Connections are supervised with bounded reconnects, and a registry keeps
//! at most one tunnel established at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ ConnectionRegistry   connecting slot / established slot      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ReconnectSupervisor  attempt ─► 3 s backoff ─► attempt ...   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ HandshakeClient ─► parse_parameters ─► Platform::provision   │
//! │ PacketForwarder      interface ◄──► UDP socket ◄──► server   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod forwarder;
pub mod handshake;
pub mod params;
#[cfg(target_os = "linux")]
pub mod platform;
pub mod registry;
pub mod socket;
pub mod supervisor;

// Re-exports for convenience
pub use config::{load_client_config, ClientConfig, SharedSecret};
pub use device::{AppFilter, InterfaceDescriptor, Platform, ProvisionRequest, VirtualInterface};
pub use error::{VpnError, VpnResult};
pub use params::{parse_parameters, ProxyEndpoint, TunnelConfig};
#[cfg(target_os = "linux")]
pub use platform::LinuxPlatform;
pub use registry::{ConnectionId, ConnectionRegistry, LifecycleEvent, LifecycleListener};
pub use supervisor::RetryPolicy;
