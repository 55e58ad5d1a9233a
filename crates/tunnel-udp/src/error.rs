//! Error types for the tunnel engine.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Message plus the lower-level error that caused it, if any.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl ErrorContext {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Tunnel engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VpnError {
    /// The tunnel socket could not be opened, protected, or connected.
    #[error("Socket unavailable: {0}")]
    SocketUnavailable(#[source] ErrorContext),

    /// No handshake reply arrived within the poll budget.
    #[error("Handshake timed out after {attempts} polls")]
    HandshakeTimeout { attempts: u32 },

    /// A handshake parameter token could not be parsed.
    #[error("Bad parameter: {0}")]
    InvalidParameter(String),

    /// Nothing was received from the server for too long.
    #[error("Tunnel timed out: no inbound traffic for {0:?}")]
    TunnelTimeout(Duration),

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The platform refused to provision the virtual interface.
    #[error("Interface provisioning failed: {0}")]
    Provision(#[source] ErrorContext),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// The worker was cancelled while suspended.
    #[error("Cancelled")]
    Cancelled,
}

impl VpnError {
    /// Create a socket-unavailable error with context only.
    pub fn socket_unavailable(message: impl Into<String>) -> Self {
        Self::SocketUnavailable(ErrorContext::new(message))
    }

    /// Create a socket-unavailable error with preserved source.
    pub fn socket_unavailable_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::SocketUnavailable(ErrorContext::with_source(message, source))
    }

    /// Create a provisioning error with context only.
    pub fn provision(message: impl Into<String>) -> Self {
        Self::Provision(ErrorContext::new(message))
    }

    /// Create a provisioning error with preserved source.
    pub fn provision_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Provision(ErrorContext::with_source(message, source))
    }

    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }

    /// Classify an error returned by the connected tunnel socket.
    ///
    /// Errors meaning the path to the server is gone (ICMP port/host/network
    /// unreachable, address no longer available) become `SocketUnavailable`;
    /// everything else stays a plain I/O failure.
    pub fn from_socket_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NetworkDown => {
                Self::socket_unavailable_with_source("Tunnel socket lost its path", err)
            }
            _ => Self::Io(err),
        }
    }

    /// Returns true if the supervisor may absorb this error and try again.
    ///
    /// Only `SocketUnavailable` is retried. Handshake timeouts, bad
    /// parameters, tunnel timeouts, I/O failures and cancellation all end
    /// the logical connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VpnError::SocketUnavailable(_))
    }
}

/// Result type alias for tunnel operations.
pub type VpnResult<T> = Result<T, VpnError>;
