//! Static client configuration.
//!
//! Supplied from outside the engine (a TOML file and CLI overrides) and
//! never modified by it.

use crate::device::AppFilter;
use crate::error::{VpnError, VpnResult};
use crate::handshake::HANDSHAKE_BUFFER_SIZE;
use crate::params::ProxyEndpoint;
use crate::supervisor::RetryPolicy;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Secret presented to the server during the handshake. Never logged.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for SharedSecret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(|s| Self(s.into_bytes()))
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes redacted>)", self.0.len())
    }
}

/// Client configuration file contents.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub server: String,

    /// Server UDP port.
    pub port: u16,

    /// Shared secret (UTF-8 string).
    #[serde(default)]
    pub secret: Option<SharedSecret>,

    /// File holding the shared secret (alternative to `secret`).
    #[serde(default)]
    pub secret_file: Option<PathBuf>,

    /// HTTP proxy host advertised on the interface.
    #[serde(default)]
    pub proxy_host: Option<String>,

    /// HTTP proxy port advertised on the interface.
    #[serde(default)]
    pub proxy_port: Option<u16>,

    /// Applications the tunnel is restricted to (or excluded from).
    #[serde(default)]
    pub apps: Vec<String>,

    /// Polarity of `apps`: true = allow list, false = deny list.
    #[serde(default = "default_allow_apps")]
    pub allow_apps: bool,

    /// Session name for the interface (defaults to the server name).
    #[serde(default)]
    pub session_name: Option<String>,

    /// Firewall mark applied to the tunnel socket (Linux).
    #[serde(default)]
    pub fwmark: Option<u32>,

    /// Consecutive pre-connect failures before giving up.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Delay between attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl ClientConfig {
    /// Minimal configuration for a server; everything else defaulted.
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
            secret: None,
            secret_file: None,
            proxy_host: None,
            proxy_port: None,
            apps: Vec::new(),
            allow_apps: default_allow_apps(),
            session_name: None,
            fwmark: None,
            max_failures: default_max_failures(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> VpnResult<()> {
        if self.server.trim().is_empty() {
            return Err(VpnError::config("'server' must not be empty"));
        }
        if self.port == 0 {
            return Err(VpnError::config("'port' must be non-zero"));
        }
        if self.secret.is_some() && self.secret_file.is_some() {
            return Err(VpnError::config(
                "Use only one of 'secret' or 'secret_file'",
            ));
        }
        if let Some(ref secret) = self.secret {
            if secret.len() >= HANDSHAKE_BUFFER_SIZE {
                return Err(VpnError::config(format!(
                    "'secret' must be shorter than {} bytes",
                    HANDSHAKE_BUFFER_SIZE
                )));
            }
        }
        let proxy_host_set = self.proxy_host.as_deref().is_some_and(|h| !h.is_empty());
        let proxy_port_set = self.proxy_port.is_some_and(|p| p > 0);
        if proxy_host_set != proxy_port_set {
            return Err(VpnError::config(
                "Incomplete proxy settings: HTTP proxy requires both 'proxy_host' and 'proxy_port'",
            ));
        }
        if self.max_failures == 0 {
            return Err(VpnError::config("'max_failures' must be greater than 0"));
        }
        Ok(())
    }

    /// Resolve the server endpoint.
    pub async fn server_addr(&self) -> VpnResult<SocketAddr> {
        tokio::net::lookup_host((self.server.as_str(), self.port))
            .await
            .map_err(|e| {
                VpnError::config_with_source(format!("Cannot resolve server {}", self.server), e)
            })?
            .next()
            .ok_or_else(|| VpnError::config(format!("Server {} has no addresses", self.server)))
    }

    /// Load the shared secret from `secret` or `secret_file`.
    pub fn shared_secret(&self) -> VpnResult<SharedSecret> {
        if let Some(ref path) = self.secret_file {
            let path = expand_tilde(path);
            let content = std::fs::read(&path).map_err(|e| {
                VpnError::config_with_source(
                    format!("Failed to read secret file: {}", path.display()),
                    e,
                )
            })?;
            let trimmed = content
                .strip_suffix(b"\n")
                .map(|s| s.strip_suffix(b"\r").unwrap_or(s))
                .unwrap_or(content.as_slice());
            if trimmed.len() >= HANDSHAKE_BUFFER_SIZE {
                return Err(VpnError::config(format!(
                    "Secret file {} must hold fewer than {} bytes",
                    path.display(),
                    HANDSHAKE_BUFFER_SIZE
                )));
            }
            return Ok(SharedSecret::new(trimmed.to_vec()));
        }
        Ok(self.secret.clone().unwrap_or_default())
    }

    pub fn proxy(&self) -> Option<ProxyEndpoint> {
        match (&self.proxy_host, self.proxy_port) {
            (Some(host), Some(port)) if !host.is_empty() && port > 0 => Some(ProxyEndpoint {
                host: host.clone(),
                port,
            }),
            _ => None,
        }
    }

    pub fn app_filter(&self) -> AppFilter {
        if self.allow_apps {
            AppFilter::Allow(self.apps.clone())
        } else {
            AppFilter::Disallow(self.apps.clone())
        }
    }

    pub fn session_name(&self) -> &str {
        self.session_name.as_deref().unwrap_or(&self.server)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_consecutive_failures: self.max_failures,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

fn default_allow_apps() -> bool {
    true
}

fn default_max_failures() -> u32 {
    RetryPolicy::default().max_consecutive_failures
}

fn default_retry_delay_ms() -> u64 {
    RetryPolicy::default().retry_delay.as_millis() as u64
}

/// Expand a leading `~` component to the home directory. `~user` forms
/// are left alone.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) if rest.as_os_str().is_empty() => home,
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn default_client_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("tunnel-udp").join("client.toml"))
}

/// Load a client configuration file (default path when `path` is `None`).
pub fn load_client_config(path: Option<&Path>) -> VpnResult<ClientConfig> {
    let config_path = match path {
        Some(p) => expand_tilde(p),
        None => default_client_config_path().ok_or_else(|| {
            VpnError::config("Could not resolve default config path. Use -c to specify a config file.")
        })?,
    };
    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        VpnError::config_with_source(
            format!("Failed to read config file: {}", config_path.display()),
            e,
        )
    })?;
    toml::from_str(&content).map_err(|e| {
        VpnError::config_with_source(
            format!("Failed to parse config file: {}", config_path.display()),
            e,
        )
    })
}
