//! tunnel-rs-udp
//!
//! Command-line client for the shared-secret UDP tunnel.

#[cfg(not(target_os = "linux"))]
compile_error!("tunnel-rs-udp only supports Linux");

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tunnel_udp::config::expand_tilde;
use tunnel_udp::{
    load_client_config, parse_parameters, ClientConfig, ConnectionRegistry, LifecycleEvent,
    LifecycleListener, LinuxPlatform, SharedSecret,
};

#[derive(Parser)]
#[command(name = "tunnel-rs-udp")]
#[command(version)]
#[command(about = "Shared-secret UDP VPN client")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a server and forward traffic until Ctrl-C
    Connect {
        /// Path to config file (default: ~/.config/tunnel-udp/client.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Server host name or IP (overrides config)
        #[arg(long)]
        server: Option<String>,

        /// Server UDP port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Shared secret (overrides config)
        #[arg(long)]
        secret: Option<String>,

        /// File containing the shared secret (overrides config)
        #[arg(long)]
        secret_file: Option<PathBuf>,

        /// Firewall mark for the tunnel socket (overrides config)
        #[arg(long)]
        fwmark: Option<u32>,
    },
    /// Parse a handshake parameter string and print the result
    ///
    /// E.g. tunnel-rs-udp parse "m,1400 a,10.0.0.2,32 d,8.8.8.8"
    Parse {
        /// Space-separated parameter tokens
        parameters: String,
    },
}

/// Logs lifecycle transitions.
struct LoggingListener;

impl LifecycleListener for LoggingListener {
    fn on_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Connecting(id) => log::info!("[conn {}] Connecting", id),
            LifecycleEvent::Connected(id) => log::info!("[conn {}] Connected", id),
            LifecycleEvent::Disconnected => log::info!("Disconnected"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Connect {
            config,
            server,
            port,
            secret,
            secret_file,
            fwmark,
        } => {
            let config = resolve_config(config, server, port, secret, secret_file, fwmark)?;
            run_client(config).await
        }
        Command::Parse { parameters } => {
            let parsed = parse_parameters(&parameters).context("Invalid parameter string")?;
            println!("{:#?}", parsed);
            Ok(())
        }
    }
}

/// Merge the config file (if any) with CLI overrides.
fn resolve_config(
    path: Option<PathBuf>,
    server: Option<String>,
    port: Option<u16>,
    secret: Option<String>,
    secret_file: Option<PathBuf>,
    fwmark: Option<u32>,
) -> Result<ClientConfig> {
    let mut config = match (path, &server, port) {
        // Everything needed is on the command line; the file is optional.
        (None, Some(server), Some(port)) => ClientConfig::new(server.clone(), port),
        (path, _, _) => load_client_config(path.as_deref()).context("Failed to load config")?,
    };

    if let Some(server) = server {
        config.server = server;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(secret) = secret {
        config.secret = Some(SharedSecret::new(secret));
        config.secret_file = None;
    }
    if let Some(path) = secret_file {
        config.secret_file = Some(expand_tilde(&path));
        config.secret = None;
    }
    if fwmark.is_some() {
        config.fwmark = fwmark;
    }

    config.validate().context("Invalid client configuration")?;
    Ok(config)
}

async fn run_client(config: ClientConfig) -> Result<()> {
    log::info!(
        "Tunnel to {}:{} (session {})",
        config.server,
        config.port,
        config.session_name()
    );

    let platform = Arc::new(LinuxPlatform::new(config.fwmark));
    let registry = ConnectionRegistry::with_listener(platform, Arc::new(LoggingListener));
    registry.connect(config);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down");
    registry.disconnect();
    Ok(())
}
