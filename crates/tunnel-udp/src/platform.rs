//! Linux host services: TUN provisioning and socket protection.

use crate::device::{AppFilter, Platform, ProvisionRequest, VirtualInterface};
use crate::error::{VpnError, VpnResult};
use async_trait::async_trait;
use ipnet::IpNet;
use std::io::{self, Read, Write};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tun::{AbstractDevice, Configuration};

/// MTU used when the server does not send one.
pub const DEFAULT_MTU: u16 = 1500;

/// Linux implementation of [`Platform`].
///
/// Protection marks the tunnel socket with a firewall mark so that policy
/// routing can send it around the tunnel. Without a mark, protection is a
/// no-op.
#[derive(Debug, Clone, Default)]
pub struct LinuxPlatform {
    fwmark: Option<u32>,
}

impl LinuxPlatform {
    pub fn new(fwmark: Option<u32>) -> Self {
        Self { fwmark }
    }
}

#[async_trait]
impl Platform for LinuxPlatform {
    fn protect(&self, socket: &UdpSocket) -> bool {
        let Some(mark) = self.fwmark else {
            return true;
        };
        match socket2::SockRef::from(socket).set_mark(mark) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to set SO_MARK {:#x} on tunnel socket: {}", mark, e);
                false
            }
        }
    }

    async fn provision(&self, request: &ProvisionRequest<'_>) -> VpnResult<Box<dyn VirtualInterface>> {
        let config = request.config;
        let mtu = config.mtu.unwrap_or(DEFAULT_MTU);
        let primary = config.addresses.iter().find_map(|net| match net {
            IpNet::V4(v4) => Some(*v4),
            IpNet::V6(_) => None,
        });

        let device = {
            let mut tun_config = Configuration::default();
            tun_config.mtu(mtu).up();
            if let Some(v4) = primary {
                tun_config.address(v4.addr()).netmask(v4.netmask());
            }
            tun_config.platform_config(|platform_config| {
                platform_config.ensure_root_privileges(true);
            });
            tun::create(&tun_config).map_err(|e| {
                VpnError::provision_with_source(
                    format!("Failed to create TUN device for {}", request.session_name),
                    e,
                )
            })?
        };
        let name = device
            .tun_name()
            .map_err(|e| VpnError::provision_with_source("Failed to get TUN name", e))?;
        device
            .set_nonblock()
            .map_err(|e| VpnError::provision_with_source(format!("Failed to make {} non-blocking", name), e))?;

        log::info!(
            "Created TUN device {} for session {} (mtu {})",
            name,
            request.session_name,
            mtu
        );

        for address in &config.addresses {
            if primary.is_some_and(|v4| IpNet::V4(v4) == *address) {
                continue;
            }
            run_ip(&address_args(address, &name), "address", address).await?;
        }
        for route in &config.routes {
            run_ip(&route_args(route, &name), "route", route).await?;
        }

        if !config.dns_servers.is_empty() {
            log::info!("DNS servers for {}: {:?} (not applied to the host resolver)", name, config.dns_servers);
        }
        if !config.search_domains.is_empty() {
            log::info!("Search domains for {}: {}", name, config.search_domains.join(" "));
        }
        if let Some(ref proxy) = config.proxy {
            log::info!("HTTP proxy for {}: {}", name, proxy);
        }
        match request.apps {
            AppFilter::Allow(apps) | AppFilter::Disallow(apps) if !apps.is_empty() => {
                log::warn!("Per-application routing is not available on Linux, ignoring {:?}", request.apps);
            }
            _ => {}
        }

        Ok(Box::new(TunInterface { device, name }))
    }
}

struct TunInterface {
    device: tun::Device,
    name: String,
}

impl VirtualInterface for TunInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.device.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            result => result,
        }
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        match self.device.write(packet) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("{} busy, dropped {} byte packet", self.name, packet.len());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn address_args(address: &IpNet, dev: &str) -> Vec<String> {
    vec![
        "addr".into(),
        "add".into(),
        address.to_string(),
        "dev".into(),
        dev.into(),
    ]
}

fn route_args(route: &IpNet, dev: &str) -> Vec<String> {
    vec![
        "route".into(),
        "add".into(),
        route.trunc().to_string(),
        "dev".into(),
        dev.into(),
    ]
}

/// iproute2's complaint when the route or address is already present.
fn ip_entry_exists(stderr: &str) -> bool {
    stderr.contains("File exists") || stderr.contains("already assigned")
}

async fn run_ip(args: &[String], label: &str, net: &IpNet) -> VpnResult<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| VpnError::provision_with_source("Failed to execute ip command", e))?;

    if output.status.success() {
        log::info!("Added {} {}", label, net);
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if ip_entry_exists(&stderr) {
        log::warn!("{} {} already exists, continuing", label, net);
        return Ok(());
    }
    Err(VpnError::provision(format!(
        "Failed to add {} {}: {}",
        label,
        net,
        stderr.trim()
    )))
}
