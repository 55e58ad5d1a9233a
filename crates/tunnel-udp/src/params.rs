//! Handshake parameter parsing.
//!
//! The server answers a handshake with a line of space-separated tokens,
//! each a comma-separated field list whose first character selects the
//! directive:
//!
//! ```text
//! m,1400 a,10.0.0.2,32 r,0.0.0.0,0 d,8.8.8.8 s,example.com
//! ```
//!
//! | Kind | Fields | Meaning |
//! |------|--------|---------|
//! | `m`  | mtu | interface MTU (last one wins) |
//! | `a`  | ip, prefix | interface address |
//! | `r`  | network, prefix | route through the tunnel |
//! | `d`  | ip | DNS server |
//! | `s`  | domain | DNS search domain |
//!
//! Tokens with any other leading character are ignored.

use crate::error::{VpnError, VpnResult};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

/// HTTP proxy advertised on the provisioned interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Interface configuration handed out by the server during the handshake.
///
/// Immutable once the handshake completes; fed to the platform's
/// interface provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelConfig {
    /// MTU; `None` leaves the platform default.
    pub mtu: Option<u16>,
    /// Interface addresses, in the order the server listed them.
    pub addresses: Vec<IpNet>,
    /// Routes through the tunnel, in order.
    pub routes: Vec<IpNet>,
    pub dns_servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
    /// Filled from local configuration, never from the server.
    pub proxy: Option<ProxyEndpoint>,
}

/// Parse a handshake parameter string into a [`TunnelConfig`].
///
/// Fails with [`VpnError::InvalidParameter`] carrying the whole offending
/// token when a numeric field, address, or required field is bad.
pub fn parse_parameters(parameters: &str) -> VpnResult<TunnelConfig> {
    let mut config = TunnelConfig::default();

    for token in parameters.split_ascii_whitespace() {
        let fields: Vec<&str> = token.split(',').collect();
        let bad = || VpnError::InvalidParameter(token.to_string());

        match token.as_bytes()[0] {
            b'm' => {
                let mtu = field(&fields, 1).ok_or_else(bad)?;
                config.mtu = Some(mtu.parse().map_err(|_| bad())?);
            }
            b'a' => config.addresses.push(parse_prefix(&fields).ok_or_else(bad)?),
            b'r' => config.routes.push(parse_prefix(&fields).ok_or_else(bad)?),
            b'd' => {
                let dns = field(&fields, 1).ok_or_else(bad)?;
                config.dns_servers.push(dns.parse().map_err(|_| bad())?);
            }
            b's' => {
                let domain = field(&fields, 1).ok_or_else(bad)?;
                config.search_domains.push(domain.to_string());
            }
            _ => {}
        }
    }

    Ok(config)
}

fn field<'a>(fields: &[&'a str], index: usize) -> Option<&'a str> {
    fields.get(index).copied().filter(|f| !f.is_empty())
}

/// `<kind>,<ip>,<prefix length>` into an [`IpNet`] that keeps host bits.
fn parse_prefix(fields: &[&str]) -> Option<IpNet> {
    let addr: IpAddr = field(fields, 1)?.parse().ok()?;
    let prefix_len: u8 = field(fields, 2)?.parse().ok()?;
    IpNet::new(addr, prefix_len).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_line() {
        let config =
            parse_parameters("m,1400 a,10.0.0.2,32 r,0.0.0.0,0 d,8.8.8.8 s,example.com").unwrap();

        assert_eq!(config.mtu, Some(1400));
        assert_eq!(config.addresses, vec!["10.0.0.2/32".parse::<IpNet>().unwrap()]);
        assert_eq!(config.routes, vec!["0.0.0.0/0".parse::<IpNet>().unwrap()]);
        assert_eq!(config.dns_servers, vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.search_domains, vec!["example.com".to_string()]);
        assert_eq!(config.proxy, None);
    }

    #[test]
    fn test_repeated_directives_keep_order() {
        let config = parse_parameters(
            "a,10.0.0.2,24 a,fd00::2,64 r,10.1.0.0,16 r,10.2.0.0,16 d,1.1.1.1 d,9.9.9.9 s,a.test s,b.test",
        )
        .unwrap();

        let addrs: Vec<String> = config.addresses.iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.2/24", "fd00::2/64"]);
        let routes: Vec<String> = config.routes.iter().map(|r| r.to_string()).collect();
        assert_eq!(routes, vec!["10.1.0.0/16", "10.2.0.0/16"]);
        assert_eq!(
            config.dns_servers,
            vec!["1.1.1.1".parse::<IpAddr>().unwrap(), "9.9.9.9".parse().unwrap()]
        );
        assert_eq!(config.search_domains, vec!["a.test", "b.test"]);
    }

    #[test]
    fn test_mtu_last_write_wins() {
        let config = parse_parameters("m,1400 m,1280").unwrap();
        assert_eq!(config.mtu, Some(1280));
    }

    #[test]
    fn test_address_keeps_host_bits() {
        let config = parse_parameters("a,10.0.0.2,24").unwrap();
        assert_eq!(config.addresses[0].addr(), "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(config.addresses[0].prefix_len(), 24);
    }

    #[test]
    fn test_unknown_directive_ignored() {
        let with_unknown = parse_parameters("m,1400 x,whatever,else a,10.0.0.2,32 zz").unwrap();
        let without = parse_parameters("m,1400 a,10.0.0.2,32").unwrap();
        assert_eq!(with_unknown, without);
    }

    #[test]
    fn test_non_numeric_field_names_token() {
        match parse_parameters("m,1400 a,10.0.0.2,abc d,8.8.8.8") {
            Err(VpnError::InvalidParameter(token)) => assert_eq!(token, "a,10.0.0.2,abc"),
            other => panic!("expected InvalidParameter, got {:?}", other),
        }

        match parse_parameters("m,big") {
            Err(VpnError::InvalidParameter(token)) => assert_eq!(token, "m,big"),
            other => panic!("expected InvalidParameter, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_field_is_invalid() {
        assert!(matches!(
            parse_parameters("r,10.0.0.0"),
            Err(VpnError::InvalidParameter(_))
        ));
        assert!(matches!(parse_parameters("d"), Err(VpnError::InvalidParameter(_))));
    }

    #[test]
    fn test_prefix_out_of_range_is_invalid() {
        assert!(matches!(
            parse_parameters("a,10.0.0.2,33"),
            Err(VpnError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_empty_and_extra_spaces() {
        assert_eq!(parse_parameters("").unwrap(), TunnelConfig::default());
        let config = parse_parameters("  m,1400   d,8.8.8.8 ").unwrap();
        assert_eq!(config.mtu, Some(1400));
        assert_eq!(config.dns_servers.len(), 1);
    }
}
