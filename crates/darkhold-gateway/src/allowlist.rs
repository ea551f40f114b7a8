//! Client IP allow-list.
//!
//! Loopback and the Tailscale ULA prefix `fd7a:115c:a1e0::/48` are always
//! permitted; `--allow-cidr` flags add IPv4 ranges on top. Everything else
//! is rejected with 403 by the HTTP layer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// Failures parsing an `--allow-cidr` value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrParseError {
    /// No `/` separator between address and prefix length.
    #[error("expected '<addr>/<prefix>' notation")]
    MissingSlash,
    /// The address part is not a valid IPv4 address.
    #[error("invalid IPv4 address '{0}'")]
    BadAddress(String),
    /// The prefix part is not an integer in `0..=32`.
    #[error("invalid prefix length '{0}' (must be 0-32)")]
    BadPrefix(String),
}

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// The network mask as a 32-bit integer.
    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    /// Whether `ip` falls inside this network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(self.network) & mask == u32::from(ip) & mask
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or(CidrParseError::MissingSlash)?;
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| CidrParseError::BadAddress(addr.to_string()))?;
        let prefix_len: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| CidrParseError::BadPrefix(prefix.to_string()))?;
        Ok(Self {
            network,
            prefix_len,
        })
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// The resolved allow-list checked for every connection.
#[derive(Debug, Clone, Default)]
pub struct ClientAllowList {
    cidrs: Vec<Ipv4Cidr>,
}

impl ClientAllowList {
    /// Build an allow-list from the configured extra CIDRs. Loopback and
    /// the Tailscale ULA are implicit.
    pub fn new(cidrs: Vec<Ipv4Cidr>) -> Self {
        Self { cidrs }
    }

    /// Whether a client at `ip` may use the gateway.
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.is_allowed_v4(v4),
            IpAddr::V6(v6) => {
                if v6.is_loopback() || is_tailscale_ula(v6) {
                    return true;
                }
                // Dual-stack listeners surface IPv4 peers as mapped v6.
                match v6.to_ipv4_mapped() {
                    Some(v4) => self.is_allowed_v4(v4),
                    None => false,
                }
            }
        }
    }

    fn is_allowed_v4(&self, ip: Ipv4Addr) -> bool {
        ip.is_loopback() || self.cidrs.iter().any(|cidr| cidr.contains(ip))
    }
}

/// Whether `ip` is inside the Tailscale ULA prefix `fd7a:115c:a1e0::/48`.
fn is_tailscale_ula(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    segments[0] == 0xfd7a && segments[1] == 0x115c && segments[2] == 0xa1e0
}
