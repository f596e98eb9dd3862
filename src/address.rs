//! IPv4 address/port pair and local-interface descriptor.
//!
//! `ip` is carried host-order as a plain `u32` (matching the wire
//! layout, where it goes out little-endian regardless of host
//! endianness); `Ipv4Addr` is only used at the edges where the
//! standard library or `local-ip-address` hands us one.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::ConfigError;

pub const ANY_INTERFACE: &str = "*";

/// `(ip, port)`. Empty when both fields are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub ip: u32,
    pub port: u16,
}

impl Address {
    pub const fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    pub const fn empty() -> Self {
        Self { ip: 0, port: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.ip == 0 && self.port == 0
    }

    pub fn from_ipv4(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: u32::from(ip),
            port,
        }
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn is_loopback(&self) -> bool {
        self.ipv4().is_loopback()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ipv4(), self.port)
    }
}

/// A local network interface: name, address, netmask, and the
/// quantities derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phy {
    pub name: String,
    pub ip: u32,
    pub netmask: u32,
}

impl Phy {
    pub fn new(name: impl Into<String>, ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            ip: u32::from(ip),
            netmask: u32::from(netmask),
        }
    }

    /// The sentinel interface meaning "any" — null ip, no netmask.
    pub fn any() -> Self {
        Self {
            name: ANY_INTERFACE.to_string(),
            ip: 0,
            netmask: 0,
        }
    }

    pub fn is_any(&self) -> bool {
        self.name == ANY_INTERFACE
    }

    pub fn net(&self) -> u32 {
        self.ip & self.netmask
    }

    pub fn wildcard(&self) -> u32 {
        !self.netmask
    }

    pub fn broadcast(&self) -> u32 {
        self.ip | self.wildcard()
    }

    pub fn host_min(&self) -> u32 {
        self.net() | 1
    }

    pub fn host_max(&self) -> u32 {
        self.broadcast() - 1
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.broadcast())
    }

    /// Whether `ip` falls within this interface's network.
    pub fn contains(&self, ip: u32) -> bool {
        ip & self.netmask == self.net()
    }

    pub fn is_loopback(&self) -> bool {
        self.ip_addr().is_loopback()
    }
}

/// Enumerates local network interfaces (loopback included — a bridge
/// on `lo` is valid config input that `validate_bridge` must be able
/// to reject by name, not by never resolving) with their address and
/// netmask, the way `local-ip-address` exposes them.
pub fn list_interfaces() -> Result<Vec<Phy>, ConfigError> {
    let ifas = local_ip_address::list_afinet_netifas()
        .map_err(|e| ConfigError::Io(std::io::Error::other(e.to_string())))?;

    let mut phys = Vec::new();
    for (name, ip) in ifas {
        let std::net::IpAddr::V4(ipv4) = ip else {
            continue;
        };
        // local-ip-address does not expose netmasks directly; assume a
        // /8 for loopback and a /24 everywhere else when the platform
        // doesn't tell us otherwise. Real deployments set `interface`
        // explicitly in settings.json.
        let netmask = if ipv4.is_loopback() {
            Ipv4Addr::new(255, 0, 0, 0)
        } else {
            Ipv4Addr::new(255, 255, 255, 0)
        };
        phys.push(Phy::new(name, ipv4, netmask));
    }
    Ok(phys)
}

/// Resolves an interface name (or `"*"`) to its `Phy` descriptor.
pub fn resolve_interface(name: &str) -> Result<Phy, ConfigError> {
    if name == ANY_INTERFACE {
        return Ok(Phy::any());
    }
    list_interfaces()?
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| ConfigError::UnknownInterface(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_network_quantities() {
        let phy = Phy::new(
            "eth0",
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert_eq!(phy.net(), u32::from(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(phy.broadcast(), u32::from(Ipv4Addr::new(10, 0, 0, 255)));
        assert_eq!(phy.host_min(), u32::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(phy.host_max(), u32::from(Ipv4Addr::new(10, 0, 0, 254)));
    }

    #[test]
    fn contains_checks_network_membership() {
        let phy = Phy::new(
            "eth0",
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert!(phy.contains(u32::from(Ipv4Addr::new(10, 0, 0, 200))));
        assert!(!phy.contains(u32::from(Ipv4Addr::new(10, 0, 1, 1))));
    }

    #[test]
    fn address_empty_detection() {
        assert!(Address::empty().is_empty());
        assert!(!Address::new(1, 0).is_empty());
    }
}
