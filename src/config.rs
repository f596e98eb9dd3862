//! Settings loader: `Settings { adapters: [...] }` JSON, mirroring
//! `hdds-discovery-server::config::ServerConfig`'s serde-default +
//! `from_file`/`validate` shape, with bridge-specific validation from
//! §3/§7 (endpoints must lie within the interface network, a bridge on
//! loopback with no explicit `send_port` is rejected as recursive).

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::{self, Phy};
use crate::error::ConfigError;

fn default_delay_ms() -> u64 {
    100
}
fn default_discovery_ms() -> u64 {
    10_000
}
fn default_acknowledge_ms() -> u64 {
    1_000
}
fn default_heartbeat_ms() -> u64 {
    60_000
}
fn default_rescan_ms() -> u64 {
    60_000
}
fn default_max_nacks() -> u32 {
    3
}
fn default_hops() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeouts {
    #[serde(default = "default_delay_ms")]
    pub delay: u64,
    #[serde(default = "default_discovery_ms")]
    pub discovery: u64,
    #[serde(default = "default_acknowledge_ms")]
    pub acknowledge: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat: u64,
    #[serde(default = "default_rescan_ms")]
    pub rescan: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            delay: default_delay_ms(),
            discovery: default_discovery_ms(),
            acknowledge: default_acknowledge_ms(),
            heartbeat: default_heartbeat_ms(),
            rescan: default_rescan_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DiscoveryMode {
    Unicast {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoints: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    Multicast {
        group: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default = "default_hops")]
        hops: u8,
    },
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeSettings {
    pub discovery: DiscoveryMode,
    #[serde(default)]
    pub send_port: Option<u16>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_max_nacks")]
    pub max_nacks: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Tcp,
    Tls,
    Websocket,
    TlsWebsocket,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum AdapterProtocol {
    Mqtt {
        #[serde(default)]
        transport: Option<Transport>,
    },
    Dds {
        #[serde(default)]
        transport: Option<Transport>,
    },
    Bridge(BridgeSettings),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdapterConfig {
    pub interface: String,
    pub port: u16,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub protocol: AdapterProtocol,
}

impl AdapterConfig {
    pub fn protocol_name(&self) -> &'static str {
        match self.protocol {
            AdapterProtocol::Mqtt { .. } => "mqtt",
            AdapterProtocol::Dds { .. } => "dds",
            AdapterProtocol::Bridge(_) => "bridge",
        }
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!(
                "[{}:{}] {}",
                self.interface,
                self.port,
                self.protocol_name()
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub adapters: Vec<AdapterConfig>,
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut bound: Vec<(Ipv4Addr, u16)> = Vec::new();
        for adapter in &self.adapters {
            let phy = address::resolve_interface(&adapter.interface)?;
            let bind_ip = phy.ip_addr();

            if bound
                .iter()
                .any(|(ip, port)| *port == adapter.port && (*ip == bind_ip || ip.is_loopback() || bind_ip.is_loopback()))
            {
                return Err(ConfigError::BindCollision(bind_ip, adapter.port));
            }
            bound.push((bind_ip, adapter.port));

            match &adapter.protocol {
                AdapterProtocol::Mqtt { transport } | AdapterProtocol::Dds { transport } => {
                    if transport.is_none() {
                        return Err(ConfigError::MissingField("transport"));
                    }
                }
                AdapterProtocol::Bridge(bridge) => {
                    validate_bridge(&phy, adapter, bridge)?;
                }
            }
        }
        Ok(())
    }
}

fn validate_bridge(
    phy: &Phy,
    adapter: &AdapterConfig,
    bridge: &BridgeSettings,
) -> Result<(), ConfigError> {
    if phy.is_loopback() && bridge.send_port.is_none() {
        return Err(ConfigError::RecursiveLoopback(adapter.interface.clone()));
    }

    if let DiscoveryMode::Unicast {
        endpoints, from, to, ..
    } = &bridge.discovery
    {
        let mut check = |ip_str: &str| -> Result<(), ConfigError> {
            let ip: Ipv4Addr = ip_str
                .parse()
                .map_err(|_| ConfigError::EndpointOutsideNetwork(Ipv4Addr::UNSPECIFIED, adapter.interface.clone()))?;
            if !phy.is_any() && !phy.contains(u32::from(ip)) {
                return Err(ConfigError::EndpointOutsideNetwork(ip, adapter.interface.clone()));
            }
            Ok(())
        };
        if let Some(list) = endpoints {
            for ip in list {
                check(ip)?;
            }
        }
        if let Some(from) = from {
            check(from)?;
        }
        if let Some(to) = to {
            check(to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_default_matches_spec_constants() {
        let t = Timeouts::default();
        assert_eq!(t.delay, 100);
        assert_eq!(t.discovery, 10_000);
        assert_eq!(t.acknowledge, 1_000);
        assert_eq!(t.heartbeat, 60_000);
        assert_eq!(t.rescan, 60_000);
    }

    #[test]
    fn settings_roundtrip_through_json() {
        let settings = Settings {
            adapters: vec![AdapterConfig {
                interface: "*".into(),
                port: 9000,
                name: None,
                protocol: AdapterProtocol::Bridge(BridgeSettings {
                    discovery: DiscoveryMode::Broadcast,
                    send_port: Some(9000),
                    timeouts: Timeouts::default(),
                    max_nacks: 3,
                }),
            }],
        };
        let text = serde_json::to_string(&settings).unwrap();
        let reloaded: Settings = serde_json::from_str(&text).unwrap();
        assert_eq!(settings, reloaded);
    }

    #[test]
    fn display_name_generated_when_absent() {
        let adapter = AdapterConfig {
            interface: "eth0".into(),
            port: 1883,
            name: None,
            protocol: AdapterProtocol::Mqtt {
                transport: Some(Transport::Tcp),
            },
        };
        assert_eq!(adapter.display_name(), "[eth0:1883] mqtt");
    }

    #[test]
    fn loopback_bridge_without_send_port_is_rejected() {
        let phy = Phy::new("lo", Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0));
        let adapter = AdapterConfig {
            interface: "lo".into(),
            port: 9000,
            name: None,
            protocol: AdapterProtocol::Bridge(BridgeSettings {
                discovery: DiscoveryMode::Broadcast,
                send_port: None,
                timeouts: Timeouts::default(),
                max_nacks: 3,
            }),
        };
        let AdapterProtocol::Bridge(bridge) = &adapter.protocol else {
            unreachable!()
        };
        let err = validate_bridge(&phy, &adapter, bridge).unwrap_err();
        assert!(matches!(err, ConfigError::RecursiveLoopback(_)));
    }
}
