use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Bridge created when none is configured.
pub const DEFAULT_BRIDGE: &str = "seam0";

/// Sentinel bridge name that disables container networking entirely.
pub const DISABLE_NETWORK_BRIDGE: &str = "none";

/// Host networking configuration, set once at daemon start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bridge interface name, or `"none"` to disable networking.
    pub bridge_iface: String,
    /// Whether to drive the packet filter at all. With this off, published
    /// ports are served by the userspace proxies alone.
    pub enable_iptables: bool,
    /// Whether containers on the bridge may talk to each other.
    pub inter_container_communication: bool,
    /// Host address used for published ports whose binding does not name
    /// one.
    pub default_ip: IpAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_iface: DEFAULT_BRIDGE.to_string(),
            enable_iptables: true,
            inter_container_communication: true,
            default_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl NetworkConfig {
    /// Configuration from `SEAM_*` environment variables, falling back to
    /// defaults:
    ///
    /// - `SEAM_BRIDGE_IFACE`: bridge name (default: `seam0`, `none` disables)
    /// - `SEAM_ENABLE_IPTABLES`: drive the packet filter (default: true)
    /// - `SEAM_ICC`: allow inter-container traffic (default: true)
    /// - `SEAM_DEFAULT_IP`: default host IP for published ports
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("SEAM_BRIDGE_IFACE") {
            config.bridge_iface = value;
        }
        if let Some(value) = env_bool("SEAM_ENABLE_IPTABLES") {
            config.enable_iptables = value;
        }
        if let Some(value) = env_bool("SEAM_ICC") {
            config.inter_container_communication = value;
        }
        if let Ok(value) = std::env::var("SEAM_DEFAULT_IP") {
            match value.parse() {
                Ok(ip) => config.default_ip = ip,
                Err(_) => tracing::warn!("ignoring invalid SEAM_DEFAULT_IP '{value}'"),
            }
        }
        config
    }

    pub fn is_disabled(&self) -> bool {
        self.bridge_iface == DISABLE_NETWORK_BRIDGE
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!("ignoring invalid {name} '{other}'");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.bridge_iface, "seam0");
        assert!(config.enable_iptables);
        assert!(config.inter_container_communication);
        assert_eq!(config.default_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(!config.is_disabled());
    }

    #[test]
    fn none_disables_networking() {
        let config = NetworkConfig {
            bridge_iface: DISABLE_NETWORK_BRIDGE.to_string(),
            ..Default::default()
        };
        assert!(config.is_disabled());
    }

    #[test]
    fn from_env_overrides() {
        std::env::set_var("SEAM_BRIDGE_IFACE", "seam1");
        std::env::set_var("SEAM_ICC", "false");
        std::env::set_var("SEAM_DEFAULT_IP", "192.168.1.10");
        let config = NetworkConfig::from_env();
        std::env::remove_var("SEAM_BRIDGE_IFACE");
        std::env::remove_var("SEAM_ICC");
        std::env::remove_var("SEAM_DEFAULT_IP");

        assert_eq!(config.bridge_iface, "seam1");
        assert!(!config.inter_container_communication);
        assert_eq!(
            config.default_ip,
            "192.168.1.10".parse::<IpAddr>().unwrap()
        );
    }
}
