//! Overlap screening for candidate bridge networks.
//!
//! A candidate CIDR is rejected when it collides with anything already
//! routed on the host or with a resolver nameserver, so container traffic
//! can never shadow an address the host depends on.

use std::net::IpAddr;
use std::path::Path;

use crate::addressing::IpNetwork;
use crate::error::{NetworkError, NetworkResult};
use crate::link::RouteEntry;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Rejects `network` if it overlaps any routed destination. Routes without
/// a destination network (default routes) are skipped.
pub fn check_route_overlaps(routes: &[RouteEntry], network: &IpNetwork) -> NetworkResult<()> {
    for route in routes {
        if let Some(dest) = &route.network {
            if network.overlaps(dest) {
                return Err(NetworkError::NetworkOverlapsRoute {
                    network: network.to_string(),
                    route: dest.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Rejects `network` if it overlaps any resolver nameserver CIDR.
pub fn check_nameserver_overlaps(
    nameservers: &[IpNetwork],
    network: &IpNetwork,
) -> NetworkResult<()> {
    for ns in nameservers {
        if network.overlaps(ns) {
            return Err(NetworkError::NetworkOverlapsNameserver {
                network: network.to_string(),
                nameserver: ns.to_string(),
            });
        }
    }
    Ok(())
}

/// Nameservers from `/etc/resolv.conf` as host CIDRs (/32 or /128).
///
/// An unreadable resolv.conf is not an error: bridge selection simply
/// proceeds without the nameserver screen.
pub fn resolv_conf_nameservers() -> Vec<IpNetwork> {
    match std::fs::read_to_string(RESOLV_CONF) {
        Ok(contents) => parse_nameservers(&contents),
        Err(e) => {
            tracing::debug!("skipping nameserver overlap check, {RESOLV_CONF}: {e}");
            Vec::new()
        }
    }
}

/// Like [`resolv_conf_nameservers`] but from an explicit path.
pub fn nameservers_from_file(path: &Path) -> NetworkResult<Vec<IpNetwork>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_nameservers(&contents))
}

fn parse_nameservers(contents: &str) -> Vec<IpNetwork> {
    let mut nameservers = Vec::new();
    for line in contents.lines() {
        let line = line
            .split(|c| c == '#' || c == ';')
            .next()
            .unwrap_or("")
            .trim();
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        let Some(addr) = fields.next().and_then(|s| s.parse::<IpAddr>().ok()) else {
            continue;
        };
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        if let Ok(net) = IpNetwork::new(addr, prefix) {
            nameservers.push(net);
        }
    }
    nameservers
}
