//! Link-layer driver: the capability the manager uses to create the bridge,
//! assign its addresses, and inspect host routes and interfaces.
//!
//! The production implementation keeps one persistent rtnetlink connection
//! per process, reused across all operations.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::route::nlas::Nla as RouteNla;

use crate::addressing::{IfaceAddress, IpNetwork};
use crate::error::{NetworkError, NetworkResult};

/// One host routing-table entry, reduced to what overlap checks need.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Destination network; `None` for default routes.
    pub network: Option<IpNetwork>,
    pub default: bool,
}

/// Capability for host link management, consumed by the network manager.
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Create a bridge interface. Must be idempotent.
    async fn add_bridge(&self, name: &str) -> NetworkResult<()>;

    /// Assign an address to an interface. Must tolerate the address
    /// already being present.
    async fn addr_add(&self, iface: &str, addr: IfaceAddress) -> NetworkResult<()>;

    /// Bring an interface up.
    async fn link_up(&self, iface: &str) -> NetworkResult<()>;

    /// All host routes, both families.
    async fn get_routes(&self) -> NetworkResult<Vec<RouteEntry>>;

    /// Addresses assigned to `iface`, with their prefixes.
    async fn interface_addrs(&self, iface: &str) -> NetworkResult<Vec<IfaceAddress>>;
}

/// rtnetlink-backed [`LinkDriver`].
pub struct NetlinkLinkDriver {
    handle: rtnetlink::Handle,
    // Keep the connection task alive for the driver's lifetime.
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkLinkDriver {
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    /// A link's ifindex by name.
    async fn link_index(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::LinkNotFound {
                name: name.to_string(),
            }),
            Err(e) => {
                // Some kernels answer "not found" with an error instead of
                // an empty dump.
                if e.to_string().contains("No such device") {
                    Err(NetworkError::LinkNotFound {
                        name: name.to_string(),
                    })
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    async fn routes_for(&self, version: rtnetlink::IpVersion) -> NetworkResult<Vec<RouteEntry>> {
        let mut entries = Vec::new();
        let mut routes = self.handle.route().get(version).execute();
        while let Some(route) = routes.try_next().await.map_err(NetworkError::Netlink)? {
            let prefix = route.header.destination_prefix_length;
            let mut dest = None;
            for nla in &route.nlas {
                if let RouteNla::Destination(bytes) = nla {
                    dest = bytes_to_ip(bytes);
                }
            }
            match dest {
                Some(addr) => entries.push(RouteEntry {
                    network: Some(IpNetwork::new(addr, prefix)?),
                    default: false,
                }),
                None => entries.push(RouteEntry {
                    network: None,
                    default: prefix == 0,
                }),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl LinkDriver for NetlinkLinkDriver {
    async fn add_bridge(&self, name: &str) -> NetworkResult<()> {
        if self.link_index(name).await.is_ok() {
            return Ok(());
        }
        let result = self
            .handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            // Lost a creation race: somebody else made it, which is fine.
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    async fn addr_add(&self, iface: &str, addr: IfaceAddress) -> NetworkResult<()> {
        let index = self.link_index(iface).await?;
        let result = self
            .handle
            .address()
            .add(index, addr.addr, addr.prefix)
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    async fn link_up(&self, iface: &str) -> NetworkResult<()> {
        let index = self.link_index(iface).await?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    async fn get_routes(&self) -> NetworkResult<Vec<RouteEntry>> {
        let mut routes = self.routes_for(rtnetlink::IpVersion::V4).await?;
        routes.extend(self.routes_for(rtnetlink::IpVersion::V6).await?);
        Ok(routes)
    }

    async fn interface_addrs(&self, iface: &str) -> NetworkResult<Vec<IfaceAddress>> {
        let index = self.link_index(iface).await?;
        let mut addrs = Vec::new();
        let mut messages = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = messages.try_next().await.map_err(NetworkError::Netlink)? {
            let prefix = msg.header.prefix_len;
            for nla in &msg.nlas {
                if let AddressNla::Address(bytes) = nla {
                    if let Some(addr) = bytes_to_ip(bytes) {
                        addrs.push(IfaceAddress { addr, prefix });
                    }
                }
            }
        }
        Ok(addrs)
    }
}

fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_to_ip_handles_both_families() {
        assert_eq!(
            bytes_to_ip(&[10, 0, 42, 1]),
            Some("10.0.42.1".parse().unwrap())
        );
        let v6: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        assert_eq!(bytes_to_ip(&v6), Some("2001:db8::2".parse().unwrap()));
        assert_eq!(bytes_to_ip(&[1, 2, 3]), None);
    }
}
