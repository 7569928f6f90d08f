//! The per-host network manager.
//!
//! Exactly one manager should exist per host. Construction discovers the
//! bridge (creating and addressing it when absent), wires the baseline
//! filter rules, and builds the allocator pair per family plus the port
//! machinery. Runtime operations are safe under concurrent callers.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::addressing::{IfaceAddress, IpNetwork};
use crate::config::NetworkConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::filter::{exists, raw_checked, FilterDriver, Protocol};
use crate::interface::{ContainerAddrs, NetworkInterface};
use crate::ip_allocator::IpAllocator;
use crate::link::LinkDriver;
use crate::overlap::{check_nameserver_overlaps, check_route_overlaps, resolv_conf_nameservers};
use crate::port_allocator::PortAllocator;
use crate::port_mapper::PortMapper;
use crate::proxy::ProxyFactory;
use crate::ula::generate_ula;

/// Candidate bridge networks, tried in order. The gateway sits at .42.1
/// rather than the first host so that the /16 and /24 ranges agree on
/// gateway addresses. 172.16.0.0/16 itself is avoided: it collides with
/// EC2's resolver at 172.16.0.23.
const CANDIDATE_V4: &[&str] = &[
    "172.17.42.1/16",
    "10.0.42.1/16",
    "10.1.42.1/16",
    "10.42.42.1/16",
    "172.16.42.1/24",
    "172.16.43.1/24",
    "172.16.44.1/24",
    "10.0.42.1/24",
    "10.0.43.1/24",
    "192.168.42.1/24",
    "192.168.43.1/24",
    "192.168.44.1/24",
];

/// How many fresh ULAs to try before giving up on the IPv6 side.
const ULA_ATTEMPTS: usize = 12;

pub struct NetworkManager {
    config: NetworkConfig,
    inner: Option<Inner>,
}

pub(crate) struct Inner {
    bridge: String,
    network: IpNetwork,
    gateway: IpAddr,
    network6: IpNetwork,
    gateway6: IpAddr,
    pub(crate) ip_allocator: IpAllocator,
    pub(crate) ip_allocator6: IpAllocator,
    pub(crate) tcp_ports: PortAllocator,
    pub(crate) udp_ports: PortAllocator,
    pub(crate) mapper: PortMapper,
    closed: AtomicBool,
}

impl Inner {
    pub(crate) fn port_allocator(&self, proto: Protocol) -> &PortAllocator {
        match proto {
            Protocol::Tcp => &self.tcp_ports,
            Protocol::Udp => &self.udp_ports,
        }
    }
}

impl NetworkManager {
    /// Build the manager. With `bridge_iface = "none"` the manager comes
    /// up disabled: allocation yields inert interfaces and everything
    /// else is a no-op.
    pub async fn new(
        config: NetworkConfig,
        link: Arc<dyn LinkDriver>,
        filter: Arc<dyn FilterDriver>,
        proxies: Arc<dyn ProxyFactory>,
    ) -> NetworkResult<Arc<Self>> {
        if config.is_disabled() {
            tracing::info!("container networking disabled by configuration");
            return Ok(Arc::new(Self {
                config,
                inner: None,
            }));
        }

        let bridge = config.bridge_iface.clone();
        let (addr4, addr6) = match bridge_addrs(&*link, &bridge).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::info!("bridge {bridge} not usable ({e}), creating it");
                create_bridge(&config, &*link, &*filter).await?;
                bridge_addrs(&*link, &bridge).await?
            }
        };

        let network = addr4.network()?;
        let network6 = addr6.network()?;
        tracing::info!(
            "bridge {bridge} up with {addr4} and {addr6}, publishing on {}",
            config.default_ip
        );

        if config.enable_iptables {
            setup_inter_container_rule(&*filter, &bridge, config.inter_container_communication)
                .await?;
        }

        let filter_for_mapper = config.enable_iptables.then(|| filter.clone());
        let mapper = PortMapper::new(filter_for_mapper, &bridge, proxies).await?;

        let inner = Inner {
            ip_allocator: IpAllocator::new(network, addr4.addr),
            ip_allocator6: IpAllocator::new(network6, addr6.addr),
            tcp_ports: PortAllocator::new(),
            udp_ports: PortAllocator::new(),
            mapper,
            bridge,
            network,
            gateway: addr4.addr,
            network6,
            gateway6: addr6.addr,
            closed: AtomicBool::new(false),
        };

        Ok(Arc::new(Self {
            config,
            inner: Some(inner),
        }))
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.is_none()
    }

    /// The bridge's IPv4 network, when networking is enabled.
    pub fn bridge_network(&self) -> Option<IpNetwork> {
        self.inner.as_ref().map(|i| i.network)
    }

    pub fn bridge_network6(&self) -> Option<IpNetwork> {
        self.inner.as_ref().map(|i| i.network6)
    }

    pub(crate) fn inner(&self) -> Option<&Inner> {
        self.inner.as_ref()
    }

    /// Allocate a container interface: one IPv4 and one IPv6 address plus
    /// both gateways. On a disabled manager this returns an inert
    /// interface whose operations are no-ops.
    pub async fn allocate(self: &Arc<Self>) -> NetworkResult<NetworkInterface> {
        let Some(inner) = &self.inner else {
            return Ok(NetworkInterface::disabled(self.clone()));
        };

        let ip4 = acquire_skipping_gateway(&inner.ip_allocator, inner.gateway).await?;
        let ip6 = match acquire_skipping_gateway(&inner.ip_allocator6, inner.gateway6).await {
            Ok(ip6) => ip6,
            Err(e) => {
                inner.ip_allocator.release(ip4).await;
                return Err(e);
            }
        };

        Ok(NetworkInterface::new(
            self.clone(),
            ContainerAddrs {
                ipv4: IfaceAddress {
                    addr: ip4,
                    prefix: inner.network.prefix(),
                },
                gateway4: inner.gateway,
                ipv6: IfaceAddress {
                    addr: ip6,
                    prefix: inner.network6.prefix(),
                },
                gateway6: inner.gateway6,
            },
        ))
    }

    /// Shut down all four allocators. Idempotent.
    pub fn close(&self) -> NetworkResult<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("closing network manager for bridge {}", inner.bridge);
        inner.tcp_ports.close();
        inner.udp_ports.close();
        inner.ip_allocator.close();
        inner.ip_allocator6.close();
        Ok(())
    }
}

/// Acquire an address, refusing to hand out the bridge gateway. A single
/// gateway hit is released and retried; a second one means the allocator
/// is misconfigured and is an error rather than a silent collision.
pub(crate) async fn acquire_skipping_gateway(
    allocator: &IpAllocator,
    gateway: IpAddr,
) -> NetworkResult<IpAddr> {
    let ip = allocator.acquire().await?;
    if ip != gateway {
        return Ok(ip);
    }
    allocator.release(ip).await;
    let retry = allocator.acquire().await?;
    if retry == gateway {
        return Err(NetworkError::GatewayCollision {
            network: allocator.network().to_string(),
            ip: retry,
        });
    }
    Ok(retry)
}

/// The bridge's IPv4 address and first global IPv6 address.
async fn bridge_addrs(
    link: &dyn LinkDriver,
    bridge: &str,
) -> NetworkResult<(IfaceAddress, IfaceAddress)> {
    let addrs = link.interface_addrs(bridge).await?;

    let v4: Vec<&IfaceAddress> = addrs.iter().filter(|a| a.addr.is_ipv4()).collect();
    let addr4 = *v4.first().ok_or_else(|| NetworkError::NoInterfaceAddress {
        name: bridge.to_string(),
        family: "IPv4",
    })?;
    if v4.len() > 1 {
        tracing::warn!("bridge {bridge} has {} IPv4 addresses, using {addr4}", v4.len());
    }

    let v6: Vec<&IfaceAddress> = addrs
        .iter()
        .filter(|a| match a.addr {
            IpAddr::V6(v6) => !is_link_local_v6(v6),
            IpAddr::V4(_) => false,
        })
        .collect();
    let addr6 = *v6.first().ok_or_else(|| NetworkError::NoInterfaceAddress {
        name: bridge.to_string(),
        family: "IPv6",
    })?;
    if v6.len() > 1 {
        tracing::warn!("bridge {bridge} has {} IPv6 addresses, using {addr6}", v6.len());
    }

    Ok((*addr4, *addr6))
}

fn is_link_local_v6(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Create and address the bridge, picking the first candidate network per
/// family that overlaps neither an existing route nor a nameserver.
async fn create_bridge(
    config: &NetworkConfig,
    link: &dyn LinkDriver,
    filter: &dyn FilterDriver,
) -> NetworkResult<()> {
    let bridge = &config.bridge_iface;
    let nameservers = resolv_conf_nameservers();
    let routes = link.get_routes().await?;

    let mut addr4 = None;
    for candidate in CANDIDATE_V4 {
        let candidate: IfaceAddress = candidate.parse()?;
        let network = candidate.network()?;
        match check_route_overlaps(&routes, &network)
            .and_then(|()| check_nameserver_overlaps(&nameservers, &network))
        {
            Ok(()) => {
                addr4 = Some(candidate);
                break;
            }
            Err(e) => tracing::debug!("rejecting bridge candidate {candidate}: {e}"),
        }
    }

    let mut addr6 = None;
    for _ in 0..ULA_ATTEMPTS {
        let ula = generate_ula()?;
        match check_route_overlaps(&routes, &ula)
            .and_then(|()| check_nameserver_overlaps(&nameservers, &ula))
        {
            Ok(()) => {
                addr6 = Some(ula_gateway(&ula)?);
                break;
            }
            Err(e) => tracing::debug!("rejecting generated ULA {ula}: {e}"),
        }
    }

    let (Some(addr4), Some(addr6)) = (addr4, addr6) else {
        return Err(NetworkError::NoFreeBridgeCidr {
            bridge: bridge.clone(),
        });
    };

    tracing::debug!("creating bridge {bridge} with {addr4} and {addr6}");
    link.add_bridge(bridge).await?;
    link.addr_add(bridge, addr4).await?;
    link.addr_add(bridge, addr6).await?;
    link.link_up(bridge).await?;

    if config.enable_iptables {
        install_baseline_rules(filter, bridge, &addr4.network()?).await?;
    }
    Ok(())
}

/// The gateway address inside a freshly generated ULA /64: first host.
fn ula_gateway(ula: &IpNetwork) -> NetworkResult<IfaceAddress> {
    match ula.addr() {
        IpAddr::V6(base) => Ok(IfaceAddress {
            addr: IpAddr::V6(Ipv6Addr::from(u128::from(base) + 1)),
            prefix: ula.prefix(),
        }),
        IpAddr::V4(_) => Err(NetworkError::InvalidCidr(ula.to_string())),
    }
}

/// Masquerade bridge egress and accept established return traffic plus
/// all non-inter-container outgoing packets.
async fn install_baseline_rules(
    filter: &dyn FilterDriver,
    bridge: &str,
    network: &IpNetwork,
) -> NetworkResult<()> {
    let network_s = network.to_string();
    raw_checked(
        filter,
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            &network_s,
            "!",
            "-d",
            &network_s,
            "-j",
            "MASQUERADE",
        ],
    )
    .await?;
    raw_checked(
        filter,
        &[
            "-I",
            "FORWARD",
            "-o",
            bridge,
            "-m",
            "conntrack",
            "--ctstate",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ],
    )
    .await?;
    raw_checked(
        filter,
        &["-I", "FORWARD", "-i", bridge, "!", "-o", bridge, "-j", "ACCEPT"],
    )
    .await
}

/// Toggle the FORWARD rule between bridge ingress and egress: ACCEPT when
/// containers may talk to each other, DROP otherwise. The two rules are
/// mutually exclusive; the opposite one is always removed first and the
/// wanted one inserted only if absent.
async fn setup_inter_container_rule(
    filter: &dyn FilterDriver,
    bridge: &str,
    allow: bool,
) -> NetworkResult<()> {
    let accept = ["FORWARD", "-i", bridge, "-o", bridge, "-j", "ACCEPT"];
    let drop = ["FORWARD", "-i", bridge, "-o", bridge, "-j", "DROP"];
    let (unwanted, wanted) = if allow {
        (&drop, &accept)
    } else {
        (&accept, &drop)
    };

    let mut delete = vec!["-D"];
    delete.extend_from_slice(unwanted);
    let _ = filter.raw(&delete).await;

    if !exists(filter, wanted).await {
        tracing::debug!(
            "{} inter-container communication on {bridge}",
            if allow { "enabling" } else { "disabling" }
        );
        let mut insert = vec!["-I"];
        insert.extend_from_slice(wanted);
        raw_checked(filter, &insert).await?;
    }
    Ok(())
}
