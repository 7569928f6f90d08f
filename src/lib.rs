//! Host networking control plane for container runtimes.
//!
//! One [`NetworkManager`] per host owns the bridge, a pair of per-family
//! [`IpAllocator`]s, TCP and UDP [`PortAllocator`]s, and the
//! [`PortMapper`] that couples each published host port to a kernel NAT
//! rule plus a userspace proxy. Containers get a [`NetworkInterface`]
//! holding their two addresses and published ports, all returned on
//! release.
//!
//! The kernel-facing edges are capability traits — [`LinkDriver`],
//! [`FilterDriver`], [`ProxyFactory`] — with production implementations
//! backed by rtnetlink, iptables/ip6tables, and tokio sockets.

pub mod addressing;
pub mod config;
pub mod error;
pub mod filter;
pub mod interface;
pub mod ip_allocator;
pub mod link;
pub mod manager;
pub mod ordered_set;
pub mod overlap;
pub mod port_allocator;
pub mod port_mapper;
pub mod proxy;
pub mod ula;

#[cfg(test)]
pub(crate) mod test_support;

pub use addressing::{IfaceAddress, IpNetwork};
pub use config::NetworkConfig;
pub use error::{NetworkError, NetworkResult};
pub use filter::{Chain, FilterDriver, IptablesDriver, Protocol};
pub use interface::{Nat, NetworkInterface, Port, PortBinding};
pub use ip_allocator::IpAllocator;
pub use link::{LinkDriver, NetlinkLinkDriver, RouteEntry};
pub use manager::NetworkManager;
pub use ordered_set::OrderedIntSet;
pub use port_allocator::PortAllocator;
pub use port_mapper::PortMapper;
pub use proxy::{Proxy, ProxyFactory, TokioProxyFactory};
pub use ula::generate_ula;
