//! Per-container network handle: the two allocated addresses plus every
//! port published on the container's behalf.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::addressing::IfaceAddress;
use crate::error::{NetworkError, NetworkResult};
use crate::filter::Protocol;
use crate::manager::NetworkManager;

/// A container-side port, e.g. `8080/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    pub proto: Protocol,
}

impl Port {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            proto: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            proto: Protocol::Udp,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

impl FromStr for Port {
    type Err = NetworkError;

    fn from_str(s: &str) -> NetworkResult<Self> {
        let (port, proto) = match s.split_once('/') {
            Some((port, proto)) => (port, proto.parse()?),
            None => (s, Protocol::Tcp),
        };
        let port = port
            .parse()
            .map_err(|_| NetworkError::InvalidPort(s.to_string()))?;
        Ok(Self { port, proto })
    }
}

/// Where a published port should appear on the host. An empty host IP
/// falls back to the manager's default; host port `0` means "pick one".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: Option<IpAddr>,
    pub host_port: u16,
}

/// One live publication: the container port and the host binding actually
/// in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat {
    pub port: Port,
    pub binding: PortBinding,
}

impl fmt::Display for Nat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host_ip = self
            .binding
            .host_ip
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        write!(f, "{host_ip}:{}:{}", self.binding.host_port, self.port)
    }
}

/// Addresses held by one container interface.
#[derive(Debug, Clone, Copy)]
pub struct ContainerAddrs {
    pub ipv4: IfaceAddress,
    pub gateway4: IpAddr,
    pub ipv6: IfaceAddress,
    pub gateway6: IpAddr,
}

/// The networking stack of one container. Owns its two addresses and its
/// published ports; both are returned to the manager by [`release`].
///
/// [`release`]: NetworkInterface::release
pub struct NetworkInterface {
    addrs: Option<ContainerAddrs>,
    nats: Vec<Nat>,
    manager: Arc<NetworkManager>,
}

impl NetworkInterface {
    pub(crate) fn new(manager: Arc<NetworkManager>, addrs: ContainerAddrs) -> Self {
        Self {
            addrs: Some(addrs),
            nats: Vec::new(),
            manager,
        }
    }

    pub(crate) fn disabled(manager: Arc<NetworkManager>) -> Self {
        Self {
            addrs: None,
            nats: Vec::new(),
            manager,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.addrs.is_none()
    }

    pub fn addrs(&self) -> Option<&ContainerAddrs> {
        self.addrs.as_ref()
    }

    /// Ports currently published for this container, in allocation order.
    pub fn nats(&self) -> &[Nat] {
        &self.nats
    }

    /// Publish a container port on the host. Reserves a host port
    /// (honoring an explicit request), installs the NAT rule, and starts
    /// the proxy. On mapping failure the reserved port is released again.
    pub async fn allocate_port(&mut self, port: Port, binding: PortBinding) -> NetworkResult<Nat> {
        let addrs = self.addrs.ok_or(NetworkError::InterfaceDisabled)?;
        let inner = self
            .manager
            .inner()
            .ok_or(NetworkError::InterfaceDisabled)?;

        let host_ip = binding
            .host_ip
            .unwrap_or(self.manager.config().default_ip);
        let backend_ip = if host_ip.is_ipv6() {
            addrs.ipv6.addr
        } else {
            addrs.ipv4.addr
        };
        let backend = SocketAddr::new(backend_ip, port.port);

        let allocator = inner.port_allocator(port.proto);
        let host_port = allocator.acquire(binding.host_port).await?;

        if let Err(e) = inner.mapper.map(host_ip, host_port, backend, port.proto).await {
            allocator.release(host_port);
            return Err(e);
        }

        let nat = Nat {
            port,
            binding: PortBinding {
                host_ip: Some(host_ip),
                host_port,
            },
        };
        self.nats.push(nat);
        Ok(nat)
    }

    /// Return everything this interface owns: published ports in reverse
    /// allocation order, then both addresses. Failures are logged and do
    /// not stop the rest of the cleanup.
    pub async fn release(&mut self) {
        let Some(addrs) = self.addrs.take() else {
            return;
        };
        let Some(inner) = self.manager.inner() else {
            return;
        };

        for nat in self.nats.drain(..).rev() {
            let host_port = nat.binding.host_port;
            let host_ip = nat
                .binding
                .host_ip
                .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
            tracing::debug!("unmapping {nat}");
            if let Err(e) = inner.mapper.unmap(host_ip, host_port, nat.port.proto).await {
                tracing::warn!("unable to unmap {nat}: {e}");
            }
            inner.port_allocator(nat.port.proto).release(host_port);
        }

        inner.ip_allocator.release(addrs.ipv4.addr).await;
        inner.ip_allocator6.release(addrs.ipv6.addr).await;
    }
}
