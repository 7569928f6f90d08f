//! Couples one host endpoint to one container backend.
//!
//! Every mapping is a NAT rule plus a userspace proxy, created and torn
//! down together: at any quiescent point a host port is either fully
//! mapped or absent from the tables, the filter, and the proxy set.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::{NetworkError, NetworkResult};
use crate::filter::{
    new_chain, new_chain6, remove_existing_chain, Action, Chain, FilterDriver, Protocol,
};
use crate::proxy::{Proxy, ProxyFactory};

/// Name of the NAT chain owned by this crate.
pub const CHAIN_NAME: &str = "SEAM";

pub struct PortMapper {
    chain: Option<Chain>,
    chain6: Option<Chain>,
    proxies: Arc<dyn ProxyFactory>,
    state: tokio::sync::Mutex<MapperState>,
}

#[derive(Default)]
struct MapperState {
    tcp: HashMap<u16, Mapping>,
    udp: HashMap<u16, Mapping>,
}

impl MapperState {
    fn table_mut(&mut self, proto: Protocol) -> &mut HashMap<u16, Mapping> {
        match proto {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        }
    }
}

struct Mapping {
    host_ip: IpAddr,
    backend: SocketAddr,
    proxy: Arc<dyn Proxy>,
}

impl PortMapper {
    /// Build the mapper, recreating this crate's NAT chains from scratch.
    /// Chains possibly left behind by a crashed predecessor are removed
    /// first. With `driver` absent the mapper runs proxy-only.
    pub async fn new(
        driver: Option<Arc<dyn FilterDriver>>,
        bridge: &str,
        proxies: Arc<dyn ProxyFactory>,
    ) -> NetworkResult<Self> {
        let (chain, chain6) = match driver {
            Some(driver) => {
                remove_existing_chain(driver.clone(), CHAIN_NAME, false).await;
                remove_existing_chain(driver.clone(), CHAIN_NAME, true).await;

                let chain = new_chain(driver.clone(), CHAIN_NAME, bridge).await?;
                let chain6 = match new_chain6(driver, CHAIN_NAME, bridge).await {
                    Ok(chain6) => Some(chain6),
                    Err(NetworkError::UnsupportedIpv6Nat) => {
                        tracing::warn!("IPv6 NAT unsupported, IPv6 port publishing disabled");
                        None
                    }
                    Err(e) => return Err(e),
                };
                (Some(chain), chain6)
            }
            None => (None, None),
        };

        Ok(Self {
            chain,
            chain6,
            proxies,
            state: tokio::sync::Mutex::new(MapperState::default()),
        })
    }

    /// Publish `(host_ip, host_port)` to `backend`: install the DNAT and
    /// FORWARD-ACCEPT rules, then start the userspace proxy. Rolls the
    /// rules back if the proxy cannot bind.
    pub async fn map(
        &self,
        host_ip: IpAddr,
        host_port: u16,
        backend: SocketAddr,
        proto: Protocol,
    ) -> NetworkResult<()> {
        let mut state = self.state.lock().await;
        if state.table_mut(proto).contains_key(&host_port) {
            return Err(NetworkError::PortInUse { port: host_port });
        }

        let chain = self.chain_for(host_ip)?;
        if let Some(chain) = chain {
            chain
                .forward(
                    Action::Add,
                    host_ip,
                    host_port,
                    proto,
                    backend.ip(),
                    backend.port(),
                )
                .await?;
        }

        let frontend = SocketAddr::new(host_ip, host_port);
        let proxy = match self.proxies.new_proxy(frontend, backend, proto).await {
            Ok(proxy) => proxy,
            Err(e) => {
                if let Some(chain) = chain {
                    if let Err(undo) = chain
                        .forward(
                            Action::Delete,
                            host_ip,
                            host_port,
                            proto,
                            backend.ip(),
                            backend.port(),
                        )
                        .await
                    {
                        tracing::warn!("could not undo filter rule for {frontend}: {undo}");
                    }
                }
                return Err(e);
            }
        };

        let runner = proxy.clone();
        tokio::spawn(async move { runner.run().await });

        state.table_mut(proto).insert(
            host_port,
            Mapping {
                host_ip,
                backend,
                proxy,
            },
        );
        tracing::info!("mapped {proto} {frontend} -> {backend}");
        Ok(())
    }

    /// Remove the mapping for `(host_port, proto)`: stop the proxy, then
    /// remove the filter rules. The entry is dropped even when rule
    /// removal fails; that failure is surfaced to the caller.
    pub async fn unmap(
        &self,
        host_ip: IpAddr,
        host_port: u16,
        proto: Protocol,
    ) -> NetworkResult<()> {
        let mut state = self.state.lock().await;
        let Some(mapping) = state.table_mut(proto).remove(&host_port) else {
            return Err(NetworkError::PortNotMapped {
                proto,
                port: host_port,
            });
        };

        mapping.proxy.close();

        if let Ok(Some(chain)) = self.chain_for(mapping.host_ip) {
            chain
                .forward(
                    Action::Delete,
                    mapping.host_ip,
                    host_port,
                    proto,
                    mapping.backend.ip(),
                    mapping.backend.port(),
                )
                .await?;
        }

        tracing::info!("unmapped {proto} {host_ip}:{host_port}");
        Ok(())
    }

    /// Whether a mapping is currently recorded for `(host_port, proto)`.
    pub async fn is_mapped(&self, host_port: u16, proto: Protocol) -> bool {
        let mut state = self.state.lock().await;
        state.table_mut(proto).contains_key(&host_port)
    }

    /// The chain matching the host address family, or an error when IPv6
    /// publishing was requested but the kernel cannot NAT IPv6.
    fn chain_for(&self, host_ip: IpAddr) -> NetworkResult<Option<&Chain>> {
        if host_ip.is_ipv4() {
            return Ok(self.chain.as_ref());
        }
        match (&self.chain, &self.chain6) {
            // Filtering disabled entirely: proxy-only is fine.
            (None, _) => Ok(None),
            (Some(_), Some(chain6)) => Ok(Some(chain6)),
            (Some(_), None) => Err(NetworkError::UnsupportedIpv6Nat),
        }
    }
}
