//! Recording fakes for the capability seams, shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::addressing::IfaceAddress;
use crate::error::{NetworkError, NetworkResult};
use crate::filter::{FilterDriver, Protocol};
use crate::link::{LinkDriver, RouteEntry};
use crate::proxy::{Proxy, ProxyFactory};

const ACTIONS: &[&str] = &["-A", "-I", "-D", "-C", "-N", "-F", "-X"];

/// In-memory packet filter: tracks chains and rules per family so that
/// add/check/delete behave like the real binaries.
#[derive(Default)]
pub struct MockFilterDriver {
    calls: parking_lot::Mutex<Vec<String>>,
    rules: parking_lot::Mutex<HashSet<String>>,
    chains: parking_lot::Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    ipv6_nat: AtomicBool,
}

impl MockFilterDriver {
    pub fn new() -> Self {
        let driver = Self::default();
        driver.ipv6_nat.store(true, Ordering::Relaxed);
        driver
    }

    /// Every joined argument vector seen so far, ip6tables calls prefixed
    /// with `ip6 `.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    pub fn fail_everything(&self) {
        self.fail_all.store(true, Ordering::Relaxed);
    }

    pub fn disable_ipv6_nat(&self) {
        self.ipv6_nat.store(false, Ordering::Relaxed);
    }

    pub fn rule_installed(&self, fragment: &str) -> bool {
        self.rules.lock().iter().any(|r| r.contains(fragment))
    }

    fn apply(&self, family: &str, args: &[&str]) -> NetworkResult<Vec<u8>> {
        let joined = if family.is_empty() {
            args.join(" ")
        } else {
            format!("{family} {}", args.join(" "))
        };
        self.calls.lock().push(joined);

        if self.fail_all.load(Ordering::Relaxed) {
            return Err(NetworkError::FilterRuleFailure {
                output: "forced failure".to_string(),
            });
        }

        let Some(action_idx) = args.iter().position(|a| ACTIONS.contains(a)) else {
            return Ok(Vec::new());
        };
        let action = args[action_idx];
        let mut key_parts: Vec<&str> = args.to_vec();
        key_parts.remove(action_idx);
        let key = format!("{family} {}", key_parts.join(" "));

        let failure = |what: &str| NetworkError::FilterRuleFailure {
            output: format!("{what}: {key}"),
        };

        match action {
            "-N" => {
                if !self.chains.lock().insert(key.clone()) {
                    return Err(failure("chain exists"));
                }
            }
            "-X" | "-F" => {
                let mut chains = self.chains.lock();
                let existed = if action == "-X" {
                    chains.remove(&key)
                } else {
                    chains.contains(&key)
                };
                if !existed {
                    return Err(failure("no such chain"));
                }
            }
            "-A" | "-I" => {
                self.rules.lock().insert(key);
            }
            "-D" => {
                if !self.rules.lock().remove(&key) {
                    return Err(failure("no such rule"));
                }
            }
            "-C" => {
                if !self.rules.lock().contains(&key) {
                    return Err(failure("rule absent"));
                }
            }
            _ => {}
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl FilterDriver for MockFilterDriver {
    async fn raw(&self, args: &[&str]) -> NetworkResult<Vec<u8>> {
        self.apply("", args)
    }

    async fn raw6(&self, args: &[&str]) -> NetworkResult<Vec<u8>> {
        if !self.ipv6_nat.load(Ordering::Relaxed) {
            return Err(NetworkError::UnsupportedIpv6Nat);
        }
        self.apply("ip6", args)
    }
}

/// In-memory link driver with preloaded routes and interfaces.
#[derive(Default)]
pub struct MockLinkDriver {
    pub routes: parking_lot::Mutex<Vec<RouteEntry>>,
    links: parking_lot::Mutex<HashMap<String, Vec<IfaceAddress>>>,
    calls: parking_lot::Mutex<Vec<String>>,
}

impl MockLinkDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_existing_link(&self, name: &str, addrs: Vec<IfaceAddress>) {
        self.links.lock().insert(name.to_string(), addrs);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LinkDriver for MockLinkDriver {
    async fn add_bridge(&self, name: &str) -> NetworkResult<()> {
        self.calls.lock().push(format!("add_bridge {name}"));
        self.links.lock().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn addr_add(&self, iface: &str, addr: IfaceAddress) -> NetworkResult<()> {
        self.calls.lock().push(format!("addr_add {iface} {addr}"));
        let mut links = self.links.lock();
        let Some(addrs) = links.get_mut(iface) else {
            return Err(NetworkError::LinkNotFound {
                name: iface.to_string(),
            });
        };
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
        Ok(())
    }

    async fn link_up(&self, iface: &str) -> NetworkResult<()> {
        self.calls.lock().push(format!("link_up {iface}"));
        if !self.links.lock().contains_key(iface) {
            return Err(NetworkError::LinkNotFound {
                name: iface.to_string(),
            });
        }
        Ok(())
    }

    async fn get_routes(&self) -> NetworkResult<Vec<RouteEntry>> {
        Ok(self.routes.lock().clone())
    }

    async fn interface_addrs(&self, iface: &str) -> NetworkResult<Vec<IfaceAddress>> {
        self.links
            .lock()
            .get(iface)
            .cloned()
            .ok_or_else(|| NetworkError::LinkNotFound {
                name: iface.to_string(),
            })
    }
}

/// Proxy factory that hands out inert recording proxies.
#[derive(Default)]
pub struct MockProxyFactory {
    fail: AtomicBool,
    created: parking_lot::Mutex<Vec<Arc<MockProxy>>>,
}

impl MockProxyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::Relaxed);
    }

    pub fn created(&self) -> Vec<Arc<MockProxy>> {
        self.created.lock().clone()
    }

    pub fn live_count(&self) -> usize {
        self.created.lock().iter().filter(|p| !p.is_closed()).count()
    }
}

#[async_trait]
impl ProxyFactory for MockProxyFactory {
    async fn new_proxy(
        &self,
        frontend: SocketAddr,
        backend: SocketAddr,
        proto: Protocol,
    ) -> NetworkResult<Arc<dyn Proxy>> {
        if self.fail.swap(false, Ordering::Relaxed) {
            return Err(NetworkError::ProxyStartFailure {
                addr: frontend.to_string(),
                reason: "mock refusal".to_string(),
            });
        }
        let proxy = Arc::new(MockProxy {
            frontend,
            backend,
            proto,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        self.created.lock().push(proxy.clone());
        Ok(proxy)
    }
}

pub struct MockProxy {
    pub frontend: SocketAddr,
    pub backend: SocketAddr,
    pub proto: Protocol,
    closed: AtomicBool,
    shutdown: Notify,
}

impl MockProxy {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Proxy for MockProxy {
    async fn run(&self) {
        while !self.is_closed() {
            self.shutdown.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    fn frontend(&self) -> SocketAddr {
        self.frontend
    }
}
