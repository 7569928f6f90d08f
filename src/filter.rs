//! Packet-filter driver and the NAT chain built on top of it.
//!
//! The driver is the raw capability: run one iptables/ip6tables invocation
//! and hand back its output. Everything with structure — the named chain,
//! the PREROUTING/OUTPUT jumps, the per-mapping DNAT+FORWARD pairs — lives
//! here and goes through the driver, so tests can swap in a recorder and
//! the manager can run with filtering disabled.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{NetworkError, NetworkResult};

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = NetworkError;

    fn from_str(s: &str) -> NetworkResult<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(NetworkError::InvalidProtocol(other.to_string())),
        }
    }
}

/// Rule action: append or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "-A",
            Action::Delete => "-D",
        }
    }
}

/// Raw access to the host packet filter, one table mutation per call.
#[async_trait]
pub trait FilterDriver: Send + Sync {
    /// Run iptables with `args`, returning its combined output on success.
    async fn raw(&self, args: &[&str]) -> NetworkResult<Vec<u8>>;

    /// Run ip6tables with `args`. Fails with [`NetworkError::UnsupportedIpv6Nat`]
    /// when the kernel cannot NAT IPv6.
    async fn raw6(&self, args: &[&str]) -> NetworkResult<Vec<u8>>;
}

/// Whether a rule matching `args` is installed (iptables `-C`).
pub async fn exists(driver: &dyn FilterDriver, args: &[&str]) -> bool {
    let mut check = vec!["-C"];
    check.extend_from_slice(args);
    driver.raw(&check).await.is_ok()
}

/// Run one iptables mutation, treating any output as failure: the filter
/// binaries only print diagnostics for table mutations.
pub async fn raw_checked(driver: &dyn FilterDriver, args: &[&str]) -> NetworkResult<()> {
    let output = driver.raw(args).await?;
    if !output.is_empty() {
        return Err(NetworkError::FilterRuleFailure {
            output: String::from_utf8_lossy(&output).trim().to_string(),
        });
    }
    Ok(())
}

/// Production driver shelling out to iptables/ip6tables.
pub struct IptablesDriver {
    ipv6_nat: bool,
}

impl IptablesDriver {
    pub fn new() -> Self {
        let ipv6_nat = kernel_supports_ipv6_nat();
        if !ipv6_nat {
            tracing::warn!("kernel is too old for IPv6 NAT, ip6tables mutations are refused");
        }
        Self { ipv6_nat }
    }

    async fn exec(&self, binary: &str, args: &[&str]) -> NetworkResult<Vec<u8>> {
        tracing::debug!("[{binary}] {}", args.join(" "));
        let output = tokio::process::Command::new(binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    NetworkError::FilterUnavailable {
                        reason: format!("{binary} not found"),
                    }
                } else {
                    NetworkError::Io(e)
                }
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if !output.status.success() {
            return Err(NetworkError::FilterRuleFailure {
                output: format!(
                    "{binary} {}: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&combined).trim()
                ),
            });
        }
        Ok(combined)
    }
}

impl Default for IptablesDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FilterDriver for IptablesDriver {
    async fn raw(&self, args: &[&str]) -> NetworkResult<Vec<u8>> {
        self.exec("iptables", args).await
    }

    async fn raw6(&self, args: &[&str]) -> NetworkResult<Vec<u8>> {
        if !self.ipv6_nat {
            return Err(NetworkError::UnsupportedIpv6Nat);
        }
        self.exec("ip6tables", args).await
    }
}

/// A named NAT chain with PREROUTING and OUTPUT jumps restricted to
/// locally-destined traffic. One per bridge per address family.
pub struct Chain {
    name: String,
    bridge: String,
    ipv6: bool,
    driver: Arc<dyn FilterDriver>,
}

/// Create `name` in the nat table and wire the PREROUTING/OUTPUT jumps.
pub async fn new_chain(
    driver: Arc<dyn FilterDriver>,
    name: &str,
    bridge: &str,
) -> NetworkResult<Chain> {
    build_chain(driver, name, bridge, false).await
}

/// IPv6 twin of [`new_chain`]; fails on kernels without IPv6 NAT.
pub async fn new_chain6(
    driver: Arc<dyn FilterDriver>,
    name: &str,
    bridge: &str,
) -> NetworkResult<Chain> {
    build_chain(driver, name, bridge, true).await
}

async fn build_chain(
    driver: Arc<dyn FilterDriver>,
    name: &str,
    bridge: &str,
    ipv6: bool,
) -> NetworkResult<Chain> {
    let chain = Chain {
        name: name.to_string(),
        bridge: bridge.to_string(),
        ipv6,
        driver,
    };
    chain.run_checked(&["-t", "nat", "-N", name]).await?;
    chain
        .jump(Action::Add, "PREROUTING", &["-m", "addrtype", "--dst-type", "LOCAL"])
        .await?;
    let loopback = if ipv6 { "::1/128" } else { "127.0.0.0/8" };
    chain
        .jump(
            Action::Add,
            "OUTPUT",
            &["-m", "addrtype", "--dst-type", "LOCAL", "!", "--dst", loopback],
        )
        .await?;
    Ok(chain)
}

/// Tear down a chain left over from a previous run. Errors are ignored:
/// the chain may simply never have existed.
pub async fn remove_existing_chain(driver: Arc<dyn FilterDriver>, name: &str, ipv6: bool) {
    let chain = Chain {
        name: name.to_string(),
        bridge: String::new(),
        ipv6,
        driver,
    };
    chain.remove().await;
}

impl Chain {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install or delete the DNAT entry for one published port, plus the
    /// FORWARD-ACCEPT rule for the return path. For FORWARD, an add is
    /// promoted to an insert so the accept lands ahead of reject rules.
    pub async fn forward(
        &self,
        action: Action,
        ip: IpAddr,
        port: u16,
        proto: Protocol,
        dest_addr: IpAddr,
        dest_port: u16,
    ) -> NetworkResult<()> {
        // iptables reads a bare unspecified address as a /32 host match;
        // "0/0" means any destination in both iptables and ip6tables.
        let daddr = if ip.is_unspecified() {
            "0/0".to_string()
        } else {
            ip.to_string()
        };
        let port_s = port.to_string();
        let dest = SocketAddr::new(dest_addr, dest_port).to_string();
        self.run_checked(&[
            "-t",
            "nat",
            action.as_str(),
            &self.name,
            "-p",
            proto.as_str(),
            "-d",
            &daddr,
            "--dport",
            &port_s,
            "!",
            "-i",
            &self.bridge,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
        ])
        .await?;

        let fwd_action = match action {
            Action::Add => "-I",
            Action::Delete => "-D",
        };
        let dest_addr_s = dest_addr.to_string();
        let dest_port_s = dest_port.to_string();
        self.run_checked(&[
            fwd_action,
            "FORWARD",
            "!",
            "-i",
            &self.bridge,
            "-o",
            &self.bridge,
            "-p",
            proto.as_str(),
            "-d",
            &dest_addr_s,
            "--dport",
            &dest_port_s,
            "-j",
            "ACCEPT",
        ])
        .await
    }

    /// Remove this chain and its jumps. Errors are ignored throughout:
    /// teardown must tolerate state from a crashed predecessor.
    pub async fn remove(&self) {
        let loopback = if self.ipv6 { "::1/128" } else { "127.0.0.0/8" };
        let _ = self
            .jump(Action::Delete, "PREROUTING", &["-m", "addrtype", "--dst-type", "LOCAL"])
            .await;
        let _ = self
            .jump(
                Action::Delete,
                "OUTPUT",
                &["-m", "addrtype", "--dst-type", "LOCAL", "!", "--dst", loopback],
            )
            .await;
        // Very old releases installed the OUTPUT jump without the loopback
        // exclusion.
        let _ = self
            .jump(Action::Delete, "OUTPUT", &["-m", "addrtype", "--dst-type", "LOCAL"])
            .await;
        let _ = self.jump(Action::Delete, "PREROUTING", &[]).await;
        let _ = self.jump(Action::Delete, "OUTPUT", &[]).await;
        let _ = self.run(&["-t", "nat", "-F", &self.name]).await;
        let _ = self.run(&["-t", "nat", "-X", &self.name]).await;
    }

    async fn jump(&self, action: Action, hook: &str, extra: &[&str]) -> NetworkResult<()> {
        let mut args = vec!["-t", "nat", action.as_str(), hook];
        args.extend_from_slice(extra);
        args.extend_from_slice(&["-j", &self.name]);
        self.run_checked(&args).await
    }

    async fn run(&self, args: &[&str]) -> NetworkResult<Vec<u8>> {
        if self.ipv6 {
            self.driver.raw6(args).await
        } else {
            self.driver.raw(args).await
        }
    }

    /// Like [`Chain::run`], but any output at all counts as failure — the
    /// filter binaries print diagnostics, never results, for mutations.
    async fn run_checked(&self, args: &[&str]) -> NetworkResult<()> {
        let output = self.run(args).await?;
        if !output.is_empty() {
            return Err(NetworkError::FilterRuleFailure {
                output: String::from_utf8_lossy(&output).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// IPv6 NAT needs kernel 3.7.0 or newer.
pub fn kernel_supports_ipv6_nat() -> bool {
    match kernel_version() {
        Ok(version) => version >= (3, 7, 0),
        Err(e) => {
            tracing::warn!("could not determine kernel version: {e}");
            false
        }
    }
}

fn kernel_version() -> NetworkResult<(u32, u32, u32)> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")?;
    let release = release.trim();
    parse_kernel_release(release).ok_or_else(|| {
        NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unparseable kernel release '{release}'"),
        ))
    })
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32, u32)> {
    let base = release.split(['-', '+']).next()?;
    let mut parts = base.split('.').map(|p| p.parse::<u32>());
    let major = parts.next()?.ok()?;
    let minor = parts.next()?.ok()?;
    let micro = parts.next().and_then(|p| p.ok()).unwrap_or(0);
    Some((major, minor, micro))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockFilterDriver;

    #[test]
    fn action_and_protocol_strings() {
        assert_eq!(Action::Add.as_str(), "-A");
        assert_eq!(Action::Delete.as_str(), "-D");
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
        assert_eq!(Protocol::Udp.to_string(), "udp");
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("icmp".parse::<Protocol>().is_err());
    }

    #[test]
    fn kernel_release_parsing() {
        assert_eq!(parse_kernel_release("3.7.0"), Some((3, 7, 0)));
        assert_eq!(parse_kernel_release("6.8.0-45-generic"), Some((6, 8, 0)));
        assert_eq!(parse_kernel_release("5.15"), Some((5, 15, 0)));
        assert_eq!(parse_kernel_release("mystery"), None);
        assert!(parse_kernel_release("3.6.11").unwrap() < (3, 7, 0));
    }

    #[tokio::test]
    async fn new_chain_installs_jumps() {
        let driver = Arc::new(MockFilterDriver::new());
        let chain = new_chain(driver.clone(), "SEAM", "seam0").await.unwrap();
        assert_eq!(chain.name(), "SEAM");

        let calls = driver.calls();
        assert_eq!(
            calls,
            vec![
                "-t nat -N SEAM",
                "-t nat -A PREROUTING -m addrtype --dst-type LOCAL -j SEAM",
                "-t nat -A OUTPUT -m addrtype --dst-type LOCAL ! --dst 127.0.0.0/8 -j SEAM",
            ]
        );
    }

    #[tokio::test]
    async fn forward_emits_dnat_and_forward_accept() {
        let driver = Arc::new(MockFilterDriver::new());
        let chain = new_chain(driver.clone(), "SEAM", "seam0").await.unwrap();
        driver.clear();

        chain
            .forward(
                Action::Add,
                "0.0.0.0".parse().unwrap(),
                49153,
                Protocol::Tcp,
                "172.17.0.2".parse().unwrap(),
                8080,
            )
            .await
            .unwrap();

        let calls = driver.calls();
        assert_eq!(
            calls,
            vec![
                "-t nat -A SEAM -p tcp -d 0/0 --dport 49153 ! -i seam0 -j DNAT \
                 --to-destination 172.17.0.2:8080",
                "-I FORWARD ! -i seam0 -o seam0 -p tcp -d 172.17.0.2 --dport 8080 -j ACCEPT",
            ]
        );
    }

    #[tokio::test]
    async fn forward_delete_removes_both_rules() {
        let driver = Arc::new(MockFilterDriver::new());
        let chain = new_chain(driver.clone(), "SEAM", "seam0").await.unwrap();

        let args = (
            Action::Add,
            "10.0.0.1".parse::<IpAddr>().unwrap(),
            8000,
            Protocol::Udp,
            "172.17.0.3".parse::<IpAddr>().unwrap(),
            53,
        );
        chain
            .forward(args.0, args.1, args.2, args.3, args.4, args.5)
            .await
            .unwrap();
        assert!(driver.rule_installed("-j DNAT"));
        driver.clear();

        chain
            .forward(Action::Delete, args.1, args.2, args.3, args.4, args.5)
            .await
            .unwrap();

        let calls = driver.calls();
        assert!(calls[0].starts_with("-t nat -D SEAM -p udp -d 10.0.0.1"));
        assert!(calls[1].starts_with("-D FORWARD"));
        assert!(!driver.rule_installed("-j DNAT"));
    }

    #[tokio::test]
    async fn remove_swallows_errors() {
        let driver = Arc::new(MockFilterDriver::new());
        driver.fail_everything();
        remove_existing_chain(driver.clone(), "SEAM", false).await;
        // All seven teardown commands attempted despite every one failing.
        assert_eq!(driver.calls().len(), 7);
    }
}
