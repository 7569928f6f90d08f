//! CIDR math shared by the allocators and the bridge-selection path.
//!
//! Positions inside a subnet are plain integers: IPv4 addresses convert to
//! `u32`, IPv6 addresses to a `(high, low)` pair of `u64` halves, and all
//! arithmetic happens on those.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{NetworkError, NetworkResult};

/// An IP network: address plus prefix length, with the address always
/// normalized to the network address (host bits cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix: u8) -> NetworkResult<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(NetworkError::InvalidCidr(format!("{addr}/{prefix}")));
        }
        Ok(Self {
            addr: mask_addr(addr, prefix),
            prefix,
        })
    }

    /// The network address (first address of the range).
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// First and last addresses of the range, inclusive.
    pub fn range(&self) -> (IpAddr, IpAddr) {
        match self.addr {
            IpAddr::V4(a) => {
                let first = ipv4_to_u32(a);
                let last = first | !prefix_mask_v4(self.prefix);
                (IpAddr::V4(a), IpAddr::V4(u32_to_ipv4(last)))
            }
            IpAddr::V6(a) => {
                let first = u128::from(a);
                let last = first | !prefix_mask_v6(self.prefix);
                (IpAddr::V6(a), IpAddr::V6(Ipv6Addr::from(last)))
            }
        }
    }

    /// Whether `ip` falls inside this network. Always false across families.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                ipv4_to_u32(ip) & prefix_mask_v4(self.prefix) == ipv4_to_u32(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & prefix_mask_v6(self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }

    /// Detects overlap between two networks: containment and straddle cases
    /// both reduce to "one network's first address lies inside the other".
    pub fn overlaps(&self, other: &IpNetwork) -> bool {
        other.contains(self.addr) || self.contains(other.addr)
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpNetwork {
    type Err = NetworkError;

    fn from_str(s: &str) -> NetworkResult<Self> {
        let (addr, prefix) = split_cidr(s)?;
        IpNetwork::new(addr, prefix)
    }
}

/// An address as assigned to an interface: the (unmasked) address plus the
/// prefix of the network it lives on. `network()` recovers the subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceAddress {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IfaceAddress {
    pub fn network(&self) -> NetworkResult<IpNetwork> {
        IpNetwork::new(self.addr, self.prefix)
    }
}

impl fmt::Display for IfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IfaceAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> NetworkResult<Self> {
        let (addr, prefix) = split_cidr(s)?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(NetworkError::InvalidCidr(s.to_string()));
        }
        Ok(Self { addr, prefix })
    }
}

fn split_cidr(s: &str) -> NetworkResult<(IpAddr, u8)> {
    let bad = || NetworkError::InvalidCidr(s.to_string());
    let (addr, prefix) = s.split_once('/').ok_or_else(|| bad())?;
    let addr: IpAddr = addr.parse().map_err(|_| bad())?;
    let prefix: u8 = prefix.parse().map_err(|_| bad())?;
    Ok((addr, prefix))
}

fn mask_addr(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(a) => IpAddr::V4(u32_to_ipv4(ipv4_to_u32(a) & prefix_mask_v4(prefix))),
        IpAddr::V6(a) => IpAddr::V6(Ipv6Addr::from(u128::from(a) & prefix_mask_v6(prefix))),
    }
}

pub fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        !0u32 << (32 - prefix)
    }
}

pub fn prefix_mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        !0u128 << (128 - prefix)
    }
}

/// Big-endian identity on the 4-octet form.
pub fn ipv4_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

pub fn u32_to_ipv4(n: u32) -> Ipv4Addr {
    Ipv4Addr::from(n)
}

/// Splits the 16 octets into big-endian `(high, low)` 64-bit halves.
pub fn ipv6_to_pair(ip: Ipv6Addr) -> (u64, u64) {
    let n = u128::from(ip);
    ((n >> 64) as u64, n as u64)
}

pub fn pair_to_ipv6(hi: u64, lo: u64) -> Ipv6Addr {
    Ipv6Addr::from((u128::from(hi) << 64) | u128::from(lo))
}

/// Host count of an IPv4 netmask, network and broadcast included.
pub fn network_size_v4(prefix: u8) -> u32 {
    (!prefix_mask_v4(prefix)).wrapping_add(1)
}

/// The inverted IPv6 netmask as `(high, low)` halves. A `/64` yields
/// `(0, u64::MAX)`: the high half is fixed and the whole low half is usable.
pub fn network_size_v6(prefix: u8) -> (u64, u64) {
    let inv = !prefix_mask_v6(prefix);
    ((inv >> 64) as u64, inv as u64)
}
