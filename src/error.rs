use std::net::IpAddr;

use crate::filter::Protocol;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("no available ip addresses on network {network}")]
    NoAvailableAddresses { network: String },

    #[error("ip {ip} is already allocated")]
    AddressAlreadyAllocated { ip: IpAddr },

    #[error("ip {ip} is outside network {network}")]
    AddressOutOfRange { ip: IpAddr, network: String },

    #[error("allocator for network {network} handed out the gateway {ip} twice")]
    GatewayCollision { network: String, ip: IpAddr },

    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("port {proto}/{port} is not mapped")]
    PortNotMapped { proto: Protocol, port: u16 },

    #[error("network {network} overlaps existing route {route}")]
    NetworkOverlapsRoute { network: String, route: String },

    #[error("network {network} overlaps nameserver {nameserver}")]
    NetworkOverlapsNameserver { network: String, nameserver: String },

    #[error("no free address range for bridge {bridge}; configure its address manually")]
    NoFreeBridgeCidr { bridge: String },

    #[error("packet filter unavailable: {reason}")]
    FilterUnavailable { reason: String },

    #[error("packet filter rule failed: {output}")]
    FilterRuleFailure { output: String },

    #[error("kernel does not support IPv6 NAT (3.7.0 or newer required)")]
    UnsupportedIpv6Nat,

    #[error("proxy failed to start on {addr}: {reason}")]
    ProxyStartFailure { addr: String, reason: String },

    #[error("interface {name} has no {family} address")]
    NoInterfaceAddress { name: String, family: &'static str },

    #[error("link {name} not found")]
    LinkNotFound { name: String },

    #[error("network interface is disabled")]
    InterfaceDisabled,

    #[error("allocator is closed")]
    AllocatorClosed,

    #[error("invalid cidr '{0}'")]
    InvalidCidr(String),

    #[error("unknown protocol '{0}'")]
    InvalidProtocol(String),

    #[error("invalid port specification '{0}'")]
    InvalidPort(String),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NetworkResult<T> = Result<T, NetworkError>;
