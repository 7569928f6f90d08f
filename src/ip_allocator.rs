//! Per-subnet IP allocation.
//!
//! One allocator per bridge per address family. All state lives on a
//! dedicated task and every operation is a message to it, so acquisition
//! order is exactly request order and no locks are held across awaits.
//!
//! The task keeps the next candidate computed ahead of time. Releases that
//! arrive while a valid candidate is waiting only clear the ledger entry —
//! the round-robin sweep rediscovers the position later, which keeps
//! recently released addresses out of circulation while fresher ones
//! remain. A release that arrives after the pool was exhausted is handed
//! out immediately on the next acquire.

use std::net::IpAddr;

use tokio::sync::{mpsc, oneshot};

use crate::addressing::{
    ipv4_to_u32, ipv6_to_pair, network_size_v6, pair_to_ipv6, u32_to_ipv4, IpNetwork,
};
use crate::error::{NetworkError, NetworkResult};
use crate::ordered_set::OrderedIntSet;

/// Handle to a per-subnet allocator task.
pub struct IpAllocator {
    network: IpNetwork,
    gateway: IpAddr,
    tx: parking_lot::Mutex<Option<mpsc::Sender<Request>>>,
}

enum Request {
    Acquire {
        reply: oneshot::Sender<NetworkResult<IpAddr>>,
    },
    AcquireExact {
        ip: IpAddr,
        reply: oneshot::Sender<NetworkResult<IpAddr>>,
    },
    Release {
        ip: IpAddr,
    },
}

impl IpAllocator {
    /// Create the allocator for `network` and spawn its task. `gateway` is
    /// the bridge's own address; its position is never handed out.
    pub fn new(network: IpNetwork, gateway: IpAddr) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let task = AllocatorTask::new(network, gateway);
        tokio::spawn(task.run(rx));
        Self {
            network,
            gateway,
            tx: parking_lot::Mutex::new(Some(tx)),
        }
    }

    pub fn network(&self) -> IpNetwork {
        self.network
    }

    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    /// Next free address, or [`NetworkError::NoAvailableAddresses`] when
    /// the subnet is exhausted.
    pub async fn acquire(&self) -> NetworkResult<IpAddr> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Acquire { reply }).await?;
        rx.await.map_err(|_| NetworkError::AllocatorClosed)?
    }

    /// Claim a specific address, failing when it is reserved, outside the
    /// subnet, or already handed out.
    pub async fn acquire_exact(&self, ip: IpAddr) -> NetworkResult<IpAddr> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::AcquireExact { ip, reply }).await?;
        rx.await.map_err(|_| NetworkError::AllocatorClosed)?
    }

    /// Return an address to the pool. Unknown addresses are tolerated.
    pub async fn release(&self, ip: IpAddr) {
        if self.send(Request::Release { ip }).await.is_err() {
            tracing::debug!("release of {ip} after allocator close, ignored");
        }
    }

    /// Stop the allocator task. Idempotent; later operations fail with
    /// [`NetworkError::AllocatorClosed`].
    pub fn close(&self) {
        self.tx.lock().take();
    }

    async fn send(&self, request: Request) -> NetworkResult<()> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(NetworkError::AllocatorClosed);
        };
        tx.send(request)
            .await
            .map_err(|_| NetworkError::AllocatorClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Position(u64),
    Exhausted,
}

/// Position arithmetic for one address family. IPv6 allocation is confined
/// to the low 64 bits with the high half fixed; /64 networks are the norm
/// and narrower prefixes still draw only from their low half.
enum AddrSpace {
    V4 { first: u32 },
    V6 { hi: u64, lo_first: u64 },
}

impl AddrSpace {
    fn pos_to_ip(&self, pos: u64) -> IpAddr {
        match self {
            AddrSpace::V4 { first } => IpAddr::V4(u32_to_ipv4(first.wrapping_add(pos as u32))),
            AddrSpace::V6 { hi, lo_first } => {
                IpAddr::V6(pair_to_ipv6(*hi, lo_first.wrapping_add(pos)))
            }
        }
    }

    fn ip_to_pos(&self, ip: IpAddr) -> Option<u64> {
        match (self, ip) {
            (AddrSpace::V4 { first }, IpAddr::V4(ip)) => {
                ipv4_to_u32(ip).checked_sub(*first).map(u64::from)
            }
            (AddrSpace::V6 { hi, lo_first }, IpAddr::V6(ip)) => {
                let (ip_hi, ip_lo) = ipv6_to_pair(ip);
                if ip_hi != *hi {
                    return None;
                }
                ip_lo.checked_sub(*lo_first)
            }
            _ => None,
        }
    }
}

struct AllocatorTask {
    space: AddrSpace,
    /// Highest usable position; positions run 1..=max.
    max: u64,
    gateway_pos: Option<u64>,
    allocated: OrderedIntSet,
    available: OrderedIntSet,
    pending: Option<Candidate>,
    network: String,
}

impl AllocatorTask {
    fn new(network: IpNetwork, gateway: IpAddr) -> Self {
        let (space, max) = match network.addr() {
            IpAddr::V4(first) => {
                let size = 1u64 << (32 - network.prefix());
                (
                    AddrSpace::V4 {
                        first: ipv4_to_u32(first),
                    },
                    // One off the top for broadcast, one for the gateway.
                    size.saturating_sub(2),
                )
            }
            IpAddr::V6(first) => {
                let (hi, lo_first) = ipv6_to_pair(first);
                let (_, lo_size) = network_size_v6(network.prefix());
                (AddrSpace::V6 { hi, lo_first }, lo_size)
            }
        };
        let gateway_pos = space.ip_to_pos(gateway).filter(|&p| p >= 1 && p <= max);
        Self {
            space,
            max,
            gateway_pos,
            allocated: OrderedIntSet::new(),
            available: OrderedIntSet::new(),
            pending: None,
            network: network.to_string(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        self.refill();
        while let Some(request) = rx.recv().await {
            match request {
                Request::Acquire { reply } => self.handle_acquire(reply),
                Request::AcquireExact { ip, reply } => self.handle_acquire_exact(ip, reply),
                Request::Release { ip } => self.handle_release(ip),
            }
        }
        tracing::debug!("ip allocator for {} stopped", self.network);
    }

    fn handle_acquire(&mut self, reply: oneshot::Sender<NetworkResult<IpAddr>>) {
        let candidate = self.pending.take().unwrap_or_else(|| self.next_candidate());
        match candidate {
            Candidate::Position(pos) => {
                self.allocated.push(pos);
                let ip = self.space.pos_to_ip(pos);
                if reply.send(Ok(ip)).is_err() {
                    // Caller cancelled before the commit reached it; take
                    // the position back so nothing leaks.
                    self.allocated.remove(pos);
                }
            }
            Candidate::Exhausted => {
                let _ = reply.send(Err(NetworkError::NoAvailableAddresses {
                    network: self.network.clone(),
                }));
            }
        }
        self.refill();
    }

    fn handle_acquire_exact(&mut self, ip: IpAddr, reply: oneshot::Sender<NetworkResult<IpAddr>>) {
        match self.register(ip) {
            Ok(pos) => {
                if self.pending == Some(Candidate::Position(pos)) {
                    self.pending = None;
                }
                if reply.send(Ok(ip)).is_err() {
                    self.allocated.remove(pos);
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
        self.refill();
    }

    fn register(&mut self, ip: IpAddr) -> NetworkResult<u64> {
        let pos = match self.space.ip_to_pos(ip) {
            Some(pos) if pos >= 1 && pos <= self.max => pos,
            _ => {
                return Err(NetworkError::AddressOutOfRange {
                    ip,
                    network: self.network.clone(),
                })
            }
        };
        // The first host and the gateway are permanently reserved.
        if pos == 1 || Some(pos) == self.gateway_pos || self.allocated.exists(pos) {
            return Err(NetworkError::AddressAlreadyAllocated { ip });
        }
        self.allocated.push(pos);
        self.available.remove(pos);
        Ok(pos)
    }

    fn handle_release(&mut self, ip: IpAddr) {
        let Some(pos) = self.space.ip_to_pos(ip) else {
            tracing::warn!("release of {ip} outside network {}, ignored", self.network);
            return;
        };
        if pos == 0 || pos > self.max {
            tracing::warn!("release of {ip} outside network {}, ignored", self.network);
            return;
        }
        self.allocated.remove(pos);
        if self.pending == Some(Candidate::Exhausted) {
            // The pool was dry: hand this address out on the very next
            // acquire instead of waiting for the sweep to come around.
            self.available.push(pos);
            self.pending = None;
            self.refill();
        }
    }

    fn refill(&mut self) {
        if self.pending.is_none() {
            self.pending = Some(self.next_candidate());
        }
    }

    fn next_candidate(&mut self) -> Candidate {
        while let Some(pos) = self.available.pop() {
            if pos != 1 && Some(pos) != self.gateway_pos && !self.allocated.exists(pos) {
                return Candidate::Position(pos);
            }
        }
        self.sweep()
    }

    /// Round-robin over 1..=max starting after the most recent allocation,
    /// skipping the reserved positions. Gives up after one whole round.
    fn sweep(&mut self) -> Candidate {
        if self.max == 0 {
            return Candidate::Exhausted;
        }
        let mut pos = self.allocated.pull_back().unwrap_or(0);
        for _ in 0..self.max {
            pos = pos % self.max + 1;
            if pos == 1 || Some(pos) == self.gateway_pos {
                continue;
            }
            if !self.allocated.exists(pos) {
                return Candidate::Position(pos);
            }
        }
        Candidate::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(gateway_cidr: &str) -> IpAllocator {
        let addr: crate::addressing::IfaceAddress = gateway_cidr.parse().unwrap();
        IpAllocator::new(addr.network().unwrap(), addr.addr)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn sequential_v4_on_a_29() {
        let alloc = allocator("127.0.0.1/29");

        for expected in ["127.0.0.2", "127.0.0.3", "127.0.0.4", "127.0.0.5", "127.0.0.6"] {
            assert_eq!(alloc.acquire().await.unwrap(), ip(expected));
        }
        assert!(matches!(
            alloc.acquire().await,
            Err(NetworkError::NoAvailableAddresses { .. })
        ));

        alloc.release(ip("127.0.0.5")).await;
        alloc.release(ip("127.0.0.4")).await;
        alloc.release(ip("127.0.0.6")).await;

        // The first released address returns immediately; the sweep then
        // continues from it rather than replaying release order.
        assert_eq!(alloc.acquire().await.unwrap(), ip("127.0.0.5"));
        assert_eq!(alloc.acquire().await.unwrap(), ip("127.0.0.6"));
        assert_eq!(alloc.acquire().await.unwrap(), ip("127.0.0.4"));

        assert!(alloc.acquire().await.is_err());
    }

    #[tokio::test]
    async fn sequential_v6_on_a_125() {
        let alloc = allocator("2001:db8::1/125");

        for expected in [
            "2001:db8::2",
            "2001:db8::3",
            "2001:db8::4",
            "2001:db8::5",
            "2001:db8::6",
            "2001:db8::7",
        ] {
            assert_eq!(alloc.acquire().await.unwrap(), ip(expected));
        }
        assert!(matches!(
            alloc.acquire().await,
            Err(NetworkError::NoAvailableAddresses { .. })
        ));

        alloc.release(ip("2001:db8::5")).await;
        alloc.release(ip("2001:db8::4")).await;
        alloc.release(ip("2001:db8::6")).await;

        assert_eq!(alloc.acquire().await.unwrap(), ip("2001:db8::5"));
        assert_eq!(alloc.acquire().await.unwrap(), ip("2001:db8::6"));
        assert_eq!(alloc.acquire().await.unwrap(), ip("2001:db8::4"));

        assert!(alloc.acquire().await.is_err());
    }

    #[tokio::test]
    async fn v6_64_prefix_allocates_in_low_half() {
        let alloc = allocator("fd00:1:2:3::1/64");
        assert_eq!(alloc.acquire().await.unwrap(), ip("fd00:1:2:3::2"));
        assert_eq!(alloc.acquire().await.unwrap(), ip("fd00:1:2:3::3"));
    }

    #[tokio::test]
    async fn gateway_off_the_first_position_is_skipped() {
        let alloc = allocator("172.17.42.1/16");
        // Position 1 and the gateway (172.17.42.1) are both reserved.
        assert_eq!(alloc.acquire().await.unwrap(), ip("172.17.0.2"));
        assert_eq!(alloc.acquire().await.unwrap(), ip("172.17.0.3"));
        assert!(matches!(
            alloc.acquire_exact(ip("172.17.42.1")).await,
            Err(NetworkError::AddressAlreadyAllocated { .. })
        ));
        assert!(matches!(
            alloc.acquire_exact(ip("172.17.0.1")).await,
            Err(NetworkError::AddressAlreadyAllocated { .. })
        ));
    }

    #[tokio::test]
    async fn released_address_is_reused_after_exhaustion() {
        let alloc = allocator("10.0.0.1/30");
        // /30: one usable position (2); position 1 doubles as the gateway.
        assert_eq!(alloc.acquire().await.unwrap(), ip("10.0.0.2"));
        assert!(alloc.acquire().await.is_err());

        alloc.release(ip("10.0.0.2")).await;
        assert_eq!(alloc.acquire().await.unwrap(), ip("10.0.0.2"));
    }

    #[tokio::test]
    async fn rapid_acquire_release_acquire_round_robins() {
        let alloc = allocator("127.0.0.1/29");
        let first = alloc.acquire().await.unwrap();
        assert_eq!(first, ip("127.0.0.2"));
        alloc.release(first).await;
        // The freshly released address is not replayed while others are
        // free; the sweep moves on.
        assert_eq!(alloc.acquire().await.unwrap(), ip("127.0.0.3"));
    }

    #[tokio::test]
    async fn acquire_exact_claims_and_conflicts() {
        let alloc = allocator("192.168.42.1/24");
        assert_eq!(
            alloc.acquire_exact(ip("192.168.42.99")).await.unwrap(),
            ip("192.168.42.99")
        );
        assert!(matches!(
            alloc.acquire_exact(ip("192.168.42.99")).await,
            Err(NetworkError::AddressAlreadyAllocated { .. })
        ));
        assert!(matches!(
            alloc.acquire_exact(ip("10.9.9.9")).await,
            Err(NetworkError::AddressOutOfRange { .. })
        ));
        // A dynamic acquire never trips over the explicit claim.
        for _ in 0..96 {
            let got = alloc.acquire().await.unwrap();
            assert_ne!(got, ip("192.168.42.99"));
        }
    }

    #[tokio::test]
    async fn release_of_unknown_address_is_harmless() {
        let alloc = allocator("10.1.0.1/24");
        alloc.release(ip("10.1.0.200")).await;
        alloc.release(ip("8.8.8.8")).await;
        assert_eq!(alloc.acquire().await.unwrap(), ip("10.1.0.2"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_calls() {
        let alloc = allocator("10.2.0.1/24");
        alloc.close();
        alloc.close();
        assert!(matches!(
            alloc.acquire().await,
            Err(NetworkError::AllocatorClosed)
        ));
        alloc.release(ip("10.2.0.2")).await;
    }
}
