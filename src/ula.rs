//! IPv6 Unique Local Address generation, RFC 4193 style.
//!
//! The global ID is the SHA-1 of local entropy: the current time, the best
//! available interface MAC, and bytes from `/dev/urandom`. The first octet
//! is forced to `0xFC` and the result is presented as a /64 network.

use std::net::{IpAddr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

use crate::addressing::IpNetwork;
use crate::error::NetworkResult;

/// Generate a pseudo-random ULA /64 for a new bridge.
pub fn generate_ula() -> NetworkResult<IpNetwork> {
    let mut hasher = Sha1::new();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    hasher.update(now.to_be_bytes());
    hasher.update(find_mac().unwrap_or(0).to_be_bytes());

    let mut random = [0u8; 8];
    {
        use std::io::Read as _;
        let mut urandom = std::fs::File::open("/dev/urandom")?;
        urandom.read_exact(&mut random)?;
    }
    hasher.update(random);

    let digest = hasher.finalize();

    let mut octets = [0u8; 16];
    octets[0] = 0xFC;
    octets[1..8].copy_from_slice(&digest[..7]);
    let addr = Ipv6Addr::from(octets);

    // /64 with a zeroed host half: already the network address.
    IpNetwork::new(IpAddr::V6(addr), 64)
}

/// The first interface MAC that is neither all-zero nor the value 1,
/// encoded as a 48-bit integer. Loopback and fresh tun devices report
/// zeros and are skipped.
fn find_mac() -> Option<u64> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        let path = entry.path().join("address");
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        if let Some(mac) = parse_mac(contents.trim()) {
            if mac > 1 {
                return Some(mac);
            }
        }
    }
    None
}

fn parse_mac(s: &str) -> Option<u64> {
    let mut value: u64 = 0;
    let mut count = 0;
    for part in s.split(':') {
        value = (value << 8) | u64::from(u8::from_str_radix(part, 16).ok()?);
        count += 1;
    }
    (count == 6).then_some(value)
}
