//! Address and port allocation
//!
//! Each allocation scope is a bounded, inclusive integer interval plus the
//! set of values currently bound to caller-supplied ids. Addresses are
//! scoped per network, ports per enrolled host. Allocation is first-fit.

pub mod protocol;
pub mod remote;
pub mod store;

pub use remote::RemoteAllocator;
pub use store::SqliteAllocator;

use async_trait::async_trait;
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use skein_common::{Error, Result};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Usable host addresses of a CIDR, network and broadcast excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub lower: Ipv4Addr,
    pub upper: Ipv4Addr,
    pub prefix_len: u8,
}

impl AddressRange {
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let network = match cidr.trim().parse::<IpNetwork>() {
            Ok(IpNetwork::V4(net)) => net,
            Ok(IpNetwork::V6(_)) => {
                return Err(Error::Validation(format!("{}: only IPv4 ranges are supported", cidr)))
            }
            Err(e) => return Err(Error::Validation(format!("invalid CIDR {}: {}", cidr, e))),
        };
        Self::from_network(network)
    }

    pub fn from_network(network: Ipv4Network) -> Result<Self> {
        if network.prefix() > 30 {
            return Err(Error::Validation(format!(
                "{} has no usable host addresses",
                network
            )));
        }
        let first = u32::from(network.network());
        let last = u32::from(network.broadcast());
        Ok(Self {
            lower: Ipv4Addr::from(first + 1),
            upper: Ipv4Addr::from(last - 1),
            prefix_len: network.prefix(),
        })
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.lower <= address && address <= self.upper
    }

    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.upper)) - u64::from(u32::from(self.lower)) + 1
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.lower, self.upper)
    }
}

/// Half-open port interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u32,
}

impl PortRange {
    pub fn new(start: u16, end: u32) -> Result<Self> {
        if start == 0 || u32::from(start) >= end || end > 65536 {
            return Err(Error::Validation(format!(
                "invalid port range [{}, {}): need 1 <= start < end <= 65536",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Last allocatable port
    pub fn last(&self) -> u16 {
        // end > start >= 1, so end - 1 fits
        (self.end - 1) as u16
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && u32::from(port) < self.end
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Lowest value in `lower..=upper` absent from `taken`
pub fn first_fit(lower: u32, upper: u32, taken: &BTreeSet<u32>) -> Option<u32> {
    let mut candidate = u64::from(lower);
    for &value in taken.range(lower..=upper) {
        let value = u64::from(value);
        if value > candidate {
            break;
        }
        candidate = value + 1;
    }
    (candidate <= u64::from(upper)).then_some(candidate as u32)
}

/// Allocation backend.
///
/// Every operation against one scope must be serialized by the backend.
/// Allocating an id that already holds a binding returns that binding.
#[async_trait]
pub trait Allocator: Send + Sync {
    async fn create_network(&self, network_id: &str, cidr: &str) -> Result<AddressRange>;
    async fn destroy_network(&self, network_id: &str) -> Result<()>;
    async fn allocate_address(&self, network_id: &str, address_id: &str) -> Result<Ipv4Addr>;
    /// Idempotent: freeing an unknown binding is a no-op
    async fn free_address(&self, network_id: &str, address_id: &str) -> Result<()>;
    async fn list_addresses(&self, network_id: &str) -> Result<Vec<(String, Ipv4Addr)>>;
    /// Record a binding that already exists elsewhere
    async fn claim_address(&self, network_id: &str, address_id: &str, address: Ipv4Addr) -> Result<()>;

    async fn create_host(&self, host_id: &str, range: PortRange) -> Result<()>;
    async fn delete_host(&self, host_id: &str) -> Result<()>;
    async fn allocate_port(&self, host_id: &str, port_id: &str) -> Result<u16>;
    async fn free_port(&self, host_id: &str, port_id: &str) -> Result<()>;
    async fn list_ports(&self, host_id: &str) -> Result<Vec<(String, u16)>>;
    async fn claim_port(&self, host_id: &str, port_id: &str, port: u16) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_excludes_network_and_broadcast() {
        let range = AddressRange::from_cidr("10.0.1.0/24").unwrap();
        assert_eq!(range.lower, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(range.upper, Ipv4Addr::new(10, 0, 1, 254));
        assert_eq!(range.prefix_len, 24);
        assert_eq!(range.size(), 254);

        // host bits are ignored
        let range = AddressRange::from_cidr("192.168.7.77/30").unwrap();
        assert_eq!(range.lower, Ipv4Addr::new(192, 168, 7, 77));
        assert_eq!(range.upper, Ipv4Addr::new(192, 168, 7, 78));
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(matches!(AddressRange::from_cidr("10.0.0.0/31"), Err(Error::Validation(_))));
        assert!(matches!(AddressRange::from_cidr("fd00::/64"), Err(Error::Validation(_))));
        assert!(matches!(AddressRange::from_cidr("nonsense"), Err(Error::Validation(_))));
        assert!(PortRange::new(0, 10).is_err());
        assert!(PortRange::new(100, 100).is_err());
        assert!(PortRange::new(1, 65537).is_err());
        assert_eq!(PortRange::new(65535, 65536).unwrap().last(), 65535);
    }

    #[test]
    fn test_first_fit_picks_lowest_gap() {
        let taken: BTreeSet<u32> = [10, 11, 13].into_iter().collect();
        assert_eq!(first_fit(10, 20, &taken), Some(12));
        assert_eq!(first_fit(14, 20, &taken), Some(14));
        assert_eq!(first_fit(5, 20, &taken), Some(5));

        let full: BTreeSet<u32> = (10..=12).collect();
        assert_eq!(first_fit(10, 12, &full), None);
        assert_eq!(first_fit(u32::MAX - 1, u32::MAX, &BTreeSet::new()), Some(u32::MAX - 1));
    }
}
