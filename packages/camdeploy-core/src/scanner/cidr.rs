//! CIDR expansion into candidate addresses.

use crate::error::ScanError;
use ipnetwork::IpNetwork;
use std::net::Ipv4Addr;

/// Largest range scanned unless configured otherwise.
pub const DEFAULT_MAX_HOSTS: usize = 256;

/// Every address of an IPv4 block, starting at the network address, capped at
/// `max_hosts`. Network and broadcast addresses are included.
pub fn expand(cidr: &str, max_hosts: usize) -> Result<Vec<Ipv4Addr>, ScanError> {
    let network: IpNetwork = cidr
        .trim()
        .parse()
        .map_err(|_| ScanError::InvalidCidr(cidr.to_string()))?;

    let IpNetwork::V4(v4) = network else {
        return Err(ScanError::Unsupported(cidr.to_string()));
    };

    let start = u32::from(v4.network());
    let size = 1u64 << (32 - u32::from(v4.prefix()));
    let count = size.min(max_hosts as u64) as u32;

    Ok((0..count).map(|offset| Ipv4Addr::from(start + offset)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slash_24_has_256_addresses() {
        let hosts = expand("192.168.50.0/24", DEFAULT_MAX_HOSTS).unwrap();
        assert_eq!(hosts.len(), 256);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 50, 0));
        assert_eq!(hosts[255], Ipv4Addr::new(192, 168, 50, 255));
    }

    #[test]
    fn test_count_is_power_of_two_for_small_blocks() {
        for prefix in 24..=32u32 {
            let hosts = expand(&format!("10.1.2.0/{}", prefix), DEFAULT_MAX_HOSTS).unwrap();
            assert_eq!(hosts.len(), 1usize << (32 - prefix));
        }
    }

    #[test]
    fn test_large_blocks_are_capped() {
        assert_eq!(expand("10.0.0.0/8", DEFAULT_MAX_HOSTS).unwrap().len(), 256);
        assert_eq!(expand("0.0.0.0/0", 16).unwrap().len(), 16);
    }

    #[test]
    fn test_host_bits_are_masked() {
        let hosts = expand("192.168.1.77/30", DEFAULT_MAX_HOSTS).unwrap();
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 76));
        assert_eq!(hosts.len(), 4);
    }

    #[test]
    fn test_rejects_garbage_and_ipv6() {
        assert!(matches!(expand("192.168.1.0/33", 256), Err(ScanError::InvalidCidr(_))));
        assert!(matches!(expand("hello", 256), Err(ScanError::InvalidCidr(_))));
        assert!(matches!(expand("fe80::/64", 256), Err(ScanError::Unsupported(_))));
    }
}
