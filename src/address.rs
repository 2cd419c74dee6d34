//! Deterministic per-instance addressing for clustered creates.
//!
//! Given the base address of a cluster and its subnet mask, each instance
//! gets the usable host address `cluster_index` places after the base, in
//! ascending numeric order. The network and broadcast addresses are never
//! handed out; the gateway is not special-cased and will be handed out if
//! the base range runs over it.

use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::Ipv4Network;

use crate::error::ForgeError;

/// Compute the address for one instance of a cluster.
///
/// A cluster of one gets the base address verbatim, whatever the prefix.
/// Larger clusters index into the subnet's usable host range starting at
/// the base address; running past the last usable host is
/// `AddressRangeExhausted`.
pub fn plan(
    base: Ipv4Addr,
    netmask: &str,
    cluster_size: u32,
    cluster_index: u32,
) -> Result<Ipv4Addr, ForgeError> {
    if cluster_size == 1 {
        return Ok(base);
    }

    let prefix = ipv4_prefix(netmask)?;
    let network = Ipv4Network::new(base, prefix).map_err(|e| ForgeError::InvalidNetworkSpec {
        message: format!("{base}/{prefix}: {e}"),
    })?;

    if prefix >= 31 {
        return Err(ForgeError::AddressRangeExhausted {
            base: base.to_string(),
            prefix,
            offset: cluster_index,
        });
    }

    let first_host = u32::from(network.network()) + 1;
    let last_host = u32::from(network.broadcast()) - 1;
    let base_n = u32::from(base);

    if base_n < first_host || base_n > last_host {
        return Err(ForgeError::InvalidNetworkSpec {
            message: format!("{base} is not a usable host address in {network}"),
        });
    }

    let target = base_n
        .checked_add(cluster_index)
        .filter(|t| *t <= last_host)
        .ok_or(ForgeError::AddressRangeExhausted {
            base: base.to_string(),
            prefix,
            offset: (base_n - first_host) + cluster_index,
        })?;

    Ok(Ipv4Addr::from(target))
}

/// Convert a subnet mask into a CIDR prefix length.
///
/// For IPv4 the mask is a dotted quad; for IPv6 callers pass the prefix
/// length directly, since there is no dotted notation to convert from.
pub fn prefix_length(ip: IpAddr, netmask: &str) -> Result<u8, ForgeError> {
    match ip {
        IpAddr::V4(_) => ipv4_prefix(netmask),
        IpAddr::V6(_) => {
            let prefix: u8 = netmask
                .parse()
                .map_err(|_| ForgeError::InvalidNetworkSpec {
                    message: format!("'{netmask}' is not an IPv6 prefix length"),
                })?;
            if prefix > 128 {
                return Err(ForgeError::InvalidNetworkSpec {
                    message: format!("IPv6 prefix length {prefix} exceeds 128"),
                });
            }
            Ok(prefix)
        }
    }
}

fn ipv4_prefix(netmask: &str) -> Result<u8, ForgeError> {
    let mask: Ipv4Addr = netmask
        .parse()
        .map_err(|_| ForgeError::InvalidNetworkSpec {
            message: format!("'{netmask}' is not a dotted-quad netmask"),
        })?;
    ipnetwork::ipv4_mask_to_prefix(mask).map_err(|_| ForgeError::InvalidNetworkSpec {
        message: format!("'{netmask}' is not a contiguous netmask"),
    })
}

/// Six colon-separated hex octets, e.g. `52:54:00:ab:cd:ef`.
pub fn valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn single_instance_returns_base_verbatim() {
        for mask in ["255.255.255.0", "255.255.0.0", "255.255.255.252"] {
            assert_eq!(plan(ip("10.0.0.10"), mask, 1, 0).unwrap(), ip("10.0.0.10"));
        }
    }

    #[test]
    fn cluster_addresses_ascend_from_base() {
        let addrs: Vec<Ipv4Addr> = (0..3)
            .map(|i| plan(ip("10.0.0.10"), "255.255.255.0", 3, i).unwrap())
            .collect();
        assert_eq!(addrs, vec![ip("10.0.0.10"), ip("10.0.0.11"), ip("10.0.0.12")]);
    }

    #[test]
    fn cluster_addresses_are_unique_and_increasing() {
        let addrs: Vec<u32> = (0..8)
            .map(|i| u32::from(plan(ip("192.168.4.100"), "255.255.255.0", 8, i).unwrap()))
            .collect();
        for pair in addrs.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn range_exhaustion_past_last_usable_host() {
        // .254 is the last usable host in a /24; index 1 runs off the end.
        let err = plan(ip("192.168.1.254"), "255.255.255.0", 2, 1).unwrap_err();
        assert!(matches!(err, ForgeError::AddressRangeExhausted { .. }));
    }

    #[test]
    fn broadcast_address_is_never_assigned() {
        let err = plan(ip("10.0.0.254"), "255.255.255.0", 2, 1).unwrap_err();
        assert!(matches!(err, ForgeError::AddressRangeExhausted { .. }));
    }

    #[test]
    fn tiny_prefixes_have_no_host_range() {
        let err = plan(ip("10.0.0.0"), "255.255.255.254", 2, 0).unwrap_err();
        assert!(matches!(err, ForgeError::AddressRangeExhausted { .. }));
    }

    #[test]
    fn network_address_base_is_rejected() {
        let err = plan(ip("10.0.0.0"), "255.255.255.0", 2, 0).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidNetworkSpec { .. }));
    }

    #[test]
    fn prefix_length_of_dotted_quad() {
        assert_eq!(
            prefix_length(ip("192.168.1.10").into(), "255.255.255.0").unwrap(),
            24
        );
        assert_eq!(
            prefix_length(ip("10.0.0.1").into(), "255.255.0.0").unwrap(),
            16
        );
    }

    #[test]
    fn prefix_length_of_ipv6_is_numeric() {
        let v6: IpAddr = "fd00::10".parse().unwrap();
        assert_eq!(prefix_length(v6, "64").unwrap(), 64);
        assert!(prefix_length(v6, "129").is_err());
        assert!(prefix_length(v6, "ffff::").is_err());
    }

    #[test]
    fn prefix_length_rejects_malformed_masks() {
        assert!(prefix_length(ip("10.0.0.1").into(), "255.0.255.0").is_err());
        assert!(prefix_length(ip("10.0.0.1").into(), "garbage").is_err());
    }

    #[test]
    fn mac_validation() {
        assert!(valid_mac("52:54:00:ab:cd:ef"));
        assert!(valid_mac("00:00:00:00:00:00"));
        assert!(!valid_mac("52:54:00:ab:cd"));
        assert!(!valid_mac("52:54:00:ab:cd:zz"));
        assert!(!valid_mac("52-54-00-ab-cd-ef"));
        assert!(!valid_mac(""));
    }
}
