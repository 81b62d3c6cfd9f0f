//! Address classification: routability, network groups and reachability
//!
//! Groups decide bucket placement in the address book and cap how many
//! outbound connections may land in the same network neighbourhood.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

fn v4_in(ip: &Ipv4Addr, net: [u8; 4], prefix: u32) -> bool {
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (u32::from(*ip) & mask) == (u32::from(Ipv4Addr::from(net)) & mask)
}

fn v6_in(ip: &Ipv6Addr, net: [u16; 8], prefix: u32) -> bool {
    let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
    let net = Ipv6Addr::new(
        net[0], net[1], net[2], net[3], net[4], net[5], net[6], net[7],
    );
    (u128::from(*ip) & mask) == (u128::from(net) & mask)
}

fn v4(ip: &IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn v6(ip: &IpAddr) -> Option<Ipv6Addr> {
    match ip {
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => Some(*v6),
        _ => None,
    }
}

/// RFC1918 private IPv4 space
pub fn is_rfc1918(ip: &IpAddr) -> bool {
    v4(ip).map_or(false, |a| {
        v4_in(&a, [10, 0, 0, 0], 8)
            || v4_in(&a, [172, 16, 0, 0], 12)
            || v4_in(&a, [192, 168, 0, 0], 16)
    })
}

/// RFC2544 benchmarking range
pub fn is_rfc2544(ip: &IpAddr) -> bool {
    v4(ip).map_or(false, |a| v4_in(&a, [198, 18, 0, 0], 15))
}

/// RFC3927 IPv4 link-local
pub fn is_rfc3927(ip: &IpAddr) -> bool {
    v4(ip).map_or(false, |a| v4_in(&a, [169, 254, 0, 0], 16))
}

/// RFC5737 documentation ranges
pub fn is_rfc5737(ip: &IpAddr) -> bool {
    v4(ip).map_or(false, |a| {
        v4_in(&a, [192, 0, 2, 0], 24)
            || v4_in(&a, [198, 51, 100, 0], 24)
            || v4_in(&a, [203, 0, 113, 0], 24)
    })
}

/// RFC6598 shared address space
pub fn is_rfc6598(ip: &IpAddr) -> bool {
    v4(ip).map_or(false, |a| v4_in(&a, [100, 64, 0, 0], 10))
}

/// RFC3849 IPv6 documentation
pub fn is_rfc3849(ip: &IpAddr) -> bool {
    v6(ip).map_or(false, |a| v6_in(&a, [0x2001, 0x0db8, 0, 0, 0, 0, 0, 0], 32))
}

/// RFC3964 6to4
pub fn is_rfc3964(ip: &IpAddr) -> bool {
    v6(ip).map_or(false, |a| v6_in(&a, [0x2002, 0, 0, 0, 0, 0, 0, 0], 16))
}

/// RFC4193 unique local
pub fn is_rfc4193(ip: &IpAddr) -> bool {
    v6(ip).map_or(false, |a| v6_in(&a, [0xfc00, 0, 0, 0, 0, 0, 0, 0], 7))
}

/// RFC4380 Teredo
pub fn is_rfc4380(ip: &IpAddr) -> bool {
    v6(ip).map_or(false, |a| v6_in(&a, [0x2001, 0, 0, 0, 0, 0, 0, 0], 32))
}

/// RFC4843 ORCHID
pub fn is_rfc4843(ip: &IpAddr) -> bool {
    v6(ip).map_or(false, |a| v6_in(&a, [0x2001, 0x0010, 0, 0, 0, 0, 0, 0], 28))
}

/// RFC4862 IPv6 link-local autoconfiguration
pub fn is_rfc4862(ip: &IpAddr) -> bool {
    v6(ip).map_or(false, |a| v6_in(&a, [0xfe80, 0, 0, 0, 0, 0, 0, 0], 64))
}

/// RFC6052 well-known IPv4/IPv6 translation prefix
pub fn is_rfc6052(ip: &IpAddr) -> bool {
    v6(ip).map_or(false, |a| v6_in(&a, [0x64, 0xff9b, 0, 0, 0, 0, 0, 0], 96))
}

/// RFC6145 IPv4-translated addresses
pub fn is_rfc6145(ip: &IpAddr) -> bool {
    v6(ip).map_or(false, |a| v6_in(&a, [0, 0, 0, 0, 0xffff, 0, 0, 0], 96))
}

/// Loopback and the 0.0.0.0/8 block
pub fn is_local(ip: &IpAddr) -> bool {
    match v4(ip) {
        Some(a) => a.is_loopback() || v4_in(&a, [0, 0, 0, 0], 8),
        None => ip.is_loopback(),
    }
}

/// Rejects unspecified and broadcast addresses
pub fn is_valid(ip: &IpAddr) -> bool {
    if ip.is_unspecified() {
        return false;
    }
    match v4(ip) {
        Some(a) => a != Ipv4Addr::BROADCAST,
        None => true,
    }
}

/// Whether the address can be reached over the public internet
pub fn is_routable(ip: &IpAddr) -> bool {
    is_valid(ip)
        && !(is_rfc1918(ip)
            || is_rfc2544(ip)
            || is_rfc3927(ip)
            || is_rfc4862(ip)
            || is_rfc3849(ip)
            || is_rfc4843(ip)
            || is_rfc5737(ip)
            || is_rfc6598(ip)
            || is_local(ip)
            || is_rfc4193(ip))
}

/// Network group an address belongs to.
///
/// IPv4 addresses group by /16. IPv6 addresses group by /32 (/36 for
/// Hurricane Electric, which hands out /32 blocks to a single customer).
/// Tunnelled IPv4 addresses group by their embedded IPv4 /16.
pub fn group_key(ip: &IpAddr) -> String {
    if is_local(ip) {
        return "local".to_string();
    }
    if !is_routable(ip) {
        return "unroutable".to_string();
    }
    if let Some(a) = v4(ip) {
        return ipv4_group(a);
    }

    let Some(a) = v6(ip) else {
        return "unroutable".to_string();
    };
    let octets = a.octets();

    if is_rfc6145(ip) || is_rfc6052(ip) {
        return ipv4_group(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]));
    }
    if is_rfc3964(ip) {
        return ipv4_group(Ipv4Addr::new(octets[2], octets[3], octets[4], octets[5]));
    }
    if is_rfc4380(ip) {
        // Teredo stores the client address bit-inverted in the last 4 bytes
        return ipv4_group(Ipv4Addr::new(
            octets[12] ^ 0xff,
            octets[13] ^ 0xff,
            octets[14] ^ 0xff,
            octets[15] ^ 0xff,
        ));
    }

    let he_net = v6_in(&a, [0x2001, 0x0470, 0, 0, 0, 0, 0, 0], 32);
    let bits = if he_net { 36 } else { 32 };
    let masked = u128::from(a) & (u128::MAX << (128 - bits));
    Ipv6Addr::from(masked).to_string()
}

fn ipv4_group(a: Ipv4Addr) -> String {
    let o = a.octets();
    Ipv4Addr::new(o[0], o[1], 0, 0).to_string()
}

/// How well a local address can be reached from a given remote address.
/// Higher is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reachability {
    Unreachable = 0,
    Default = 1,
    Teredo = 2,
    Ipv6Weak = 3,
    Ipv4 = 4,
    Ipv6Strong = 5,
    Private = 6,
}

/// Rank `local` as an address to advertise to `remote`
pub fn reachability_from(local: &IpAddr, remote: &IpAddr) -> Reachability {
    if !is_routable(remote) {
        return Reachability::Unreachable;
    }

    if is_rfc4380(remote) {
        if !is_routable(local) {
            return Reachability::Default;
        }
        if is_rfc4380(local) {
            return Reachability::Teredo;
        }
        if v4(local).is_some() {
            return Reachability::Ipv4;
        }
        return Reachability::Ipv6Weak;
    }

    if v4(remote).is_some() {
        if is_routable(local) && v4(local).is_some() {
            return Reachability::Ipv4;
        }
        return Reachability::Unreachable;
    }

    // Remote is IPv6
    let tunnelled = is_rfc3964(local) || is_rfc6052(local) || is_rfc6145(local);
    if !is_routable(local) {
        return Reachability::Default;
    }
    if is_rfc4380(local) {
        return Reachability::Teredo;
    }
    if v4(local).is_some() {
        return Reachability::Ipv4;
    }
    if tunnelled {
        return Reachability::Ipv6Weak;
    }
    Reachability::Ipv6Strong
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_routable() {
        assert!(is_routable(&ip("8.8.8.8")));
        assert!(is_routable(&ip("2a01:4f8::1")));

        for addr in [
            "10.1.2.3",
            "172.20.0.1",
            "192.168.1.1",
            "127.0.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "169.254.3.3",
            "198.18.0.1",
            "192.0.2.7",
            "100.64.1.1",
            "::1",
            "::",
            "fe80::1",
            "fd00::1",
            "2001:db8::1",
            "2001:10::1",
        ] {
            assert!(!is_routable(&ip(addr)), "{} should not be routable", addr);
        }
    }

    #[test]
    fn test_group_key() {
        assert_eq!(group_key(&ip("127.0.0.1")), "local");
        assert_eq!(group_key(&ip("10.0.0.1")), "unroutable");
        assert_eq!(group_key(&ip("8.8.4.4")), "8.8.0.0");
        assert_eq!(group_key(&ip("8.8.200.1")), group_key(&ip("8.8.4.4")));
        assert_ne!(group_key(&ip("8.9.0.1")), group_key(&ip("8.8.4.4")));
        assert_eq!(group_key(&ip("::ffff:8.8.4.4")), "8.8.0.0");
        assert_eq!(group_key(&ip("2002:0808:0404::1")), "8.8.0.0");
        assert_eq!(group_key(&ip("2a01:4f8:1:2::1")), "2a01:4f8::");
        assert_eq!(group_key(&ip("2001:470:1234::1")), "2001:470:1000::");
    }

    #[test]
    fn test_reachability_ordering() {
        let remote4 = ip("8.8.8.8");
        assert_eq!(reachability_from(&ip("1.2.3.4"), &remote4), Reachability::Ipv4);
        assert_eq!(
            reachability_from(&ip("2a01:4f8::1"), &remote4),
            Reachability::Unreachable
        );

        let remote6 = ip("2a01:4f8::9");
        assert_eq!(
            reachability_from(&ip("2a00:1450::1"), &remote6),
            Reachability::Ipv6Strong
        );
        assert_eq!(
            reachability_from(&ip("10.0.0.1"), &remote6),
            Reachability::Default
        );
        assert!(Reachability::Ipv6Strong > Reachability::Ipv4);
        assert_eq!(
            reachability_from(&ip("1.2.3.4"), &ip("10.0.0.1")),
            Reachability::Unreachable
        );
    }
}
