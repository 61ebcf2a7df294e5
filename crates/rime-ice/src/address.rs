//! Address classification helpers.
//!
//! Candidates carry plain [`SocketAddr`] values; this module centralizes the
//! admissibility and scope rules applied when turning interface addresses
//! into host candidates and when pairing local with remote candidates.

use std::net::{IpAddr, SocketAddr};

/// Scope of an address, used to decide candidate admissibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    Loopback,
    LinkLocal,
    Private,
    Global,
}

pub fn classify(ip: IpAddr) -> AddressScope {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                AddressScope::Loopback
            } else if v4.is_link_local() {
                AddressScope::LinkLocal
            } else if v4.is_private() {
                AddressScope::Private
            } else {
                AddressScope::Global
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                AddressScope::Loopback
            } else if is_v6_link_local(ip) {
                AddressScope::LinkLocal
            } else {
                AddressScope::Global
            }
        }
    }
}

fn is_v6_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => (v6.segments()[0] & 0xFFC0) == 0xFE80,
        IpAddr::V4(_) => false,
    }
}

/// Whether an interface address may back a host candidate.
///
/// Unspecified and v4-mapped/compatible v6 addresses never make usable
/// candidates. Loopback is allowed, it is how two agents on one machine
/// find each other.
pub fn usable_as_host(ip: IpAddr) -> bool {
    if ip.is_unspecified() {
        return false;
    }

    if let IpAddr::V6(v6) = ip {
        if v6.to_ipv4_mapped().is_some() || v6.to_ipv4().is_some() {
            return false;
        }
    }

    true
}

/// Whether two addresses may form a candidate pair: same family, and for
/// link-local scopes both or neither side link local.
pub fn pairable(local: SocketAddr, remote: SocketAddr) -> bool {
    match (local.ip(), remote.ip()) {
        (IpAddr::V4(l), IpAddr::V4(r)) => l.is_link_local() == r.is_link_local(),
        (l @ IpAddr::V6(_), r @ IpAddr::V6(_)) => is_v6_link_local(l) == is_v6_link_local(r),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn classification() {
        assert_eq!(classify("127.0.0.1".parse().unwrap()), AddressScope::Loopback);
        assert_eq!(classify("169.254.1.1".parse().unwrap()), AddressScope::LinkLocal);
        assert_eq!(classify("192.168.1.7".parse().unwrap()), AddressScope::Private);
        assert_eq!(classify("198.51.100.4".parse().unwrap()), AddressScope::Global);
        assert_eq!(classify("fe80::1".parse().unwrap()), AddressScope::LinkLocal);
        assert_eq!(classify("2001:db8::1".parse().unwrap()), AddressScope::Global);
    }

    #[test]
    fn host_admissibility() {
        assert!(usable_as_host("192.168.1.7".parse().unwrap()));
        assert!(usable_as_host("127.0.0.1".parse().unwrap()));
        assert!(!usable_as_host("0.0.0.0".parse().unwrap()));
        assert!(!usable_as_host("::ffff:1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn pairing_rules() {
        assert!(pairable(addr("10.0.0.1:1"), addr("198.51.100.4:2")));
        assert!(!pairable(addr("10.0.0.1:1"), addr("[2001:db8::1]:2")));
        assert!(!pairable(addr("[fe80::1]:1"), addr("[2001:db8::1]:2")));
        assert!(pairable(addr("[fe80::1]:1"), addr("[fe80::2]:2")));
    }
}
