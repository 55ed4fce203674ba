//! Polymorphic socket address (§9: "Polymorphic socket-address union").
//!
//! `QUIC_ADDR` in the original is a C union over `sockaddr_in`/`sockaddr_in6`
//! whose active family is read at runtime. We model that as a tagged enum
//! instead, with the v4-mapped-v6 normalization the original leaves
//! half-commented-out (`QuicConvertFromMappedV6`) implemented as a total
//! function.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// An address that may be IPv4 or IPv6, with its family observable at runtime.
///
/// The v6 variant carries a scope id, used to hold the interface index
/// recovered from `IPV6_PKTINFO`/`IP_PKTINFO` ancillary data (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuicAddr {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl QuicAddr {
    pub fn port(&self) -> u16 {
        match self {
            QuicAddr::V4(a) => a.port(),
            QuicAddr::V6(a) => a.port(),
        }
    }

    pub fn set_port(&mut self, port: u16) {
        match self {
            QuicAddr::V4(a) => a.set_port(port),
            QuicAddr::V6(a) => a.set_port(port),
        }
    }

    pub fn scope_id(&self) -> u32 {
        match self {
            QuicAddr::V4(_) => 0,
            QuicAddr::V6(a) => a.scope_id(),
        }
    }

    pub fn set_scope_id(&mut self, scope_id: u32) {
        if let QuicAddr::V6(a) = self {
            *a = SocketAddrV6::new(*a.ip(), a.port(), a.flowinfo(), scope_id);
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, QuicAddr::V6(_))
    }

    /// Converts an IPv4-mapped IPv6 address down to a plain v4 address,
    /// leaving everything else untouched. Mirrors the commented-out
    /// `QuicConvertFromMappedV6` calls in the original: the datapath
    /// normalizes addresses delivered to the upper layer so a dual-stack
    /// socket never leaks `::ffff:a.b.c.d` up through the receive path
    /// (§8 scenario S2, §9 open question resolved in DESIGN.md).
    pub fn normalized(self) -> QuicAddr {
        match self {
            QuicAddr::V6(a) => match a.ip().to_ipv4_mapped() {
                Some(v4) => QuicAddr::V4(SocketAddrV4::new(v4, a.port())),
                None => QuicAddr::V6(a),
            },
            v4 => v4,
        }
    }

    /// The inverse of [`Self::normalized`]: maps a v4 address into the
    /// `::ffff:0:0/96` range so it can be sent out of a dual-stack v6
    /// socket. Named `QuicConvertToMappedV6` in the original.
    pub fn to_mapped_v6(self) -> QuicAddr {
        match self {
            QuicAddr::V4(a) => {
                let mapped = a.ip().to_ipv6_mapped();
                QuicAddr::V6(SocketAddrV6::new(mapped, a.port(), 0, 0))
            }
            v6 => v6,
        }
    }
}

impl From<SocketAddr> for QuicAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => QuicAddr::V4(a),
            SocketAddr::V6(a) => QuicAddr::V6(a),
        }
    }
}

impl From<QuicAddr> for SocketAddr {
    fn from(addr: QuicAddr) -> Self {
        match addr {
            QuicAddr::V4(a) => SocketAddr::V4(a),
            QuicAddr::V6(a) => SocketAddr::V6(a),
        }
    }
}

impl std::fmt::Display for QuicAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuicAddr::V4(a) => write!(f, "{a}"),
            QuicAddr::V6(a) => write!(f, "{a}"),
        }
    }
}

/// Local/remote address pair recovered for a single datagram (§3 "Tuple").
#[derive(Debug, Clone, Copy)]
pub struct Tuple {
    pub local: QuicAddr,
    pub remote: QuicAddr,
}

impl Tuple {
    pub(crate) fn zeroed(family_is_v6: bool) -> Self {
        let zero = if family_is_v6 {
            QuicAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0))
        } else {
            QuicAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        };
        Tuple {
            local: zero,
            remote: zero,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_v6_normalizes_to_v4() {
        let mapped: Ipv6Addr = Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped();
        let addr = QuicAddr::V6(SocketAddrV6::new(mapped, 4433, 0, 0));

        let normalized = addr.normalized();

        assert_eq!(
            normalized,
            QuicAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 4433))
        );
    }

    #[test]
    fn plain_v6_is_unaffected_by_normalization() {
        let addr = QuicAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4433, 0, 0));
        assert_eq!(addr.normalized(), addr);
    }

    #[test]
    fn round_trips_through_mapped_and_back() {
        let original = QuicAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1234));
        assert_eq!(original.to_mapped_v6().normalized(), original);
    }

    #[test]
    fn scope_id_is_only_meaningful_for_v6() {
        let mut v4 = QuicAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        v4.set_scope_id(7);
        assert_eq!(v4.scope_id(), 0);

        let mut v6 = QuicAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0));
        v6.set_scope_id(7);
        assert_eq!(v6.scope_id(), 7);
    }
}
