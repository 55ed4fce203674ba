//! Ancillary-data (control message) plumbing (§4.2, §4.3).
//!
//! Recovering the destination address and interface index of an inbound
//! datagram, and pinning the source address of an outbound one, both go
//! through `IP_PKTINFO`/`IPV6_PKTINFO` control messages. This module is
//! the direct Rust translation of the `CMSG_FIRSTHDR`/`CMSG_NXTHDR` walk in
//! `QuicSocketContextRecvComplete` and the `CMSG_DATA` fill in
//! `QuicDataPathBindingSend`, from `original_source/src/platform/datapath_darwin.c`.

use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::addr::QuicAddr;

/// Large enough for either a `struct in_pktinfo` or a `struct in6_pktinfo`
/// control message, plus header and alignment padding. The original sizes
/// this buffer at a lazy `CMSG_SPACE(8192)`; we size it to what is
/// actually needed, per its own inline comment suggesting as much.
pub const CONTROL_BUFFER_LEN: usize = 128;

pub type ControlBuffer = [u8; CONTROL_BUFFER_LEN];

pub fn new_control_buffer() -> ControlBuffer {
    [0u8; CONTROL_BUFFER_LEN]
}

/// Destination address and interface index recovered from an inbound
/// datagram's ancillary data.
#[derive(Debug, Clone, Copy)]
pub struct PktInfo {
    pub addr: IpAddr,
    pub ifindex: u32,
}

/// Walks the control messages attached to `msg` looking for
/// `IP_PKTINFO`/`IPV6_PKTINFO`. Returns `None` if no matching record is
/// present (§4.2: the caller must treat this as a fatal programming
/// error since we always request ancillary data on sockets we read).
///
/// # Safety
/// `msg` must be a `msghdr` that was just populated by a successful
/// `recvmsg` call, with `msg_control` pointing at a buffer of at least
/// `msg_controllen` bytes that remains valid for the call.
pub unsafe fn parse_pktinfo(msg: &libc::msghdr) -> Option<PktInfo> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;

            if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
                let data = libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo;
                let info = std::ptr::read_unaligned(data);
                return Some(PktInfo {
                    addr: IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)),
                    ifindex: info.ipi6_ifindex,
                });
            }

            if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == pktinfo_ip_type() {
                let data = libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo;
                let info = std::ptr::read_unaligned(data);
                let octets = info.ipi_addr.s_addr.to_ne_bytes();
                return Some(PktInfo {
                    addr: IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])),
                    ifindex: info.ipi_ifindex as u32,
                });
            }

            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
        None
    }
}

/// Writes a single `IP_PKTINFO`/`IPV6_PKTINFO` control message into `buf`
/// encoding `local`'s address and interface index, and returns the total
/// control length (`msg_controllen`) to set on the outbound `msghdr`.
/// Used by `send_from_to` (§4.3) to pin the source address of a reply.
///
/// # Safety
/// `buf` must be at least `CMSG_SPACE` bytes for the relevant pktinfo
/// struct (guaranteed by `CONTROL_BUFFER_LEN`), and the caller must wire
/// the resulting length into a `msghdr` whose `msg_control` points at
/// `buf` before calling `sendmsg`.
pub unsafe fn write_pktinfo(buf: &mut ControlBuffer, local: &QuicAddr) -> usize {
    match local {
        QuicAddr::V4(addr) => unsafe {
            let controllen = libc::CMSG_SPACE(size_of::<libc::in_pktinfo>() as u32) as usize;
            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_control = buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = controllen as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            let hdr = &mut *cmsg;
            hdr.cmsg_level = libc::IPPROTO_IP;
            hdr.cmsg_type = pktinfo_ip_type();
            hdr.cmsg_len = libc::CMSG_LEN(size_of::<libc::in_pktinfo>() as u32) as _;

            let octets = addr.ip().octets();
            let info = libc::in_pktinfo {
                ipi_ifindex: 0,
                ipi_spec_dst: libc::in_addr { s_addr: 0 },
                ipi_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(octets),
                },
            };
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo, info);

            controllen
        },
        QuicAddr::V6(addr) => unsafe {
            let controllen = libc::CMSG_SPACE(size_of::<libc::in6_pktinfo>() as u32) as usize;
            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_control = buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = controllen as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            let hdr = &mut *cmsg;
            hdr.cmsg_level = libc::IPPROTO_IPV6;
            hdr.cmsg_type = libc::IPV6_PKTINFO;
            hdr.cmsg_len = libc::CMSG_LEN(size_of::<libc::in6_pktinfo>() as u32) as _;

            let info = libc::in6_pktinfo {
                ipi6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                ipi6_ifindex: addr.scope_id(),
            };
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo, info);

            controllen
        },
    }
}

/// `IP_PKTINFO` on Linux; Darwin/BSD name the same ancillary message type
/// `IP_PKTINFO` too (unlike the `IP_RECVDSTADDR`/`IP_RECVIF` pair used only
/// to *request* it on BSD — see `socket::configure`), so this collapses to
/// one constant. Kept as a function in case a future target needs to
/// special-case it.
#[inline]
fn pktinfo_ip_type() -> libc::c_int {
    libc::IP_PKTINFO
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv6Addr, SocketAddrV6};

    #[test]
    fn control_buffer_fits_either_pktinfo_kind() {
        let v4_space = unsafe { libc::CMSG_SPACE(size_of::<libc::in_pktinfo>() as u32) as usize };
        let v6_space = unsafe { libc::CMSG_SPACE(size_of::<libc::in6_pktinfo>() as u32) as usize };
        assert!(CONTROL_BUFFER_LEN >= v4_space);
        assert!(CONTROL_BUFFER_LEN >= v6_space);
    }

    #[test]
    fn write_then_parse_pktinfo_round_trips_v6() {
        let mut buf = new_control_buffer();
        let addr = QuicAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 7));
        let len = unsafe { write_pktinfo(&mut buf, &addr) };

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_control = buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = len as _;

        let parsed = unsafe { parse_pktinfo(&msg) }.expect("pktinfo should parse back");
        assert_eq!(parsed.addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(parsed.ifindex, 7);
    }
}
