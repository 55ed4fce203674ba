//! Socket context (§3 "SocketContext", §4.2, §4.3).
//!
//! One socket, its current in-flight receive, and the FIFO of sends
//! pending a writable wakeup. Ownership of the socket file descriptor and
//! the recv/send pools is private to the worker that drives it; the
//! pending-send list is the one piece of state a caller on any thread may
//! touch synchronously (`send_to`/`send_from_to` can run from whatever
//! thread the upper layer calls them on), so it lives behind a small
//! `parking_lot::Mutex` that is never held across a syscall (§5 "No spin
//! locks on hot path; no mutexes held across syscalls").

use std::collections::VecDeque;
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use socket2::Socket;

use crate::addr::{QuicAddr, Tuple};
use crate::binding::Binding;
use crate::callback::{ClientContext, ReceiveHandler};
use crate::cmsg;
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::recv::{PartitionIndex, ReceiveBlock, MAX_UDP_PAYLOAD_LENGTH};
use crate::rundown::RundownGuard;
use crate::send::{PendingSend, SendBuffer, SendContext};
use crate::worker::Worker;

/// MTU deduction used to size the receive I/O vector (§6 "Numerical
/// constants worth naming"): IPv4 minimum header plus UDP header. We size
/// the buffer to the full [`MAX_UDP_PAYLOAD_LENGTH`] regardless, so this
/// constant only documents the budget the original reserves; it does not
/// shrink the allocation.
pub const QUIC_MIN_IPV4_HEADER_SIZE: usize = 20;
pub const QUIC_UDP_HEADER_SIZE: usize = 8;

struct RecvState {
    current: Option<ReceiveBlock>,
}

struct SendState {
    pending: VecDeque<PendingSend>,
}

#[derive(Clone)]
pub(crate) struct SocketPools {
    pub recv_blocks: Arc<Pool<BytesMut>>,
    pub send_buffers: Arc<Pool<BytesMut>>,
    pub send_contexts: Arc<Pool<Vec<SendBuffer>>>,
}

/// One UDP socket belonging to a binding, pinned to one worker (§3).
pub struct SocketContext {
    socket: Socket,
    token: Token,
    is_v6: bool,
    partition_index: PartitionIndex,
    pools: SocketPools,
    recv: Mutex<RecvState>,
    send: Mutex<SendState>,
    send_waiting: AtomicBool,
    recv_handler: ReceiveHandler,
    client_context: ClientContext,
    binding_local_port: u16,
    /// Released automatically when the context is dropped (which only
    /// happens after the owning worker processes an `Unregister` command
    /// — see `worker.rs`), giving us "release one rundown reference per
    /// socket context" for free (§4.4 "Delete").
    _rundown: RundownGuard,
}

impl SocketContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        socket: Socket,
        token: Token,
        is_v6: bool,
        partition_index: PartitionIndex,
        pools: SocketPools,
        recv_handler: ReceiveHandler,
        client_context: ClientContext,
        binding_local_port: u16,
        rundown: RundownGuard,
    ) -> Self {
        SocketContext {
            socket,
            token,
            is_v6,
            partition_index,
            pools,
            recv: Mutex::new(RecvState { current: None }),
            send: Mutex::new(SendState {
                pending: VecDeque::new(),
            }),
            send_waiting: AtomicBool::new(false),
            recv_handler,
            client_context,
            binding_local_port,
            _rundown: rundown,
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Registers this socket's fd with `registry` for read-readiness,
    /// edge-triggered (mio always registers epoll/kqueue edge-triggered),
    /// matching §4.4 step 5.
    pub(crate) fn register(&self, registry: &Registry) -> std::io::Result<()> {
        let mut source = SourceFd(&self.socket.as_raw_fd());
        Source::register(&mut source, registry, self.token, Interest::READABLE)
    }

    pub(crate) fn reregister_writable(&self, registry: &Registry) -> std::io::Result<()> {
        let mut source = SourceFd(&self.socket.as_raw_fd());
        Source::reregister(
            &mut source,
            registry,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    pub(crate) fn deregister(&self, registry: &Registry) -> std::io::Result<()> {
        let mut source = SourceFd(&self.socket.as_raw_fd());
        Source::deregister(&mut source, registry)
    }

    /// Arms a receive: pulls a block from the pool and wires it in as the
    /// `recvmsg` target (§4.2 "Arming a receive"). Pool exhaustion here is
    /// fatal and panics the worker thread (`ReceiveBlock::new`), per §4.2/§7.
    pub(crate) fn arm_receive(&self) {
        let mut state = self.recv.lock();
        if state.current.is_some() {
            return;
        }
        let tuple = Tuple::zeroed(self.is_v6);
        state.current = Some(ReceiveBlock::new(
            self.pools.recv_blocks.clone(),
            tuple,
            self.partition_index,
        ));
    }

    /// Runs exactly one `recvmsg` for a single readable event and, on
    /// success, dispatches to the receive callback then rearms (§4.2
    /// "Readiness dispatch"). `EAGAIN`/`EINTR` silently drop the event.
    pub(crate) fn on_readable(&self, binding: &Binding) {
        self.arm_receive();
        let mut guard = self.recv.lock();
        let block = guard.current.as_mut().expect("armed above");

        let mut control = cmsg::new_control_buffer();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let buf_ptr = block.buffer_mut().as_mut_ptr();
        let buf_len = MAX_UDP_PAYLOAD_LENGTH;

        let mut iov = libc::iovec {
            iov_base: buf_ptr as *mut libc::c_void,
            iov_len: buf_len,
        };

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = size_of::<libc::sockaddr_storage>() as _;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let ret = unsafe { libc::recvmsg(self.raw_fd(), &mut msg, 0) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                _ => tracing::debug!(error = %err, "recvmsg failed"),
            }
            return;
        }

        let len = ret as usize;

        let Some(pktinfo) = (unsafe { cmsg::parse_pktinfo(&msg) }) else {
            panic!(
                "datapath: recvmsg returned a packet with no IP_PKTINFO/IPV6_PKTINFO \
                 ancillary record; the kernel violated a contract we requested"
            );
        };

        let remote = sockaddr_storage_to_quicaddr(&storage, msg.msg_namelen as usize)
            .unwrap_or_else(|| Tuple::zeroed(self.is_v6).remote);

        let mut local = match pktinfo.addr {
            IpAddr::V6(ip) => {
                QuicAddr::V6(SocketAddrV6::new(ip, self.binding_local_port, 0, pktinfo.ifindex))
            }
            IpAddr::V4(ip) => QuicAddr::V4(SocketAddrV4::new(ip, self.binding_local_port)),
        };
        local = local.normalized();

        let mut block = guard.current.take().expect("checked above");
        block.set_len(len);
        block.tuple = Tuple {
            local,
            remote: remote.normalized(),
        };
        block.partition_index = self.partition_index;
        drop(guard);

        (self.recv_handler)(binding, &self.client_context, block);

        self.arm_receive();
    }

    /// Drains the pending-send FIFO after a writable wakeup (§4.3
    /// "Partial-batch resumption").
    pub(crate) fn on_writable(&self, registry: &Registry) {
        loop {
            let mut guard = self.send.lock();
            let Some(mut pending) = guard.pending.pop_front() else {
                self.send_waiting.store(false, Ordering::SeqCst);
                break;
            };
            drop(guard);

            match self.resume_send(&mut pending) {
                SendOutcome::Completed => continue,
                SendOutcome::WouldBlock => {
                    let mut guard = self.send.lock();
                    guard.pending.push_front(pending);
                    break;
                }
                SendOutcome::Failed(e) => {
                    tracing::debug!(error = %e, "deferred send failed");
                    continue;
                }
            }
        }

        let mut guard = self.send.lock();
        if guard.pending.is_empty() {
            self.send_waiting.store(false, Ordering::SeqCst);
            drop(guard);
            let mut source = SourceFd(&self.socket.as_raw_fd());
            let _ = Source::reregister(&mut source, registry, self.token, Interest::READABLE);
        }
    }

    fn resume_send(&self, pending: &mut PendingSend) -> SendOutcome {
        match pending {
            PendingSend::PerDatagram(ctx) => send_connected_from(self.raw_fd(), ctx),
            PendingSend::Batched { ctx, local } => {
                send_batched_from(self.raw_fd(), ctx, *local, self.is_v6)
            }
        }
    }

    /// `send_to` entry point (§4.3): socket is already `connect()`-ed, so
    /// the address is omitted and each buffer is issued with `send(2)`
    /// from `CurrentIndex`. If this socket context already has a send
    /// backlogged (§5: ordering must survive `EWOULDBLOCK` pending), the
    /// new send is parked at the tail of the FIFO instead of racing a
    /// syscall against the sends ahead of it.
    pub(crate) fn send_to(&self, ctx: SendContext, worker: &Worker) -> Result<()> {
        if self.has_backlog() {
            self.enqueue_pending(PendingSend::PerDatagram(ctx), worker);
            return Ok(());
        }
        let mut ctx = ctx;
        match send_connected_from(self.raw_fd(), &mut ctx) {
            SendOutcome::Completed => Ok(()),
            SendOutcome::WouldBlock => {
                self.enqueue_pending(PendingSend::PerDatagram(ctx), worker);
                Ok(())
            }
            SendOutcome::Failed(e) => Err(e),
        }
    }

    /// `send_from_to` entry point (§4.3): one `sendmsg` carrying the whole
    /// batch, with an `IP_PKTINFO`/`IPV6_PKTINFO` ancillary record pinning
    /// the source address. Same backlog check as `send_to`.
    pub(crate) fn send_from_to(&self, ctx: SendContext, local: QuicAddr, worker: &Worker) -> Result<()> {
        if self.has_backlog() {
            self.enqueue_pending(PendingSend::Batched { ctx, local }, worker);
            return Ok(());
        }
        let mut ctx = ctx;
        match send_batched_from(self.raw_fd(), &mut ctx, local, self.is_v6) {
            SendOutcome::Completed => Ok(()),
            SendOutcome::WouldBlock => {
                self.enqueue_pending(PendingSend::Batched { ctx, local }, worker);
                Ok(())
            }
            SendOutcome::Failed(e) => Err(e),
        }
    }

    /// True if a previous send is already parked on the pending FIFO and
    /// hasn't been drained by a writable wakeup yet. Checked before every
    /// direct send attempt so a send issued while backlog exists always
    /// joins the tail of the queue rather than reaching the kernel ahead
    /// of sends submitted before it (§5, §8 property 5).
    fn has_backlog(&self) -> bool {
        let guard = self.send.lock();
        !guard.pending.is_empty() || self.send_waiting.load(Ordering::SeqCst)
    }

    fn enqueue_pending(&self, pending: PendingSend, worker: &Worker) {
        let mut guard = self.send.lock();
        guard.pending.push_back(pending);
        drop(guard);

        if !self.send_waiting.swap(true, Ordering::SeqCst) {
            worker.arm_writable(self.token);
        }
    }
}

enum SendOutcome {
    Completed,
    WouldBlock,
    Failed(Error),
}

fn send_connected_from(fd: RawFd, ctx: &mut SendContext) -> SendOutcome {
    while ctx.current_index < ctx.buffers.len() {
        let buf = &ctx.buffers[ctx.current_index];
        let ret = unsafe {
            libc::send(
                fd,
                buf.as_slice().as_ptr() as *const libc::c_void,
                buf.as_slice().len(),
                0,
            )
        };

        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => SendOutcome::WouldBlock,
                _ => SendOutcome::Failed(Error::Io(err)),
            };
        }

        ctx.current_index += 1;
    }
    SendOutcome::Completed
}

fn send_batched_from(fd: RawFd, ctx: &mut SendContext, local: QuicAddr, is_v6: bool) -> SendOutcome {
    let mut iovecs: Vec<libc::iovec> = ctx
        .buffers
        .iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_slice().as_mut_ptr() as *mut libc::c_void,
            iov_len: b.as_mut_slice().len(),
        })
        .collect();

    // A dual-stack socket only accepts v6-shaped sockaddrs as `msg_name`.
    let remote = if is_v6 && !ctx.remote().is_ipv6() {
        ctx.remote().to_mapped_v6()
    } else {
        ctx.remote()
    };
    let mut storage = quicaddr_to_sockaddr_storage(remote);
    let namelen = if remote.is_ipv6() {
        size_of::<libc::sockaddr_in6>()
    } else {
        size_of::<libc::sockaddr_in>()
    };

    let mut control = cmsg::new_control_buffer();
    let controllen = unsafe { cmsg::write_pktinfo(&mut control, &local) };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = namelen as _;
    msg.msg_iov = iovecs.as_mut_ptr();
    msg.msg_iovlen = iovecs.len() as _;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = controllen as _;

    let ret = unsafe { libc::sendmsg(fd, &msg, 0) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => SendOutcome::WouldBlock,
            _ => SendOutcome::Failed(Error::Io(err)),
        };
    }
    ctx.current_index = ctx.buffers.len();
    SendOutcome::Completed
}

fn quicaddr_to_sockaddr_storage(addr: QuicAddr) -> libc::sockaddr_storage {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        QuicAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
                #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
                sin_len: size_of::<libc::sockaddr_in>() as u8,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
        }
        QuicAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
                #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
                sin6_len: size_of::<libc::sockaddr_in6>() as u8,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
        }
    }
    storage
}

/// Per-family ancillary-data request and socket option sequence, translated
/// from `QuicSocketContextInitialize` in `datapath_darwin.c`: `SO_REUSEADDR`
/// always, `IPV6_V6ONLY = 0` plus `IPV6_RECVPKTINFO` for v6 (so one
/// dual-stack socket serves both families), and the platform's way of
/// requesting `IP_PKTINFO`-equivalent delivery for v4.
pub(crate) fn configure(socket: &Socket, is_v6: bool) -> std::io::Result<()> {
    socket.set_reuse_address(true)?;

    if is_v6 {
        socket.set_only_v6(false)?;
        set_bool_opt(socket.as_raw_fd(), libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)?;
    } else {
        request_v4_pktinfo(socket.as_raw_fd())?;
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn request_v4_pktinfo(fd: RawFd) -> std::io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_IP, libc::IP_PKTINFO)
}

/// BSD/Darwin requests `IP_PKTINFO` delivery the same as Linux (it is a
/// real cmsg type there too — see `datapath_darwin.c`'s own
/// `QuicSocketContextInitialize`, which sets all three options below), but
/// also sets `IP_RECVDSTADDR`/`IP_RECVIF` defensively since older BSD
/// kernels only honor that pair. `parse_pktinfo` only ever looks for
/// `IP_PKTINFO`, matching the original's receive-side parsing.
#[cfg(not(target_os = "linux"))]
fn request_v4_pktinfo(fd: RawFd) -> std::io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_IP, libc::IP_RECVDSTADDR)?;
    set_bool_opt(fd, libc::IPPROTO_IP, libc::IP_PKTINFO)?;
    set_bool_opt(fd, libc::IPPROTO_IP, libc::IP_RECVIF)
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int) -> std::io::Result<()> {
    let value: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn sockaddr_storage_to_quicaddr(storage: &libc::sockaddr_storage, _len: usize) -> Option<QuicAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let octets = sin.sin_addr.s_addr.to_ne_bytes();
            let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            Some(QuicAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(QuicAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
