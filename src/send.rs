//! Send contexts and buffers (§3 "SendContext"/"SendBuffer", §4.3).

use std::sync::Arc;

use bytes::BytesMut;

use crate::addr::{QuicAddr, Tuple};
use crate::pool::Pool;
use crate::recv::MAX_UDP_PAYLOAD_LENGTH;

/// Hard cap on buffers in one send batch (§6 `QUIC_MAX_BATCH_SEND`).
pub const MAX_SEND_BATCH_SIZE: usize = 10;

/// One send buffer, lent from a worker's send-buffer pool for the
/// lifetime of the enclosing [`SendContext`] (§3 "SendBuffer").
pub struct SendBuffer {
    pool: Arc<Pool<BytesMut>>,
    bytes: Option<BytesMut>,
}

impl SendBuffer {
    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.bytes.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn len(&self) -> usize {
        self.bytes.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.bytes.take() {
            buf.resize(MAX_UDP_PAYLOAD_LENGTH, 0);
            self.pool.free(buf);
        }
    }
}

/// A batch of up to [`MAX_SEND_BATCH_SIZE`] outbound buffers plus the
/// addressing a send call needs, allocated per send operation and freed
/// on completion (§3 "SendContext").
///
/// The `Vec<SendBuffer>` backing storage itself comes from a
/// [`Pool<Vec<SendBuffer>>`] (the "send-context pool" of §3/§4.3) so that
/// repeated sends reuse the same heap allocation instead of growing a
/// fresh `Vec` every time.
pub struct SendContext {
    pub(crate) buffer_pool: Arc<Pool<BytesMut>>,
    context_pool: Arc<Pool<Vec<SendBuffer>>>,
    pub(crate) buffers: Vec<SendBuffer>,
    /// Resumption point for partial-batch sends (§4.3 "Partial-batch
    /// resumption"). Monotonically non-decreasing until the context is
    /// freed (§3 invariants).
    pub(crate) current_index: usize,
    /// Destination, set by `send_to`/`send_from_to` at issue time rather
    /// than at allocation (§6: `remote` is an input to the send entry
    /// points, not to `alloc_send_context` — a context is not tied to one
    /// peer until it is actually issued, so an unconnected binding can
    /// reuse the same allocation pattern to answer whichever sender a
    /// datagram arrived from).
    pub(crate) remote: QuicAddr,
}

impl SendContext {
    /// Allocates a context's backing storage from `context_pool`. Returns
    /// `None` on exhaustion (§6 `alloc_send_context` → `OUT_OF_MEMORY`):
    /// unlike arming a receive, this is a recoverable condition a caller
    /// can retry or drop, not a fatal one.
    pub(crate) fn new(buffer_pool: Arc<Pool<BytesMut>>, context_pool: Arc<Pool<Vec<SendBuffer>>>) -> Option<Self> {
        let buffers = context_pool.alloc()?;
        Some(SendContext {
            buffer_pool,
            context_pool,
            buffers,
            current_index: 0,
            remote: Tuple::zeroed(false).remote,
        })
    }

    /// Pulls one send buffer from the pool and appends it to the batch.
    /// Returns `None` once the batch is full or the pool is empty
    /// (§4.3, §8 property 3).
    pub fn alloc_datagram(&mut self, len: usize) -> Option<&mut SendBuffer> {
        if self.is_full() {
            return None;
        }
        debug_assert!(len <= MAX_UDP_PAYLOAD_LENGTH);

        let mut bytes = self.buffer_pool.alloc()?;
        bytes.resize(len, 0);

        self.buffers.push(SendBuffer {
            pool: self.buffer_pool.clone(),
            bytes: Some(bytes),
        });
        self.buffers.last_mut()
    }

    pub fn is_full(&self) -> bool {
        self.buffers.len() == MAX_SEND_BATCH_SIZE
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn remote(&self) -> QuicAddr {
        self.remote
    }

    /// Set by `Binding::send_to`/`send_from_to` before a context is ever
    /// handed to a socket; not part of the public allocation API.
    pub(crate) fn set_remote(&mut self, remote: QuicAddr) {
        self.remote = remote;
    }
}

impl Drop for SendContext {
    fn drop(&mut self) {
        let mut buffers = std::mem::take(&mut self.buffers);
        buffers.clear();
        self.context_pool.free(buffers);
    }
}

/// A send that returned `EWOULDBLOCK` and is parked on a socket context's
/// pending-send FIFO until the socket becomes writable again (§4.3
/// "Partial-batch resumption").
///
/// The two variants mirror the two send entry points: `send_to` issues one
/// `send(2)` per buffer on a connected socket and can resume mid-batch at
/// `CurrentIndex`; `send_from_to` issues a single `sendmsg(2)` carrying the
/// whole batch as one datagram, so its retry always restarts that one call
/// with no partial state.
pub enum PendingSend {
    PerDatagram(SendContext),
    Batched { ctx: SendContext, local: QuicAddr },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn remote() -> QuicAddr {
        QuicAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4433))
    }

    fn pool() -> Arc<Pool<BytesMut>> {
        Arc::new(Pool::new(16, || BytesMut::zeroed(MAX_UDP_PAYLOAD_LENGTH)))
    }

    fn ctx_pool() -> Arc<Pool<Vec<SendBuffer>>> {
        Arc::new(Pool::new(4, || Vec::with_capacity(MAX_SEND_BATCH_SIZE)))
    }

    #[test]
    fn batch_overflow_returns_none_and_reports_full() {
        let mut ctx = SendContext::new(pool(), ctx_pool()).unwrap();
        for _ in 0..MAX_SEND_BATCH_SIZE {
            assert!(ctx.alloc_datagram(1200).is_some());
        }
        assert!(ctx.is_full());
        assert!(ctx.alloc_datagram(1200).is_none());
    }

    #[test]
    fn exhausted_pool_also_returns_none() {
        let pool = Arc::new(Pool::new(1, || BytesMut::zeroed(MAX_UDP_PAYLOAD_LENGTH)));
        let mut ctx = SendContext::new(pool, ctx_pool()).unwrap();

        assert!(ctx.alloc_datagram(10).is_some());
        assert!(ctx.alloc_datagram(10).is_none());
        assert!(!ctx.is_full());
    }

    #[test]
    fn remote_defaults_to_unspecified_until_set() {
        let ctx = SendContext::new(pool(), ctx_pool()).unwrap();
        assert_ne!(ctx.remote(), remote());

        let mut ctx = ctx;
        ctx.set_remote(remote());
        assert_eq!(ctx.remote(), remote());
    }

    #[test]
    fn freeing_send_context_returns_all_buffers() {
        let pool = pool();
        let before = pool.idle_len();
        {
            let mut ctx = SendContext::new(pool.clone(), ctx_pool()).unwrap();
            ctx.alloc_datagram(100);
            ctx.alloc_datagram(100);
            assert_eq!(pool.idle_len(), before - 2);
        }
        assert_eq!(pool.idle_len(), before);
    }

    #[test]
    fn context_pool_exhaustion_is_recoverable() {
        let ctx_pool = Arc::new(Pool::new(1, || Vec::with_capacity(MAX_SEND_BATCH_SIZE)));
        let _held = SendContext::new(pool(), ctx_pool.clone()).expect("first alloc succeeds");
        assert!(
            SendContext::new(pool(), ctx_pool).is_none(),
            "exhausted context pool should return None, not fabricate storage"
        );
    }
}
