//! Receive blocks (§3 "ReceiveBlock", §4.2).
//!
//! A `ReceiveBlock` is simultaneously owned by exactly one party at a
//! time: its pool (idle), the socket context that armed it (in flight),
//! or the user (between callback dispatch and [`ReceiveBlock`] drop /
//! explicit return). The owning-pool back-pointer never changes after
//! allocation (§3 invariants).

use std::sync::Arc;

use bytes::BytesMut;

use crate::addr::Tuple;
use crate::pool::Pool;

/// Maximum UDP payload this datapath will ever hand to the upper layer in
/// one datagram (§6 "MAX_UDP_PAYLOAD_LENGTH"). Sized generously above the
/// largest possible UDP payload so a single receive never truncates.
pub const MAX_UDP_PAYLOAD_LENGTH: usize = 65527;

/// The worker index stamped on every datagram delivered through it, so the
/// upper layer can route follow-up work back to the same core (§ Glossary
/// "Partition index").
pub type PartitionIndex = usize;

/// A pre-allocated container for one inbound datagram: the kernel-filled
/// payload, the recovered 4-tuple, and a pool back-pointer (§3).
pub struct ReceiveBlock {
    owning_pool: Arc<Pool<BytesMut>>,
    buffer: Option<BytesMut>,
    pub tuple: Tuple,
    pub partition_index: PartitionIndex,
    /// `next` link for the datagram chain (§4.2 "Chaining"). The receive
    /// path currently only ever produces single-element chains, but
    /// `return_recv_datagrams` walks this link regardless, so a future
    /// coalescing implementation needs no API change.
    pub next: Option<Box<ReceiveBlock>>,
}

impl ReceiveBlock {
    /// Arms one receive block from `owning_pool`. Pool exhaustion here is
    /// a structural violation the spec treats as fatal (§4.2 "Failure to
    /// allocate is fatal", §7 "pool exhaustion when rearming a receive...
    /// the process terminates"): unlike send-side allocation, there is no
    /// recoverable path back to a caller, so this kills the thread that
    /// was arming the receive (the owning worker) rather than silently
    /// growing the pool past its configured capacity.
    pub(crate) fn new(owning_pool: Arc<Pool<BytesMut>>, tuple: Tuple, partition_index: usize) -> Self {
        let buffer = owning_pool.alloc().unwrap_or_else(|| {
            panic!("datapath: receive-block pool exhausted while arming a receive")
        });
        ReceiveBlock {
            owning_pool,
            buffer: Some(buffer),
            tuple,
            partition_index,
            next: None,
        }
    }

    /// Mutable access to the inline payload buffer, sized to
    /// [`MAX_UDP_PAYLOAD_LENGTH`], used as the `recvmsg` I/O vector target.
    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buffer.get_or_insert_with(|| BytesMut::zeroed(MAX_UDP_PAYLOAD_LENGTH))
    }

    /// Truncates the buffer to the byte count the kernel actually reported
    /// and returns the payload as seen by the upper-layer callback.
    pub(crate) fn set_len(&mut self, len: usize) {
        if let Some(buf) = self.buffer.as_mut() {
            buf.truncate(len);
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl Drop for ReceiveBlock {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            let mut buf = buf;
            buf.resize(MAX_UDP_PAYLOAD_LENGTH, 0);
            self.owning_pool.free(buf);
        }
    }
}

/// Walks a datagram chain and returns every block to its owning pool
/// (§6 `return_recv_datagrams`). Dropping the head is sufficient since
/// [`ReceiveBlock::drop`] already returns its own buffer; this just makes
/// the chain-walk explicit and documented, matching
/// `QuicDataPathBindingReturnRecvDatagrams`.
pub fn return_recv_datagrams(mut chain: Option<Box<ReceiveBlock>>) {
    while let Some(mut block) = chain.take() {
        chain = block.next.take();
        drop(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::QuicAddr;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn tuple() -> Tuple {
        let a = QuicAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1234));
        Tuple { local: a, remote: a }
    }

    #[test]
    fn freeing_a_block_returns_its_buffer_to_its_own_pool() {
        let pool = Arc::new(Pool::new(2, || BytesMut::zeroed(MAX_UDP_PAYLOAD_LENGTH)));
        assert_eq!(pool.idle_len(), 2);

        let block = ReceiveBlock::new(pool.clone(), tuple(), 0);
        assert_eq!(pool.idle_len(), 1);

        drop(block);
        assert_eq!(pool.idle_len(), 2);
    }

    #[test]
    fn chain_return_frees_every_link() {
        let pool = Arc::new(Pool::new(3, || BytesMut::zeroed(MAX_UDP_PAYLOAD_LENGTH)));

        let mut head = Box::new(ReceiveBlock::new(pool.clone(), tuple(), 0));
        head.next = Some(Box::new(ReceiveBlock::new(pool.clone(), tuple(), 0)));
        assert_eq!(pool.idle_len(), 1);

        return_recv_datagrams(Some(head));
        assert_eq!(pool.idle_len(), 3);
    }

    #[test]
    fn set_len_truncates_payload() {
        let pool = Arc::new(Pool::new(1, || BytesMut::zeroed(MAX_UDP_PAYLOAD_LENGTH)));
        let mut block = ReceiveBlock::new(pool, tuple(), 0);
        block.buffer_mut()[..5].copy_from_slice(b"hello");
        block.set_len(5);
        assert_eq!(block.payload(), b"hello");
    }
}
