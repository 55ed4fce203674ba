//! Fixed-size, multi-producer/single-consumer-ish free list (§4.1).
//!
//! One [`Pool<T>`] backs receive blocks, one backs send buffers and one
//! backs send contexts, per worker (§3). `alloc` is only ever called from
//! the owning worker's thread; `free` may be called from any thread
//! (a receive block is handed to the user, who may return it from
//! wherever they like — §5 "Cancellation").
//!
//! We back this with [`crossbeam_queue::ArrayQueue`], a bounded lock-free
//! MPMC ring buffer, rather than the teacher's `lockfree_object_pool`
//! (see `bufferpool/lib.rs`): the spec requires `alloc` to return `nil` on
//! exhaustion (a hard capacity), whereas `lockfree_object_pool` grows the
//! pool on a miss. `crossbeam-queue` is already part of the teacher's
//! workspace dependency set (used elsewhere in `firezone-firezone`), so
//! this keeps the dependency stack aligned without pulling in a new crate.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// A fixed-capacity free list of `T`, pinned to one worker.
pub struct Pool<T> {
    free: ArrayQueue<T>,
}

impl<T> Pool<T> {
    /// Creates a pool with room for `capacity` idle elements, pre-filled by
    /// calling `make` once per slot. Exhaustion past `capacity` is not
    /// papered over anywhere: callers decide per call-site whether running
    /// dry is fatal (arming a receive, §4.2/§7) or recoverable
    /// (`alloc_send_context`/`alloc_send_datagram`, §6).
    pub fn new(capacity: usize, make: impl Fn() -> T) -> Self {
        let free = ArrayQueue::new(capacity.max(1));
        for _ in 0..capacity {
            // `push` cannot fail: we sized the queue to `capacity`.
            let _ = free.push(make());
        }

        Pool { free }
    }

    /// Returns capacity worth of elements, `None` once the free list is
    /// empty and no element has been freed back yet (§4.1: "alloc returns
    /// a zeroed element or nil on exhaustion").
    pub fn alloc(&self) -> Option<T> {
        self.free.pop()
    }

    /// Returns an element to the free list. Safe to call from any thread.
    /// If the pool is momentarily over capacity (more outstanding frees
    /// than the configured size, which should not happen in practice) the
    /// element is simply dropped instead of leaking the queue's capacity
    /// invariant.
    pub fn free(&self, value: T) {
        let _ = self.free.push(value);
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    pub fn idle_len(&self) -> usize {
        self.free.len()
    }
}

/// A pool shared by every socket context on one worker.
pub type SharedPool<T> = Arc<Pool<T>>;
