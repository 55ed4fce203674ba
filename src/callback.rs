//! Upcall signatures (§3 "Datapath", §6 external API table).
//!
//! The original threads an opaque `void *ClientRecvContext` of
//! `ClientRecvContextLength` bytes through every callback. We keep the
//! "opaque to the datapath" contract but represent it with a type-erased
//! `Arc` instead of a raw buffer, since nothing in this crate ever needs to
//! know its layout, only to hand it back unchanged.

use std::sync::Arc;

use crate::binding::Binding;
use crate::recv::ReceiveBlock;

/// Opaque, caller-supplied state handed back unchanged on every upcall for
/// a given binding.
pub type ClientContext = Arc<dyn std::any::Any + Send + Sync>;

/// Invoked once per received datagram (chain), from whichever worker
/// thread owns the socket it arrived on (§4.2 "Readiness dispatch"). Must
/// not block for long: it runs on the hot path, inline with the next
/// `recvmsg` for that socket.
pub type ReceiveHandler = Arc<dyn Fn(&Binding, &ClientContext, ReceiveBlock) + Send + Sync>;

/// Invoked when a send fails with `ECONNREFUSED`/`ENETUNREACH`/similar,
/// signaling that the remote endpoint is unreachable (§3 "Datapath",
/// `QuicDataPathUnreachableCallback` in the original).
pub type UnreachableHandler = Arc<dyn Fn(&Binding, &ClientContext) + Send + Sync>;
