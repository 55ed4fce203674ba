//! Error taxonomy for the datapath (§7).
//!
//! Expected conditions (`EAGAIN`/`EWOULDBLOCK` on send, `EAGAIN`/`EINTR` on
//! receive) never surface here — they are recovered locally in
//! [`crate::socket`]. Everything that does surface is either a setup
//! failure scoped to a single binding, or a genuine programmer/caller
//! error.

use thiserror::Error;

/// Unified result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A required callback or argument was missing or nonsensical.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Allocation from a fixed-size pool failed; pools never grow.
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    /// `resolve_address` could not resolve the given hostname.
    #[error("failed to resolve hostname '{0}' to an IP address")]
    DnsResolutionError(String),

    /// An invariant the datapath relies on the OS to uphold was violated
    /// (e.g. a packet without the ancillary data we requested). These are
    /// structural, not recoverable, and the caller should treat them as
    /// fatal to the affected worker.
    #[error("internal datapath error: {0}")]
    Internal(&'static str),

    /// Passthrough socket/OS error from a setup step (socket/bind/connect/
    /// registration) or from a send/receive that failed for a reason other
    /// than would-block.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
