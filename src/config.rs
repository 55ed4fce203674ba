//! Tunables for a [`crate::datapath::Datapath`] instance (ambient
//! configuration layer; the original hard-codes every one of these).
//!
//! There is no CLI/env parsing in the library itself — that belongs to
//! whatever binary embeds the datapath (see `demos/echo-server`). A
//! `Default` impl provides the same constants the original's
//! `QuicDataPathInitialize` and `QuicSocketContextInitialize` hard-code.

/// Per-worker tunables, applied identically to every worker (§4.1 "Pools:
/// sized once at worker-set construction time").
#[derive(Debug, Clone, Copy)]
pub struct DatapathConfig {
    /// Number of workers to start. `None` defers to one per logical CPU
    /// (§4.1 "ProcCount", `QuicProcActiveProcessorCount` in the original).
    pub worker_count: Option<usize>,
    /// Idle capacity of each worker's receive-block pool.
    pub recv_block_pool_size: usize,
    /// Idle capacity of each worker's send-buffer pool.
    pub send_buffer_pool_size: usize,
    /// Idle capacity of each worker's send-context backing-storage pool.
    pub send_context_pool_size: usize,
    /// Capacity of the `mio::Events` buffer each worker polls into per
    /// iteration.
    pub events_capacity: usize,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        DatapathConfig {
            worker_count: None,
            recv_block_pool_size: 256,
            send_buffer_pool_size: 256,
            send_context_pool_size: 64,
            events_capacity: 128,
        }
    }
}

impl DatapathConfig {
    /// Resolves [`Self::worker_count`] against the host's logical CPU
    /// count, mirroring the original's `CxPlatProcessorCount()` query via
    /// `sysctlbyname("hw.logicalcpu")`.
    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(num_cpus::get).max(1)
    }
}
