//! Datapath root (§3 "Datapath", §4.4 "Init"/"Uninit").
//!
//! The process-wide (or, more precisely, per-embedding) handle: one worker
//! per logical CPU by default, a rundown tracking every live binding, and
//! the two constructor entry points — `resolve_address` and
//! `binding_create` — that everything else hangs off of.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::addr::QuicAddr;
use crate::binding::Binding;
use crate::callback::{ClientContext, ReceiveHandler, UnreachableHandler};
use crate::config::DatapathConfig;
use crate::error::{Error, Result};
use crate::rundown::Rundown;
use crate::worker::Worker;

/// The root datapath handle. Construction spins up one worker thread per
/// configured partition; `uninit` blocks until every binding created from
/// this handle has been deleted, then joins every worker thread.
pub struct Datapath {
    workers: Vec<Arc<Worker>>,
    bindings_rundown: Rundown,
}

impl Datapath {
    /// `datapath_init` (§4.4): starts the worker pool. Mirrors
    /// `QuicDataPathInitialize`'s processor-context array construction,
    /// one `QUIC_DATAPATH_PROC_CONTEXT` per worker.
    pub fn init(config: DatapathConfig) -> Result<Self> {
        let worker_count = config.resolved_worker_count();
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            workers.push(Arc::new(Worker::spawn(index, &config)?));
        }

        tracing::info!(worker_count, "datapath initialized");

        Ok(Datapath {
            workers,
            bindings_rundown: Rundown::new(),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub(crate) fn bindings_rundown(&self) -> &Rundown {
        &self.bindings_rundown
    }

    /// `binding_create` (§4.4, §6): builds one socket per worker, all
    /// sharing a single local (and optionally remote) address.
    #[allow(clippy::too_many_arguments)]
    pub fn binding_create(
        &self,
        local_address: Option<QuicAddr>,
        remote_address: Option<QuicAddr>,
        recv_handler: ReceiveHandler,
        unreachable_handler: UnreachableHandler,
        client_context: ClientContext,
    ) -> Result<Arc<Binding>> {
        Binding::create(
            self,
            local_address,
            remote_address,
            recv_handler,
            unreachable_handler,
            client_context,
        )
    }

    /// `resolve_address` (§4.4, §6), translated from
    /// `QuicDataPathResolveAddress`: tries the host as a numeric literal
    /// first, falling back to a canonical-name DNS lookup only if that
    /// fails, so a bracketed/plain IP never pays for a resolver round trip.
    pub fn resolve_address(host: &str, port: u16) -> Result<QuicAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(QuicAddr::from(SocketAddr::new(ip, port)));
        }

        (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(QuicAddr::from)
            .ok_or_else(|| Error::DnsResolutionError(host.to_string()))
    }

    /// `datapath_uninit` (§4.4): blocks until every binding created from
    /// this handle has called `delete`, then shuts down and joins every
    /// worker thread.
    pub fn uninit(self) {
        self.bindings_rundown.release_and_wait();
        tracing::info!("all bindings drained, shutting down workers");
        for worker in &self.workers {
            worker.shutdown();
        }
    }
}
