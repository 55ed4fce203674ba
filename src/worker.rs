//! Per-worker readiness loop (§3 "Worker"/"ProcessorContext", §4.4).
//!
//! One OS thread per worker, each driving its own `mio::Poll`. Modeled on
//! `relay/server/src/sockets.rs`'s `mio_worker_task`: a dedicated thread
//! owns the event loop privately, and every other thread talks to it
//! through a command channel plus an explicit wake event rather than
//! touching its state directly. The one deliberate departure from that
//! model: `sockets.rs` bridges back to an async `tokio::mpsc` channel,
//! while this datapath's workers are plain OS threads end to end, so a
//! `std::sync::mpsc` channel is enough.
//!
//! The wake event itself is a [`mio::Waker`], which is backed by
//! `EVFILT_USER` on kqueue platforms and `eventfd` on Linux — the same
//! explicit-wake primitive the receive/send data flow calls for (§4.4
//! "Wakeup from idle").

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use bytes::BytesMut;
use mio::{Events, Poll, Token, Waker};

use crate::binding::Binding;
use crate::config::DatapathConfig;
use crate::pool::Pool;
use crate::recv::{PartitionIndex, MAX_UDP_PAYLOAD_LENGTH};
use crate::send::{SendBuffer, MAX_SEND_BATCH_SIZE};
use crate::socket::{SocketContext, SocketPools};

const WAKE_TOKEN: Token = Token(usize::MAX);

enum Command {
    Register {
        token: Token,
        ctx: Arc<SocketContext>,
        binding: Arc<Binding>,
    },
    Unregister(Token),
    ArmWritable(Token),
    Shutdown,
}

/// A worker's pools, cloned out for binding creation to build
/// [`SocketPools`] from (§3 "one set per worker").
#[derive(Clone)]
pub(crate) struct WorkerPools {
    pub recv_blocks: Arc<Pool<BytesMut>>,
    pub send_buffers: Arc<Pool<BytesMut>>,
    pub send_contexts: Arc<Pool<Vec<SendBuffer>>>,
}

impl WorkerPools {
    fn new(config: &DatapathConfig) -> Self {
        WorkerPools {
            recv_blocks: Arc::new(Pool::new(config.recv_block_pool_size, || {
                BytesMut::zeroed(MAX_UDP_PAYLOAD_LENGTH)
            })),
            send_buffers: Arc::new(Pool::new(config.send_buffer_pool_size, || {
                BytesMut::zeroed(MAX_UDP_PAYLOAD_LENGTH)
            })),
            send_contexts: Arc::new(Pool::new(config.send_context_pool_size, || {
                Vec::with_capacity(MAX_SEND_BATCH_SIZE)
            })),
        }
    }

    pub(crate) fn socket_pools(&self) -> SocketPools {
        SocketPools {
            recv_blocks: self.recv_blocks.clone(),
            send_buffers: self.send_buffers.clone(),
            send_contexts: self.send_contexts.clone(),
        }
    }
}

/// A handle to one worker thread. Cloning is cheap (an `Arc` internally);
/// every binding holds one handle per worker it has a socket on.
pub struct Worker {
    index: PartitionIndex,
    pools: WorkerPools,
    waker: Arc<Waker>,
    commands: mpsc::Sender<Command>,
    next_token: AtomicUsize,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn spawn(index: PartitionIndex, config: &DatapathConfig) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, rx) = mpsc::channel();
        let pools = WorkerPools::new(config);
        let events_capacity = config.events_capacity;

        let handle = std::thread::Builder::new()
            .name(format!("quic-datapath-worker-{index}"))
            .spawn(move || run(poll, rx, events_capacity))?;

        Ok(Worker {
            index,
            pools,
            waker,
            commands: tx,
            next_token: AtomicUsize::new(0),
            handle: parking_lot::Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn index(&self) -> PartitionIndex {
        self.index
    }

    pub(crate) fn pools(&self) -> &WorkerPools {
        &self.pools
    }

    /// Allocates a fresh token for a new socket on this worker. Tokens are
    /// scoped to one worker's `mio::Poll`, so a plain per-worker counter is
    /// enough (unlike `sockets.rs`, which encodes port/family into the
    /// token because one `Poll` there multiplexes every socket process-wide).
    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, token: Token, ctx: Arc<SocketContext>, binding: Arc<Binding>) {
        let _ = self.commands.send(Command::Register { token, ctx, binding });
        let _ = self.waker.wake();
    }

    pub(crate) fn unregister(&self, token: Token) {
        let _ = self.commands.send(Command::Unregister(token));
        let _ = self.waker.wake();
    }

    /// Re-arms write-interest for `token`, routed through the command
    /// channel rather than called directly against the registry from
    /// the caller's thread. `send_to`/`send_from_to` run synchronously
    /// on whatever thread calls them, and registration itself is only
    /// processed by this same channel (`Command::Register`); sending the
    /// rearm through it too means it can never reach the registry ahead
    /// of the socket's own registration, even if a caller enqueues a
    /// pending send within the same instant a binding is created.
    pub(crate) fn arm_writable(&self, token: Token) {
        let _ = self.commands.send(Command::ArmWritable(token));
        let _ = self.waker.wake();
    }

    /// Signals the worker's event loop to exit and joins its thread.
    /// Called only from `Datapath::uninit`, after every binding's rundown
    /// has drained (§4.4 "Teardown"). Idempotent and callable through a
    /// shared reference since a `Worker` may still be reachable via
    /// stray `Arc` clones (e.g. a binding the caller forgot to delete).
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.lock().is_some() {
            self.shutdown();
        }
    }
}

fn run(mut poll: Poll, commands: mpsc::Receiver<Command>, events_capacity: usize) {
    let registry = match poll.registry().try_clone() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "worker failed to clone registry; exiting");
            return;
        }
    };

    let mut sockets: HashMap<Token, (Arc<SocketContext>, Arc<Binding>)> = HashMap::new();
    let mut events = Events::with_capacity(events_capacity);
    let mut shutting_down = false;

    'outer: loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %e, "worker poll failed; exiting");
            break;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                while let Ok(cmd) = commands.try_recv() {
                    match cmd {
                        Command::Register { token, ctx, binding } => {
                            if let Err(e) = ctx.register(&registry) {
                                tracing::warn!(error = %e, "failed to register socket with worker");
                                continue;
                            }
                            ctx.arm_receive();
                            sockets.insert(token, (ctx, binding));
                        }
                        Command::Unregister(token) => {
                            if let Some((ctx, _binding)) = sockets.remove(&token) {
                                let _ = ctx.deregister(&registry);
                                // `ctx` drops here: its RundownGuard
                                // releases, unblocking a waiting
                                // `binding_delete` once every socket on
                                // every worker has done the same.
                            }
                        }
                        Command::ArmWritable(token) => {
                            if let Some((ctx, _binding)) = sockets.get(&token) {
                                if let Err(e) = ctx.reregister_writable(&registry) {
                                    tracing::warn!(error = %e, "failed to arm write-interest");
                                }
                            }
                        }
                        Command::Shutdown => shutting_down = true,
                    }
                }
                continue;
            }

            let token = event.token();
            let Some((ctx, binding)) = sockets.get(&token) else {
                continue;
            };
            if event.is_readable() {
                ctx.on_readable(binding);
            }
            if event.is_writable() {
                ctx.on_writable(&registry);
            }
        }

        if shutting_down {
            break 'outer;
        }
    }
}
