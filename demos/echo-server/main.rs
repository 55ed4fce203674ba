//! A small UDP echo server built on top of the `quic-datapath` library,
//! exercising the binding/send/receive API end to end. Not part of the
//! crate itself — this mirrors the way `firezone-relay`'s own `main.rs`
//! is a thin driver over the library crate it ships alongside.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use quic_datapath::{Datapath, DatapathConfig};

#[derive(Parser, Debug)]
#[command(about = "Echoes every UDP datagram it receives back to its sender")]
struct Cli {
    /// Address to listen on, e.g. `127.0.0.1:4433` or `[::]:4433`.
    #[arg(long, default_value = "127.0.0.1:4433")]
    listen: SocketAddr,

    /// Number of worker threads. Defaults to one per logical CPU.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let config = DatapathConfig {
        worker_count: cli.workers,
        ..Default::default()
    };

    let datapath = Datapath::init(config).expect("failed to initialize datapath");
    tracing::info!(workers = datapath.worker_count(), "datapath started");

    let local = cli.listen.into();
    let echoed = Arc::new(AtomicU64::new(0));
    let client_context: Arc<dyn std::any::Any + Send + Sync> = echoed.clone();

    let recv_handler = {
        let echoed = echoed.clone();
        Arc::new(move |binding: &quic_datapath::Binding, ctx: &quic_datapath::ClientContext, mut block: quic_datapath::ReceiveBlock| {
            let _ = ctx;
            let tuple = block.tuple;
            let partition_index = block.partition_index;
            let len = block.payload().len();

            let mut send_ctx = match binding.alloc_send_context(partition_index, len) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to allocate send context, dropping reply");
                    quic_datapath::return_recv_datagrams(Some(Box::new(block)));
                    return;
                }
            };
            if let Some(buf) = send_ctx.alloc_datagram(len) {
                buf.as_mut_slice().copy_from_slice(block.payload());
            }

            if let Err(e) = binding.send_from_to(partition_index, tuple.local, tuple.remote, send_ctx) {
                tracing::debug!(error = %e, remote = %tuple.remote, "failed to echo datagram");
            } else {
                echoed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(remote = %tuple.remote, len, "echoed datagram");
            }

            block.next = None;
            quic_datapath::return_recv_datagrams(Some(Box::new(block)));
        })
    };

    let unreachable_handler = Arc::new(|binding: &quic_datapath::Binding, _ctx: &quic_datapath::ClientContext| {
        tracing::debug!(local = %binding.local_address(), "peer unreachable");
    });

    let binding = datapath
        .binding_create(Some(local), None, recv_handler, unreachable_handler, client_context)
        .expect("failed to create binding");

    tracing::info!(local = %binding.local_address(), "listening");

    ctrlc::set_handler({
        let echoed = echoed.clone();
        move || {
            tracing::info!(echoed = echoed.load(Ordering::Relaxed), "shutting down");
            std::process::exit(0);
        }
    })
    .expect("failed to install Ctrl-C handler");

    // Block forever; the worker threads do all the work. Ctrl-C exits the
    // process directly rather than threading a graceful shutdown through
    // here, since this is a demo, not a long-lived service.
    loop {
        std::thread::park();
    }
}
