//! End-to-end loopback scenarios (spec §8): real worker threads, real UDP
//! sockets, no mocking of the kernel. Mirrors the driving style of
//! `relay/server/src/sockets.rs`'s own test suite, adapted to plain OS
//! threads since the datapath itself runs on them rather than Tokio.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use quic_datapath::{
    return_recv_datagrams, Binding, ClientContext, Datapath, DatapathConfig, QuicAddr,
    ReceiveBlock,
};

fn single_worker_config() -> DatapathConfig {
    DatapathConfig {
        worker_count: Some(1),
        ..Default::default()
    }
}

fn no_context() -> ClientContext {
    Arc::new(())
}

fn silent_unreachable() -> Arc<dyn Fn(&Binding, &ClientContext) + Send + Sync> {
    Arc::new(|_: &Binding, _: &ClientContext| {})
}

fn discarding_receiver() -> Arc<dyn Fn(&Binding, &ClientContext, ReceiveBlock) + Send + Sync> {
    Arc::new(|_: &Binding, _: &ClientContext, block: ReceiveBlock| {
        return_recv_datagrams(Some(Box::new(block)));
    })
}

/// S1: loopback echo, v4. One datagram sent from a connected binding B to
/// a listening binding A arrives exactly once, with the expected payload
/// and addresses on both sides.
#[test]
fn loopback_echo_v4_delivers_payload_and_addresses() {
    let datapath = Datapath::init(single_worker_config()).expect("datapath init");

    let (tx, rx) = mpsc::channel::<(Vec<u8>, SocketAddr, SocketAddr)>();
    let recv_handler = Arc::new(move |_b: &Binding, _c: &ClientContext, block: ReceiveBlock| {
        let payload = block.payload().to_vec();
        let tuple = block.tuple;
        let _ = tx.send((payload, tuple.local.into(), tuple.remote.into()));
        return_recv_datagrams(Some(Box::new(block)));
    });

    let local_a = QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
    let binding_a = datapath
        .binding_create(
            Some(local_a),
            None,
            recv_handler,
            silent_unreachable(),
            no_context(),
        )
        .expect("binding A create");
    let port_a = binding_a.local_address().port();
    let remote_for_b = QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, port_a)));

    let binding_b = datapath
        .binding_create(
            None,
            Some(remote_for_b),
            discarding_receiver(),
            silent_unreachable(),
            no_context(),
        )
        .expect("binding B create");
    let port_b = binding_b.local_address().port();

    let mut ctx = binding_b
        .alloc_send_context(0, 100)
        .expect("alloc send context");
    {
        let buf = ctx.alloc_datagram(100).expect("alloc datagram");
        buf.as_mut_slice().fill(0xAB);
    }
    binding_b
        .send_to(0, remote_for_b, ctx)
        .expect("send_to should succeed or defer");

    let (payload, local, remote) = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("binding A should receive the echoed datagram");

    assert_eq!(payload.len(), 100);
    assert!(payload.iter().all(|&b| b == 0xAB));
    assert_eq!(local.port(), port_a);
    assert_eq!(remote.ip(), std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(remote.port(), port_b);

    binding_a.delete();
    binding_b.delete();
    datapath.uninit();
}

/// S2: loopback echo, v6 dual-stack — same shape as S1 but on `[::1]`,
/// exercising the `IPV6_PKTINFO` path and v4-mapped-address normalization
/// on a dual-stack socket.
#[test]
fn loopback_echo_v6_delivers_payload_and_addresses() {
    let datapath = Datapath::init(single_worker_config()).expect("datapath init");

    let (tx, rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>();
    let recv_handler = Arc::new(move |_b: &Binding, _c: &ClientContext, block: ReceiveBlock| {
        let payload = block.payload().to_vec();
        let tuple = block.tuple;
        let _ = tx.send((payload, tuple.local.into()));
        return_recv_datagrams(Some(Box::new(block)));
    });

    let local_a = QuicAddr::from(SocketAddr::from((Ipv6Addr::LOCALHOST, 0)));
    let binding_a = datapath
        .binding_create(
            Some(local_a),
            None,
            recv_handler,
            silent_unreachable(),
            no_context(),
        )
        .expect("binding A create");
    let port_a = binding_a.local_address().port();
    let remote_for_b = QuicAddr::from(SocketAddr::from((Ipv6Addr::LOCALHOST, port_a)));

    let binding_b = datapath
        .binding_create(
            None,
            Some(remote_for_b),
            discarding_receiver(),
            silent_unreachable(),
            no_context(),
        )
        .expect("binding B create");

    let mut ctx = binding_b
        .alloc_send_context(0, 50)
        .expect("alloc send context");
    {
        let buf = ctx.alloc_datagram(50).expect("alloc datagram");
        buf.as_mut_slice().fill(0xCD);
    }
    binding_b
        .send_to(0, remote_for_b, ctx)
        .expect("send_to should succeed or defer");

    let (payload, local) = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("binding A should receive the echoed datagram");

    assert_eq!(payload.len(), 50);
    assert_eq!(local.port(), port_a);
    assert!(!local.is_ipv6() || matches!(local.ip(), std::net::IpAddr::V6(ip) if ip == Ipv6Addr::LOCALHOST));

    binding_a.delete();
    binding_b.delete();
    datapath.uninit();
}

/// S3: batch send. Ten buffers submitted in one `alloc_send_datagram`
/// batch arrive in submission order.
#[test]
fn batch_send_preserves_submission_order() {
    let datapath = Datapath::init(single_worker_config()).expect("datapath init");

    let (tx, rx) = mpsc::channel::<u32>();
    let recv_handler = Arc::new(move |_b: &Binding, _c: &ClientContext, block: ReceiveBlock| {
        let mut idx_bytes = [0u8; 4];
        idx_bytes.copy_from_slice(&block.payload()[..4]);
        let _ = tx.send(u32::from_be_bytes(idx_bytes));
        return_recv_datagrams(Some(Box::new(block)));
    });

    let local_a = QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
    let binding_a = datapath
        .binding_create(
            Some(local_a),
            None,
            recv_handler,
            silent_unreachable(),
            no_context(),
        )
        .expect("binding A create");
    let remote_for_b = QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, binding_a.local_address().port())));

    let binding_b = datapath
        .binding_create(
            None,
            Some(remote_for_b),
            discarding_receiver(),
            silent_unreachable(),
            no_context(),
        )
        .expect("binding B create");

    let mut ctx = binding_b
        .alloc_send_context(0, 1200)
        .expect("alloc send context");
    for i in 0u32..10 {
        let buf = ctx.alloc_datagram(1200).expect("batch has room for ten");
        buf.as_mut_slice()[..4].copy_from_slice(&i.to_be_bytes());
    }
    assert!(ctx.is_full());
    binding_b.send_to(0, remote_for_b, ctx).expect("send_to");

    let mut received = Vec::new();
    for _ in 0..10 {
        received.push(
            rx.recv_timeout(Duration::from_secs(2))
                .expect("all ten datagrams should arrive"),
        );
    }

    assert_eq!(received, (0u32..10).collect::<Vec<_>>());

    binding_a.delete();
    binding_b.delete();
    datapath.uninit();
}

/// S4: batch overflow. An eleventh `alloc_send_datagram` call fails and
/// `is_full` reports the batch as full, without ever touching the network.
#[test]
fn eleventh_datagram_allocation_fails() {
    let datapath = Datapath::init(single_worker_config()).expect("datapath init");
    let local = QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
    let binding = datapath
        .binding_create(
            Some(local),
            None,
            discarding_receiver(),
            silent_unreachable(),
            no_context(),
        )
        .expect("binding create");

    let mut ctx = binding
        .alloc_send_context(0, 1200)
        .expect("alloc send context");
    for _ in 0..10 {
        assert!(ctx.alloc_datagram(1200).is_some());
    }
    assert!(ctx.is_full());
    assert!(ctx.alloc_datagram(1200).is_none());

    binding.delete();
    datapath.uninit();
}

/// S6: shutdown under load. No receive callback is delivered for a
/// binding after `binding_delete` has returned, even with a sender still
/// actively transmitting to it.
#[test]
fn no_callback_fires_after_binding_delete() {
    let datapath = Datapath::init(single_worker_config()).expect("datapath init");

    let received = Arc::new(AtomicU32::new(0));
    let received_in_handler = received.clone();
    let recv_handler = Arc::new(move |_b: &Binding, _c: &ClientContext, block: ReceiveBlock| {
        received_in_handler.fetch_add(1, Ordering::SeqCst);
        return_recv_datagrams(Some(Box::new(block)));
    });

    let local_a = QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
    let binding_a = datapath
        .binding_create(
            Some(local_a),
            None,
            recv_handler,
            silent_unreachable(),
            no_context(),
        )
        .expect("binding A create");
    let port_a = binding_a.local_address().port();
    let remote_for_b = QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, port_a)));

    let binding_b = datapath
        .binding_create(
            None,
            Some(remote_for_b),
            discarding_receiver(),
            silent_unreachable(),
            no_context(),
        )
        .expect("binding B create");

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let sender_thread = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if let Ok(mut ctx) = binding_b.alloc_send_context(0, 64) {
                    if let Some(buf) = ctx.alloc_datagram(64) {
                        buf.as_mut_slice().fill(1);
                    }
                    let _ = binding_b.send_to(0, remote_for_b, ctx);
                }
                std::thread::sleep(Duration::from_micros(200));
            }
            binding_b.delete();
        })
    };

    // Let some traffic actually flow before tearing the receiver down.
    std::thread::sleep(Duration::from_millis(50));
    assert!(received.load(Ordering::SeqCst) > 0, "traffic should have flowed before shutdown");

    binding_a.delete();
    let count_at_delete = received.load(Ordering::SeqCst);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        received.load(Ordering::SeqCst),
        count_at_delete,
        "no callback should fire for a binding after its delete() has returned"
    );

    stop.store(true, Ordering::Relaxed);
    sender_thread.join().unwrap();
    datapath.uninit();
}

/// Address-echo property (§8 property 4): the local address reported by a
/// binding matches what the OS actually bound to (`getsockname`).
#[test]
fn local_address_matches_getsockname() {
    let datapath = Datapath::init(single_worker_config()).expect("datapath init");
    let local = QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
    let binding = datapath
        .binding_create(
            Some(local),
            None,
            discarding_receiver(),
            silent_unreachable(),
            no_context(),
        )
        .expect("binding create");

    assert_ne!(binding.local_address().port(), 0);
    assert_eq!(
        binding.local_address(),
        QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, binding.local_address().port())))
    );

    binding.delete();
    datapath.uninit();
}

/// Two bindings created from the same datapath each get one socket
/// context per worker (§3 invariant: "a binding publishes exactly
/// ProcCount socket contexts").
#[test]
fn binding_has_one_socket_context_per_worker() {
    let datapath = Datapath::init(DatapathConfig {
        worker_count: Some(3),
        ..Default::default()
    })
    .expect("datapath init");

    let local = QuicAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
    let binding = datapath
        .binding_create(
            Some(local),
            None,
            discarding_receiver(),
            silent_unreachable(),
            no_context(),
        )
        .expect("binding create");

    assert_eq!(binding.worker_count(), 3);
    assert!(binding.alloc_send_context(2, 10).is_ok());
    assert!(binding.alloc_send_context(3, 10).is_err());

    binding.delete();
    datapath.uninit();
}

/// Guards against accidental regressions in teardown ordering: dropping a
/// datapath with no bindings ever created should not hang.
#[test]
fn uninit_with_no_bindings_returns_immediately() {
    let datapath = Datapath::init(single_worker_config()).expect("datapath init");
    datapath.uninit();
}
