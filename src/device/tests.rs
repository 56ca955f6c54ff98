use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand_core::OsRng;
use tokio::sync::mpsc;
use tokio::time::timeout;
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::IntoBytes;

use crate::device::{self, Device, DeviceState, Error, ObfuscationConfig, Peer};
use crate::device::{UNDER_LOAD_AFTER_TIME, queues::QUEUE_HANDSHAKE_SIZE};
use crate::packet::{CnHandshakeInit, Ip, Packet, TYPE_HANDSHAKE_INIT};
use crate::tun::channel::{TunChannel, TunChannelHost, new_tun_channel};
use crate::udp::channel::{UdpChannelFactory, UdpChannelHost, new_udp_channel};

type TestTransports = (UdpChannelFactory, TunChannel, TunChannel);

struct TestHarness {
    device: Device<TestTransports>,
    tun: TunChannelHost,
    udp: UdpChannelHost,
    key: StaticSecret,
}

async fn test_device() -> TestHarness {
    let (udp_host, udp) = new_udp_channel(2048);
    let (tun_host, tun) = new_tun_channel(2048);
    let key = StaticSecret::random_from_rng(OsRng);

    let device = device::build()
        .with_udp(udp)
        .with_ip(tun)
        .with_private_key(key.clone())
        .build()
        .await
        .expect("device builds");

    TestHarness {
        device,
        tun: tun_host,
        udp: udp_host,
        key,
    }
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr) -> Packet<Ip> {
    let mut buf = vec![0u8; 32];
    buf[0] = 0x45; // version 4, ihl 5
    buf[2..4].copy_from_slice(&32u16.to_be_bytes()); // total_len
    buf[8] = 64; // ttl
    buf[9] = 17; // udp
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    Packet::copy_from(&buf).try_into_ip().expect("valid size")
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// A device with no peers comes up cleanly.
#[tokio::test]
async fn up_with_no_peers() {
    let harness = test_device().await;
    let device = &harness.device;

    assert_eq!(device.state(), DeviceState::Down);
    device.up().await.unwrap();
    assert_eq!(device.state(), DeviceState::Up);

    // one receive task per receiver handed out by the bind
    assert_eq!(device.inner.net.lock().await.receivers.len(), 1);
    assert_ne!(device.listen_port().await, 0);

    assert_eq!(device.inner.queues.handshake.depth(), 0);
    assert!(!device.is_under_load());

    device.close().await;
}

/// State transitions are idempotent and down clears the bind.
#[tokio::test]
async fn up_down_up() {
    let harness = test_device().await;
    let device = &harness.device;

    device.up().await.unwrap();
    device.up().await.unwrap();
    let port = device.listen_port().await;
    assert_ne!(port, 0);

    device.down().await.unwrap();
    assert_eq!(device.state(), DeviceState::Down);
    assert_eq!(device.listen_port().await, 0);

    device.up().await.unwrap();
    assert_eq!(device.state(), DeviceState::Up);

    device.close().await;
}

/// Handshake queue depth drives the load detector, with hysteresis.
#[tokio::test]
async fn load_detection_with_hysteresis() {
    let harness = test_device().await;
    let device = &harness.device;
    device.up().await.unwrap();

    // Pause the handshake workers by monopolizing their receive lock.
    let handshake_rx = device.inner.queues.handshake.receiver();
    let pause = handshake_rx.rx.lock().await;

    assert!(!device.is_under_load());

    // Enqueue one more handshake message than the threshold.
    let threshold = QUEUE_HANDSHAKE_SIZE / 8;
    let init = CnHandshakeInit::new(TYPE_HANDSHAKE_INIT);
    for _ in 0..threshold + 1 {
        harness
            .udp
            .inbound
            .send((Packet::copy_from(init.as_bytes()), addr("198.51.100.7:9999")))
            .await
            .unwrap();
    }

    // Wait for the receive task to push them all into the handshake queue.
    for _ in 0..200 {
        if device.inner.queues.handshake.depth() > threshold {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(device.inner.queues.handshake.depth() > threshold);
    assert!(device.is_under_load());

    // Unpause and wait for the queue to drain (every message fails mac1).
    drop(pause);
    for _ in 0..200 {
        if device.inner.queues.handshake.depth() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(device.inner.queues.handshake.depth(), 0);

    // Still under load until the hysteresis window has passed.
    assert!(device.is_under_load());
    tokio::time::sleep(UNDER_LOAD_AFTER_TIME + Duration::from_millis(300)).await;
    assert!(!device.is_under_load());

    device.close().await;
}

/// An outbound packet inside a peer's allowed IPs triggers traffic to
/// that peer's endpoint; a packet outside them is dropped by routing.
#[tokio::test]
async fn outbound_routing() {
    let mut harness = test_device().await;
    let device = &harness.device;

    let peer_key = StaticSecret::random_from_rng(OsRng);
    let endpoint = addr("192.0.2.10:51820");
    device
        .add_peer(
            Peer::new(PublicKey::from(&peer_key))
                .with_allowed_ip("10.0.0.0/24".parse().unwrap())
                .with_endpoint(endpoint),
        )
        .await
        .unwrap();

    device.up().await.unwrap();

    // Routable destination: the peer has no keypair yet, so the first
    // observable datagram is a handshake initiation to its endpoint.
    harness
        .tun
        .tx
        .send(ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 7),
        ))
        .await
        .unwrap();

    let (datagram, dst) = timeout(Duration::from_secs(5), harness.udp.outbound.recv())
        .await
        .expect("an initiation must be emitted")
        .expect("channel open");
    assert_eq!(dst, endpoint);
    assert_eq!(datagram.len(), CnHandshakeInit::LEN);
    assert_eq!(
        u32::from_le_bytes(datagram[..4].try_into().unwrap()),
        TYPE_HANDSHAKE_INIT
    );

    // Unroutable destination: nothing leaves the device.
    harness
        .tun
        .tx
        .send(ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 1),
        ))
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(500), harness.udp.outbound.recv())
            .await
            .is_err(),
        "unrouted packets must not produce traffic"
    );

    device.close().await;
}

/// Installing a valid obfuscation config flips the flag; an invalid one
/// leaves the previous config live.
#[tokio::test]
async fn obfuscation_install_and_rollback() {
    let harness = test_device().await;
    let device = &harness.device;

    assert!(!device.is_obfuscation_on());

    let conf = ObfuscationConfig {
        init_packet_magic_header: 5,
        response_packet_magic_header: 6,
        underload_packet_magic_header: 7,
        transport_packet_magic_header: 8,
        init_packet_junk_size: 16,
        response_packet_junk_size: 16,
        ..Default::default()
    };
    device.set_obfuscation_config(&conf).await.unwrap();
    assert!(device.is_obfuscation_on());

    // A transport tag duplicating the init tag is rejected in full.
    let bad = ObfuscationConfig {
        transport_packet_magic_header: 5,
        ..conf
    };
    let err = device.set_obfuscation_config(&bad).await.unwrap_err();
    assert!(matches!(err, Error::ConfigInvalid(_)));
    assert_eq!(device.inner.obfuscation.tables().tags.transport, 8);
    assert!(device.is_obfuscation_on());

    device.close().await;
}

/// With obfuscation active, emitted initiations carry the junk prefix and
/// are classifiable only by length.
#[tokio::test]
async fn obfuscated_initiation_on_wire() {
    let mut harness = test_device().await;
    let device = &harness.device;

    device
        .set_obfuscation_config(&ObfuscationConfig {
            init_packet_magic_header: 0x51e3a7,
            response_packet_magic_header: 0x51e3a8,
            underload_packet_magic_header: 0x51e3a9,
            transport_packet_magic_header: 0x51e3aa,
            init_packet_junk_size: 24,
            response_packet_junk_size: 40,
            junk_packet_count: 2,
            junk_packet_min_size: 8,
            junk_packet_max_size: 32,
            ..Default::default()
        })
        .await
        .unwrap();

    let peer_key = StaticSecret::random_from_rng(OsRng);
    let endpoint = addr("192.0.2.33:1234");
    device
        .add_peer(
            Peer::new(PublicKey::from(&peer_key))
                .with_allowed_ip("10.3.0.0/16".parse().unwrap())
                .with_endpoint(endpoint),
        )
        .await
        .unwrap();
    device.up().await.unwrap();

    harness
        .tun
        .tx
        .send(ipv4_packet(
            Ipv4Addr::new(10, 3, 0, 1),
            Ipv4Addr::new(10, 3, 0, 2),
        ))
        .await
        .unwrap();

    // Two junk datagrams precede the initiation.
    let mut sizes = vec![];
    for _ in 0..3 {
        let (datagram, dst) = timeout(Duration::from_secs(5), harness.udp.outbound.recv())
            .await
            .expect("initiation must be emitted")
            .expect("channel open");
        assert_eq!(dst, endpoint);
        sizes.push(datagram.len());
    }
    assert!(sizes[0] >= 8 && sizes[0] < 32);
    assert!(sizes[1] >= 8 && sizes[1] < 32);
    assert_eq!(sizes[2], CnHandshakeInit::LEN + 24);

    device.close().await;
}

/// Rotating the identity to a key matching one peer's static removes
/// exactly that peer and expires every survivor's keypairs, without
/// deadlocking against concurrent configuration.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identity_rotation() {
    let harness = test_device().await;
    let device = &harness.device;
    device.up().await.unwrap();

    let keys: Vec<StaticSecret> = (0..100)
        .map(|_| StaticSecret::random_from_rng(OsRng))
        .collect();

    for (i, key) in keys.iter().enumerate() {
        let network = format!("10.{}.{}.0/24", i / 256, i % 256);
        device
            .add_peer(
                Peer::new(PublicKey::from(key)).with_allowed_ip(network.parse().unwrap()),
            )
            .await
            .unwrap();
    }
    assert_eq!(device.peers().len(), 100);

    // Concurrent configuration churn while the identity rotates.
    let churn_device = device.clone();
    let churn = tokio::spawn(async move {
        for i in 0..20 {
            let key = StaticSecret::random_from_rng(OsRng);
            let network: ipnetwork::IpNetwork = format!("172.16.{i}.0/24").parse().unwrap();
            let peer = Peer::new(PublicKey::from(&key)).with_allowed_ip(network);
            churn_device.add_peer(peer).await.unwrap();
            churn_device.remove_peer(&PublicKey::from(&key)).await;
        }
    });

    // The new identity equals peer 42's static key.
    let rotated = keys[42].clone();
    timeout(Duration::from_secs(2), device.set_private_key(rotated))
        .await
        .expect("identity rotation must not deadlock")
        .unwrap();
    timeout(Duration::from_secs(2), churn)
        .await
        .expect("concurrent configuration must not deadlock")
        .unwrap();

    let peers = device.peers();
    assert_eq!(peers.len(), 99, "exactly the self-routing peer is removed");
    let rotated_public = PublicKey::from(&keys[42]);
    assert!(
        peers.iter().all(|p| p.peer.public_key != rotated_public),
        "peer 42 must be gone"
    );

    // Every survivor's current keypair is expired (none were ever usable
    // here, which the invariant subsumes).
    let registry = device.inner.peers.read();
    for peer in registry.by_key.values() {
        assert!(!peer.has_usable_sending_keypair());
    }
    drop(registry);

    device.close().await;
}

/// After close, every worker has exited within the grace period,
/// and the closed state is sticky.
#[tokio::test]
async fn close_joins_workers_and_is_sticky() {
    let harness = test_device().await;
    let device = &harness.device;

    device.up().await.unwrap();
    let peer_key = StaticSecret::random_from_rng(OsRng);
    device
        .add_peer(
            Peer::new(PublicKey::from(&peer_key))
                .with_allowed_ip("10.0.0.0/8".parse().unwrap()),
        )
        .await
        .unwrap();

    timeout(Duration::from_secs(5), device.close())
        .await
        .expect("all workers must exit within the grace period");
    assert_eq!(device.state(), DeviceState::Closed);

    // Further transitions are ignored, successfully.
    device.up().await.unwrap();
    assert_eq!(device.state(), DeviceState::Closed);
    device.down().await.unwrap();
    assert_eq!(device.state(), DeviceState::Closed);

    // Operations requiring a result report Closed.
    let key = StaticSecret::random_from_rng(OsRng);
    assert!(matches!(
        device.add_peer(Peer::new(PublicKey::from(&key))).await,
        Err(Error::Closed)
    ));

    timeout(Duration::from_secs(1), device.wait())
        .await
        .expect("wait resolves after close");
}

struct Pair {
    a: TestHarness,
    b: TestHarness,
}

/// Cross-wire two channel devices: everything device A sends to B's address
/// arrives at B with A's address as source, and vice versa.
async fn wired_pair() -> Pair {
    let mut a = test_device().await;
    let mut b = test_device().await;

    let a_addr = addr("192.0.2.1:1001");
    let b_addr = addr("192.0.2.2:2002");

    a.device
        .add_peer(
            Peer::new(PublicKey::from(&b.key))
                .with_allowed_ip("10.0.0.2/32".parse().unwrap())
                .with_endpoint(b_addr),
        )
        .await
        .unwrap();
    // B learns A's endpoint from A's handshake (roaming).
    b.device
        .add_peer(
            Peer::new(PublicKey::from(&a.key)).with_allowed_ip("10.0.0.1/32".parse().unwrap()),
        )
        .await
        .unwrap();

    let mut a_out = std::mem::replace(&mut a.udp.outbound, mpsc::channel(1).1);
    let mut b_out = std::mem::replace(&mut b.udp.outbound, mpsc::channel(1).1);
    let a_in = a.udp.inbound.clone();
    let b_in = b.udp.inbound.clone();

    tokio::spawn(async move {
        while let Some((packet, dst)) = a_out.recv().await {
            if dst == b_addr {
                let _ = b_in.send((packet, a_addr)).await;
            }
        }
    });
    tokio::spawn(async move {
        while let Some((packet, dst)) = b_out.recv().await {
            if dst == a_addr {
                let _ = a_in.send((packet, b_addr)).await;
            }
        }
    });

    a.device.up().await.unwrap();
    b.device.up().await.unwrap();

    Pair { a, b }
}

async fn expect_ip(
    host: &mut TunChannelHost,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Packet<Ip> {
    let packet = timeout(Duration::from_secs(10), host.rx.recv())
        .await
        .expect("tunneled packet must arrive")
        .expect("channel open");
    assert_eq!(packet.source(), Some(src.into()));
    assert_eq!(packet.destination(), Some(dst.into()));
    packet
}

/// Full tunnel: handshake, transport in both directions, and source-address
/// authorization on the receive path.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_tunnel() {
    let mut pair = wired_pair().await;

    let a_ip = Ipv4Addr::new(10, 0, 0, 1);
    let b_ip = Ipv4Addr::new(10, 0, 0, 2);

    // A -> B. This triggers the full handshake first.
    pair.a.tun.tx.send(ipv4_packet(a_ip, b_ip)).await.unwrap();
    expect_ip(&mut pair.b.tun, a_ip, b_ip).await;

    // B -> A over the established session.
    pair.b.tun.tx.send(ipv4_packet(b_ip, a_ip)).await.unwrap();
    expect_ip(&mut pair.a.tun, b_ip, a_ip).await;

    // A packet whose inner source is outside A's allowed IPs is dropped by
    // B's authorization check, even though it decrypts fine.
    pair.a
        .tun
        .tx
        .send(ipv4_packet(Ipv4Addr::new(10, 9, 9, 9), b_ip))
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(500), pair.b.tun.rx.recv())
            .await
            .is_err(),
        "unauthorized source must not be delivered"
    );

    pair.a.device.close().await;
    pair.b.device.close().await;
}

/// The tunnel also works with a full obfuscation config active on both ends.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_tunnel_obfuscated() {
    let conf = ObfuscationConfig {
        junk_packet_count: 3,
        junk_packet_min_size: 10,
        junk_packet_max_size: 50,
        init_packet_junk_size: 20,
        response_packet_junk_size: 28,
        init_packet_magic_header: 0xdead01,
        response_packet_magic_header: 0xdead02,
        underload_packet_magic_header: 0xdead03,
        transport_packet_magic_header: 0xdead04,
    };

    let mut pair = wired_pair().await;
    pair.a.device.set_obfuscation_config(&conf).await.unwrap();
    pair.b.device.set_obfuscation_config(&conf).await.unwrap();
    assert!(pair.a.device.is_obfuscation_on());

    let a_ip = Ipv4Addr::new(10, 0, 0, 1);
    let b_ip = Ipv4Addr::new(10, 0, 0, 2);

    pair.a.tun.tx.send(ipv4_packet(a_ip, b_ip)).await.unwrap();
    expect_ip(&mut pair.b.tun, a_ip, b_ip).await;

    pair.b.tun.tx.send(ipv4_packet(b_ip, a_ip)).await.unwrap();
    expect_ip(&mut pair.a.tun, b_ip, a_ip).await;

    pair.a.device.close().await;
    pair.b.device.close().await;
}
