// Copyright (c) 2026 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The packet-processing tasks of a device.
//!
//! Outbound: the TUN reader routes host packets to a peer's staged queue;
//! the peer's feeder reserves nonces and submits work to the encryption
//! pool; the peer's serial sender emits sealed frames in nonce order.
//!
//! Inbound: a receive task per UDP receiver classifies datagrams and hands
//! transport packets to the decryption pool (handshake traffic to the
//! handshake pool); the peer's serial receiver delivers plaintext to the
//! host in submission order after checking source authorization.
//!
//! The worker pools exit when their queue closes; everything else is stopped
//! explicitly by the device or peer that spawned it.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use x25519_dalek::PublicKey;
use zerocopy::IntoBytes;

use crate::device::peer::{IndexEntry, KeypairSlot, PeerHandle};
use crate::device::queues::{
    Decrypted, HandshakeElement, InboundElement, OutboundElement, QueueSender,
};
use crate::device::{DeviceInner, DeviceTransports, obfuscation};
use crate::noise::rate_limiter::HandshakeVerdict;
use crate::noise::timers::{REKEY_ATTEMPT_TIME, REKEY_TIMEOUT};
use crate::noise::{Keypair, parse_handshake_anon};
use crate::packet::{CnData, CnKind, Packet, PacketBufPool};
use crate::tun::{IpRecv, IpSend, TunEvent};
use crate::udp::{UdpRecv, UdpSend, UdpTransportFactory};

type UdpRecvOf<T> =
    <<T as DeviceTransports>::UdpTransportFactory as UdpTransportFactory>::Recv;

/// Read batches of IP packets from the host, route each to a peer by its
/// destination address, and stage it there.
pub(crate) async fn tun_reader<T: DeviceTransports>(
    device: Weak<DeviceInner<T>>,
    tun_rx: Arc<tokio::sync::Mutex<T::IpRecv>>,
    mut pool: PacketBufPool,
) {
    // Held until this task is stopped; ownership can then be reclaimed.
    let mut tun_rx = tun_rx.lock().await;

    loop {
        let packets = match tun_rx.recv(&mut pool).await {
            Ok(packets) => packets,
            Err(e) => {
                log::error!("unexpected error on the IP transport: {e:?}");
                break;
            }
        };

        for packet in packets {
            let Some(device) = device.upgrade() else {
                return;
            };

            let Some(dst) = packet.destination() else {
                continue;
            };

            let peer = device.peers.read().by_ip.find(dst).cloned();
            let Some(peer) = peer else {
                // No route for this destination.
                log::trace!("no peer has allowed IPs for {dst}, dropping packet");
                continue;
            };

            peer.stage_outbound(packet.into_bytes());
        }
    }
}

/// Drain a peer's staged queue into the encryption queue, negotiating a
/// keypair first when necessary.
pub(crate) async fn peer_outbound_feeder<T: DeviceTransports>(peer: Arc<PeerHandle<T>>) {
    let Some(enc_tx) = peer
        .device
        .upgrade()
        .and_then(|device| device.queues.encryption.sender())
    else {
        return;
    };

    // Held until this task is stopped; ownership can then be reclaimed.
    let staged_rx = Arc::clone(&peer.staged_rx);
    let mut staged = staged_rx.lock().await;

    'packets: while let Some(packet) = staged.recv().await {
        let started = Instant::now();
        let (keypair, nonce) = loop {
            if let Some(pair) = peer.next_send() {
                break pair;
            }
            // No usable sending keypair; negotiate one. The initiation is
            // internally rate limited, so this doubles as the retransmit.
            peer.send_handshake_initiation().await;
            tokio::select! {
                _ = peer.keypair_installed.notified() => {}
                _ = tokio::time::sleep(REKEY_TIMEOUT) => {}
            }
            if started.elapsed() >= REKEY_ATTEMPT_TIME {
                log::debug!("handshake attempts exhausted, dropping staged packet");
                continue 'packets;
            }
        };

        if keypair.should_rekey() {
            peer.send_handshake_initiation().await;
        }

        let Some(out_tx) = peer.serial_out_sender() else {
            return;
        };
        let (sealed_tx, sealed_rx) = oneshot::channel();
        // Enter the serial queue before the parallel workers see the
        // element, so emission happens in nonce order.
        if out_tx.send(sealed_rx).await.is_err() {
            return;
        }

        let element = OutboundElement {
            packet,
            peer: Arc::clone(&peer),
            keypair,
            nonce,
            sealed_tx,
        };
        if enc_tx.send(element).await.is_err() {
            return;
        }
    }
}

/// One worker of the encryption pool.
pub(crate) async fn encryption_worker<T: DeviceTransports>(device: Weak<DeviceInner<T>>) {
    let Some(rx) = device.upgrade().map(|d| d.queues.encryption.receiver()) else {
        return;
    };

    loop {
        let Some(element) = rx.recv().await else {
            // Queue closed and drained.
            return;
        };

        let Some(device) = device.upgrade() else {
            return;
        };

        let transport_tag = device.obfuscation.tables().tags.transport;
        let sealed = element
            .keypair
            .seal(element.nonce, element.packet, transport_tag);

        element.peer.mark_sent();
        element.peer.add_tx_bytes(sealed.as_bytes().len() as u64);

        // The serial sender may be gone if the peer stopped; drop then.
        let _ = element.sealed_tx.send(sealed);
    }
}

/// Emit a peer's sealed frames in nonce order.
pub(crate) async fn peer_serial_sender<T: DeviceTransports>(
    peer: Arc<PeerHandle<T>>,
    mut rx: mpsc::Receiver<oneshot::Receiver<Packet<CnData>>>,
) {
    while let Some(sealed_rx) = rx.recv().await {
        let Ok(sealed) = sealed_rx.await else {
            continue;
        };
        let Some(device) = peer.device.upgrade() else {
            return;
        };
        let Some(endpoint) = peer.endpoint() else {
            log::trace!("no endpoint, dropping sealed packet");
            continue;
        };
        let Some(udp) = device.current_udp_tx() else {
            continue;
        };
        if udp.send_to(sealed.into_bytes(), endpoint).await.is_err() {
            log::trace!("udp send failed");
        }
    }
}

/// Receive datagrams from one UDP receiver and dispatch them: transport
/// packets to the decryption queue, everything else to the handshake queue.
pub(crate) async fn udp_receiver<T: DeviceTransports>(
    device: Weak<DeviceInner<T>>,
    mut udp_rx: UdpRecvOf<T>,
    decryption_tx: QueueSender<InboundElement<T>>,
    handshake_tx: QueueSender<HandshakeElement>,
    mut pool: PacketBufPool,
) {
    loop {
        let Ok((packet, src)) = udp_rx.recv_from(&mut pool).await else {
            // The bind was closed underneath us.
            return;
        };

        let Some(device) = device.upgrade() else {
            return;
        };

        let Some(kind) = device.obfuscation.classify(packet) else {
            continue;
        };

        match kind {
            CnKind::Data(data) => {
                let receiver_idx = data.header.receiver_idx.get();
                let Some(IndexEntry::Keypair(peer, keypair)) =
                    device.index_table.get(receiver_idx)
                else {
                    continue;
                };
                let (Some(peer), Some(keypair)) = (peer.upgrade(), keypair.upgrade()) else {
                    continue;
                };
                let Some(in_tx) = peer.serial_in_sender() else {
                    // Peer is not running.
                    continue;
                };

                let (opened_tx, opened_rx) = oneshot::channel();
                // Enter the serial queue before the parallel workers see the
                // element, so delivery happens in submission order.
                if in_tx.send(opened_rx).await.is_err() {
                    continue;
                }
                let element = InboundElement {
                    packet: data,
                    peer,
                    keypair,
                    src,
                    opened_tx,
                };
                if decryption_tx.send(element).await.is_err() {
                    return;
                }
            }
            message @ (CnKind::HandshakeInit(_)
            | CnKind::HandshakeResp(_)
            | CnKind::CookieReply(_)) => {
                if handshake_tx
                    .send(HandshakeElement { message, src })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// One worker of the decryption pool.
pub(crate) async fn decryption_worker<T: DeviceTransports>(device: Weak<DeviceInner<T>>) {
    let Some(rx) = device.upgrade().map(|d| d.queues.decryption.receiver()) else {
        return;
    };

    loop {
        let Some(element) = rx.recv().await else {
            // Queue closed and drained.
            return;
        };

        match element.keypair.open(element.packet) {
            Ok(packet) => {
                let _ = element.opened_tx.send(Decrypted {
                    packet,
                    src: element.src,
                    keypair: element.keypair,
                });
            }
            Err(e) => {
                // Dropping opened_tx tells the serial receiver to skip this slot.
                log::trace!("failed to open transport packet: {e}");
            }
        }
    }
}

/// Deliver a peer's decrypted packets to the host, in submission order,
/// after verifying that the peer is authorized for the inner source address.
pub(crate) async fn peer_serial_receiver<T: DeviceTransports>(
    peer: Arc<PeerHandle<T>>,
    mut rx: mpsc::Receiver<oneshot::Receiver<Decrypted>>,
) {
    while let Some(opened_rx) = rx.recv().await {
        let Ok(decrypted) = opened_rx.await else {
            continue;
        };
        let Some(device) = peer.device.upgrade() else {
            return;
        };

        // A valid transport packet also updates the peer's endpoint (roaming)
        // and confirms a responder-side keypair.
        if device.roaming_enabled() {
            peer.set_endpoint(decrypted.src);
        }
        peer.promote_on_receive(&decrypted.keypair);
        peer.mark_received();
        peer.add_rx_bytes((decrypted.packet.len() + CnData::OVERHEAD) as u64);

        if decrypted.packet.is_empty() {
            log::trace!("received keepalive");
            continue;
        }

        let Ok(packet) = decrypted.packet.try_into_ip() else {
            continue;
        };
        let Some(source) = packet.source() else {
            continue;
        };

        let authorized = {
            let registry = device.peers.read();
            registry
                .by_ip
                .find(source)
                .is_some_and(|routed| Arc::ptr_eq(routed, &peer))
        };
        if !authorized {
            log::warn!("peer is not allowed to send us packets from {source}");
            continue;
        }

        if device.tun_tx.lock().await.send(packet).await.is_err() {
            log::trace!("delivering packet to the IP transport failed");
        }
    }
}

/// One worker of the handshake pool.
///
/// Implements the responder and initiator state machines for initiation,
/// response and cookie-reply messages, demanding cookie proofs while the
/// device is under load.
pub(crate) async fn handshake_worker<T: DeviceTransports>(device: Weak<DeviceInner<T>>) {
    let Some(rx) = device.upgrade().map(|d| d.queues.handshake.receiver()) else {
        return;
    };

    loop {
        let Some(element) = rx.recv().await else {
            // Queue closed and drained.
            return;
        };

        let Some(device) = device.upgrade() else {
            return;
        };

        let (private, public, rate_limiter) = {
            let identity = device.identity.read();
            (
                identity.private.clone(),
                identity.public,
                identity.rate_limiter.clone(),
            )
        };
        let (Some(private), Some(public), Some(rate_limiter)) = (private, public, rate_limiter)
        else {
            // No identity configured yet; nothing can be authenticated.
            continue;
        };
        rate_limiter.try_reset_count();

        let tables = device.obfuscation.tables();
        let under_load = device.is_under_load();

        match element.message {
            CnKind::HandshakeInit(packet) => {
                let packet = match rate_limiter.verify_handshake(
                    element.src.ip(),
                    packet,
                    under_load,
                    tables.tags.cookie_reply,
                ) {
                    HandshakeVerdict::Allow(packet) => packet,
                    HandshakeVerdict::SendCookie(reply) => {
                        if let Some(udp) = device.current_udp_tx() {
                            let reply = Packet::copy_from(reply.as_bytes());
                            let _ = udp.send_to(reply, element.src).await;
                        }
                        continue;
                    }
                    HandshakeVerdict::Drop => continue,
                };

                let Ok(half) = parse_handshake_anon(&private, &public, &packet) else {
                    continue;
                };

                let peer = {
                    let registry = device.peers.read();
                    registry
                        .by_key
                        .get(&PublicKey::from(half.peer_static_public))
                        .cloned()
                };
                let Some(peer) = peer else {
                    continue;
                };

                // Reserve the responder index, then finish the handshake.
                let index = device
                    .index_table
                    .register(IndexEntry::Handshake(Arc::downgrade(&peer)));
                let result = {
                    let mut handshake = peer.handshake.lock();
                    handshake.receive_initiation(
                        &packet,
                        half,
                        index.value(),
                        tables.tags.response,
                    )
                };
                let (response, material) = match result {
                    Ok(ok) => ok,
                    Err(e) => {
                        log::debug!("rejected handshake initiation: {e}");
                        continue;
                    }
                };

                let keypair = Arc::new(Keypair::new(material));
                device.index_table.update(
                    &index,
                    IndexEntry::Keypair(Arc::downgrade(&peer), Arc::downgrade(&keypair)),
                );

                if device.roaming_enabled() {
                    peer.set_endpoint(element.src);
                }
                peer.set_last_handshake();
                peer.install_keypair(KeypairSlot { keypair, index });

                log::debug!("sending handshake response");
                let out =
                    obfuscation::prepend_junk(response.as_bytes(), tables.response_packet_junk_size);
                if let Some(udp) = device.current_udp_tx() {
                    let _ = udp.send_to(out, element.src).await;
                }
                peer.mark_sent();
            }
            CnKind::HandshakeResp(packet) => {
                let packet = match rate_limiter.verify_handshake(
                    element.src.ip(),
                    packet,
                    under_load,
                    tables.tags.cookie_reply,
                ) {
                    HandshakeVerdict::Allow(packet) => packet,
                    HandshakeVerdict::SendCookie(reply) => {
                        if let Some(udp) = device.current_udp_tx() {
                            let reply = Packet::copy_from(reply.as_bytes());
                            let _ = udp.send_to(reply, element.src).await;
                        }
                        continue;
                    }
                    HandshakeVerdict::Drop => continue,
                };

                let Some(entry) = device.index_table.get(packet.receiver_idx.get()) else {
                    continue;
                };
                let IndexEntry::Handshake(peer) = entry else {
                    continue;
                };
                let Some(peer) = peer.upgrade() else {
                    continue;
                };

                let result = {
                    let mut handshake = peer.handshake.lock();
                    handshake.receive_response(&packet)
                };
                let material = match result {
                    Ok(material) => material,
                    Err(e) => {
                        log::debug!("rejected handshake response: {e}");
                        continue;
                    }
                };

                // The initiation's index carries over to the keypair.
                let Some(index) = peer.take_handshake_index() else {
                    continue;
                };
                let keypair = Arc::new(Keypair::new(material));
                device.index_table.update(
                    &index,
                    IndexEntry::Keypair(Arc::downgrade(&peer), Arc::downgrade(&keypair)),
                );

                if device.roaming_enabled() {
                    peer.set_endpoint(element.src);
                }
                peer.set_last_handshake();
                peer.clear_handshake_started();
                peer.install_keypair(KeypairSlot { keypair, index });

                log::debug!("handshake completed as initiator");

                // Confirm the session so the responder can promote it.
                peer.send_keepalive();
            }
            CnKind::CookieReply(packet) => {
                let Some(entry) = device.index_table.get(packet.receiver_idx.get()) else {
                    continue;
                };
                let Some(peer) = entry.peer() else {
                    continue;
                };
                let result = {
                    let mut handshake = peer.handshake.lock();
                    handshake.consume_cookie_reply(&packet)
                };
                match result {
                    Ok(()) => {
                        // The next initiation will carry mac2; let it go out
                        // without waiting for the full rekey timeout.
                        peer.clear_handshake_started();
                        log::debug!("consumed cookie reply");
                    }
                    Err(e) => log::debug!("rejected cookie reply: {e}"),
                }
            }
            CnKind::Data(_) => {
                // The receive path never dispatches transport packets here.
                continue;
            }
        }
    }
}

/// Apply host-side interface events to the device.
pub(crate) async fn tun_event_handler<T: DeviceTransports>(
    device: Weak<DeviceInner<T>>,
    mut events: mpsc::Receiver<TunEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(device) = device.upgrade() else {
            return;
        };
        match event {
            TunEvent::LinkUp => {
                if let Err(e) = device.up().await {
                    log::error!("failed to bring device up on link event: {e}");
                }
            }
            TunEvent::LinkDown => {
                if let Err(e) = device.down().await {
                    log::error!("failed to bring device down on link event: {e}");
                }
            }
            TunEvent::MtuUpdate(mtu) => {
                device.set_mtu(mtu);
                log::debug!("MTU updated to {mtu}");
            }
        }
    }
}

/// Periodic per-peer maintenance: persistent and passive keepalives, stale
/// keypair cleanup.
pub(crate) async fn peer_timers<T: DeviceTransports>(peer: Arc<PeerHandle<T>>) {
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;

        if peer.device.strong_count() == 0 {
            return;
        }

        let interval = peer.persistent_keepalive();
        if interval > 0 {
            let due = peer
                .duration_since_last_sent()
                .is_none_or(|since| since >= Duration::from_secs(u64::from(interval)));
            if due {
                peer.send_keepalive();
            }
        }

        if peer.wants_passive_keepalive() {
            peer.send_keepalive();
        }

        peer.discard_stale_keypairs();
    }
}
