// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
//
// Modified by Mullvad VPN.
// Copyright (c) 2025 Mullvad VPN.
//
// SPDX-License-Identifier: BSD-3-Clause

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc, oneshot};
use x25519_dalek::PublicKey;

use crate::device::obfuscation::{prepend_junk, random_junk_packet};
use crate::device::queues::{Decrypted, QUEUE_INBOUND_SIZE, QUEUE_OUTBOUND_SIZE, QUEUE_STAGED_SIZE};
use crate::device::{DeviceInner, DeviceTransports, pipeline};
use crate::noise::timers::{KEEPALIVE_TIMEOUT, REJECT_AFTER_TIME, REKEY_TIMEOUT};
use crate::noise::{Handshake, Index, Keypair};
use crate::packet::{CnData, Packet};
use crate::task::Task;
use crate::udp::UdpSend;
use crate::x25519;
use zerocopy::IntoBytes;

/// Peer data. Used to construct and update peers in a
/// [`Device`](crate::device::Device).
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Peer {
    /// The peer's static public key.
    pub public_key: PublicKey,
    /// The peer's endpoint address (IP and port).
    ///
    /// An incoming handshake or transport packet from the peer overwrites
    /// the endpoint with its source address. If `None`, the peer is inactive
    /// until it contacts us.
    pub endpoint: Option<SocketAddr>,
    /// List of IP networks that may be routed through this peer.
    pub allowed_ips: Vec<IpNetwork>,
    /// Optional preshared key for additional security.
    pub preshared_key: Option<[u8; 32]>,
    /// Persistent keepalive interval in seconds. Disabled if `None`.
    pub keepalive: Option<u16>,
}

impl Peer {
    /// Create a new peer with the given public key.
    ///
    /// All other fields are set to their default values.
    pub const fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ips: Vec::new(),
            preshared_key: None,
            keepalive: None,
        }
    }

    /// Set the endpoint address for this peer.
    pub const fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Add a single allowed IP network for this peer.
    pub fn with_allowed_ip(mut self, network: IpNetwork) -> Self {
        self.allowed_ips.push(network);
        self
    }

    /// Add multiple allowed IP networks for this peer.
    pub fn with_allowed_ips(mut self, networks: impl IntoIterator<Item = IpNetwork>) -> Self {
        self.allowed_ips.extend(networks);
        self
    }

    /// Set the preshared key for this peer.
    pub const fn with_preshared_key(mut self, preshared_key: [u8; 32]) -> Self {
        self.preshared_key = Some(preshared_key);
        self
    }

    /// Set the persistent keepalive interval, in seconds.
    pub const fn with_keepalive(mut self, keepalive: u16) -> Self {
        self.keepalive = Some(keepalive);
        self
    }
}

/// What a session index currently resolves to.
pub(crate) enum IndexEntry<T: DeviceTransports> {
    /// A handshake in progress; resolves responses and cookie replies.
    Handshake(Weak<PeerHandle<T>>),
    /// An established keypair; resolves transport packets.
    Keypair(Weak<PeerHandle<T>>, Weak<Keypair>),
}

impl<T: DeviceTransports> Clone for IndexEntry<T> {
    fn clone(&self) -> Self {
        match self {
            IndexEntry::Handshake(peer) => IndexEntry::Handshake(peer.clone()),
            IndexEntry::Keypair(peer, keypair) => {
                IndexEntry::Keypair(peer.clone(), keypair.clone())
            }
        }
    }
}

impl<T: DeviceTransports> IndexEntry<T> {
    pub fn peer(&self) -> Option<Arc<PeerHandle<T>>> {
        match self {
            IndexEntry::Handshake(peer) | IndexEntry::Keypair(peer, _) => peer.upgrade(),
        }
    }
}

/// A keypair together with the reservation of its local index.
///
/// Dropping the slot frees the index for reuse, which is only correct
/// because nothing can route to the keypair anymore.
pub(crate) struct KeypairSlot<T: DeviceTransports> {
    pub keypair: Arc<Keypair>,
    pub index: Index<IndexEntry<T>>,
}

/// The previous/current/next keypair triple of a peer.
///
/// `current` is the sending keypair. A responder-side keypair waits in
/// `next` until the first transport packet arrives on it.
pub(crate) struct Keypairs<T: DeviceTransports> {
    pub previous: Option<KeypairSlot<T>>,
    pub current: Option<KeypairSlot<T>>,
    pub next: Option<KeypairSlot<T>>,
}

impl<T: DeviceTransports> Default for Keypairs<T> {
    fn default() -> Self {
        Self {
            previous: None,
            current: None,
            next: None,
        }
    }
}

pub(crate) struct SerialSenders {
    pub out_tx: mpsc::Sender<oneshot::Receiver<Packet<CnData>>>,
    pub in_tx: mpsc::Sender<oneshot::Receiver<Decrypted>>,
}

/// The live state of a configured peer.
///
/// Created by configuration, started when the device goes up (or when added
/// while up), stopped on device down, removal, or an identity change that
/// invalidates it.
pub(crate) struct PeerHandle<T: DeviceTransports> {
    /// Back-reference handed to spawned tasks and index table entries.
    self_weak: Weak<PeerHandle<T>>,

    pub device: Weak<DeviceInner<T>>,
    pub public_key: PublicKey,

    endpoint: RwLock<Option<SocketAddr>>,
    pub handshake: Mutex<Handshake>,
    keypairs: RwLock<Keypairs<T>>,
    pub(crate) allowed_ips: Mutex<Vec<IpNetwork>>,

    staged_tx: mpsc::Sender<Packet>,
    pub(crate) staged_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Packet>>>,

    running: AtomicBool,
    tasks: Mutex<Vec<Task>>,
    serial: Mutex<Option<SerialSenders>>,

    /// Reservation of the session index of an initiation in flight.
    handshake_index: Mutex<Option<Index<IndexEntry<T>>>>,
    /// Rate-limits our own initiations to one per [`REKEY_TIMEOUT`].
    handshake_started: Mutex<Option<Instant>>,

    /// Signalled whenever a keypair becomes usable for sending.
    pub(crate) keypair_installed: Notify,

    persistent_keepalive: AtomicU32,
    created: Instant,
    last_handshake: Mutex<Option<Instant>>,

    /// Millis since `created`, offset by 1 so that 0 means "never".
    last_sent: AtomicU64,
    last_received: AtomicU64,

    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

impl<T: DeviceTransports> PeerHandle<T> {
    pub fn new(
        device: &DeviceInner<T>,
        config: &Peer,
        static_private: x25519::StaticSecret,
    ) -> Arc<Self> {
        let (staged_tx, staged_rx) = mpsc::channel(QUEUE_STAGED_SIZE);

        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            device: device.self_weak(),
            public_key: config.public_key,
            endpoint: RwLock::new(config.endpoint),
            handshake: Mutex::new(Handshake::new(
                static_private,
                config.public_key,
                config.preshared_key,
            )),
            keypairs: RwLock::new(Keypairs::default()),
            allowed_ips: Mutex::new(config.allowed_ips.clone()),
            staged_tx,
            staged_rx: Arc::new(tokio::sync::Mutex::new(staged_rx)),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            serial: Mutex::new(None),
            handshake_index: Mutex::new(None),
            handshake_started: Mutex::new(None),
            keypair_installed: Notify::new(),
            persistent_keepalive: AtomicU32::new(config.keepalive.unwrap_or(0).into()),
            created: Instant::now(),
            last_handshake: Mutex::new(None),
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
        })
    }

    /// Activate the peer: open the serial queues and spawn its tasks.
    ///
    /// Idempotent while running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self
            .self_weak
            .upgrade()
            .expect("start is called on a live peer");

        let (out_tx, out_rx) = mpsc::channel(QUEUE_OUTBOUND_SIZE);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_INBOUND_SIZE);
        *self.serial.lock() = Some(SerialSenders { out_tx, in_tx });

        let mut tasks = self.tasks.lock();
        tasks.push(Task::spawn(
            "peer_outbound_feeder",
            pipeline::peer_outbound_feeder(Arc::clone(&this)),
        ));
        tasks.push(Task::spawn(
            "peer_serial_sender",
            pipeline::peer_serial_sender(Arc::clone(&this), out_rx),
        ));
        tasks.push(Task::spawn(
            "peer_serial_receiver",
            pipeline::peer_serial_receiver(Arc::clone(&this), in_rx),
        ));
        tasks.push(Task::spawn("peer_timers", pipeline::peer_timers(this)));

        log::debug!("peer started");
    }

    /// Deactivate the peer: close the serial queues and stop its tasks.
    ///
    /// After this returns, no task of this peer processes packets anymore.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        *self.serial.lock() = None;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.stop().await;
        }

        log::debug!("peer stopped");
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    pub fn set_endpoint(&self, addr: SocketAddr) {
        *self.endpoint.write() = Some(addr);
    }

    pub fn serial_out_sender(&self) -> Option<mpsc::Sender<oneshot::Receiver<Packet<CnData>>>> {
        self.serial.lock().as_ref().map(|s| s.out_tx.clone())
    }

    pub fn serial_in_sender(&self) -> Option<mpsc::Sender<oneshot::Receiver<Decrypted>>> {
        self.serial.lock().as_ref().map(|s| s.in_tx.clone())
    }

    /// Append an outbound IP packet to the staged queue.
    ///
    /// Dropped when the queue is full; the staged queue absorbs bursts while
    /// a handshake completes, it is not a reliable buffer.
    pub fn stage_outbound(&self, packet: Packet) {
        if self.staged_tx.try_send(packet).is_err() {
            log::trace!("staged queue full, dropping packet");
        }
    }

    /// Queue a keepalive: an empty packet, sealed like any other.
    pub fn send_keepalive(&self) {
        self.stage_outbound(Packet::default());
    }

    // --- keypair triple ---

    /// Reserve the next sending nonce on the current keypair.
    pub fn next_send(&self) -> Option<(Arc<Keypair>, u64)> {
        let keypairs = self.keypairs.read();
        let slot = keypairs.current.as_ref()?;
        let nonce = slot.keypair.next_sending_nonce()?;
        Some((Arc::clone(&slot.keypair), nonce))
    }

    pub fn has_usable_sending_keypair(&self) -> bool {
        self.keypairs
            .read()
            .current
            .as_ref()
            .is_some_and(|slot| slot.keypair.usable_for_sending())
    }

    /// Install a freshly negotiated keypair.
    ///
    /// An initiator-side keypair becomes `current` immediately; a
    /// responder-side keypair waits in `next` until confirmed by inbound
    /// traffic (see [`Self::promote_on_receive`]).
    pub fn install_keypair(&self, slot: KeypairSlot<T>) {
        let is_initiator = slot.keypair.is_initiator();
        let mut keypairs = self.keypairs.write();
        if is_initiator {
            keypairs.previous = keypairs.current.take();
            keypairs.current = Some(slot);
            keypairs.next = None;
            drop(keypairs);
            self.keypair_installed.notify_one();
        } else {
            keypairs.next = Some(slot);
        }
    }

    /// Promote `next` to `current` if `received` is it.
    ///
    /// Called for every successfully opened transport packet; the first one
    /// on a responder-side keypair confirms the session.
    pub fn promote_on_receive(&self, received: &Arc<Keypair>) {
        let mut keypairs = self.keypairs.write();
        let is_next = keypairs
            .next
            .as_ref()
            .is_some_and(|slot| Arc::ptr_eq(&slot.keypair, received));
        if !is_next {
            return;
        }
        let next = keypairs.next.take();
        keypairs.previous = keypairs.current.take();
        keypairs.current = next;
        drop(keypairs);
        self.keypair_installed.notify_one();
    }

    /// Invalidate the sending side of all keypairs and abandon any handshake
    /// in progress, forcing fresh negotiation.
    pub fn expire_current_keypairs(&self) {
        self.handshake.lock().clear();
        *self.handshake_index.lock() = None;
        let keypairs = self.keypairs.read();
        if let Some(slot) = &keypairs.current {
            slot.keypair.expire();
        }
        if let Some(slot) = &keypairs.next {
            slot.keypair.expire();
        }
    }

    /// Drop keypairs that can no longer receive anything meaningful.
    pub fn discard_stale_keypairs(&self) {
        let mut keypairs = self.keypairs.write();
        let stale = |slot: &Option<KeypairSlot<T>>| {
            slot.as_ref()
                .is_some_and(|s| s.keypair.created().elapsed() >= REJECT_AFTER_TIME * 3)
        };
        if stale(&keypairs.previous) {
            keypairs.previous = None;
        }
        if stale(&keypairs.current) {
            keypairs.current = None;
        }
        if stale(&keypairs.next) {
            keypairs.next = None;
        }
    }

    // --- handshakes ---

    /// Send a handshake initiation to the peer's endpoint.
    ///
    /// A no-op while a recent initiation is still unanswered, so callers may
    /// invoke this freely.
    pub async fn send_handshake_initiation(&self) {
        let Some(device) = self.device.upgrade() else {
            return;
        };

        {
            let mut started = self.handshake_started.lock();
            if started.is_some_and(|t| t.elapsed() < REKEY_TIMEOUT) {
                return;
            }
            *started = Some(Instant::now());
        }

        let Some(endpoint) = self.endpoint() else {
            log::debug!("peer has no known endpoint, cannot initiate handshake");
            return;
        };

        let tables = device.obfuscation.tables();
        let msg = {
            let index = device
                .index_table
                .register(IndexEntry::Handshake(self.self_weak.clone()));
            let mut handshake = self.handshake.lock();
            let msg = handshake.format_initiation(index.value(), tables.tags.init);
            *self.handshake_index.lock() = Some(index);
            msg
        };

        let Some(udp) = device.current_udp_tx() else {
            return;
        };

        // Junk datagrams ahead of the initiation confuse flow classifiers.
        if device.obfuscation.is_enabled() {
            for _ in 0..tables.junk_packet_count {
                let junk =
                    random_junk_packet(tables.junk_packet_min_size, tables.junk_packet_max_size);
                if udp.send_to(junk, endpoint).await.is_err() {
                    return;
                }
            }
        }

        let packet = prepend_junk(msg.as_bytes(), tables.init_packet_junk_size);
        if udp.send_to(packet, endpoint).await.is_err() {
            log::trace!("failed to send handshake initiation");
            return;
        }
        self.mark_sent();
        log::debug!("sent handshake initiation");
    }

    /// Allow the next initiation immediately, e.g. after a cookie reply.
    pub fn clear_handshake_started(&self) {
        *self.handshake_started.lock() = None;
    }

    pub fn take_handshake_index(&self) -> Option<Index<IndexEntry<T>>> {
        self.handshake_index.lock().take()
    }

    pub fn set_last_handshake(&self) {
        *self.last_handshake.lock() = Some(Instant::now());
    }

    pub fn last_handshake(&self) -> Option<Instant> {
        *self.last_handshake.lock()
    }

    // --- timers and counters ---

    fn now_millis(&self) -> u64 {
        self.created.elapsed().as_millis() as u64 + 1
    }

    pub fn mark_sent(&self) {
        self.last_sent.store(self.now_millis(), Ordering::Relaxed);
    }

    pub fn mark_received(&self) {
        self.last_received.store(self.now_millis(), Ordering::Relaxed);
    }

    pub fn duration_since_last_sent(&self) -> Option<Duration> {
        let sent = self.last_sent.load(Ordering::Relaxed);
        (sent != 0).then(|| Duration::from_millis(self.now_millis().saturating_sub(sent)))
    }

    /// Whether we owe the peer a passive keepalive: data was received, and
    /// nothing was sent back for [`KEEPALIVE_TIMEOUT`].
    pub fn wants_passive_keepalive(&self) -> bool {
        let received = self.last_received.load(Ordering::Relaxed);
        if received == 0 {
            return false;
        }
        let sent = self.last_sent.load(Ordering::Relaxed);
        if sent == 0 {
            return true;
        }
        received > sent
            && self.now_millis().saturating_sub(sent) >= KEEPALIVE_TIMEOUT.as_millis() as u64
    }

    pub fn persistent_keepalive(&self) -> u32 {
        self.persistent_keepalive.load(Ordering::Relaxed)
    }

    pub fn add_tx_bytes(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx_bytes(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}
