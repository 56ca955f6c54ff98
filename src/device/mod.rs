// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
//
// Modified by Mullvad VPN.
// Copyright (c) 2025 Mullvad VPN.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The device: lifecycle state machine, peer registry, routing table, and
//! the concurrent packet pipeline.
//!
//! A [`Device`] multiplexes encrypted tunnels with many peers over a single
//! UDP transport while exposing one IP transport to the host. It is built
//! with [`DeviceBuilder`], starts down, and is driven with
//! [`Device::up`]/[`Device::down`]/[`Device::close`].

pub(crate) mod allowed_ips;
mod builder;
pub mod configure;
mod obfuscation;
mod peer;
mod pipeline;
mod queues;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{Mutex as TokioMutex, mpsc, watch};
use x25519_dalek::PublicKey;

use crate::noise::rate_limiter::RateLimiter;
use crate::noise::{Handshake, IndexTable};
use crate::packet::PacketBufPool;
use crate::task::Task;
use crate::tun::{IpRecv, IpSend, TunEvent};
use crate::udp::{UdpSend, UdpTransportFactory, UdpTransportParams};
use crate::x25519;
use allowed_ips::AllowedIps;
use obfuscation::Obfuscator;
use peer::{IndexEntry, PeerHandle};
use queues::{DeviceQueues, QUEUE_HANDSHAKE_SIZE};

pub use builder::{DeviceBuilder, Nul};
pub use configure::PeerStats;
pub use obfuscation::ObfuscationConfig;
pub use peer::Peer;

/// The number of handshakes per second a single source may attempt while the
/// device is under load.
const HANDSHAKE_RATE_LIMIT: u64 = 100;

/// The largest datagram the device will ever emit or accept.
pub const MAX_SEGMENT_SIZE: usize = 65535;

/// How long the device keeps reporting "under load" after the handshake
/// queue depth last crossed its threshold.
pub(crate) const UNDER_LOAD_AFTER_TIME: Duration = Duration::from_secs(1);

/// In-flight ceiling of the packet buffer pool. `0` disables the ceiling and
/// lets the pool grow on demand.
pub(crate) const PREALLOCATED_BUFFERS_PER_POOL: usize = 0;

/// Error of [`Device`]-related operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind UDP transport (port={1}): {0}")]
    Bind(#[source] io::Error, u16),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("IP transport failed: {0}")]
    Tun(#[source] io::Error),

    #[error("no private key configured")]
    NoPrivateKey,

    #[error("device is closed")]
    Closed,

    /// Bringing the device up failed, and it was driven back down.
    ///
    /// `down` carries the secondary error if the recovery failed too.
    #[error("failed to bring device up: {up}")]
    UpFailed {
        #[source]
        up: Box<Error>,
        down: Option<Box<Error>>,
    },
}

/// The lifecycle states of a [`Device`].
///
/// Transitions:
///
/// ```text
/// down -----+
///   ↕       ↓
///   up -> closed
/// ```
///
/// Once closed, a device never leaves that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Down = 0,
    Up = 1,
    Closed = 2,
}

impl DeviceState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => DeviceState::Down,
            1 => DeviceState::Up,
            _ => DeviceState::Closed,
        }
    }
}

/// The transport types a [`Device`] is generic over.
pub trait DeviceTransports: 'static {
    type UdpTransportFactory: UdpTransportFactory;
    type IpSend: IpSend;
    type IpRecv: IpRecv;
}

impl<UF, IS, IR> DeviceTransports for (UF, IS, IR)
where
    UF: UdpTransportFactory,
    IS: IpSend,
    IR: IpRecv,
{
    type UdpTransportFactory = UF;
    type IpSend = IS;
    type IpRecv = IR;
}

impl<UF, IP> DeviceTransports for (UF, IP)
where
    UF: UdpTransportFactory,
    IP: IpSend + IpRecv + Clone,
{
    type UdpTransportFactory = UF;
    type IpSend = IP;
    type IpRecv = IP;
}

pub(crate) type UdpSendOf<T> =
    <<T as DeviceTransports>::UdpTransportFactory as UdpTransportFactory>::Send;

/// A reference-counted handle to a tunnel device.
pub struct Device<T: DeviceTransports> {
    pub(crate) inner: Arc<DeviceInner<T>>,
}

impl<T: DeviceTransports> Clone for Device<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Start building a [`Device`].
pub fn build() -> DeviceBuilder<Nul, Nul, Nul> {
    DeviceBuilder::new()
}

/// The bind/port/fwmark tuple and the receive tasks of the current bind.
struct Net<T: DeviceTransports> {
    factory: T::UdpTransportFactory,
    /// Configured listening port; `0` = ephemeral.
    port: u16,
    /// The port the current bind actually listens on.
    listen_port: u16,
    fwmark: Option<u32>,
    receivers: Vec<Task>,
}

/// The device's own key material and the derived cookie/rate limiter state.
pub(crate) struct StaticIdentity {
    pub private: Option<x25519::StaticSecret>,
    pub public: Option<PublicKey>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// The peer registry: key map plus the allowed-IPs routing trie, guarded by
/// one reader-writer lock.
pub(crate) struct PeerRegistry<T: DeviceTransports> {
    pub by_key: HashMap<PublicKey, Arc<PeerHandle<T>>>,
    pub by_ip: AllowedIps<Arc<PeerHandle<T>>>,
}

pub(crate) struct DeviceInner<T: DeviceTransports> {
    /// Back-reference handed to spawned tasks and index table entries.
    self_weak: std::sync::Weak<DeviceInner<T>>,

    /// The device's state. Accessed atomically, written under `state_lock`.
    ///
    /// During transitions this holds the intended future state, which may
    /// not become the actual state (up can fail). Unsynchronized reads are
    /// advisory only.
    state: AtomicU32,
    /// Serializes lifecycle transitions.
    state_lock: TokioMutex<()>,
    /// Serializes configuration changes against up transitions.
    pub(crate) ipc_lock: TokioMutex<()>,

    net: TokioMutex<Net<T>>,
    /// Send half of the current bind. `None` while down.
    udp_tx: RwLock<Option<UdpSendOf<T>>>,

    /// When set, peer endpoints are never updated from incoming traffic.
    broken_roaming: bool,

    pub(crate) tun_tx: Arc<TokioMutex<T::IpSend>>,
    tun_rx: Arc<TokioMutex<T::IpRecv>>,
    tun_batch_size: usize,
    mtu: AtomicU32,

    pub(crate) identity: RwLock<StaticIdentity>,
    pub(crate) peers: RwLock<PeerRegistry<T>>,
    pub(crate) index_table: IndexTable<IndexEntry<T>>,

    pub(crate) queues: DeviceQueues<T>,
    pub(crate) pool: PacketBufPool,

    pub(crate) obfuscation: Obfuscator,

    start_time: Instant,
    /// Millis (since `start_time`) until which the device reports under load.
    under_load_until: AtomicU64,

    tun_reader: parking_lot::Mutex<Option<Task>>,
    tun_events: parking_lot::Mutex<Option<Task>>,
    /// The fixed worker pools. Joined, not aborted, during close.
    workers: parking_lot::Mutex<Vec<Task>>,

    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl<T: DeviceTransports> DeviceInner<T> {
    pub(crate) fn new(
        factory: T::UdpTransportFactory,
        tun_tx: T::IpSend,
        tun_rx: T::IpRecv,
        port: u16,
        fwmark: Option<u32>,
        broken_roaming: bool,
        tun_events: Option<mpsc::Receiver<TunEvent>>,
    ) -> Arc<Self> {
        let (closed_tx, closed_rx) = watch::channel(false);
        let tun_batch_size = tun_rx.batch_size();
        let mtu = tun_rx.mtu();

        let inner = Arc::new_cyclic(|self_weak| DeviceInner {
            self_weak: self_weak.clone(),
            state: AtomicU32::new(DeviceState::Down as u32),
            state_lock: TokioMutex::new(()),
            ipc_lock: TokioMutex::new(()),
            net: TokioMutex::new(Net {
                factory,
                port,
                listen_port: 0,
                fwmark,
                receivers: Vec::new(),
            }),
            udp_tx: RwLock::new(None),
            broken_roaming,
            tun_tx: Arc::new(TokioMutex::new(tun_tx)),
            tun_rx: Arc::new(TokioMutex::new(tun_rx)),
            tun_batch_size,
            mtu: AtomicU32::new(u32::from(mtu)),
            identity: RwLock::new(StaticIdentity {
                private: None,
                public: None,
                rate_limiter: None,
            }),
            peers: RwLock::new(PeerRegistry {
                by_key: HashMap::new(),
                by_ip: AllowedIps::new(),
            }),
            index_table: IndexTable::from_os_rng(),
            queues: DeviceQueues::new(),
            pool: PacketBufPool::new(PREALLOCATED_BUFFERS_PER_POOL),
            obfuscation: Obfuscator::new(),
            start_time: Instant::now(),
            under_load_until: AtomicU64::new(0),
            tun_reader: parking_lot::Mutex::new(None),
            tun_events: parking_lot::Mutex::new(None),
            workers: parking_lot::Mutex::new(Vec::new()),
            closed_tx,
            closed_rx,
        });

        // One worker of each kind per CPU.
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        {
            let mut workers = inner.workers.lock();
            for _ in 0..cpus {
                workers.push(Task::spawn(
                    "encryption_worker",
                    pipeline::encryption_worker(Arc::downgrade(&inner)),
                ));
                workers.push(Task::spawn(
                    "decryption_worker",
                    pipeline::decryption_worker(Arc::downgrade(&inner)),
                ));
                workers.push(Task::spawn(
                    "handshake_worker",
                    pipeline::handshake_worker(Arc::downgrade(&inner)),
                ));
            }
        }

        *inner.tun_reader.lock() = Some(Task::spawn(
            "tun_reader",
            pipeline::tun_reader(
                Arc::downgrade(&inner),
                Arc::clone(&inner.tun_rx),
                inner.pool.clone(),
            ),
        ));

        if let Some(events) = tun_events {
            *inner.tun_events.lock() = Some(Task::spawn(
                "tun_event_handler",
                pipeline::tun_event_handler(Arc::downgrade(&inner), events),
            ));
        }

        inner
    }

    pub(crate) fn self_weak(&self) -> std::sync::Weak<DeviceInner<T>> {
        self.self_weak.clone()
    }

    pub(crate) fn device_state(&self) -> DeviceState {
        DeviceState::from_u32(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_up(&self) -> bool {
        self.device_state() == DeviceState::Up
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.device_state() == DeviceState::Closed
    }

    pub(crate) async fn up(&self) -> Result<(), Error> {
        self.change_state(DeviceState::Up).await
    }

    pub(crate) async fn down(&self) -> Result<(), Error> {
        self.change_state(DeviceState::Down).await
    }

    /// Attempt to change the device state to `want`.
    async fn change_state(&self, want: DeviceState) -> Result<(), Error> {
        let _guard = self.state_lock.lock().await;

        let old = self.device_state();
        if old == DeviceState::Closed {
            // once closed, always closed
            log::debug!("device is closed, ignoring requested state {want:?}");
            return Ok(());
        }
        if want == old {
            return Ok(());
        }

        let result = match want {
            DeviceState::Up => {
                self.state.store(DeviceState::Up as u32, Ordering::SeqCst);
                match self.up_locked().await {
                    Ok(()) => Ok(()),
                    Err(up) => {
                        // up failed; bring the device all the way back down
                        self.state.store(DeviceState::Down as u32, Ordering::SeqCst);
                        let down = self.down_locked().await.err();
                        if let Some(down) = &down {
                            log::error!("recovery to down failed as well: {down}");
                        }
                        Err(Error::UpFailed {
                            up: Box::new(up),
                            down: down.map(Box::new),
                        })
                    }
                }
            }
            DeviceState::Down => {
                self.state.store(DeviceState::Down as u32, Ordering::SeqCst);
                self.down_locked().await
            }
            DeviceState::Closed => unreachable!("close() does not go through change_state"),
        };

        log::debug!(
            "device state was {old:?}, requested {want:?}, now {:?}",
            self.device_state()
        );
        result
    }

    /// Bring the device up: rebind, then start every peer.
    ///
    /// The caller must hold `state_lock` and have stored the up state.
    async fn up_locked(&self) -> Result<(), Error> {
        {
            let mut net = self.net.lock().await;
            self.bind_update_locked(&mut net).await?;
        }

        // A configuration change in progress may still be creating peers;
        // they must be started before up completes.
        let _ipc = self.ipc_lock.lock().await;

        let peers: Vec<_> = self.peers.read().by_key.values().cloned().collect();
        for peer in peers {
            peer.start();
            if peer.persistent_keepalive() > 0 {
                peer.send_keepalive();
            }
        }
        Ok(())
    }

    /// Bring the device down: close the bind, then stop every peer.
    ///
    /// The caller must hold `state_lock` and have stored the down state.
    async fn down_locked(&self) -> Result<(), Error> {
        {
            let mut net = self.net.lock().await;
            self.close_bind_locked(&mut net).await;
        }

        let peers: Vec<_> = self.peers.read().by_key.values().cloned().collect();
        for peer in peers {
            peer.stop().await;
        }
        Ok(())
    }

    /// Tear down the current bind and its receive tasks.
    async fn close_bind_locked(&self, net: &mut Net<T>) {
        *self.udp_tx.write() = None;
        for task in net.receivers.drain(..) {
            task.stop().await;
        }
        net.listen_port = 0;
    }

    /// (Re)bind the UDP transport and spawn its receive tasks.
    ///
    /// The caller must hold the net lock. Does nothing unless the device is
    /// up.
    pub(crate) async fn bind_update_locked(&self, net: &mut Net<T>) -> Result<(), Error> {
        // close existing sockets, waiting for their receivers
        self.close_bind_locked(net).await;

        if !self.is_up() {
            return Ok(());
        }

        let params = UdpTransportParams {
            port: net.port,
            fwmark: net.fwmark,
        };
        let (udp_tx, receivers, listen_port) = net
            .factory
            .bind(&params)
            .await
            .map_err(|e| Error::Bind(e, net.port))?;

        net.listen_port = listen_port;
        *self.udp_tx.write() = Some(udp_tx);

        // Each receive task is a producer on the decryption and handshake
        // queues for as long as it runs.
        let (Some(decryption_tx), Some(handshake_tx)) = (
            self.queues.decryption.sender(),
            self.queues.handshake.sender(),
        ) else {
            return Err(Error::Closed);
        };
        for udp_rx in receivers {
            net.receivers.push(Task::spawn(
                "udp_receiver",
                pipeline::udp_receiver(
                    self.self_weak.clone(),
                    udp_rx,
                    decryption_tx.clone(),
                    handshake_tx.clone(),
                    self.pool.clone(),
                ),
            ));
        }

        log::debug!("UDP bind has been updated");
        Ok(())
    }

    /// Close the device. Idempotent; once closed, always closed.
    pub(crate) async fn close(&self) {
        let _state = self.state_lock.lock().await;
        let _ipc = self.ipc_lock.lock().await;
        if self.is_closed() {
            return;
        }
        self.state
            .store(DeviceState::Closed as u32, Ordering::SeqCst);
        log::debug!("device closing");

        // Stop consuming from the host side.
        let events_task = self.tun_events.lock().take();
        if let Some(task) = events_task {
            task.stop().await;
        }
        let reader_task = self.tun_reader.lock().take();
        if let Some(task) = reader_task {
            task.stop().await;
        }

        let _ = self.down_locked().await;

        // Remove peers before closing the queues; peers assume the queues
        // are active.
        self.remove_all_peers().await;

        // Drop the device-held producer references. With the receivers and
        // peers gone too, the queues close, and the worker pools exit after
        // draining them.
        self.queues.close_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.join().await;
        }

        if let Some(rate_limiter) = self.identity.read().rate_limiter.clone() {
            rate_limiter.close();
        }

        log::debug!("device closed");
        let _ = self.closed_tx.send(true);
    }

    /// Resolve once the device has fully closed.
    pub(crate) async fn wait(&self) {
        let mut closed = self.closed_rx.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the device is (or recently was) under handshake load.
    ///
    /// While under load, handshake initiators must present a valid cookie
    /// proof.
    pub(crate) fn is_under_load(&self) -> bool {
        let now = self.start_time.elapsed();

        if self.queues.handshake.depth() >= QUEUE_HANDSHAKE_SIZE / 8 {
            let until = now + UNDER_LOAD_AFTER_TIME;
            self.under_load_until
                .store(until.as_millis() as u64, Ordering::Relaxed);
            return true;
        }

        // recently under load (hysteresis)
        Duration::from_millis(self.under_load_until.load(Ordering::Relaxed)) > now
    }

    /// Install a new private key.
    ///
    /// Removes peers whose static key equals the new public key, recomputes
    /// every surviving peer's static-static DH, reinitializes the cookie
    /// state, and expires all current keypairs so fresh handshakes are
    /// negotiated under the new identity. Setting the same key is a no-op.
    pub(crate) async fn set_private_key(&self, private_key: x25519::StaticSecret) {
        let public_key = PublicKey::from(&private_key);

        let mut removed_peers = Vec::new();
        let mut survivors = Vec::new();
        {
            let mut identity = self.identity.write();
            // x25519 (rightly) doesn't let us expose secret keys for comparison.
            // If the public keys are the same, then the private keys are the same.
            if identity.public == Some(public_key) {
                return;
            }

            let mut registry = self.peers.write();
            let peers: Vec<_> = registry.by_key.values().cloned().collect();

            // Hold every peer's handshake state so the identity swap is
            // atomic with respect to the pipeline.
            let mut guards: Vec<parking_lot::MutexGuard<Handshake>> =
                peers.iter().map(|peer| peer.handshake.lock()).collect();

            for (peer, guard) in peers.iter().zip(guards.iter_mut()) {
                if *guard.peer_static_public() == public_key {
                    // This peer would be ourselves under the new identity.
                    registry.by_key.remove(&peer.public_key);
                    let target = Arc::clone(peer);
                    registry
                        .by_ip
                        .remove(&|candidate: &Arc<PeerHandle<T>>| Arc::ptr_eq(candidate, &target));
                    removed_peers.push(Arc::clone(peer));
                } else {
                    // Recompute the static-static DH under the new key.
                    guard.set_static_private(private_key.clone());
                    survivors.push(Arc::clone(peer));
                }
            }

            identity.private = Some(private_key);
            identity.public = Some(public_key);
            identity.rate_limiter =
                Some(Arc::new(RateLimiter::new(&public_key, HANDSHAKE_RATE_LIMIT)));
        }

        for peer in &survivors {
            peer.expire_current_keypairs();
        }
        for peer in removed_peers {
            peer.stop().await;
        }
    }

    /// Add a peer to the registry and routing table.
    ///
    /// Returns `false` if a peer with this public key already exists. The
    /// peer is started immediately when the device is up.
    pub(crate) async fn add_peer(&self, config: Peer) -> Result<bool, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let _ipc = self.ipc_lock.lock().await;
        self.add_peer_ipc_locked(config)
    }

    pub(crate) fn add_peer_ipc_locked(&self, config: Peer) -> Result<bool, Error> {
        let private = self
            .identity
            .read()
            .private
            .clone()
            .ok_or(Error::NoPrivateKey)?;

        let peer = {
            let mut registry = self.peers.write();
            if registry.by_key.contains_key(&config.public_key) {
                return Ok(false);
            }
            let peer = PeerHandle::new(self, &config, private);
            for network in &config.allowed_ips {
                registry
                    .by_ip
                    .insert(network.network(), network.prefix(), Arc::clone(&peer));
            }
            registry.by_key.insert(config.public_key, Arc::clone(&peer));
            peer
        };

        if self.is_up() {
            peer.start();
            if peer.persistent_keepalive() > 0 {
                peer.send_keepalive();
            }
        }

        log::debug!("peer added");
        Ok(true)
    }

    /// Remove a peer. Its routes leave the table before the peer stops.
    pub(crate) async fn remove_peer(&self, public_key: &PublicKey) -> bool {
        let _ipc = self.ipc_lock.lock().await;

        let peer = {
            let mut registry = self.peers.write();
            let Some(peer) = registry.by_key.remove(public_key) else {
                return false;
            };
            let target = Arc::clone(&peer);
            registry
                .by_ip
                .remove(&|candidate: &Arc<PeerHandle<T>>| Arc::ptr_eq(candidate, &target));
            peer
        };
        peer.stop().await;

        log::debug!("peer removed");
        true
    }

    pub(crate) async fn remove_all_peers(&self) {
        let removed: Vec<_> = {
            let mut registry = self.peers.write();
            registry.by_ip.clear();
            registry.by_key.drain().map(|(_, peer)| peer).collect()
        };
        for peer in removed {
            peer.stop().await;
        }
    }

    /// The send half of the current bind, if any.
    pub(crate) fn current_udp_tx(&self) -> Option<UdpSendOf<T>> {
        self.udp_tx.read().clone()
    }

    /// Whether peer endpoints may follow the source address of authenticated
    /// incoming traffic.
    pub(crate) fn roaming_enabled(&self) -> bool {
        !self.broken_roaming
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        self.mtu.store(u32::from(mtu), Ordering::Relaxed);
    }

    pub(crate) fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed) as u16
    }

    /// The batch size for the device as a whole: the max of the bind batch
    /// size and the IP transport batch size.
    pub(crate) fn batch_size(&self) -> usize {
        let bind = self
            .udp_tx
            .read()
            .as_ref()
            .map(|tx| tx.batch_size())
            .unwrap_or(1);
        bind.max(self.tun_batch_size)
    }

    pub(crate) async fn listen_port(&self) -> u16 {
        self.net.lock().await.listen_port
    }

    pub(crate) async fn set_port(&self, port: u16) -> Result<(), Error> {
        let mut net = self.net.lock().await;
        if net.port == port {
            return Ok(());
        }
        net.port = port;
        // Rebind only applies to a running device.
        if self.is_up() {
            return self.bind_update_locked(&mut net).await;
        }
        Ok(())
    }

    pub(crate) async fn set_fwmark(&self, fwmark: u32) -> Result<(), Error> {
        let mut net = self.net.lock().await;
        if net.fwmark == Some(fwmark) {
            return Ok(());
        }
        net.fwmark = Some(fwmark);
        // update the mark on the existing bind
        if let Some(udp_tx) = self.current_udp_tx() {
            udp_tx.set_fwmark(fwmark)?;
        }
        Ok(())
    }
}
