// Copyright (c) 2026 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The bounded queues feeding the worker pools, and the elements that travel
//! through them.
//!
//! Each queue is a bounded mpsc channel drained by a fixed pool of workers.
//! The producer reference count of the classic design maps onto sender
//! clones: every producer (the device itself, each UDP receive task, each
//! peer feeder) holds a [`QueueSender`], and the channel closes when the
//! last one is dropped. Consumers then drain the channel and exit.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};

use crate::device::DeviceTransports;
use crate::device::peer::PeerHandle;
use crate::noise::Keypair;
use crate::packet::{CnData, CnKind, Packet};

/// Capacity of each peer's staged outbound queue (the ideal batch size).
pub(crate) const QUEUE_STAGED_SIZE: usize = 128;

/// Capacity of the encryption queue.
pub(crate) const QUEUE_OUTBOUND_SIZE: usize = 1024;

/// Capacity of the decryption queue.
pub(crate) const QUEUE_INBOUND_SIZE: usize = 1024;

/// Capacity of the handshake queue.
pub(crate) const QUEUE_HANDSHAKE_SIZE: usize = 1024;

/// A plaintext packet on its way to the encryption workers.
pub(crate) struct OutboundElement<T: DeviceTransports> {
    pub packet: Packet,
    pub peer: Arc<PeerHandle<T>>,
    pub keypair: Arc<Keypair>,
    /// The sending nonce reserved by the peer's feeder. Reservation order is
    /// the order of the peer's serial queue.
    pub nonce: u64,
    /// Hands the sealed frame to the peer's serial sender.
    pub sealed_tx: oneshot::Sender<Packet<CnData>>,
}

/// A transport datagram on its way to the decryption workers.
pub(crate) struct InboundElement<T: DeviceTransports> {
    pub packet: Packet<CnData>,
    pub peer: Arc<PeerHandle<T>>,
    pub keypair: Arc<Keypair>,
    pub src: SocketAddr,
    /// Hands the decrypted packet to the peer's serial receiver. Dropped
    /// without sending when decryption fails.
    pub opened_tx: oneshot::Sender<Decrypted>,
}

/// A successfully opened transport packet.
pub(crate) struct Decrypted {
    pub packet: Packet,
    pub src: SocketAddr,
    pub keypair: Arc<Keypair>,
}

/// A handshake or cookie datagram on its way to the handshake workers.
pub(crate) struct HandshakeElement {
    pub message: CnKind,
    pub src: SocketAddr,
}

/// One producer reference on a [`Queue`].
///
/// Sends block while the queue is at capacity. Dropping the last sender
/// closes the queue.
pub(crate) struct QueueSender<E> {
    tx: mpsc::Sender<E>,
    notify: Arc<Notify>,
}

impl<E> Clone for QueueSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<E> QueueSender<E> {
    /// Enqueue one element, waking an idle consumer.
    ///
    /// Errors when every consumer is gone, which only happens on teardown.
    pub async fn send(&self, element: E) -> Result<(), mpsc::error::SendError<E>> {
        self.tx.send(element).await?;
        self.notify.notify_one();
        Ok(())
    }
}


/// One consumer handle on a [`Queue`]; the worker pools share the channel
/// through this.
///
/// The receiver lock is only held for a non-blocking poll, never while
/// parked, so consumers cannot starve each other.
pub(crate) struct QueueReceiver<E> {
    pub(crate) rx: Arc<Mutex<mpsc::Receiver<E>>>,
    notify: Arc<Notify>,
}

impl<E> Clone for QueueReceiver<E> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<E> QueueReceiver<E> {
    /// Take the next element, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<E> {
        loop {
            // Register for a wakeup before polling, so a send or close
            // racing with the empty poll is not lost.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut rx = self.rx.lock().await;
                match rx.try_recv() {
                    Ok(element) => return Some(element),
                    Err(TryRecvError::Disconnected) => return None,
                    Err(TryRecvError::Empty) => {}
                }
            }
            notified.await;
        }
    }
}

/// A bounded channel with a fixed consumer pool on the receiving side.
///
/// The device holds one sender for the queue's whole lifetime (dropped by
/// [`Queue::close`] during teardown); other producers take clones via
/// [`Queue::sender`].
pub(crate) struct Queue<E> {
    tx: parking_lot::Mutex<Option<QueueSender<E>>>,
    probe: mpsc::WeakSender<E>,
    rx: Arc<Mutex<mpsc::Receiver<E>>>,
    notify: Arc<Notify>,
}

impl<E: Send + 'static> Queue<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let notify = Arc::new(Notify::new());
        Self {
            probe: tx.downgrade(),
            tx: parking_lot::Mutex::new(Some(QueueSender {
                tx,
                notify: Arc::clone(&notify),
            })),
            rx: Arc::new(Mutex::new(rx)),
            notify,
        }
    }

    /// Take a producer handle. `None` once the queue has been closed.
    pub fn sender(&self) -> Option<QueueSender<E>> {
        self.tx.lock().clone()
    }

    /// A consumer handle for the worker pool.
    pub fn receiver(&self) -> QueueReceiver<E> {
        QueueReceiver {
            rx: Arc::clone(&self.rx),
            notify: Arc::clone(&self.notify),
        }
    }

    /// Number of queued elements. Advisory; used by the load detector.
    pub fn depth(&self) -> usize {
        match self.probe.upgrade() {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }

    /// Drop the device-held producer reference and wake every idle consumer.
    /// The channel closes once all other producers are gone too, and the
    /// workers exit after draining it.
    pub fn close(&self) {
        *self.tx.lock() = None;
        self.notify.notify_waiters();
    }
}

/// The device's three pipeline queues.
pub(crate) struct DeviceQueues<T: DeviceTransports> {
    pub encryption: Queue<OutboundElement<T>>,
    pub decryption: Queue<InboundElement<T>>,
    pub handshake: Queue<HandshakeElement>,
}

impl<T: DeviceTransports> DeviceQueues<T> {
    pub fn new() -> Self {
        Self {
            encryption: Queue::new(QUEUE_OUTBOUND_SIZE),
            decryption: Queue::new(QUEUE_INBOUND_SIZE),
            handshake: Queue::new(QUEUE_HANDSHAKE_SIZE),
        }
    }

    pub fn close_all(&self) {
        self.encryption.close();
        self.decryption.close();
        self.handshake.close();
    }
}
