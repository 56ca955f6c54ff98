// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::{
    Arc, Weak,
    atomic::{AtomicUsize, Ordering},
};

use bytes::BytesMut;
use tokio::sync::Semaphore;

use crate::packet::Packet;

/// A recycler of objects of a single type, with an optional ceiling on the
/// number of objects in flight.
///
/// [`WaitPool::get`] hands out a recycled object if one is available, and
/// otherwise constructs a fresh one using the factory the pool was created
/// with. With a non-zero `max`, `get` parks the caller while `max` objects
/// are already in flight; [`WaitPool::put`] wakes waiters in arrival order.
pub struct WaitPool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for WaitPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

pub(crate) struct PoolShared<T> {
    free_tx: crossbeam_channel::Sender<T>,
    free_rx: crossbeam_channel::Receiver<T>,

    /// Present iff the pool has a ceiling. Permits equal free slots.
    gate: Option<Semaphore>,

    /// Objects currently held by callers. Advisory only; see [`WaitPool::count`].
    in_flight: AtomicUsize,

    new_fn: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Send> WaitPool<T> {
    /// Create a pool with the given in-flight ceiling and object factory.
    ///
    /// `max == 0` disables the ceiling entirely; `get` then never blocks.
    pub fn new(max: usize, new_fn: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(PoolShared {
                free_tx,
                free_rx,
                gate: (max > 0).then(|| Semaphore::new(max)),
                in_flight: AtomicUsize::new(0),
                new_fn: Box::new(new_fn),
            }),
        }
    }

    /// Take an object from the pool, waiting for one to be returned if the
    /// in-flight ceiling has been reached.
    pub async fn get(&self) -> T {
        if let Some(gate) = &self.shared.gate {
            gate.acquire()
                .await
                .expect("pool semaphore is never closed")
                .forget();
        }
        self.shared.in_flight.fetch_add(1, Ordering::Relaxed);
        self.shared
            .free_rx
            .try_recv()
            .unwrap_or_else(|_| (self.shared.new_fn)())
    }

    /// Return an object to the pool, waking one waiter if any.
    pub fn put(&self, item: T) {
        self.shared.put(item);
    }

    /// The number of objects currently in flight. Advisory only; used by tests.
    pub fn count(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }
}

impl<T> PoolShared<T> {
    fn put(&self, item: T) {
        let _ = self.free_tx.send(item);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }
}

/// Sends a previously allocated buffer back to its [`PacketBufPool`] when the
/// owning [`Packet`] is dropped.
#[derive(Clone)]
pub(crate) struct ReturnToPool(Weak<PoolShared<BytesMut>>);

impl ReturnToPool {
    pub(crate) fn put_back(&self, buf: BytesMut) {
        // If the pool is gone, the buffer is simply freed.
        if let Some(pool) = self.0.upgrade() {
            pool.put(buf);
        }
    }
}

/// A pool of packet buffers.
///
/// Buffers are `N` bytes large and returned to the pool when the handed-out
/// [`Packet`] is dropped. The ceiling semantics are those of [`WaitPool`];
/// the device runs with the ceiling disabled and grows on demand.
#[derive(Clone)]
pub struct PacketBufPool<const N: usize = 4096> {
    pool: WaitPool<BytesMut>,
}

impl<const N: usize> PacketBufPool<N> {
    /// Create a new [`PacketBufPool`] allowing at most `max` buffers in
    /// flight (`0` = unlimited), each allocated with a capacity of `N` bytes.
    pub fn new(max: usize) -> Self {
        Self {
            pool: WaitPool::new(max, || BytesMut::zeroed(N)),
        }
    }

    /// Get a zero-filled [`Packet`] of `N` bytes from the pool.
    ///
    /// This will re-use an already allocated buffer if possible, or allocate
    /// one otherwise.
    pub async fn get(&self) -> Packet {
        let mut buf = self.pool.get().await;
        buf.clear();
        if buf.try_reclaim(N) {
            buf.resize(N, 0);
        } else {
            // The previous user advanced past recoverable capacity.
            buf = BytesMut::zeroed(N);
        }
        Packet::new_from_pool(ReturnToPool(Arc::downgrade(&self.pool.shared)), buf)
    }

    /// The number of buffers currently in flight. Advisory only; used by tests.
    pub fn count(&self) -> usize {
        self.pool.count()
    }
}

#[cfg(test)]
mod tests {
    use super::{PacketBufPool, WaitPool};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    /// Buffers are recycled once their packet is dropped.
    #[tokio::test]
    async fn pool_buffer_recycle() {
        let pool = PacketBufPool::<4096>::new(0);

        let mut packet1 = pool.get().await;
        let packet1_addr = packet1.buf_mut().as_ptr();
        assert_eq!(pool.count(), 1);

        drop(packet1);
        assert_eq!(pool.count(), 0);

        // This should re-use the buffer of packet1.
        let packet2 = pool.get().await;
        let packet2_addr = packet2.buf().as_ptr();

        // Since we're still holding packet2, this will result in an allocation.
        let packet3 = pool.get().await;
        let packet3_addr = packet3.buf().as_ptr();

        assert_eq!(packet1_addr, packet2_addr);
        assert_ne!(packet1_addr, packet3_addr);
        assert_eq!(pool.count(), 2);
    }

    /// Every `get` is matched by exactly one `put`, and the in-flight count
    /// reflects the difference at all times.
    #[tokio::test]
    async fn pool_accounting() {
        let pool = WaitPool::new(0, || 0u64);

        let mut held = vec![];
        for _ in 0..100 {
            held.push(pool.get().await);
        }
        assert_eq!(pool.count(), 100);

        for item in held.drain(50..) {
            pool.put(item);
        }
        assert_eq!(pool.count(), 50);

        for item in held {
            pool.put(item);
        }
        assert_eq!(pool.count(), 0);
    }

    /// With a ceiling of 4 and 8 concurrent workers, the observed in-flight
    /// count never exceeds 4, and reaches it.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_ceiling_under_contention() {
        const MAX: usize = 4;
        const WORKERS: usize = 8;
        const CYCLES: usize = 10_000;

        let pool = WaitPool::new(MAX, || [0u8; 32]);
        let observed_max = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let pool = pool.clone();
                let observed_max = Arc::clone(&observed_max);
                tokio::spawn(async move {
                    for _ in 0..CYCLES {
                        let item = pool.get().await;
                        let count = pool.count();
                        assert!(count <= MAX, "in-flight count {count} exceeded ceiling");
                        observed_max.fetch_max(count, Ordering::Relaxed);
                        tokio::task::yield_now().await;
                        pool.put(item);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(pool.count(), 0);
        assert_eq!(observed_max.load(Ordering::Relaxed), MAX);
    }
}
