// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Implementations of [`IpSend`]/[`IpRecv`] for tokio channels.
//!
//! Lets arbitrary IP traffic be piped into and out of a device entirely in
//! userspace; used by the test suite in place of a TUN driver.

use std::io;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::packet::{Ip, Packet, PacketBufPool};
use crate::tun::{DEFAULT_MTU, IpRecv, IpSend};

/// The host-side ends of a [`TunChannel`].
pub struct TunChannelHost {
    /// Inject IP packets for the device to read, as if written to a TUN.
    pub tx: mpsc::Sender<Packet<Ip>>,
    /// Receive the IP packets the device delivers to the host.
    pub rx: mpsc::Receiver<Packet<Ip>>,
}

/// A channel-backed IP transport. Create with [`new_tun_channel`].
#[derive(Clone)]
pub struct TunChannel {
    tx: mpsc::Sender<Packet<Ip>>,
    rx: Arc<Mutex<mpsc::Receiver<Packet<Ip>>>>,
    mtu: u16,
    batch_size: usize,
}

/// Create a channel-backed IP endpoint pair for in-process use.
///
/// Returns the host-side handle and the device-side transport.
pub fn new_tun_channel(capacity: usize) -> (TunChannelHost, TunChannel) {
    let (host_tx, device_rx) = mpsc::channel(capacity);
    let (device_tx, host_rx) = mpsc::channel(capacity);

    (
        TunChannelHost {
            tx: host_tx,
            rx: host_rx,
        },
        TunChannel {
            tx: device_tx,
            rx: Arc::new(Mutex::new(device_rx)),
            mtu: DEFAULT_MTU,
            batch_size: 128,
        },
    )
}

impl IpSend for TunChannel {
    async fn send(&mut self, packet: Packet<Ip>) -> io::Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

impl IpRecv for TunChannel {
    async fn recv(&mut self, _pool: &mut PacketBufPool) -> io::Result<Vec<Packet<Ip>>> {
        let mut rx = self.rx.lock().await;
        let Some(first) = rx.recv().await else {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        };

        let mut packets = vec![first];
        while packets.len() < self.batch_size {
            match rx.try_recv() {
                Ok(packet) => packets.push(packet),
                Err(_) => break,
            }
        }
        Ok(packets)
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
