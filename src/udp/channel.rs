// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Implementations of [`UdpSend`]/[`UdpRecv`] for tokio channels.
//!
//! See [`new_udp_channel`]. The host side sees raw `(payload, address)`
//! pairs: outbound pairs carry the destination the device sent to, inbound
//! pairs carry the claimed source address. Used by the test suite, and for
//! in-process multihop wiring.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};

use crate::packet::{Packet, PacketBufPool};
use crate::udp::{UdpRecv, UdpSend, UdpTransportFactory, UdpTransportParams};

type Datagram = (Packet, SocketAddr);

/// The host-side ends of a channel transport.
pub struct UdpChannelHost {
    /// Datagrams the device emitted, paired with their destination.
    pub outbound: mpsc::Receiver<Datagram>,
    /// Inject datagrams for the device to receive, paired with their source.
    pub inbound: mpsc::Sender<Datagram>,
}

/// An implementation of [`UdpTransportFactory`] backed by channels.
///
/// Binding claims exclusive access to the inbound channel for the lifetime of
/// the returned [`UdpChannelRx`]. Another `bind` will *block* until that
/// receiver has been dropped.
pub struct UdpChannelFactory {
    out_tx: mpsc::Sender<Datagram>,
    in_rx: Arc<Mutex<mpsc::Receiver<Datagram>>>,
}

/// The sending half of a channel transport. Create using [`new_udp_channel`].
#[derive(Clone)]
pub struct UdpChannelTx {
    out_tx: mpsc::Sender<Datagram>,
    port: u16,
}

/// The receiving half of a channel transport. Create using [`new_udp_channel`].
pub struct UdpChannelRx {
    in_rx: OwnedMutexGuard<mpsc::Receiver<Datagram>>,
}

/// Create a channel-backed UDP transport for in-process device communication.
///
/// `capacity` is the channel buffer size for each direction.
pub fn new_udp_channel(capacity: usize) -> (UdpChannelHost, UdpChannelFactory) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);

    (
        UdpChannelHost {
            outbound: out_rx,
            inbound: in_tx,
        },
        UdpChannelFactory {
            out_tx,
            in_rx: Arc::new(Mutex::new(in_rx)),
        },
    )
}

impl UdpTransportFactory for UdpChannelFactory {
    type Send = UdpChannelTx;
    type Recv = UdpChannelRx;

    async fn bind(
        &mut self,
        params: &UdpTransportParams,
    ) -> io::Result<(Self::Send, Vec<Self::Recv>, u16)> {
        let port = match params.port {
            0 => rand::random_range(1u16..u16::MAX),
            p => p,
        };

        let tx = UdpChannelTx {
            out_tx: self.out_tx.clone(),
            port,
        };
        let rx = UdpChannelRx {
            in_rx: self.in_rx.clone().lock_owned().await,
        };

        Ok((tx, vec![rx], port))
    }
}

impl UdpSend for UdpChannelTx {
    async fn send_to(&self, packet: Packet, destination: SocketAddr) -> io::Result<()> {
        self.out_tx
            .send((packet, destination))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.port)
    }

    fn set_fwmark(&self, _mark: u32) -> io::Result<()> {
        Ok(())
    }
}

impl UdpRecv for UdpChannelRx {
    async fn recv_from(&mut self, _pool: &mut PacketBufPool) -> io::Result<(Packet, SocketAddr)> {
        self.in_rx
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}
