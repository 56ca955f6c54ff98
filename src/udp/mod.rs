// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Trait abstractions for the datagram side of the device.
//!
//! A [`UdpTransportFactory`] binds the listening transport and hands the
//! device one send half plus a set of receivers; the device spawns one
//! receive task per receiver.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use crate::packet::{Packet, PacketBufPool};

pub mod channel;
pub mod socket;

/// Parameters for [`UdpTransportFactory::bind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTransportParams {
    /// Port to listen on. `0` picks an ephemeral port.
    pub port: u16,
    /// Firewall mark to stamp on the sockets, where supported.
    pub fwmark: Option<u32>,
}

/// The sending half of a bound UDP transport.
///
/// Cheap to clone; the pipeline hands clones to every task that emits
/// datagrams.
pub trait UdpSend: Clone + Send + Sync + 'static {
    /// Send one datagram to `destination`.
    fn send_to(
        &self,
        packet: Packet,
        destination: SocketAddr,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// The actual port this transport is listening on.
    fn local_port(&self) -> io::Result<u16>;

    /// Update the firewall mark on the live transport. A no-op where
    /// unsupported.
    fn set_fwmark(&self, mark: u32) -> io::Result<()>;

    /// The ideal number of packets to move in one batch.
    fn batch_size(&self) -> usize {
        1
    }
}

/// One receiving half of a bound UDP transport.
pub trait UdpRecv: Send + 'static {
    /// Receive one datagram and its source address.
    ///
    /// An error return is fatal to the receive task that owns this half.
    fn recv_from(
        &mut self,
        pool: &mut PacketBufPool,
    ) -> impl Future<Output = io::Result<(Packet, SocketAddr)>> + Send;
}

/// A factory for the UDP transport of a device.
///
/// `bind` is called on every up transition (and rebind); the previous
/// transport halves are dropped first.
pub trait UdpTransportFactory: Send + Sync + 'static {
    type Send: UdpSend;
    type Recv: UdpRecv;

    /// Bind the transport.
    ///
    /// Returns the send half, the receivers (the device spawns one receive
    /// task each), and the actual listening port.
    fn bind(
        &mut self,
        params: &UdpTransportParams,
    ) -> impl Future<Output = io::Result<(Self::Send, Vec<Self::Recv>, u16)>> + Send;
}
