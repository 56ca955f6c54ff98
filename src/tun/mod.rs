// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Trait abstractions for the IP side of the device.
//!
//! See [`IpSend`] and [`IpRecv`]. These are normally backed by a TUN driver,
//! but can be implemented by anything, for example a tokio channel
//! ([`channel`]).

use std::future::Future;
use std::io;

use crate::packet::{Ip, Packet, PacketBufPool};

pub mod channel;

/// MTU assumed when the IP transport does not report one.
pub const DEFAULT_MTU: u16 = 1420;

/// Events emitted by the host side of an IP transport.
///
/// The device applies these to itself: link state maps to up/down
/// transitions, MTU updates replace the device MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    LinkUp,
    LinkDown,
    MtuUpdate(u16),
}

/// A type that lets you send an IP packet to the host network stack.
pub trait IpSend: Send + Sync + 'static {
    /// Send a complete IP packet.
    fn send(&mut self, packet: Packet<Ip>) -> impl Future<Output = io::Result<()>> + Send;
}

/// A type that lets you receive IP packets from the host network stack.
pub trait IpRecv: Send + Sync + 'static {
    /// Receive a batch of complete IP packets, at most [`IpRecv::batch_size`]
    /// of them.
    ///
    /// An error return is fatal to the device's read loop.
    fn recv(
        &mut self,
        pool: &mut PacketBufPool,
    ) -> impl Future<Output = io::Result<Vec<Packet<Ip>>>> + Send;

    /// The current maximum transfer unit of the underlying link.
    fn mtu(&self) -> u16 {
        DEFAULT_MTU
    }

    /// The largest number of packets a single [`IpRecv::recv`] may return.
    fn batch_size(&self) -> usize {
        1
    }
}
