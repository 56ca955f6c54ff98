// Copyright (c) 2026 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use tokio::sync::mpsc;

use crate::device::{Device, DeviceInner, Error, peer::Peer};
use crate::tun::{IpRecv, IpSend, TunEvent};
use crate::udp::{UdpTransportFactory, socket::UdpSocketFactory};
use crate::x25519;

/// Uninitialized [`DeviceBuilder`] transport parameter.
pub struct Nul;

/// Builder for a [`Device`].
///
/// The type-parameters represent the final transport implementations, see
/// [`DeviceTransports`](crate::device::DeviceTransports).
pub struct DeviceBuilder<Udp, TunTx, TunRx> {
    udp: Udp,
    tun_tx: TunTx,
    tun_rx: TunRx,
    tun_events: Option<mpsc::Receiver<TunEvent>>,
    port: u16,
    fwmark: Option<u32>,
    broken_roaming: bool,
    private_key: Option<x25519::StaticSecret>,
    peers: Vec<Peer>,
}

impl Default for DeviceBuilder<Nul, Nul, Nul> {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBuilder<Nul, Nul, Nul> {
    /// Create a new [`DeviceBuilder`].
    /// A final [`Device`] is assembled with [`DeviceBuilder::build`].
    pub const fn new() -> Self {
        Self {
            udp: Nul,
            tun_tx: Nul,
            tun_rx: Nul,
            tun_events: None,
            port: 0,
            fwmark: None,
            broken_roaming: false,
            private_key: None,
            peers: Vec::new(),
        }
    }
}

impl<X, Y> DeviceBuilder<Nul, X, Y> {
    /// Use plain UDP sockets for datagrams. This is the conventional device
    /// kind.
    pub fn with_default_udp(self) -> DeviceBuilder<UdpSocketFactory, X, Y> {
        self.with_udp(UdpSocketFactory)
    }

    /// Use a custom [`UdpTransportFactory`].
    ///
    /// See also [`with_default_udp`](Self::with_default_udp).
    pub fn with_udp<Udp: UdpTransportFactory>(self, udp: Udp) -> DeviceBuilder<Udp, X, Y> {
        DeviceBuilder {
            udp,
            tun_tx: self.tun_tx,
            tun_rx: self.tun_rx,
            tun_events: self.tun_events,
            port: self.port,
            fwmark: self.fwmark,
            broken_roaming: self.broken_roaming,
            private_key: self.private_key,
            peers: self.peers,
        }
    }
}

impl<X> DeviceBuilder<X, Nul, Nul> {
    /// Set the channel where the device will read and write IP packets.
    /// This is normally a TUN device, but can be any type that implements
    /// both [`IpSend`] and [`IpRecv`].
    pub fn with_ip<Ip: IpSend + IpRecv + Clone>(self, ip: Ip) -> DeviceBuilder<X, Ip, Ip> {
        self.with_ip_pair(ip.clone(), ip)
    }

    /// Like [`with_ip`](Self::with_ip), but with separate halves for sending
    /// and receiving IP packets.
    pub fn with_ip_pair<IpTx: IpSend, IpRx: IpRecv>(
        self,
        ip_tx: IpTx,
        ip_rx: IpRx,
    ) -> DeviceBuilder<X, IpTx, IpRx> {
        DeviceBuilder {
            udp: self.udp,
            tun_tx: ip_tx,
            tun_rx: ip_rx,
            tun_events: self.tun_events,
            port: self.port,
            fwmark: self.fwmark,
            broken_roaming: self.broken_roaming,
            private_key: self.private_key,
            peers: self.peers,
        }
    }
}

impl<X, Y, Z> DeviceBuilder<X, Y, Z> {
    /// Apply interface events (link up/down, MTU changes) from this channel
    /// to the device.
    pub fn with_tun_events(mut self, events: mpsc::Receiver<TunEvent>) -> Self {
        self.tun_events = Some(events);
        self
    }

    /// Set the device's private key.
    ///
    /// A key must be configured (here, or with
    /// [`Device::set_private_key`](crate::device::Device::set_private_key))
    /// before any peer can be added.
    pub fn with_private_key(mut self, private_key: x25519::StaticSecret) -> Self {
        self.private_key = Some(private_key);
        self
    }

    /// Add a [`Peer`] to this device. May be called multiple times.
    ///
    /// Peers can also be added later with
    /// [`Device::add_peer`](crate::device::Device::add_peer).
    pub fn with_peer(mut self, peer: Peer) -> Self {
        self.peers.push(peer);
        self
    }

    /// Add multiple [`Peer`]s to this device. May be called multiple times.
    pub fn with_peers(mut self, peers: impl IntoIterator<Item = Peer>) -> Self {
        self.peers.extend(peers);
        self
    }

    /// Specify the listening port. `0` picks an ephemeral port.
    pub const fn with_listen_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Specify the firewall mark to stamp on the UDP sockets.
    pub const fn with_fwmark(mut self, fwmark: u32) -> Self {
        self.fwmark = Some(fwmark);
        self
    }

    /// Never update peer endpoints from the source address of incoming
    /// traffic. For hosts behind address-rewriting middleboxes.
    pub const fn with_broken_roaming(mut self) -> Self {
        self.broken_roaming = true;
        self
    }
}

impl<Udp: UdpTransportFactory, TunTx: IpSend, TunRx: IpRecv> DeviceBuilder<Udp, TunTx, TunRx> {
    /// Build the final [`Device`] from this builder.
    ///
    /// The device starts in the down state; bring it up with
    /// [`Device::up`](crate::device::Device::up).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPrivateKey`] if peers were configured without a
    /// private key.
    pub async fn build(self) -> Result<Device<(Udp, TunTx, TunRx)>, Error> {
        let inner = DeviceInner::new(
            self.udp,
            self.tun_tx,
            self.tun_rx,
            self.port,
            self.fwmark,
            self.broken_roaming,
            self.tun_events,
        );

        if let Some(private_key) = self.private_key {
            inner.set_private_key(private_key).await;
        }
        for peer in self.peers {
            inner.add_peer(peer).await?;
        }

        Ok(Device { inner })
    }
}
