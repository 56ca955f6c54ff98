// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
//
// Modified by Mullvad VPN.
// Copyright (c) 2025 Mullvad VPN.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A userspace implementation of the `cn` secure tunnel protocol.
//!
//! The heart of the crate is the [`device`] module: a concurrent packet
//! engine that multiplexes encrypted datagrams with many remote peers over a
//! single UDP transport while exposing one virtual IP interface to the host.
//! The [`noise`] module implements the Noise_IKpsk2 handshake and transport
//! keypairs, and [`packet`] provides the zero-copy wire types shared by both.
//!
//! An optional obfuscation layer ("advanced security") remaps the protocol
//! message tags and pads handshake frames with random junk to resist deep
//! packet inspection. See [`device::ObfuscationConfig`].

pub mod device;
pub mod noise;
pub mod packet;
pub mod tun;
pub mod udp;

mod task;

/// Re-export of the x25519 types
pub mod x25519 {
    pub use x25519_dalek::{
        EphemeralSecret, PublicKey, ReusableSecret, SharedSecret, StaticSecret,
    };
}
