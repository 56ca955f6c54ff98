// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Types to create, parse, and move network packets around in a zero-copy manner.
//!
//! See [`Packet`](crate::packet::Packet) for a [`bytes`]-backed owned packet
//! buffer, and [`PacketBufPool`] for the recycling allocator the pipeline
//! draws its buffers from.

use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use bytes::BytesMut;
use eyre::bail;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

mod cn;
mod ip;
mod ipv4;
mod ipv6;
mod pool;
mod util;

pub use cn::*;
pub use ip::*;
pub use ipv4::*;
pub use ipv6::*;
pub use pool::*;

/// An owned packet of some type.
///
/// The generic type `Kind` represents the type of packet.
/// For example, a `Packet<[u8]>` is an untyped packet containing arbitrary
/// bytes. It can be decoded into a `Packet<Ip>` using [`Packet::try_into_ip`],
/// or classified into one of the tunnel message types using
/// [`Packet::try_into_cn`](crate::packet::Packet::try_into_cn).
///
/// [`Packet`] uses [`BytesMut`] as the backing buffer. Buffers handed out by a
/// [`PacketBufPool`] are returned to the pool when the packet is dropped.
pub struct Packet<Kind: ?Sized = [u8]> {
    inner: PacketInner,

    /// Marker type defining what type the buffer holds.
    ///
    /// INVARIANT:
    /// `buf` must have been ensured to actually contain a packet of this type.
    _kind: PhantomData<Kind>,
}

struct PacketInner {
    buf: BytesMut,

    // If the [BytesMut] was allocated by a [PacketBufPool], this returns the
    // buffer to be re-used later.
    return_to_pool: Option<ReturnToPool>,
}

impl Drop for PacketInner {
    fn drop(&mut self) {
        if let Some(pool) = self.return_to_pool.take() {
            pool.put_back(std::mem::take(&mut self.buf));
        }
    }
}

/// A marker trait that indicates that a [Packet] contains a valid payload of a
/// specific type.
///
/// For example, a [`Packet<CnData>`] can only be constructed through
/// [`Packet::try_into_cn`], which checks the length and type tag first.
pub trait CheckedPayload: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned {}

impl CheckedPayload for [u8] {}
impl CheckedPayload for Ip {}
impl CheckedPayload for CnHandshakeInit {}
impl CheckedPayload for CnHandshakeResp {}
impl CheckedPayload for CnCookieReply {}
impl CheckedPayload for CnData {}

impl<T: CheckedPayload + ?Sized> Packet<T> {
    /// Cast `T` to `Y` without checking anything.
    ///
    /// Only invoke this after checking that the backing buffer contains a
    /// bitwise valid `Y`. Incorrect usage of this function will cause
    /// [`Packet::deref`] to panic.
    pub(crate) fn cast<Y: CheckedPayload + ?Sized>(self) -> Packet<Y> {
        Packet {
            inner: self.inner,
            _kind: PhantomData::<Y>,
        }
    }

    /// Discard the type of this packet and treat it as a pile of bytes.
    pub fn into_bytes(self) -> Packet<[u8]> {
        self.cast()
    }

    pub(crate) fn buf(&self) -> &[u8] {
        &self.inner.buf
    }

    /// Create a `Packet<Y>` from a `&Y` by copying its bytes into the backing
    /// buffer of this `Packet<T>`.
    ///
    /// If the `Y` won't fit into the backing buffer, this call will allocate.
    pub fn overwrite_with<Y: CheckedPayload>(mut self, payload: &Y) -> Packet<Y> {
        self.inner.buf.clear();
        self.inner.buf.extend_from_slice(payload.as_bytes());
        self.cast()
    }
}

impl Default for Packet<[u8]> {
    fn default() -> Self {
        Self::from_bytes(BytesMut::default())
    }
}

impl Packet<[u8]> {
    /// Create a new packet from a pool, with automatic return-to-pool on drop.
    ///
    /// This is used internally by [`PacketBufPool`] to create packets that are
    /// returned to the pool when dropped.
    pub(crate) fn new_from_pool(return_to_pool: ReturnToPool, bytes: BytesMut) -> Self {
        Self {
            inner: PacketInner {
                buf: bytes,
                return_to_pool: Some(return_to_pool),
            },
            _kind: PhantomData::<[u8]>,
        }
    }

    /// Create a `Packet::<[u8]>` from a [`BytesMut`].
    pub fn from_bytes(bytes: BytesMut) -> Self {
        Self {
            inner: PacketInner {
                buf: bytes,
                return_to_pool: None,
            },
            _kind: PhantomData::<[u8]>,
        }
    }

    /// Create a `Packet::<[u8]>` by copying `payload` into a fresh buffer.
    pub fn copy_from(payload: &[u8]) -> Self {
        Self::from_bytes(BytesMut::from(payload))
    }

    /// See [`BytesMut::truncate`].
    pub fn truncate(&mut self, new_len: usize) {
        self.inner.buf.truncate(new_len);
    }

    /// Get direct mutable access to the backing buffer.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.inner.buf
    }

    /// Try to cast this untyped packet into an [`Ip`].
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if this packet is smaller than the fixed part of an
    /// IPv4 header. No other validation takes place.
    pub fn try_into_ip(self) -> eyre::Result<Packet<Ip>> {
        let buf_len = self.buf().len();

        // IPv6 packets are larger, but we learn the IP version from the first
        // byte. This is the smallest any IP packet can be.
        if buf_len < Ipv4Header::LEN {
            bail!("Packet too small ({buf_len} < {})", Ipv4Header::LEN);
        }

        Ok(self.cast::<Ip>())
    }
}

impl<Kind> Deref for Packet<Kind>
where
    Kind: CheckedPayload + ?Sized,
{
    type Target = Kind;

    fn deref(&self) -> &Self::Target {
        Self::Target::ref_from_bytes(&self.inner.buf)
            .expect("We have previously checked that the payload is valid")
    }
}

impl<Kind> DerefMut for Packet<Kind>
where
    Kind: CheckedPayload + ?Sized,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        Self::Target::mut_from_bytes(&mut self.inner.buf)
            .expect("We have previously checked that the payload is valid")
    }
}

impl<Kind: Debug> Debug for Packet<Kind>
where
    Kind: CheckedPayload + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Packet").field(&self.deref()).finish()
    }
}
