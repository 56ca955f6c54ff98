// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

#![deny(clippy::unwrap_used)]
use std::fmt::{self, Debug};
use std::mem::offset_of;
use std::ops::Deref;

use eyre::{bail, eyre};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned, little_endian};

use crate::packet::util::size_must_be;
use crate::packet::{CheckedPayload, Packet};

/// The four canonical message type tags.
///
/// With the obfuscation layer active these are replaced by user-chosen values
/// greater than `4`; the active set lives on the device, never in a global.
pub const TYPE_HANDSHAKE_INIT: u32 = 1;
pub const TYPE_HANDSHAKE_RESP: u32 = 2;
pub const TYPE_COOKIE_REPLY: u32 = 3;
pub const TYPE_DATA: u32 = 4;

/// The set of message type tags a device currently speaks.
///
/// Defaults to the canonical `1`/`2`/`3`/`4`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CnTypeTags {
    pub init: u32,
    pub response: u32,
    pub cookie_reply: u32,
    pub transport: u32,
}

impl Default for CnTypeTags {
    fn default() -> Self {
        Self {
            init: TYPE_HANDSHAKE_INIT,
            response: TYPE_HANDSHAKE_RESP,
            cookie_reply: TYPE_COOKIE_REPLY,
            transport: TYPE_DATA,
        }
    }
}

/// An owned tunnel [`Packet`] whose message type is known. See [`Packet::try_into_cn`].
pub enum CnKind {
    /// An owned [`CnHandshakeInit`] packet.
    HandshakeInit(Packet<CnHandshakeInit>),

    /// An owned [`CnHandshakeResp`] packet.
    HandshakeResp(Packet<CnHandshakeResp>),

    /// An owned [`CnCookieReply`] packet.
    CookieReply(Packet<CnCookieReply>),

    /// An owned [`CnData`] packet.
    Data(Packet<CnData>),
}

impl Debug for CnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeInit(_) => f.debug_tuple("HandshakeInit").finish(),
            Self::HandshakeResp(_) => f.debug_tuple("HandshakeResp").finish(),
            Self::CookieReply(_) => f.debug_tuple("CookieReply").finish(),
            Self::Data(_) => f.debug_tuple("Data").finish(),
        }
    }
}

impl From<CnKind> for Packet {
    fn from(kind: CnKind) -> Self {
        match kind {
            CnKind::HandshakeInit(packet) => packet.into_bytes(),
            CnKind::HandshakeResp(packet) => packet.into_bytes(),
            CnKind::CookieReply(packet) => packet.into_bytes(),
            CnKind::Data(packet) => packet.into_bytes(),
        }
    }
}

/// Header of [`CnData`].
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C)]
pub struct CnDataHeader {
    /// 4-byte little-endian message type tag.
    // INVARIANT: must be the transport tag of the emitting device
    pub packet_type: little_endian::U32,

    /// The receiver's session index.
    pub receiver_idx: little_endian::U32,

    /// The AEAD nonce counter.
    pub counter: little_endian::U64,
}

impl CnDataHeader {
    /// Header length
    pub const LEN: usize = size_must_be::<Self>(16);
}

/// Transport data packet.
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C, packed)]
pub struct CnData {
    /// Data packet header.
    pub header: CnDataHeader,

    /// Data packet payload and trailing AEAD tag.
    pub encrypted_encapsulated_packet_and_tag: CnDataAndTag,
}

/// Transport data payload with a trailing tag.
///
/// This is essentially a byte slice that is at least [`CnData::TAG_LEN`] long.
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C)]
pub struct CnDataAndTag {
    // Don't access these fields directly. The tag is actually at the end of the struct.
    _tag_size: [u8; CnData::TAG_LEN],
    _extra: [u8],
}

impl CnData {
    /// Data packet overhead: header and tag.
    pub const OVERHEAD: usize = CnDataHeader::LEN + CnData::TAG_LEN;

    /// Length of the trailing AEAD tag, in bytes.
    pub const TAG_LEN: usize = 16;

    /// Strip the tag from the encapsulated packet.
    fn split_encapsulated_packet_and_tag(&mut self) -> (&mut [u8], &mut [u8; CnData::TAG_LEN]) {
        self.encrypted_encapsulated_packet_and_tag
            .split_last_chunk_mut::<{ CnData::TAG_LEN }>()
            .expect("CnDataAndTag is at least TAG_LEN bytes long")
    }

    /// Get a mutable reference to the encapsulated packet, without the trailing tag.
    pub fn encrypted_encapsulated_packet_mut(&mut self) -> &mut [u8] {
        let (encrypted_encapsulated_packet, _) = self.split_encapsulated_packet_and_tag();
        encrypted_encapsulated_packet
    }

    /// Get a mutable reference to the tag of the encapsulated packet.
    pub fn tag_mut(&mut self) -> &mut [u8; CnData::TAG_LEN] {
        let (_, tag) = self.split_encapsulated_packet_and_tag();
        tag
    }

    /// Returns true if the payload is empty.
    pub const fn is_empty(&self) -> bool {
        self.encrypted_encapsulated_packet_and_tag._extra.is_empty()
    }

    /// [`Self::is_empty`]. Keepalive packets are just data packets with no payload.
    pub const fn is_keepalive(&self) -> bool {
        self.is_empty()
    }
}

impl Deref for CnDataAndTag {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl std::ops::DerefMut for CnDataAndTag {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_bytes()
    }
}

/// Trait for fields common to both [`CnHandshakeInit`] and [`CnHandshakeResp`].
pub trait CnHandshakeBase:
    FromBytes + IntoBytes + KnownLayout + Unaligned + Immutable + CheckedPayload
{
    /// Length of the handshake packet, in bytes.
    const LEN: usize;

    /// Offset of the `mac1` field.
    /// This is used for getting a byte slice up until `mac1`, i.e. `&packet[..MAC1_OFF]`.
    const MAC1_OFF: usize;

    /// Offset of the `mac2` field.
    /// This is used for getting a byte slice up until `mac2`, i.e. `&packet[..MAC2_OFF]`.
    const MAC2_OFF: usize;

    /// Get `sender_idx`.
    fn sender_idx(&self) -> u32;

    /// Get a mutable reference to `mac1`.
    fn mac1_mut(&mut self) -> &mut [u8; 16];

    /// Get a mutable reference to `mac2`.
    fn mac2_mut(&mut self) -> &mut [u8; 16];

    /// Get `mac1`.
    fn mac1(&self) -> &[u8; 16];

    /// Get `mac2`.
    fn mac2(&self) -> &[u8; 16];

    /// Get packet until MAC1. Precisely equivalent to `packet[0..offsetof(packet.mac1)]`.
    #[inline(always)]
    fn until_mac1(&self) -> &[u8] {
        &self.as_bytes()[..Self::MAC1_OFF]
    }

    /// Get packet until MAC2. Precisely equivalent to `packet[0..offsetof(packet.mac2)]`.
    #[inline(always)]
    fn until_mac2(&self) -> &[u8] {
        &self.as_bytes()[..Self::MAC2_OFF]
    }
}

/// Handshake initiation packet.
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C, packed)]
pub struct CnHandshakeInit {
    /// 4-byte little-endian message type tag.
    pub packet_type: little_endian::U32,

    /// The initiator's session index.
    pub sender_idx: little_endian::U32,

    /// The initiator's ephemeral public key, in the clear.
    pub unencrypted_ephemeral: [u8; 32],

    /// The initiator's static public key, sealed.
    pub encrypted_static: [u8; 48],

    /// TAI64N timestamp, sealed. Protects against initiation replay.
    pub encrypted_timestamp: [u8; 28],

    /// Keyed MAC over the packet up to this field.
    pub mac1: [u8; 16],

    /// Cookie MAC, set when replying to a cookie challenge.
    pub mac2: [u8; 16],
}

impl CnHandshakeInit {
    /// Length of the packet, in bytes.
    pub const LEN: usize = size_must_be::<Self>(148);

    /// Construct a [`CnHandshakeInit`] where all fields except `packet_type` are zeroed.
    pub fn new(packet_type: u32) -> Self {
        Self {
            packet_type: packet_type.into(),
            ..CnHandshakeInit::new_zeroed()
        }
    }
}

impl CnHandshakeBase for CnHandshakeInit {
    const LEN: usize = Self::LEN;
    const MAC1_OFF: usize = offset_of!(Self, mac1);
    const MAC2_OFF: usize = offset_of!(Self, mac2);

    fn sender_idx(&self) -> u32 {
        self.sender_idx.get()
    }

    fn mac1_mut(&mut self) -> &mut [u8; 16] {
        &mut self.mac1
    }

    fn mac2_mut(&mut self) -> &mut [u8; 16] {
        &mut self.mac2
    }

    fn mac1(&self) -> &[u8; 16] {
        &self.mac1
    }

    fn mac2(&self) -> &[u8; 16] {
        &self.mac2
    }
}

/// Handshake response packet.
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C, packed)]
pub struct CnHandshakeResp {
    /// 4-byte little-endian message type tag.
    pub packet_type: little_endian::U32,

    /// The responder's session index.
    pub sender_idx: little_endian::U32,

    /// The initiator's session index, echoed back.
    pub receiver_idx: little_endian::U32,

    /// The responder's ephemeral public key, in the clear.
    pub unencrypted_ephemeral: [u8; 32],

    /// Zero-length plaintext, sealed. Confirms the chaining key.
    pub encrypted_nothing: [u8; 16],

    /// Keyed MAC over the packet up to this field.
    pub mac1: [u8; 16],

    /// Cookie MAC, set when replying to a cookie challenge.
    pub mac2: [u8; 16],
}

impl CnHandshakeResp {
    /// Length of the packet, in bytes.
    pub const LEN: usize = size_must_be::<Self>(92);

    /// Construct a [`CnHandshakeResp`] where all fields except `packet_type` are zeroed.
    pub fn new(packet_type: u32) -> Self {
        Self {
            packet_type: packet_type.into(),
            ..CnHandshakeResp::new_zeroed()
        }
    }
}

impl CnHandshakeBase for CnHandshakeResp {
    const LEN: usize = Self::LEN;
    const MAC1_OFF: usize = offset_of!(Self, mac1);
    const MAC2_OFF: usize = offset_of!(Self, mac2);

    fn sender_idx(&self) -> u32 {
        self.sender_idx.get()
    }

    fn mac1_mut(&mut self) -> &mut [u8; 16] {
        &mut self.mac1
    }

    fn mac2_mut(&mut self) -> &mut [u8; 16] {
        &mut self.mac2
    }

    fn mac1(&self) -> &[u8; 16] {
        &self.mac1
    }

    fn mac2(&self) -> &[u8; 16] {
        &self.mac2
    }
}

/// Cookie reply packet.
#[derive(FromBytes, IntoBytes, KnownLayout, Unaligned, Immutable)]
#[repr(C, packed)]
pub struct CnCookieReply {
    /// 4-byte little-endian message type tag.
    pub packet_type: little_endian::U32,

    /// The session index of the handshake being challenged.
    pub receiver_idx: little_endian::U32,

    /// XChaCha20-Poly1305 nonce for the sealed cookie.
    pub nonce: [u8; 24],

    /// The cookie, sealed with the peer's cookie key.
    pub encrypted_cookie: [u8; 32],
}

impl CnCookieReply {
    /// Length of the packet, in bytes.
    pub const LEN: usize = size_must_be::<Self>(64);

    /// Construct a [`CnCookieReply`] where all fields except `packet_type` are zeroed.
    pub fn new(packet_type: u32) -> Self {
        Self {
            packet_type: packet_type.into(),
            ..Self::new_zeroed()
        }
    }
}

impl Packet {
    /// Try to classify this packet by its leading 4-byte tag, sanity-checking
    /// packet sizes against the wire format.
    ///
    /// `tags` is the set of tags the receiving device currently speaks; with
    /// obfuscation off this is the canonical `1`/`2`/`3`/`4`.
    pub fn try_into_cn(self, tags: &CnTypeTags) -> eyre::Result<CnKind> {
        let bytes = self.buf();
        let Some(tag) = bytes.first_chunk::<4>().map(|b| u32::from_le_bytes(*b)) else {
            bail!("Not a tunnel packet, too small.");
        };

        let len = bytes.len();
        if tag == tags.init && len == CnHandshakeInit::LEN {
            Ok(CnKind::HandshakeInit(self.cast()))
        } else if tag == tags.response && len == CnHandshakeResp::LEN {
            Ok(CnKind::HandshakeResp(self.cast()))
        } else if tag == tags.cookie_reply && len == CnCookieReply::LEN {
            Ok(CnKind::CookieReply(self.cast()))
        } else if tag == tags.transport && len >= CnData::OVERHEAD {
            Ok(CnKind::Data(self.cast()))
        } else {
            Err(eyre!("Not a tunnel packet, bad type/size."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_canonical_tags() {
        let tags = CnTypeTags::default();

        let init = Packet::copy_from(CnHandshakeInit::new(TYPE_HANDSHAKE_INIT).as_bytes());
        assert!(matches!(
            init.try_into_cn(&tags),
            Ok(CnKind::HandshakeInit(_))
        ));

        let resp = Packet::copy_from(CnHandshakeResp::new(TYPE_HANDSHAKE_RESP).as_bytes());
        assert!(matches!(
            resp.try_into_cn(&tags),
            Ok(CnKind::HandshakeResp(_))
        ));

        let cookie = Packet::copy_from(CnCookieReply::new(TYPE_COOKIE_REPLY).as_bytes());
        assert!(matches!(cookie.try_into_cn(&tags), Ok(CnKind::CookieReply(_))));

        let mut data = vec![0u8; CnData::OVERHEAD + 11];
        data[..4].copy_from_slice(&TYPE_DATA.to_le_bytes());
        let data = Packet::copy_from(&data);
        assert!(matches!(data.try_into_cn(&tags), Ok(CnKind::Data(_))));
    }

    #[test]
    fn classify_rejects_bad_size_and_tag() {
        let tags = CnTypeTags::default();

        // A handshake-sized packet with an unknown tag.
        let mut bytes = vec![0u8; CnHandshakeInit::LEN];
        bytes[..4].copy_from_slice(&0x7fff_ffffu32.to_le_bytes());
        assert!(Packet::copy_from(&bytes).try_into_cn(&tags).is_err());

        // A truncated initiation.
        let mut bytes = vec![0u8; CnHandshakeInit::LEN - 1];
        bytes[..4].copy_from_slice(&TYPE_HANDSHAKE_INIT.to_le_bytes());
        assert!(Packet::copy_from(&bytes).try_into_cn(&tags).is_err());

        // Remapped tags are honored.
        let remapped = CnTypeTags {
            init: 5,
            response: 6,
            cookie_reply: 7,
            transport: 8,
        };
        let init = Packet::copy_from(CnHandshakeInit::new(5).as_bytes());
        assert!(matches!(
            init.try_into_cn(&remapped),
            Ok(CnKind::HandshakeInit(_))
        ));
        let old_init = Packet::copy_from(CnHandshakeInit::new(TYPE_HANDSHAKE_INIT).as_bytes());
        assert!(old_init.try_into_cn(&remapped).is_err());
    }
}
