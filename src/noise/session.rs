// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
//
// Modified by Mullvad VPN.
// Copyright (c) 2025 Mullvad VPN.
//
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use ring::aead::{Aad, CHACHA20_POLY1305, LessSafeKey, Nonce, UnboundKey};
use zerocopy::FromBytes;

use crate::noise::errors::NoiseError;
use crate::noise::handshake::KeypairMaterial;
use crate::noise::timers::{
    REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME,
};
use crate::packet::{CnData, CnDataHeader, Packet};

/// A bidirectional transport keypair derived from a completed handshake.
///
/// Carries the sending nonce counter, the receive-side replay window, and the
/// session indices. A keypair is usable for sending only until
/// [`REJECT_AFTER_TIME`] after creation or [`REJECT_AFTER_MESSAGES`] sent
/// messages; receiving continues until the peer stops using it.
pub struct Keypair {
    local_index: u32,
    remote_index: u32,
    sender: LessSafeKey,
    receiver: LessSafeKey,
    sending_counter: AtomicU64,
    receiving_counter: Mutex<ReceivingCounterValidator>,
    created: Instant,
    is_initiator: bool,
    expired: AtomicBool,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Keypair: {}<- ->{}",
            self.local_index, self.remote_index
        )
    }
}

// Receiving window constants
const WORD_SIZE: u64 = 64;
const N_WORDS: u64 = 16; // Suffices to reorder 64*16 = 1024 packets
const N_BITS: u64 = WORD_SIZE * N_WORDS;

/// In order to reject replays while allowing for some reordering of packets,
/// we keep a bitmap of received counters alongside the highest counter seen.
#[derive(Debug, Clone, Default)]
struct ReceivingCounterValidator {
    /// The counter one past the highest received so far.
    next: u64,
    /// Used to estimate packet loss
    receive_cnt: u64,
    bitmap: [u64; N_WORDS as usize],
}

impl ReceivingCounterValidator {
    #[inline(always)]
    fn set_bit(&mut self, idx: u64) {
        let bit_idx = idx % N_BITS;
        let word = (bit_idx / WORD_SIZE) as usize;
        let bit = (bit_idx % WORD_SIZE) as usize;
        self.bitmap[word] |= 1 << bit;
    }

    #[inline(always)]
    fn clear_bit(&mut self, idx: u64) {
        let bit_idx = idx % N_BITS;
        let word = (bit_idx / WORD_SIZE) as usize;
        let bit = (bit_idx % WORD_SIZE) as usize;
        self.bitmap[word] &= !(1u64 << bit);
    }

    /// Clear the word that contains idx
    #[inline(always)]
    fn clear_word(&mut self, idx: u64) {
        let bit_idx = idx % N_BITS;
        let word = (bit_idx / WORD_SIZE) as usize;
        self.bitmap[word] = 0;
    }

    /// Returns true if bit is set, false otherwise
    #[inline(always)]
    fn check_bit(&self, idx: u64) -> bool {
        let bit_idx = idx % N_BITS;
        let word = (bit_idx / WORD_SIZE) as usize;
        let bit = (bit_idx % WORD_SIZE) as usize;
        ((self.bitmap[word] >> bit) & 1) == 1
    }

    /// Returns Ok if the counter was not yet received, and is not too far back
    #[inline(always)]
    fn will_accept(&self, counter: u64) -> Result<(), NoiseError> {
        if counter >= self.next {
            // As long as the counter is growing no replay took place for sure
            return Ok(());
        }
        if counter + N_BITS < self.next {
            // Drop if too far back
            return Err(NoiseError::InvalidCounter);
        }
        if self.check_bit(counter) {
            Err(NoiseError::DuplicateCounter)
        } else {
            Ok(())
        }
    }

    /// Marks the counter as received, rejecting it if it was seen before or
    /// fell out of the window.
    #[inline(always)]
    fn mark_did_receive(&mut self, counter: u64) -> Result<(), NoiseError> {
        if counter + N_BITS < self.next {
            // Drop if too far back
            return Err(NoiseError::InvalidCounter);
        }
        if counter == self.next {
            // Usually the packets arrive in order, in that case we simply mark the bit and
            // increment the counter
            self.set_bit(counter);
            self.next += 1;
            return Ok(());
        }
        if counter < self.next {
            // A packet arrived out of order, check if it is valid, and mark
            if self.check_bit(counter) {
                return Err(NoiseError::InvalidCounter);
            }
            self.set_bit(counter);
            return Ok(());
        }
        // Packets were dropped, or maybe reordered, skip them and mark unused
        if counter - self.next >= N_BITS {
            // Too far ahead, clear all the bits
            for c in self.bitmap.iter_mut() {
                *c = 0;
            }
        } else {
            let mut i = self.next;
            while !i.is_multiple_of(WORD_SIZE) && i < counter {
                // Clear until i aligned to word size
                self.clear_bit(i);
                i += 1;
            }
            while i + WORD_SIZE < counter {
                // Clear whole word at a time
                self.clear_word(i);
                i = (i + WORD_SIZE) & 0u64.wrapping_sub(WORD_SIZE);
            }
            while i < counter {
                // Clear any remaining bits
                self.clear_bit(i);
                i += 1;
            }
        }
        self.set_bit(counter);
        self.next = counter + 1;
        Ok(())
    }
}

impl Keypair {
    pub fn new(material: KeypairMaterial) -> Keypair {
        let KeypairMaterial {
            local_index,
            remote_index,
            sending_key,
            receiving_key,
            is_initiator,
        } = material;
        Keypair {
            local_index,
            remote_index,
            sender: LessSafeKey::new(
                UnboundKey::new(&CHACHA20_POLY1305, &sending_key)
                    .expect("transport keys are 32 bytes"),
            ),
            receiver: LessSafeKey::new(
                UnboundKey::new(&CHACHA20_POLY1305, &receiving_key)
                    .expect("transport keys are 32 bytes"),
            ),
            sending_counter: AtomicU64::new(0),
            receiving_counter: Mutex::new(Default::default()),
            created: Instant::now(),
            is_initiator,
            expired: AtomicBool::new(false),
        }
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Mark this keypair as no longer usable for sending.
    ///
    /// Receiving remains possible until the keypair is dropped.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::Relaxed);
    }

    /// Whether a call to [`Self::next_sending_nonce`] could currently succeed.
    pub fn usable_for_sending(&self) -> bool {
        !self.expired.load(Ordering::Relaxed)
            && self.created.elapsed() < REJECT_AFTER_TIME
            && self.sending_counter.load(Ordering::Relaxed) < REJECT_AFTER_MESSAGES
    }

    /// Whether the sender should negotiate a fresh keypair soon.
    pub fn should_rekey(&self) -> bool {
        self.sending_counter.load(Ordering::Relaxed) >= REKEY_AFTER_MESSAGES
            || (self.is_initiator && self.created.elapsed() >= REKEY_AFTER_TIME)
    }

    /// Reserve the next sending nonce.
    ///
    /// Returns `None` once the keypair must no longer be used for sending.
    pub fn next_sending_nonce(&self) -> Option<u64> {
        if self.expired.load(Ordering::Relaxed) || self.created.elapsed() >= REJECT_AFTER_TIME {
            return None;
        }
        let nonce = self.sending_counter.fetch_add(1, Ordering::Relaxed);
        (nonce < REJECT_AFTER_MESSAGES).then_some(nonce)
    }

    /// Returns Ok if the receiving counter is good to use
    fn receiving_counter_quick_check(&self, counter: u64) -> Result<(), NoiseError> {
        let counter_validator = self.receiving_counter.lock();
        counter_validator.will_accept(counter)
    }

    /// Returns Ok if the receiving counter is good to use, and marks it as used
    fn receiving_counter_mark(&self, counter: u64) -> Result<(), NoiseError> {
        let mut counter_validator = self.receiving_counter.lock();
        let ret = counter_validator.mark_did_receive(counter);
        if ret.is_ok() {
            counter_validator.receive_cnt += 1;
        }
        ret
    }

    /// Seal `packet` into a [`CnData`] under the reserved `nonce`.
    ///
    /// `packet_type` is the active transport tag of the emitting device.
    pub fn seal(&self, nonce: u64, packet: Packet, packet_type: u32) -> Packet<CnData> {
        let len = CnData::OVERHEAD + packet.len();

        let mut buf = Packet::from_bytes(BytesMut::zeroed(len));

        let data = CnData::mut_from_bytes(buf.buf_mut())
            .expect("buffer size is at least CnData::OVERHEAD");

        data.header.packet_type = packet_type.into();
        data.header.receiver_idx = self.remote_index.into();
        data.header.counter = nonce.into();

        let mut aead_nonce = [0u8; 12];
        aead_nonce[4..12].copy_from_slice(&nonce.to_le_bytes());
        data.encrypted_encapsulated_packet_mut()
            .copy_from_slice(&packet);
        let tag = self
            .sender
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(aead_nonce),
                Aad::empty(),
                data.encrypted_encapsulated_packet_mut(),
            )
            .expect("encryption must succeed");
        data.tag_mut().copy_from_slice(tag.as_ref());

        buf.cast::<CnData>()
    }

    /// Open `packet` and return the decrypted payload.
    ///
    /// The payload of a keepalive is empty.
    pub fn open(&self, mut packet: Packet<CnData>) -> Result<Packet, NoiseError> {
        if packet.header.receiver_idx.get() != self.local_index {
            return Err(NoiseError::WrongIndex);
        }

        let counter = packet.header.counter.get();

        // In case this is a replay attack we want to reject the counter before
        // running the expensive decryption.
        self.receiving_counter_quick_check(counter)?;

        let mut aead_nonce = [0u8; 12];
        aead_nonce[4..12].copy_from_slice(&counter.to_le_bytes());

        // decrypt the data in-place
        let decrypted_len = self
            .receiver
            .open_in_place(
                Nonce::assume_unique_for_key(aead_nonce),
                Aad::empty(),
                &mut packet.encrypted_encapsulated_packet_and_tag,
            )
            .map_err(|_| NoiseError::InvalidAeadTag)?
            .len();

        // shift the packet buffer slice onto the decrypted data
        let mut packet = packet.into_bytes();
        let buf = packet.buf_mut();
        buf.advance(CnDataHeader::LEN);
        buf.truncate(decrypted_len);

        // After decryption is done, check the counter again, and mark it as received
        self.receiving_counter_mark(counter)?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TYPE_DATA;
    use zerocopy::IntoBytes;

    #[test]
    fn test_replay_counter() {
        let mut c: ReceivingCounterValidator = Default::default();

        assert!(c.mark_did_receive(0).is_ok());
        assert!(c.mark_did_receive(0).is_err());
        assert!(c.mark_did_receive(1).is_ok());
        assert!(c.mark_did_receive(1).is_err());
        assert!(c.mark_did_receive(63).is_ok());
        assert!(c.mark_did_receive(63).is_err());
        assert!(c.mark_did_receive(15).is_ok());
        assert!(c.mark_did_receive(15).is_err());

        for i in 64..N_BITS + 128 {
            assert!(c.mark_did_receive(i).is_ok());
            assert!(c.mark_did_receive(i).is_err());
        }

        assert!(c.mark_did_receive(N_BITS * 3).is_ok());
        for i in 0..=N_BITS * 2 {
            assert!(matches!(c.will_accept(i), Err(NoiseError::InvalidCounter)));
            assert!(c.mark_did_receive(i).is_err());
        }
        for i in N_BITS * 2 + 1..N_BITS * 3 {
            assert!(c.will_accept(i).is_ok());
        }
        assert!(matches!(
            c.will_accept(N_BITS * 3),
            Err(NoiseError::DuplicateCounter)
        ));

        for i in (N_BITS * 2 + 1..N_BITS * 3).rev() {
            assert!(c.mark_did_receive(i).is_ok());
            assert!(c.mark_did_receive(i).is_err());
        }

        assert!(c.mark_did_receive(N_BITS * 3 + 70).is_ok());
        assert!(c.mark_did_receive(N_BITS * 3 + 71).is_ok());
        assert!(c.mark_did_receive(N_BITS * 3 + 72).is_ok());
        assert!(c.mark_did_receive(N_BITS * 3 + 72 + 125).is_ok());
        assert!(c.mark_did_receive(N_BITS * 3 + 63).is_ok());

        assert!(c.mark_did_receive(N_BITS * 3 + 70).is_err());
        assert!(c.mark_did_receive(N_BITS * 3 + 71).is_err());
        assert!(c.mark_did_receive(N_BITS * 3 + 72).is_err());
    }

    fn keypair_pair() -> (Keypair, Keypair) {
        let a = KeypairMaterial {
            local_index: 1,
            remote_index: 2,
            sending_key: [0x11; 32],
            receiving_key: [0x22; 32],
            is_initiator: true,
        };
        let b = KeypairMaterial {
            local_index: 2,
            remote_index: 1,
            sending_key: [0x22; 32],
            receiving_key: [0x11; 32],
            is_initiator: false,
        };
        (Keypair::new(a), Keypair::new(b))
    }

    /// A sealed packet opens on the other side, and replaying it fails.
    #[test]
    fn seal_open_and_replay() {
        let (a, b) = keypair_pair();

        let nonce = a.next_sending_nonce().unwrap();
        assert_eq!(nonce, 0);

        let plaintext = b"hello over the tunnel";
        let sealed = a.seal(nonce, Packet::copy_from(plaintext), TYPE_DATA);
        assert_eq!(sealed.header.packet_type.get(), TYPE_DATA);
        assert_eq!(sealed.header.receiver_idx.get(), 2);

        let replay = Packet::copy_from(sealed.as_bytes()).try_into_cn(&Default::default());
        let opened = b.open(sealed).unwrap();
        assert_eq!(&*opened, &plaintext[..]);

        // An exact replay of the same datagram is rejected by the window.
        let Ok(crate::packet::CnKind::Data(replay)) = replay else {
            panic!("sealed packet must classify as data");
        };
        assert_eq!(b.open(replay).err(), Some(NoiseError::DuplicateCounter));
    }

    /// Keepalives are data packets with an empty payload.
    #[test]
    fn keepalive_is_empty() {
        let (a, b) = keypair_pair();
        let nonce = a.next_sending_nonce().unwrap();
        let sealed = a.seal(nonce, Packet::default(), TYPE_DATA);
        assert!(sealed.is_keepalive());
        let opened = b.open(sealed).unwrap();
        assert!(opened.is_empty());
    }

    /// An expired keypair refuses to hand out sending nonces.
    #[test]
    fn expiry_blocks_sending() {
        let (a, _) = keypair_pair();
        assert!(a.usable_for_sending());
        a.expire();
        assert!(!a.usable_for_sending());
        assert_eq!(a.next_sending_nonce(), None);
    }
}
