// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
//
// Modified by Mullvad VPN.
// Copyright (c) 2025 Mullvad VPN.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::handshake::{b2s_hash, b2s_keyed_mac_16, b2s_keyed_mac_16_2, b2s_mac_24};
use crate::noise::handshake::{LABEL_COOKIE, LABEL_MAC1};
use crate::packet::{CnCookieReply, CnHandshakeBase, Packet};

use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use constant_time_eq::constant_time_eq;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const COOKIE_REFRESH: u64 = 128; // Use 128 and not 120 so the compiler can optimize out the division
const COOKIE_SIZE: usize = 16;
const COOKIE_NONCE_SIZE: usize = 24;

/// How often to reset the per-source handshake counters
const RESET_PERIOD: Duration = Duration::from_secs(1);

type Cookie = [u8; COOKIE_SIZE];

struct IpCounts {
    counts: HashMap<IpAddr, u64>,
    last_reset: Instant,
}

/// The outcome of verifying a handshake message under the current load.
pub enum HandshakeVerdict<P: CnHandshakeBase> {
    /// The message passed verification and should be processed.
    Allow(Packet<P>),
    /// The sender must first prove IP ownership; send them this cookie reply.
    SendCookie(CnCookieReply),
    /// The message failed verification or the sender is over its rate.
    Drop,
}

/// There are two places where the protocol requires "randomness" for cookies
/// * The 24 byte nonce in the cookie message - here the only goal is to avoid nonce reuse
/// * A secret value that changes every two minutes
///
/// Because the main goal of the cookie is simply for a party to prove ownership of an IP address
/// we can relax the randomness definition a bit, in order to avoid locking, because using less
/// resources is the main goal of any DoS prevention mechanism.
/// In order to avoid locking and calls to rand we derive pseudo random values using the AEAD and
/// some counters.
pub struct RateLimiter {
    /// The key we use to derive the nonce
    nonce_key: [u8; 32],
    /// The key we use to derive the cookie
    secret_key: [u8; 16],
    start_time: Instant,
    /// A single 64 bit counter (should suffice for many years)
    nonce_ctr: AtomicU64,
    mac1_key: [u8; 32],
    cookie_key: Key,
    limit: u64,
    /// Per-source-IP handshake counts, reset every `RESET_PERIOD`
    ip_counts: Mutex<IpCounts>,
}

impl RateLimiter {
    /// Create a new rate limiter and cookie checker for handshake messages.
    ///
    /// # Arguments
    ///
    /// * `public_key` - The device's public key, used for cookie generation
    /// * `limit` - Maximum number of handshakes allowed per source IP and
    ///   rate limiting period while the device is under load
    pub fn new(public_key: &crate::x25519::PublicKey, limit: u64) -> Self {
        let mut secret_key = [0u8; 16];
        OsRng.fill_bytes(&mut secret_key);
        RateLimiter {
            nonce_key: Self::rand_bytes(),
            secret_key,
            start_time: Instant::now(),
            nonce_ctr: AtomicU64::new(0),
            mac1_key: b2s_hash(LABEL_MAC1, public_key.as_bytes()),
            cookie_key: b2s_hash(LABEL_COOKIE, public_key.as_bytes()).into(),
            limit,
            ip_counts: Mutex::new(IpCounts {
                counts: HashMap::new(),
                last_reset: Instant::now(),
            }),
        }
    }

    fn rand_bytes() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Reset packet counts (ideally should be called with a period of 1 second)
    pub fn try_reset_count(&self) {
        let current_time = Instant::now();
        let mut ip_counts = self.ip_counts.lock();
        if current_time.duration_since(ip_counts.last_reset) >= RESET_PERIOD {
            ip_counts.counts.clear();
            ip_counts.last_reset = current_time;
        }
    }

    /// Release all per-source state. Called during device teardown.
    pub fn close(&self) {
        let mut ip_counts = self.ip_counts.lock();
        ip_counts.counts.clear();
    }

    /// Compute the correct cookie value based on the current secret value and the source IP
    fn current_cookie(&self, addr: IpAddr) -> Cookie {
        let mut addr_bytes = [0u8; 16];

        match addr {
            IpAddr::V4(a) => addr_bytes[..4].copy_from_slice(&a.octets()[..]),
            IpAddr::V6(a) => addr_bytes[..].copy_from_slice(&a.octets()[..]),
        }

        // The current cookie for a given IP is
        // MAC(responder.changing_secret_every_two_minutes, initiator.ip_address).
        // First we derive the secret from the current time; the value of
        // cur_counter changes with it.
        let cur_counter = Instant::now().duration_since(self.start_time).as_secs() / COOKIE_REFRESH;

        b2s_keyed_mac_16_2(&self.secret_key, &cur_counter.to_le_bytes(), &addr_bytes)
    }

    fn nonce(&self) -> [u8; COOKIE_NONCE_SIZE] {
        let ctr = self.nonce_ctr.fetch_add(1, Ordering::Relaxed);

        b2s_mac_24(&self.nonce_key, &ctr.to_le_bytes())
    }

    /// Increment the per-source-IP handshake counter and return whether it exceeds `self.limit`.
    ///
    /// Counters are cleared every `RESET_PERIOD` by [`try_reset_count`](Self::try_reset_count),
    /// so each IP is independently allowed `limit` handshakes per period.
    fn count_exceeded(&self, src_addr: IpAddr) -> bool {
        let mut ip_counts = self.ip_counts.lock();
        let count = ip_counts.counts.entry(src_addr).or_insert(0);
        *count += 1;
        *count > self.limit
    }

    /// Build a cookie reply carrying `cookie`, sealed against `mac1`.
    ///
    /// `packet_type` is the active cookie-reply tag of the device.
    pub(crate) fn format_cookie_reply(
        &self,
        idx: u32,
        cookie: Cookie,
        mac1: &[u8],
        packet_type: u32,
    ) -> CnCookieReply {
        let mut reply = CnCookieReply::new(packet_type);

        reply.receiver_idx = idx.into();
        reply.nonce = self.nonce();

        let cipher = XChaCha20Poly1305::new(&self.cookie_key);

        let (ct, tag_out) = reply.encrypted_cookie.split_at_mut(COOKIE_SIZE);
        ct.copy_from_slice(&cookie);
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&reply.nonce), mac1, ct)
            .expect("cookie reply is large enough");
        tag_out.copy_from_slice(&tag);

        reply
    }

    /// Verify the MAC fields on a handshake message, applying the cookie
    /// mechanism and per-source rate limiting while `under_load`.
    ///
    /// `cookie_reply_tag` is the active cookie-reply tag used when a proof of
    /// IP ownership must be requested.
    pub fn verify_handshake<P: CnHandshakeBase>(
        &self,
        src_addr: IpAddr,
        handshake: Packet<P>,
        under_load: bool,
        cookie_reply_tag: u32,
    ) -> HandshakeVerdict<P> {
        let computed_mac1 = b2s_keyed_mac_16(&self.mac1_key, handshake.until_mac1());
        if !constant_time_eq(&computed_mac1, handshake.mac1()) {
            return HandshakeVerdict::Drop;
        }

        if !under_load {
            return HandshakeVerdict::Allow(handshake);
        }

        let cookie = self.current_cookie(src_addr);
        let computed_mac2 = b2s_keyed_mac_16(&cookie, handshake.until_mac2());

        if !constant_time_eq(&computed_mac2, handshake.mac2()) {
            let reply = self.format_cookie_reply(
                handshake.sender_idx(),
                cookie,
                handshake.mac1(),
                cookie_reply_tag,
            );
            return HandshakeVerdict::SendCookie(reply);
        }

        // mac2 is valid; the sender proved IP ownership, but is still
        // subject to the per-source rate.
        if self.count_exceeded(src_addr) {
            return HandshakeVerdict::Drop;
        }

        HandshakeVerdict::Allow(handshake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::Handshake;
    use crate::packet::{CnHandshakeInit, TYPE_COOKIE_REPLY, TYPE_HANDSHAKE_INIT};
    use crate::x25519;

    fn valid_initiation(
        responder_public: &x25519::PublicKey,
    ) -> (Handshake, Packet<CnHandshakeInit>) {
        let initiator_key = x25519::StaticSecret::random_from_rng(OsRng);
        let mut initiator = Handshake::new(initiator_key, *responder_public, None);
        let init = initiator.format_initiation(7, TYPE_HANDSHAKE_INIT);
        let packet = Packet::copy_from(zerocopy::IntoBytes::as_bytes(&init))
            .try_into_cn(&Default::default());
        let crate::packet::CnKind::HandshakeInit(packet) = packet.unwrap() else {
            panic!("must classify as initiation");
        };
        (initiator, packet)
    }

    #[test]
    fn mac1_is_required() {
        let responder_key = x25519::StaticSecret::random_from_rng(OsRng);
        let responder_public = x25519::PublicKey::from(&responder_key);
        let limiter = RateLimiter::new(&responder_public, 10);
        let src = IpAddr::from([192, 0, 2, 1]);

        let (_, packet) = valid_initiation(&responder_public);
        assert!(matches!(
            limiter.verify_handshake(src, packet, false, TYPE_COOKIE_REPLY),
            HandshakeVerdict::Allow(_)
        ));

        let (_, mut packet) = valid_initiation(&responder_public);
        packet.mac1[0] ^= 0xff;
        assert!(matches!(
            limiter.verify_handshake(src, packet, false, TYPE_COOKIE_REPLY),
            HandshakeVerdict::Drop
        ));
    }

    /// Under load, an initiation without mac2 gets a cookie reply; after the
    /// initiator consumes it, its next initiation passes.
    #[test]
    fn cookie_round_trip_under_load() {
        let responder_key = x25519::StaticSecret::random_from_rng(OsRng);
        let responder_public = x25519::PublicKey::from(&responder_key);
        let limiter = RateLimiter::new(&responder_public, 10);
        let src = IpAddr::from([192, 0, 2, 2]);

        let (mut initiator, packet) = valid_initiation(&responder_public);

        let reply = match limiter.verify_handshake(src, packet, true, TYPE_COOKIE_REPLY) {
            HandshakeVerdict::SendCookie(reply) => reply,
            _ => panic!("must demand a cookie while under load"),
        };
        assert_eq!(reply.packet_type.get(), TYPE_COOKIE_REPLY);
        assert_eq!(reply.receiver_idx.get(), 7);

        initiator.consume_cookie_reply(&reply).unwrap();

        // The retried initiation now carries a valid mac2.
        let retry = initiator.format_initiation(7, TYPE_HANDSHAKE_INIT);
        assert_ne!(retry.mac2, [0u8; 16]);
        let retry = Packet::copy_from(zerocopy::IntoBytes::as_bytes(&retry))
            .try_into_cn(&Default::default());
        let crate::packet::CnKind::HandshakeInit(retry) = retry.unwrap() else {
            panic!("must classify as initiation");
        };
        assert!(matches!(
            limiter.verify_handshake(src, retry, true, TYPE_COOKIE_REPLY),
            HandshakeVerdict::Allow(_)
        ));
    }

    /// Even with valid cookies, a source is limited to `limit` handshakes
    /// per reset period while under load.
    #[test]
    fn per_source_rate_is_enforced() {
        let responder_key = x25519::StaticSecret::random_from_rng(OsRng);
        let responder_public = x25519::PublicKey::from(&responder_key);
        let limiter = RateLimiter::new(&responder_public, 2);
        let src = IpAddr::from([192, 0, 2, 3]);

        let (mut initiator, first) = valid_initiation(&responder_public);
        let reply = match limiter.verify_handshake(src, first, true, TYPE_COOKIE_REPLY) {
            HandshakeVerdict::SendCookie(reply) => reply,
            _ => panic!("must demand a cookie while under load"),
        };
        initiator.consume_cookie_reply(&reply).unwrap();

        let mut verdicts = vec![];
        for _ in 0..4 {
            let init = initiator.format_initiation(7, TYPE_HANDSHAKE_INIT);
            let packet = Packet::copy_from(zerocopy::IntoBytes::as_bytes(&init))
                .try_into_cn(&Default::default());
            let crate::packet::CnKind::HandshakeInit(packet) = packet.unwrap() else {
                panic!("must classify as initiation");
            };
            verdicts.push(limiter.verify_handshake(src, packet, true, TYPE_COOKIE_REPLY));
        }

        assert!(matches!(verdicts[0], HandshakeVerdict::Allow(_)));
        assert!(matches!(verdicts[1], HandshakeVerdict::Allow(_)));
        assert!(matches!(verdicts[2], HandshakeVerdict::Drop));
        assert!(matches!(verdicts[3], HandshakeVerdict::Drop));
    }
}
