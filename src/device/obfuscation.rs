// Copyright (c) 2026 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The "advanced security" obfuscation layer.
//!
//! When active, the four protocol message tags are remapped to user-chosen
//! values and handshake frames are padded with random junk, so receivers
//! classify datagrams by wire length instead of by tag. The active mapping is
//! held per device; nothing here is process-global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use rand_core::{OsRng, RngCore};
use std::sync::Arc;

use crate::device::{Error, MAX_SEGMENT_SIZE};
use crate::packet::{
    CnCookieReply, CnData, CnHandshakeInit, CnHandshakeResp, CnKind, CnTypeTags, Packet,
};

/// Obfuscation parameters, as delivered by the configuration interface.
///
/// All-zero (the [`Default`]) means obfuscation off: canonical tags, no junk.
/// Magic header values of `4` or less select the canonical tag for that slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObfuscationConfig {
    /// Number of junk datagrams sent ahead of a handshake initiation.
    pub junk_packet_count: i32,
    /// Minimum size of a junk datagram.
    pub junk_packet_min_size: usize,
    /// Maximum size of a junk datagram.
    pub junk_packet_max_size: usize,
    /// Random prefix length prepended to handshake initiations.
    pub init_packet_junk_size: usize,
    /// Random prefix length prepended to handshake responses.
    pub response_packet_junk_size: usize,
    /// Replacement tag for handshake initiations.
    pub init_packet_magic_header: u32,
    /// Replacement tag for handshake responses.
    pub response_packet_magic_header: u32,
    /// Replacement tag for cookie replies.
    pub underload_packet_magic_header: u32,
    /// Replacement tag for transport packets.
    pub transport_packet_magic_header: u32,
}

/// The active dispatch tables derived from a validated [`ObfuscationConfig`].
///
/// Swapped atomically by [`Obfuscator::handle_post_config`]; the pipeline
/// takes an [`Arc`] snapshot per datagram.
pub(crate) struct TypeTables {
    pub tags: CnTypeTags,

    /// Exact wire size to active tag, for the fixed-size message types.
    pub size_to_type: HashMap<usize, u32>,
    /// Active tag to leading junk length to strip before parsing.
    pub junk_by_type: HashMap<u32, usize>,

    pub junk_packet_count: u32,
    pub junk_packet_min_size: usize,
    pub junk_packet_max_size: usize,
    pub init_packet_junk_size: usize,
    pub response_packet_junk_size: usize,
}

impl TypeTables {
    fn with_tags_and_junk(tags: CnTypeTags, init_junk: usize, response_junk: usize) -> Self {
        TypeTables {
            tags,
            size_to_type: HashMap::from([
                (CnHandshakeInit::LEN + init_junk, tags.init),
                (CnHandshakeResp::LEN + response_junk, tags.response),
                (CnCookieReply::LEN, tags.cookie_reply),
                (CnData::OVERHEAD, tags.transport),
            ]),
            junk_by_type: HashMap::from([
                (tags.init, init_junk),
                (tags.response, response_junk),
                (tags.cookie_reply, 0),
                (tags.transport, 0),
            ]),
            junk_packet_count: 0,
            junk_packet_min_size: 0,
            junk_packet_max_size: 0,
            init_packet_junk_size: init_junk,
            response_packet_junk_size: response_junk,
        }
    }
}

impl Default for TypeTables {
    fn default() -> Self {
        Self::with_tags_and_junk(CnTypeTags::default(), 0, 0)
    }
}

/// Per-device obfuscation state: the "advanced security on" flag plus the
/// active dispatch tables.
pub(crate) struct Obfuscator {
    enabled: AtomicBool,
    tables: RwLock<Arc<TypeTables>>,
}

impl Default for Obfuscator {
    fn default() -> Self {
        Self::new()
    }
}

impl Obfuscator {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            tables: RwLock::new(Arc::new(TypeTables::default())),
        }
    }

    /// Whether any non-default obfuscation parameter is installed.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Snapshot of the active dispatch tables.
    pub fn tables(&self) -> Arc<TypeTables> {
        Arc::clone(&self.tables.read())
    }

    /// Validate `conf` and, only if every check passes, atomically install
    /// the derived dispatch tables.
    ///
    /// Validation faults accumulate; the returned `ConfigInvalid` names all
    /// of them, and the live tables remain untouched on any failure.
    pub fn handle_post_config(&self, conf: &ObfuscationConfig) -> Result<(), Error> {
        let mut errs: Vec<String> = vec![];

        if conf.junk_packet_count < 0 {
            errs.push("JunkPacketCount should be non negative".into());
        }

        let junk_min = conf.junk_packet_min_size;
        let mut junk_max = conf.junk_packet_max_size;
        // Equal bounds with junk packets enabled would make every junk packet
        // the same size, which defeats the point.
        if conf.junk_packet_count > 0 && junk_max == junk_min {
            junk_max += 1;
        }

        if junk_max >= MAX_SEGMENT_SIZE {
            errs.push(format!(
                "JunkPacketMaxSize: {junk_max}; should be smaller than maxSegmentSize: {MAX_SEGMENT_SIZE}"
            ));
        } else if junk_max < junk_min {
            errs.push(format!(
                "maxSize: {junk_max}; should be greater than minSize: {junk_min}"
            ));
        }

        if CnHandshakeInit::LEN + conf.init_packet_junk_size >= MAX_SEGMENT_SIZE {
            errs.push(format!(
                "init size({}) + junkSize: {}; should be smaller than maxSegmentSize: {MAX_SEGMENT_SIZE}",
                CnHandshakeInit::LEN,
                conf.init_packet_junk_size,
            ));
        }
        if CnHandshakeResp::LEN + conf.response_packet_junk_size >= MAX_SEGMENT_SIZE {
            errs.push(format!(
                "response size({}) + junkSize: {}; should be smaller than maxSegmentSize: {MAX_SEGMENT_SIZE}",
                CnHandshakeResp::LEN,
                conf.response_packet_junk_size,
            ));
        }

        // Values of 4 or less fall back to the canonical tag for their slot.
        let defaults = CnTypeTags::default();
        let resolve = |v: u32, canonical: u32| if v > 4 { v } else { canonical };
        let tags = CnTypeTags {
            init: resolve(conf.init_packet_magic_header, defaults.init),
            response: resolve(conf.response_packet_magic_header, defaults.response),
            cookie_reply: resolve(conf.underload_packet_magic_header, defaults.cookie_reply),
            transport: resolve(conf.transport_packet_magic_header, defaults.transport),
        };

        // Distinctness is checked after defaulting, so a custom value that
        // collides with another slot's fallback is rejected too.
        let distinct: std::collections::HashSet<u32> =
            [tags.init, tags.response, tags.cookie_reply, tags.transport]
                .into_iter()
                .collect();
        if distinct.len() != 4 {
            errs.push(format!(
                "magic headers should differ; got: init:{}; recv:{}; unde:{}; tran:{}",
                tags.init, tags.response, tags.cookie_reply, tags.transport,
            ));
        }

        let new_init_size = CnHandshakeInit::LEN + conf.init_packet_junk_size;
        let new_response_size = CnHandshakeResp::LEN + conf.response_packet_junk_size;
        if new_init_size == new_response_size {
            errs.push(format!(
                "new init size: {new_init_size}; and new response size: {new_response_size}; should differ"
            ));
        }

        if !errs.is_empty() {
            return Err(Error::ConfigInvalid(errs.join("; ")));
        }

        // Everything validated; only now may the live tables change.
        let mut tables = TypeTables::with_tags_and_junk(
            tags,
            conf.init_packet_junk_size,
            conf.response_packet_junk_size,
        );
        tables.junk_packet_count = conf.junk_packet_count as u32;
        tables.junk_packet_min_size = junk_min;
        tables.junk_packet_max_size = junk_max;

        let non_default = conf.junk_packet_count != 0
            || conf.junk_packet_min_size != 0
            || conf.junk_packet_max_size != 0
            || conf.init_packet_junk_size != 0
            || conf.response_packet_junk_size != 0
            || conf.init_packet_magic_header > 4
            || conf.response_packet_magic_header > 4
            || conf.underload_packet_magic_header > 4
            || conf.transport_packet_magic_header > 4;

        *self.tables.write() = Arc::new(tables);
        self.enabled.store(non_default, Ordering::Relaxed);

        Ok(())
    }

    /// Classify an incoming datagram against the active tables.
    ///
    /// With obfuscation off, classification is by leading tag. With it on,
    /// fixed-size message types are recognized by exact wire length (junk
    /// included), the junk prefix is stripped, and anything else is tried as
    /// a transport packet.
    pub fn classify(&self, mut packet: Packet) -> Option<CnKind> {
        let tables = self.tables();

        if !self.is_enabled() {
            return packet.try_into_cn(&tables.tags).ok();
        }

        if let Some(tag) = tables.size_to_type.get(&packet.len()) {
            let junk = tables.junk_by_type.get(tag).copied().unwrap_or(0);
            if junk > 0 {
                bytes::Buf::advance(packet.buf_mut(), junk);
            }
            return packet.try_into_cn(&tables.tags).ok();
        }

        // Transport packets have variable size and no junk prefix.
        match packet.try_into_cn(&tables.tags) {
            Ok(kind @ CnKind::Data(_)) => Some(kind),
            _ => None,
        }
    }
}

/// Copy `msg` into a fresh buffer behind `junk` random bytes.
pub(crate) fn prepend_junk(msg: &[u8], junk: usize) -> Packet {
    let mut buf = BytesMut::with_capacity(junk + msg.len());
    if junk > 0 {
        let mut padding = vec![0u8; junk];
        OsRng.fill_bytes(&mut padding);
        buf.put_slice(&padding);
    }
    buf.put_slice(msg);
    Packet::from_bytes(buf)
}

/// A random-length, random-content junk datagram in `[min, max)`.
pub(crate) fn random_junk_packet(min: usize, max: usize) -> Packet {
    let size = if max > min {
        rand::random_range(min..max)
    } else {
        min
    };
    let mut buf = vec![0u8; size.max(1)];
    OsRng.fill_bytes(&mut buf);
    Packet::copy_from(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn remapped_conf() -> ObfuscationConfig {
        ObfuscationConfig {
            init_packet_magic_header: 5,
            response_packet_magic_header: 6,
            underload_packet_magic_header: 7,
            transport_packet_magic_header: 8,
            init_packet_junk_size: 16,
            response_packet_junk_size: 16,
            ..Default::default()
        }
    }

    #[test]
    fn default_is_off() {
        let obfuscator = Obfuscator::new();
        assert!(!obfuscator.is_enabled());
        assert_eq!(obfuscator.tables().tags, CnTypeTags::default());
    }

    #[test]
    fn valid_config_installs_tables() {
        let obfuscator = Obfuscator::new();
        obfuscator.handle_post_config(&remapped_conf()).unwrap();

        assert!(obfuscator.is_enabled());
        let tables = obfuscator.tables();
        assert_eq!(
            tables.tags,
            CnTypeTags {
                init: 5,
                response: 6,
                cookie_reply: 7,
                transport: 8
            }
        );
        assert_eq!(
            tables.size_to_type.get(&(CnHandshakeInit::LEN + 16)),
            Some(&5)
        );
        assert_eq!(tables.junk_by_type.get(&5), Some(&16));
        assert_eq!(tables.junk_by_type.get(&8), Some(&0));
    }

    #[test]
    fn duplicate_magic_headers_rejected_and_tables_retained() {
        let obfuscator = Obfuscator::new();
        obfuscator.handle_post_config(&remapped_conf()).unwrap();

        // transport duplicates init
        let bad = ObfuscationConfig {
            transport_packet_magic_header: 5,
            ..remapped_conf()
        };
        let err = obfuscator.handle_post_config(&bad).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));

        // previous config is still live
        assert_eq!(obfuscator.tables().tags.transport, 8);
    }

    /// Distinctness is checked after defaulting, so a fully-default config is
    /// fine but two custom values colliding is not.
    #[test]
    fn collision_checked_after_defaulting() {
        let obfuscator = Obfuscator::new();

        // All four fall back to the canonical 1/2/3/4.
        obfuscator
            .handle_post_config(&ObfuscationConfig::default())
            .unwrap();
        assert!(!obfuscator.is_enabled());

        let mut conf = remapped_conf();
        conf.underload_packet_magic_header = conf.response_packet_magic_header;
        assert!(obfuscator.handle_post_config(&conf).is_err());
    }

    #[test]
    fn equal_frame_sizes_rejected() {
        let obfuscator = Obfuscator::new();
        // 148 + 10 == 92 + 66
        let conf = ObfuscationConfig {
            init_packet_junk_size: 10,
            response_packet_junk_size: 66,
            ..Default::default()
        };
        let err = obfuscator.handle_post_config(&conf).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert!(!obfuscator.is_enabled());
    }

    #[test]
    fn junk_bounds_validation() {
        let obfuscator = Obfuscator::new();

        assert!(
            obfuscator
                .handle_post_config(&ObfuscationConfig {
                    junk_packet_count: -1,
                    ..Default::default()
                })
                .is_err()
        );

        assert!(
            obfuscator
                .handle_post_config(&ObfuscationConfig {
                    junk_packet_max_size: MAX_SEGMENT_SIZE,
                    ..Default::default()
                })
                .is_err()
        );

        assert!(
            obfuscator
                .handle_post_config(&ObfuscationConfig {
                    junk_packet_min_size: 64,
                    junk_packet_max_size: 32,
                    ..Default::default()
                })
                .is_err()
        );

        // min == max with junk packets on is adjusted, not rejected
        obfuscator
            .handle_post_config(&ObfuscationConfig {
                junk_packet_count: 3,
                junk_packet_min_size: 40,
                junk_packet_max_size: 40,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(obfuscator.tables().junk_packet_max_size, 41);
    }

    #[test]
    fn classify_by_length_with_junk() {
        let obfuscator = Obfuscator::new();
        obfuscator.handle_post_config(&remapped_conf()).unwrap();

        // An initiation with a 16-byte junk prefix and the remapped tag.
        let init = CnHandshakeInit::new(5);
        let wire = prepend_junk(init.as_bytes(), 16);
        assert_eq!(wire.len(), CnHandshakeInit::LEN + 16);
        assert!(matches!(
            obfuscator.classify(wire),
            Some(CnKind::HandshakeInit(_))
        ));

        // The canonical frame (no junk, old tag) is no longer recognized.
        let plain = Packet::copy_from(CnHandshakeInit::new(1).as_bytes());
        assert!(obfuscator.classify(plain).is_none());

        // Transport packets still classify by tag, at any size.
        let mut data = vec![0u8; CnData::OVERHEAD + 100];
        data[..4].copy_from_slice(&8u32.to_le_bytes());
        assert!(matches!(
            obfuscator.classify(Packet::copy_from(&data)),
            Some(CnKind::Data(_))
        ));
    }
}
