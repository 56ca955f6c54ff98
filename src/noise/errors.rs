// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

/// Errors that can occur during protocol operations.
///
/// These are per-packet failures. The pipeline counts and logs them; they
/// never propagate out of a worker.
#[derive(Debug, PartialEq, Eq)]
pub enum NoiseError {
    /// Received a packet that was not expected in the current state.
    UnexpectedPacket,
    /// The session index in the packet is invalid or not recognized.
    WrongIndex,
    /// The cryptographic key used is incorrect or invalid.
    WrongKey,
    /// The TAI64N timestamp is not newer than the last one seen (replay).
    WrongTai64nTimestamp,
    /// The MAC (Message Authentication Code) verification failed.
    InvalidMac,
    /// The AEAD authentication tag verification failed.
    InvalidAeadTag,
    /// The packet counter is invalid.
    InvalidCounter,
    /// Received a packet with a duplicate counter (replay attack prevention).
    DuplicateCounter,
    /// The packet format or content is invalid.
    InvalidPacket,
    /// No usable transport session exists for this operation.
    NoCurrentSession,
    /// The session has passed its usable lifetime.
    Expired,
}

impl std::fmt::Display for NoiseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for NoiseError {}
