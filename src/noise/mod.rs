// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
//
// Modified by Mullvad VPN.
// Copyright (c) 2025 Mullvad VPN.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The Noise_IKpsk2 protocol layer: handshakes, transport keypairs, cookies.
//!
//! The [`device`](crate::device) pipeline drives these types; nothing in this
//! module does I/O or owns a task.

pub mod errors;
pub mod handshake;
pub mod index_table;
pub mod rate_limiter;
pub mod session;
pub mod timers;

pub use errors::NoiseError;
pub use handshake::{Handshake, KeypairMaterial, parse_handshake_anon};
pub use index_table::{Index, IndexTable};
pub use rate_limiter::{HandshakeVerdict, RateLimiter};
pub use session::Keypair;
