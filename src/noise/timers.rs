// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
//
// Modified by Mullvad VPN.
// Copyright (c) 2025 Mullvad VPN.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Protocol timing and message-count limits.
//!
//! See the [whitepaper](https://www.wireguard.com/papers/wireguard.pdf#page=14)
//! for the rationale behind each constant.

use std::time::Duration;

/// An initiator starts a new handshake once its sending keypair is this old.
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// A keypair must never be used for sending once it is this old.
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Handshake retransmission is abandoned after this long.
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// An unanswered handshake initiation is retransmitted after this long.
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// A passive keepalive is sent when we have received a data packet but sent
/// nothing back for this long.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// A received cookie may be used in `mac2` for this long.
pub const COOKIE_EXPIRATION_TIME: Duration = Duration::from_secs(120);

/// Rekey once this many messages have been sent on a keypair.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Never send more than this many messages on a keypair.
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);
