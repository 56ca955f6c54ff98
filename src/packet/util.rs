// Copyright (c) 2025 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

/// Assert, at compile time, that `T` is exactly `expected` bytes large.
///
/// Used to pin down the wire size of zerocopy packet structs.
pub(crate) const fn size_must_be<T>(expected: usize) -> usize {
    assert!(size_of::<T>() == expected);
    expected
}
