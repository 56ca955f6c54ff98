// Copyright (c) 2026 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng, TryRngCore};

/// A table of unique session indices.
///
/// All peers of a device share a single `IndexTable` to ensure no two live
/// handshakes or keypairs use the same index. Indices are random `u32`s and
/// are freed automatically when the returned [`Index`] guard is dropped,
/// which is the proof of non-use that index recycling requires.
pub struct IndexTable<V>(Arc<Mutex<Inner<V>>>);

struct Inner<V> {
    rng: StdRng,
    entries: HashMap<u32, V>,
}

impl<V> Clone for IndexTable<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// An allocated session index that is automatically freed from its
/// [`IndexTable`] on drop.
pub struct Index<V> {
    value: u32,
    table: IndexTable<V>,
}

impl<V> Index<V> {
    /// The raw `u32` index value.
    pub fn value(&self) -> u32 {
        self.value
    }
}

impl<V> Drop for Index<V> {
    fn drop(&mut self) {
        self.table.free_index(self.value);
    }
}

impl<V> std::fmt::Debug for Index<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

impl<V> std::fmt::Display for Index<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

impl<V: Clone> IndexTable<V> {
    /// Create a new [`IndexTable`] using the given seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        IndexTable(Arc::new(Mutex::new(Inner {
            rng: StdRng::from_seed(seed),
            entries: HashMap::new(),
        })))
    }

    /// Create a new [`IndexTable`] seeded using [`OsRng`].
    pub fn from_os_rng() -> Self {
        let mut seed = [0u8; 32];
        // `StdRng::from_os_rng` also unwraps, so we can trust that this won't fail
        OsRng.try_fill_bytes(&mut seed).expect("os rng is available");
        Self::from_seed(seed)
    }

    /// Reserve a random `u32` not already in the table and map it to `entry`.
    ///
    /// The returned [`Index`] keeps the slot reserved; dropping it frees both
    /// the slot and the entry.
    pub fn register(&self, entry: V) -> Index<V> {
        let mut g = self.0.lock();
        // Find a free index by guessing. See the rationale here:
        // https://github.com/torvalds/linux/blob/e81dd54f62c753dd423d1a9b62481a1c599fb975/drivers/net/wireguard/peerlookup.c#L95-L117
        // Even if the table contained 2^31 entries, you'd usually only need 1-2 attempts.
        loop {
            let idx = g.rng.next_u32();
            if let std::collections::hash_map::Entry::Vacant(slot) = g.entries.entry(idx) {
                slot.insert(entry);
                return Index {
                    value: idx,
                    table: self.clone(),
                };
            }
        }
    }

    /// Replace the entry behind a reserved index.
    ///
    /// Used when a handshake-in-progress index becomes a keypair index.
    pub fn update(&self, index: &Index<V>, entry: V) {
        let mut g = self.0.lock();
        g.entries.insert(index.value, entry);
    }

    /// Look up the entry behind an index.
    pub fn get(&self, index: u32) -> Option<V> {
        let g = self.0.lock();
        g.entries.get(&index).cloned()
    }
}

impl<V> IndexTable<V> {
    /// Remove an index from the table, making it available for reuse.
    fn free_index(&self, index: u32) {
        let mut g = self.0.lock();
        g.entries.remove(&index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Indices are unique while reserved and recycled only after the guard
    /// is dropped.
    #[test]
    fn unique_until_dropped() {
        let table: IndexTable<&'static str> = IndexTable::from_seed([42u8; 32]);

        let a = table.register("a");
        let b = table.register("b");
        assert_ne!(a.value(), b.value());

        assert_eq!(table.get(a.value()), Some("a"));
        assert_eq!(table.get(b.value()), Some("b"));

        let a_value = a.value();
        drop(a);
        assert_eq!(table.get(a_value), None);
        assert_eq!(table.get(b.value()), Some("b"));
    }

    #[test]
    fn update_replaces_entry() {
        let table: IndexTable<u8> = IndexTable::from_seed([1u8; 32]);
        let idx = table.register(1);
        table.update(&idx, 2);
        assert_eq!(table.get(idx.value()), Some(2));
    }
}
