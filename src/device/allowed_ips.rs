// Copyright (c) 2026 Mullvad VPN AB. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};

/// A bitwise radix tree mapping IP prefixes to some data `D`.
///
/// `find` returns the data attached to the deepest (longest) prefix matching
/// the address. IPv4 and IPv6 live in separate trees.
///
/// Mutation happens under the peer-registry write lock; lookups under its
/// read lock. The values are non-owning from the registry's point of view:
/// removing a peer must remove every prefix referencing it first, see
/// [`AllowedIps::remove`].
pub struct AllowedIps<D> {
    v4: Option<Box<Node<D>>>,
    v6: Option<Box<Node<D>>>,
}

/// One node of the path-compressed trie.
///
/// `bits` holds the full prefix from the root, left-aligned in a `u128` and
/// masked to `len` bits. IPv4 addresses occupy the top 32 bits.
struct Node<D> {
    bits: u128,
    len: u8,
    value: Option<D>,
    children: [Option<Box<Node<D>>>; 2],
}

/// Left-align an address into the `u128` key space, with its maximum prefix
/// length.
fn key_of(addr: IpAddr) -> (u128, u8) {
    match addr {
        IpAddr::V4(a) => ((u32::from(a) as u128) << 96, 32),
        IpAddr::V6(a) => (u128::from(a), 128),
    }
}

/// The top-`len` bit mask.
fn mask(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(len))
    }
}

fn bit_at(key: u128, idx: u8) -> usize {
    ((key >> (127 - u32::from(idx))) & 1) as usize
}

/// Length of the longest common prefix of `a` and `b`, capped at `max`.
fn common_len(a: u128, b: u128, max: u8) -> u8 {
    ((a ^ b).leading_zeros() as u8).min(max)
}

impl<D> Node<D> {
    fn leaf(bits: u128, len: u8, value: D) -> Box<Self> {
        Box::new(Node {
            bits,
            len,
            value: Some(value),
            children: [None, None],
        })
    }
}

impl<D> Default for AllowedIps<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> AllowedIps<D> {
    pub fn new() -> Self {
        Self { v4: None, v6: None }
    }

    pub fn clear(&mut self) {
        self.v4 = None;
        self.v6 = None;
    }

    /// Attach `value` to the exact `addr/cidr` node, splitting as required.
    ///
    /// An existing value on the same prefix is replaced.
    pub fn insert(&mut self, addr: IpAddr, cidr: u8, value: D) {
        let (key, max_len) = key_of(addr);
        let cidr = cidr.min(max_len);
        let key = key & mask(cidr);
        let root = match addr {
            IpAddr::V4(_) => &mut self.v4,
            IpAddr::V6(_) => &mut self.v6,
        };
        insert_node(root, key, cidr, value);
    }

    /// Find the value attached to the deepest prefix containing `addr`.
    pub fn find(&self, addr: IpAddr) -> Option<&D> {
        let (key, max_len) = key_of(addr);
        let mut cursor = match addr {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };

        let mut best = None;
        while let Some(node) = cursor {
            if (key ^ node.bits) & mask(node.len) != 0 {
                break;
            }
            if node.value.is_some() {
                best = node.value.as_ref();
            }
            if node.len >= max_len {
                break;
            }
            cursor = &node.children[bit_at(key, node.len)];
        }
        best
    }

    /// Detach every value for which `predicate` returns true, pruning the
    /// tree afterwards.
    pub fn remove(&mut self, predicate: &impl Fn(&D) -> bool) {
        prune_node(&mut self.v4, predicate);
        prune_node(&mut self.v6, predicate);
    }

    /// Every `(network, value)` pair in the tree, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (IpNetwork, &D)> {
        let mut entries = Vec::new();
        collect_node(&self.v4, true, &mut entries);
        collect_node(&self.v6, false, &mut entries);
        entries.into_iter()
    }
}

fn insert_node<D>(slot: &mut Option<Box<Node<D>>>, key: u128, len: u8, value: D) {
    let Some(node) = slot else {
        *slot = Some(Node::leaf(key, len, value));
        return;
    };

    let common = common_len(node.bits, key, node.len.min(len));
    if common == node.len && common == len {
        // exact node
        node.value = Some(value);
    } else if common == node.len {
        // the new prefix extends below this node
        insert_node(&mut node.children[bit_at(key, node.len)], key, len, value);
    } else if common == len {
        // the new prefix is an ancestor of this node
        let old = slot.take().expect("slot is occupied");
        let old_bit = bit_at(old.bits, len);
        let mut new = Node::leaf(key, len, value);
        new.children[old_bit] = Some(old);
        *slot = Some(new);
    } else {
        // diverge: split at the common prefix
        let old = slot.take().expect("slot is occupied");
        let old_bit = bit_at(old.bits, common);
        let mut mid = Box::new(Node {
            bits: key & mask(common),
            len: common,
            value: None,
            children: [None, None],
        });
        mid.children[old_bit] = Some(old);
        mid.children[bit_at(key, common)] = Some(Node::leaf(key, len, value));
        *slot = Some(mid);
    }
}

fn prune_node<D>(slot: &mut Option<Box<Node<D>>>, predicate: &impl Fn(&D) -> bool) {
    let Some(node) = slot else { return };

    if node.value.as_ref().is_some_and(predicate) {
        node.value = None;
    }
    prune_node(&mut node.children[0], predicate);
    prune_node(&mut node.children[1], predicate);

    if node.value.is_none() {
        let occupied = node.children.iter().filter(|c| c.is_some()).count();
        if occupied == 0 {
            *slot = None;
        } else if occupied == 1 {
            let child = node
                .children
                .iter_mut()
                .find_map(|c| c.take())
                .expect("exactly one child is occupied");
            *slot = Some(child);
        }
    }
}

fn collect_node<'a, D>(
    slot: &'a Option<Box<Node<D>>>,
    is_v4: bool,
    out: &mut Vec<(IpNetwork, &'a D)>,
) {
    let Some(node) = slot else { return };

    if let Some(value) = &node.value {
        let network = if is_v4 {
            Ipv4Network::new(Ipv4Addr::from((node.bits >> 96) as u32), node.len)
                .map(IpNetwork::V4)
        } else {
            Ipv6Network::new(Ipv6Addr::from(node.bits), node.len).map(IpNetwork::V6)
        };
        if let Ok(network) = network {
            out.push((network, value));
        }
    }
    collect_node(&node.children[0], is_v4, out);
    collect_node(&node.children[1], is_v4, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let mut trie = AllowedIps::new();
        trie.insert(ip("10.0.0.0"), 8, "wide");
        trie.insert(ip("10.1.0.0"), 16, "narrow");
        trie.insert(ip("10.1.2.0"), 24, "narrowest");

        assert_eq!(trie.find(ip("10.200.1.1")), Some(&"wide"));
        assert_eq!(trie.find(ip("10.1.200.1")), Some(&"narrow"));
        assert_eq!(trie.find(ip("10.1.2.3")), Some(&"narrowest"));
        assert_eq!(trie.find(ip("11.0.0.1")), None);
    }

    #[test]
    fn zero_length_prefix_matches_everything() {
        let mut trie = AllowedIps::new();
        trie.insert(ip("0.0.0.0"), 0, "default");
        assert_eq!(trie.find(ip("8.8.8.8")), Some(&"default"));
        assert_eq!(trie.find(ip("255.255.255.255")), Some(&"default"));
        // but not the other family
        assert_eq!(trie.find(ip("::1")), None);
    }

    #[test]
    fn exact_host_routes() {
        let mut trie = AllowedIps::new();
        trie.insert(ip("192.168.1.7"), 32, 7);
        trie.insert(ip("192.168.1.8"), 32, 8);

        assert_eq!(trie.find(ip("192.168.1.7")), Some(&7));
        assert_eq!(trie.find(ip("192.168.1.8")), Some(&8));
        assert_eq!(trie.find(ip("192.168.1.9")), None);
    }

    #[test]
    fn ipv6_prefixes() {
        let mut trie = AllowedIps::new();
        trie.insert(ip("fd00::"), 8, "ula");
        trie.insert(ip("fd00:1234::"), 32, "site");

        assert_eq!(trie.find(ip("fdff::1")), Some(&"ula"));
        assert_eq!(trie.find(ip("fd00:1234::42")), Some(&"site"));
        assert_eq!(trie.find(ip("2001:db8::1")), None);
    }

    #[test]
    fn remove_by_value() {
        let mut trie = AllowedIps::new();
        trie.insert(ip("10.0.0.0"), 24, 1);
        trie.insert(ip("10.0.1.0"), 24, 2);
        trie.insert(ip("10.0.2.0"), 24, 1);
        trie.insert(ip("fc00::"), 7, 1);

        trie.remove(&|v| *v == 1);

        assert_eq!(trie.find(ip("10.0.0.1")), None);
        assert_eq!(trie.find(ip("10.0.1.1")), Some(&2));
        assert_eq!(trie.find(ip("10.0.2.1")), None);
        assert_eq!(trie.find(ip("fc00::1")), None);

        let entries: Vec<_> = trie.iter().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn insert_replaces_same_prefix() {
        let mut trie = AllowedIps::new();
        trie.insert(ip("10.0.0.0"), 24, 1);
        trie.insert(ip("10.0.0.0"), 24, 2);
        assert_eq!(trie.find(ip("10.0.0.1")), Some(&2));
        assert_eq!(trie.iter().count(), 1);
    }

    #[test]
    fn iter_reports_networks() {
        let mut trie = AllowedIps::new();
        trie.insert(ip("10.11.0.0"), 16, "a");
        trie.insert(ip("10.12.0.0"), 16, "b");

        let mut nets: Vec<String> = trie.iter().map(|(net, _)| net.to_string()).collect();
        nets.sort();
        assert_eq!(nets, vec!["10.11.0.0/16", "10.12.0.0/16"]);
    }
}
