use crate::net::address::{Address, Family};
use crate::net::network::IpNetwork;

type NodeIx = u32;

#[derive(Clone, Default)]
struct Node {
    left: Option<NodeIx>,
    right: Option<NodeIx>,
    value: Option<IpNetwork>,
}

/// Binary radix tree over CIDR networks, supporting longest-prefix-match
/// lookups for IPv4 and IPv6 (one root per family; the family is part of
/// the key and bounds the walk depth at 32 or 128 bits).
///
/// Nodes live in an arena addressed by 32-bit indices, so the tree is
/// cheap to clone for copy-on-write swaps and drops in a single pass.
#[derive(Clone)]
pub struct NetworkTree {
    nodes: Vec<Node>,
    len: usize,
}

const V4_ROOT: usize = 0;
const V6_ROOT: usize = 1;

impl NetworkTree {
    pub fn new() -> Self {
        Self { nodes: vec![Node::default(), Node::default()], len: 0 }
    }

    /// Number of networks stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn root(family: Family) -> Option<usize> {
        match family {
            Family::V4 => Some(V4_ROOT),
            Family::V6 => Some(V6_ROOT),
            Family::Unknown => None,
        }
    }

    /// Inserts a network. Returns false without modifying the tree if the
    /// network is null, has a zero prefix, or is already present (the
    /// caller decides whether a duplicate is an error).
    pub fn insert(&mut self, network: IpNetwork) -> bool {
        if network.is_null() || network.bits() == 0 {
            return false;
        }
        let Some(mut node) = Self::root(network.family()) else {
            return false;
        };

        let bytes = network.address().bytes().to_vec();
        for i in 0..network.bits() {
            let bit = bit_at(&bytes, i);
            let child = if bit { self.nodes[node].right } else { self.nodes[node].left };
            node = match child {
                Some(ix) => ix as usize,
                None => {
                    self.nodes.push(Node::default());
                    let ix = (self.nodes.len() - 1) as NodeIx;
                    if bit {
                        self.nodes[node].right = Some(ix);
                    } else {
                        self.nodes[node].left = Some(ix);
                    }
                    ix as usize
                }
            };
        }

        if self.nodes[node].value.is_some() {
            return false;
        }
        self.nodes[node].value = Some(network);
        self.len += 1;
        true
    }

    /// Longest-prefix match: the narrowest stored network containing the
    /// given key (an exact match wins over any supernet).
    pub fn find(&self, key: &IpNetwork) -> Option<IpNetwork> {
        if key.is_null() || key.bits() == 0 {
            return None;
        }
        let mut node = Self::root(key.family())?;

        let bytes = key.address().bytes();
        let mut best = None;
        for i in 0..key.bits() {
            if let Some(value) = self.nodes[node].value {
                best = Some(value);
            }
            let bit = bit_at(bytes, i);
            let child = if bit { self.nodes[node].right } else { self.nodes[node].left };
            match child {
                Some(ix) => node = ix as usize,
                None => return best,
            }
        }
        if let Some(value) = self.nodes[node].value {
            best = Some(value);
        }
        best
    }

    /// Longest-prefix match for a single address.
    pub fn find_address(&self, address: &Address) -> Option<IpNetwork> {
        self.find(&IpNetwork::host(*address))
    }
}

impl Default for NetworkTree {
    fn default() -> Self {
        Self::new()
    }
}

fn bit_at(bytes: &[u8], i: u8) -> bool {
    let byte = bytes[i as usize / 8];
    (byte >> (7 - i % 8)) & 1 != 0
}
