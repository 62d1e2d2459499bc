//! Variable-fanout radix tree (an adaptive radix tree, ART): the form the
//! production cache index prefers (spec §4.A). Nodes grow 4 -> 16 -> 48 ->
//! 256-way as children are added, and shrink back down on removal.
//!
//! Unlike [`super::simple::SimpleRadixTree`], deletion here fully compacts:
//! an internal node that becomes childless and value-less is unlinked from
//! its parent, and the unlink recurses upward — this is the resolution of
//! the Open Question in spec §9 about the simple tree's FIXME.

use super::{PrefixIndex, Value};

enum Children {
    Node4(Vec<(u8, Box<Node>)>),
    Node16(Vec<(u8, Box<Node>)>),
    Node48(Box<[Option<Box<Node>>; 256]>),
}

impl Children {
    fn new() -> Self {
        Children::Node4(Vec::new())
    }

    fn len(&self) -> usize {
        match self {
            Children::Node4(v) | Children::Node16(v) => v.len(),
            Children::Node48(arr) => arr.iter().filter(|c| c.is_some()).count(),
        }
    }

    fn get(&self, byte: u8) -> Option<&Node> {
        match self {
            Children::Node4(v) | Children::Node16(v) => {
                v.iter().find(|(b, _)| *b == byte).map(|(_, n)| n.as_ref())
            }
            Children::Node48(arr) => arr[byte as usize].as_deref(),
        }
    }

    fn get_mut(&mut self, byte: u8) -> Option<&mut Node> {
        match self {
            Children::Node4(v) | Children::Node16(v) => v
                .iter_mut()
                .find(|(b, _)| *b == byte)
                .map(|(_, n)| n.as_mut()),
            Children::Node48(arr) => arr[byte as usize].as_deref_mut(),
        }
    }

    fn remove(&mut self, byte: u8) {
        match self {
            Children::Node4(v) | Children::Node16(v) => v.retain(|(b, _)| *b != byte),
            Children::Node48(arr) => arr[byte as usize] = None,
        }
    }

    fn insert(&mut self, byte: u8, node: Box<Node>) {
        match self {
            Children::Node4(v) => {
                if let Some(slot) = v.iter_mut().find(|(b, _)| *b == byte) {
                    slot.1 = node;
                    return;
                }
                if v.len() < 4 {
                    v.push((byte, node));
                    return;
                }
                let mut grown: Vec<(u8, Box<Node>)> = std::mem::take(v);
                grown.push((byte, node));
                *self = Children::Node16(grown);
            }
            Children::Node16(v) => {
                if let Some(slot) = v.iter_mut().find(|(b, _)| *b == byte) {
                    slot.1 = node;
                    return;
                }
                if v.len() < 16 {
                    v.push((byte, node));
                    return;
                }
                let grown: Vec<(u8, Box<Node>)> = std::mem::take(v);
                let mut arr: Box<[Option<Box<Node>>; 256]> =
                    Box::new(std::array::from_fn(|_| None));
                for (b, n) in grown {
                    arr[b as usize] = Some(n);
                }
                arr[byte as usize] = Some(node);
                *self = Children::Node48(arr);
            }
            Children::Node48(arr) => {
                arr[byte as usize] = Some(node);
            }
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (u8, &Node)> + '_> {
        match self {
            Children::Node4(v) | Children::Node16(v) => {
                Box::new(v.iter().map(|(b, n)| (*b, n.as_ref())))
            }
            Children::Node48(arr) => Box::new(
                arr.iter()
                    .enumerate()
                    .filter_map(|(b, n)| n.as_deref().map(|n| (b as u8, n))),
            ),
        }
    }

    fn sorted_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.iter().map(|(b, _)| b).collect();
        bytes.sort_unstable();
        bytes
    }
}

struct Node {
    value: Option<Value>,
    children: Children,
}

impl Node {
    fn new() -> Self {
        Node {
            value: None,
            children: Children::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.len() == 0
    }
}

pub struct AdaptiveRadixTree {
    root: Node,
    nr_entries: usize,
}

impl Default for AdaptiveRadixTree {
    fn default() -> Self {
        AdaptiveRadixTree {
            root: Node::new(),
            nr_entries: 0,
        }
    }
}

impl AdaptiveRadixTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn count_subtree(node: &Node) -> usize {
        let mut c = if node.value.is_some() { 1 } else { 0 };
        for (_, child) in node.children.iter() {
            c += Self::count_subtree(child);
        }
        c
    }

    /// Walks down `key`, creating intermediate nodes as needed, and returns
    /// the node at the end of the path.
    fn insert_path<'a>(node: &'a mut Node, key: &[u8]) -> &'a mut Node {
        let mut cur = node;
        for &byte in key {
            if cur.children.get(byte).is_none() {
                cur.children.insert(byte, Box::new(Node::new()));
            }
            cur = cur.children.get_mut(byte).unwrap();
        }
        cur
    }

    fn lookup_path<'a>(node: &'a Node, key: &[u8]) -> Option<&'a Node> {
        let mut cur = node;
        for &byte in key {
            cur = cur.children.get(byte)?;
        }
        Some(cur)
    }

    /// Removes `key`, compacting every now-empty node back up the path to
    /// (not including) `node`. Returns whether a value was actually removed.
    fn remove_path(node: &mut Node, key: &[u8]) -> bool {
        if key.is_empty() {
            return node.value.take().is_some();
        }
        let byte = key[0];
        let Some(child) = node.children.get_mut(byte) else {
            return false;
        };
        let removed = Self::remove_path(child, &key[1..]);
        if removed && child.is_empty() {
            node.children.remove(byte);
        }
        removed
    }

    fn iterate_node(
        node: &Node,
        prefix: &mut Vec<u8>,
        visit: &mut dyn FnMut(&[u8], Value) -> bool,
    ) -> bool {
        if let Some(v) = node.value {
            if !visit(prefix, v) {
                return false;
            }
        }
        for byte in node.children.sorted_bytes() {
            let child = node.children.get(byte).unwrap();
            prefix.push(byte);
            let keep_going = Self::iterate_node(child, prefix, visit);
            prefix.pop();
            if !keep_going {
                return false;
            }
        }
        true
    }
}

impl PrefixIndex for AdaptiveRadixTree {
    fn insert(&mut self, key: &[u8], value: Value) {
        let node = Self::insert_path(&mut self.root, key);
        if node.value.is_none() {
            self.nr_entries += 1;
        }
        node.value = Some(value);
    }

    fn lookup(&self, key: &[u8]) -> Option<Value> {
        Self::lookup_path(&self.root, key).and_then(|n| n.value)
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        let removed = Self::remove_path(&mut self.root, key);
        if removed {
            self.nr_entries -= 1;
        }
        removed
    }

    fn remove_prefix(&mut self, prefix: &[u8]) -> usize {
        if prefix.is_empty() {
            let n = self.nr_entries;
            self.root = Node::new();
            self.nr_entries = 0;
            return n;
        }
        // Walk down all but the last byte, removing the final child
        // wholesale (and compacting back up), the same way `remove_path`
        // compacts a single-key removal.
        fn remove_last<'a>(node: &'a mut Node, key: &[u8]) -> usize {
            if key.len() == 1 {
                let Some(child) = node.children.get(key[0]) else {
                    return 0;
                };
                let count = AdaptiveRadixTree::count_subtree(child);
                node.children.remove(key[0]);
                return count;
            }
            let byte = key[0];
            let Some(child) = node.children.get_mut(byte) else {
                return 0;
            };
            let count = remove_last(child, &key[1..]);
            if count > 0 && child.is_empty() {
                node.children.remove(byte);
            }
            count
        }
        let removed = remove_last(&mut self.root, prefix);
        self.nr_entries -= removed;
        removed
    }

    fn iterate(&self, prefix: &[u8], visit: &mut dyn FnMut(&[u8], Value) -> bool) {
        let Some(node) = Self::lookup_path(&self.root, prefix) else {
            return;
        };
        let mut buf = prefix.to_vec();
        Self::iterate_node(node, &mut buf, visit);
    }

    fn size(&self) -> usize {
        self.nr_entries
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract_tests;
    use super::*;

    #[test]
    fn satisfies_prefix_index_contract() {
        contract_tests::run::<AdaptiveRadixTree>();
    }

    #[test]
    fn grows_through_fanout_tiers() {
        let mut t = AdaptiveRadixTree::new();
        for b in 0u8..=255 {
            t.insert(&[b], Value::Int(b as u64));
        }
        assert_eq!(t.size(), 256);
        for b in 0u8..=255 {
            assert_eq!(t.lookup(&[b]), Some(Value::Int(b as u64)));
        }
    }

    #[test]
    fn compacts_internal_nodes_on_delete() {
        let mut t = AdaptiveRadixTree::new();
        t.insert(b"device-id", Value::Int(1));
        assert!(t.root.children.len() > 0);
        assert!(t.remove(b"device-id"));
        assert_eq!(t.size(), 0);
        assert_eq!(
            t.root.children.len(),
            0,
            "stub nodes must not survive deletion"
        );
    }
}
