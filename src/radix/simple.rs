//! Reference implementation: nested ternary-split binary trees, a direct
//! translation of `radix-tree-simple.c`. Kept only to validate the adaptive
//! tree against (spec §4.A, §9) — it is not used by the cache.
//!
//! Deliberately NOT patched to compact nodes on delete: the original C
//! carries a `// FIXME: delete parent if this was the last entry` comment at
//! exactly this spot, and this port preserves the same behavior so the two
//! implementations can be told apart in tests. See DESIGN.md for why this is
//! judged a latent bug rather than an intentional trade-off.

use super::{PrefixIndex, Value};

struct Node {
    key: u8,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
    center: Option<Box<Node>>,
    value: Option<Value>,
}

impl Node {
    fn new(key: u8) -> Self {
        Node {
            key,
            left: None,
            right: None,
            center: None,
            value: None,
        }
    }

    fn has_children(&self) -> bool {
        self.left.is_some() || self.center.is_some() || self.right.is_some()
    }
}

#[derive(Default)]
pub struct SimpleRadixTree {
    root: Option<Box<Node>>,
    root_value: Option<Value>,
    nr_entries: usize,
}

impl SimpleRadixTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_at(slot: &mut Option<Box<Node>>, key: &[u8], value: Value) {
        let node = slot.get_or_insert_with(|| Box::new(Node::new(key[0])));
        if key.is_empty() {
            unreachable!("caller guarantees non-empty remaining key on first call");
        }
        if key.len() == 1 {
            if node.key == key[0] {
                node.value = Some(value);
            } else if key[0] < node.key {
                Self::insert_at(&mut node.left, key, value);
            } else {
                Self::insert_at(&mut node.right, key, value);
            }
            return;
        }
        match key[0].cmp(&node.key) {
            std::cmp::Ordering::Less => Self::insert_at(&mut node.left, key, value),
            std::cmp::Ordering::Greater => Self::insert_at(&mut node.right, key, value),
            std::cmp::Ordering::Equal => Self::insert_at(&mut node.center, &key[1..], value),
        }
    }

    /// Like `lookup_slot` but returns a mutable reference to the node whose
    /// own `value`/`center` fields represent the exact `key` match.
    fn find_node_mut<'a>(slot: &'a mut Option<Box<Node>>, key: &[u8]) -> Option<&'a mut Node> {
        let node = slot.as_mut()?;
        if key.is_empty() {
            return Some(node);
        }
        match key[0].cmp(&node.key) {
            std::cmp::Ordering::Less => Self::find_node_mut(&mut node.left, key),
            std::cmp::Ordering::Greater => Self::find_node_mut(&mut node.right, key),
            std::cmp::Ordering::Equal => {
                if key.len() == 1 {
                    Some(node)
                } else {
                    Self::find_node_mut(&mut node.center, &key[1..])
                }
            }
        }
    }

    fn lookup_slot<'a>(slot: &'a Option<Box<Node>>, key: &[u8]) -> Option<&'a Node> {
        let node = slot.as_ref()?;
        if key.is_empty() {
            return Some(node);
        }
        match key[0].cmp(&node.key) {
            std::cmp::Ordering::Less => Self::lookup_slot(&node.left, key),
            std::cmp::Ordering::Greater => Self::lookup_slot(&node.right, key),
            std::cmp::Ordering::Equal => {
                if key.len() == 1 {
                    Some(node)
                } else {
                    Self::lookup_slot(&node.center, &key[1..])
                }
            }
        }
    }

    fn remove_at(slot: &mut Option<Box<Node>>, key: &[u8]) -> bool {
        let Some(node) = slot.as_mut() else {
            return false;
        };
        if key.is_empty() {
            return false;
        }
        if key[0] == node.key && key.len() == 1 {
            if node.value.take().is_some() {
                if !node.has_children() {
                    // The FIXME in the original: we only clear this node's
                    // own slot, never walk back up to prune now-childless
                    // ancestors. Stub nodes accumulate on the path.
                    *slot = None;
                }
                return true;
            }
            return false;
        }
        match key[0].cmp(&node.key) {
            std::cmp::Ordering::Less => Self::remove_at(&mut node.left, key),
            std::cmp::Ordering::Greater => Self::remove_at(&mut node.right, key),
            std::cmp::Ordering::Equal => Self::remove_at(&mut node.center, &key[1..]),
        }
    }

    fn count(node: &Option<Box<Node>>) -> usize {
        let Some(n) = node else { return 0 };
        let mut c = Self::count(&n.left) + Self::count(&n.center) + Self::count(&n.right);
        if n.value.is_some() {
            c += 1;
        }
        c
    }

    fn iterate_node(node: &Node, prefix: &mut Vec<u8>, visit: &mut dyn FnMut(&[u8], Value) -> bool) -> bool {
        if let Some(left) = &node.left {
            if !Self::iterate_node(left, prefix, visit) {
                return false;
            }
        }
        if let Some(v) = node.value {
            prefix.push(node.key);
            let keep_going = visit(prefix, v);
            prefix.pop();
            if !keep_going {
                return false;
            }
        }
        if let Some(center) = &node.center {
            prefix.push(node.key);
            let keep_going = Self::iterate_node(center, prefix, visit);
            prefix.pop();
            if !keep_going {
                return false;
            }
        }
        if let Some(right) = &node.right {
            if !Self::iterate_node(right, prefix, visit) {
                return false;
            }
        }
        true
    }
}

impl PrefixIndex for SimpleRadixTree {
    fn insert(&mut self, key: &[u8], value: Value) {
        if key.is_empty() {
            // Root stores the zero-length key's value directly.
            if self.lookup(key).is_none() {
                self.nr_entries += 1;
            }
            self.root_value = Some(value);
            return;
        }
        let existed = self.lookup(key).is_some();
        Self::insert_at(&mut self.root, key, value);
        if !existed {
            self.nr_entries += 1;
        }
    }

    fn lookup(&self, key: &[u8]) -> Option<Value> {
        if key.is_empty() {
            return self.root_value;
        }
        Self::lookup_slot(&self.root, key).and_then(|n| n.value)
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        if key.is_empty() {
            let had = self.root_value.take().is_some();
            if had {
                self.nr_entries -= 1;
            }
            return had;
        }
        let removed = Self::remove_at(&mut self.root, key);
        if removed {
            self.nr_entries -= 1;
        }
        removed
    }

    fn remove_prefix(&mut self, prefix: &[u8]) -> usize {
        if prefix.is_empty() {
            let n = self.nr_entries;
            self.root = None;
            self.root_value = None;
            self.nr_entries = 0;
            return n;
        }
        let Some(node) = Self::find_node_mut(&mut self.root, prefix) else {
            return 0;
        };
        let mut removed = Self::count(&node.center);
        node.center = None;
        if node.value.take().is_some() {
            removed += 1;
        }
        self.nr_entries -= removed;
        removed
    }

    fn iterate(&self, prefix: &[u8], visit: &mut dyn FnMut(&[u8], Value) -> bool) {
        if prefix.is_empty() {
            if let Some(v) = self.root_value {
                if !visit(b"", v) {
                    return;
                }
            }
            if let Some(root) = &self.root {
                let mut buf = Vec::new();
                Self::iterate_node(root, &mut buf, visit);
            }
            return;
        }
        let Some(node) = Self::lookup_slot(&self.root, prefix) else {
            return;
        };
        if let Some(v) = node.value {
            if !visit(prefix, v) {
                return;
            }
        }
        if let Some(center) = &node.center {
            let mut buf = prefix.to_vec();
            Self::iterate_node(center, &mut buf, visit);
        }
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
        contract_tests::run::<SimpleRadixTree>();
    }

    #[test]
    fn leaves_stub_nodes_behind_on_delete() {
        // Documents the preserved FIXME: removing "ab" frees the leaf node
        // for 'b', but the parent node for 'a' (which never held a value of
        // its own) is never checked or pruned, and survives as a stub.
        let mut t = SimpleRadixTree::new();
        t.insert(b"ab", Value::Int(1));
        assert!(t.remove(b"ab"));
        assert_eq!(t.size(), 0);
        assert!(
            t.root.is_some(),
            "the value-less 'a' node should remain as a stub"
        );
    }
}
