//! Copy-on-write sparse trie keyed by 32-bit integers.
//!
//! `SparseArray` is the storage primitive behind dispatch tables. Keys are
//! split into 8-bit digits; every node is a fixed 256-way array, so a trie
//! of depth 32 has at most four levels and a lookup is four indexed loads.
//!
//! # Sharing
//!
//! Nodes are held in `Arc`s. Cloning a `SparseArray` only bumps the root's
//! strong count, and [`SparseArray::insert`] clones any node on the path
//! that is still shared before writing to it. A reader that holds an older
//! `SparseArray` therefore never sees a write that happens to a copy, and
//! needs no lock to walk it.

use std::fmt;
use std::sync::Arc;

/// Children per node.
const FANOUT: usize = 256;
/// Key bits consumed per level.
const BITS: u32 = 8;
const MASK: u32 = 0xff;
/// Largest supported depth, in key bits.
pub const MAX_DEPTH: u32 = 32;

#[derive(Clone)]
enum Node<T> {
    Leaf(Box<[Option<T>; FANOUT]>),
    Branch(Box<[Option<Arc<Node<T>>>; FANOUT]>),
}

impl<T> Node<T> {
    fn empty(shift: u32) -> Self {
        if shift == 0 {
            Node::Leaf(Box::new(std::array::from_fn(|_| None)))
        } else {
            Node::Branch(Box::new(std::array::from_fn(|_| None)))
        }
    }
}

/// A fixed fan-out, copy-on-write map from `u32` to `T`.
pub struct SparseArray<T> {
    /// Shift applied to the key at the root: `depth - 8`.
    shift: u32,
    root: Arc<Node<T>>,
    len: usize,
}

fn normalize_depth(depth: u32) -> u32 {
    depth.div_ceil(BITS).clamp(1, MAX_DEPTH / BITS) * BITS
}

impl<T> SparseArray<T> {
    /// Creates an empty trie able to hold keys below `2^depth`.
    ///
    /// `depth` is rounded up to a multiple of 8 and clamped to `8..=32`.
    #[must_use]
    pub fn new(depth: u32) -> Self {
        let shift = normalize_depth(depth) - BITS;
        SparseArray {
            shift,
            root: Arc::new(Node::empty(shift)),
            len: 0,
        }
    }

    /// Number of key bits this trie covers.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.shift + BITS
    }

    /// Number of occupied keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no key is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `key` is within the trie's depth.
    #[must_use]
    pub fn covers(&self, key: u32) -> bool {
        self.depth() >= MAX_DEPTH || key >> self.depth() == 0
    }

    /// Returns the value stored under `key`, or `None` for unset and
    /// out-of-range keys.
    #[must_use]
    pub fn lookup(&self, key: u32) -> Option<&T> {
        if !self.covers(key) {
            return None;
        }
        let mut node = &*self.root;
        let mut shift = self.shift;
        loop {
            match node {
                Node::Leaf(values) => return values[(key & MASK) as usize].as_ref(),
                Node::Branch(children) => {
                    node = children[((key >> shift) & MASK) as usize].as_deref()?;
                    shift -= BITS;
                }
            }
        }
    }

    /// Grows the trie to `new_depth` bits by wrapping the current root as
    /// child 0 of taller roots. Keys that were in range resolve identically
    /// afterwards. Shrinking is a no-op.
    pub fn expand_depth(&mut self, new_depth: u32) {
        let target = normalize_depth(new_depth);
        while self.depth() < target {
            let shift = self.shift + BITS;
            let mut children: Box<[Option<Arc<Node<T>>>; FANOUT]> =
                Box::new(std::array::from_fn(|_| None));
            let old = std::mem::replace(&mut self.root, Arc::new(Node::empty(0)));
            children[0] = Some(old);
            self.root = Arc::new(Node::Branch(children));
            self.shift = shift;
        }
    }

    /// Returns `true` if both tries share the same root node.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// Iterates occupied entries in ascending key order.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            stack: vec![Frame {
                node: &self.root,
                base: 0,
                shift: self.shift,
                next: 0,
            }],
        }
    }
}

impl<T: Clone> SparseArray<T> {
    /// Stores `value` under `key`, returning the previous value.
    ///
    /// Keys beyond the current depth expand the trie first. Shared nodes on
    /// the path are copied before they are written.
    pub fn insert(&mut self, key: u32, value: T) -> Option<T> {
        if !self.covers(key) {
            let needed = MAX_DEPTH - key.leading_zeros();
            self.expand_depth(needed);
        }
        let previous = Self::slot_mut(&mut self.root, self.shift, key).replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Clears `key`, returning the value that was stored there.
    ///
    /// Absent keys leave the trie, and any nodes it shares, untouched.
    pub fn remove(&mut self, key: u32) -> Option<T> {
        self.lookup(key)?;
        let previous = Self::slot_mut(&mut self.root, self.shift, key).take();
        if previous.is_some() {
            self.len -= 1;
        }
        previous
    }

    fn slot_mut(root: &mut Arc<Node<T>>, mut shift: u32, key: u32) -> &mut Option<T> {
        let mut node = Arc::make_mut(root);
        loop {
            let current = node;
            match current {
                Node::Leaf(values) => return &mut values[(key & MASK) as usize],
                Node::Branch(children) => {
                    let child_shift = shift - BITS;
                    let child = children[((key >> shift) & MASK) as usize]
                        .get_or_insert_with(|| Arc::new(Node::empty(child_shift)));
                    node = Arc::make_mut(child);
                    shift = child_shift;
                }
            }
        }
    }
}

impl<T> Clone for SparseArray<T> {
    /// O(1): the copy shares every node with `self` until one side writes.
    fn clone(&self) -> Self {
        SparseArray {
            shift: self.shift,
            root: Arc::clone(&self.root),
            len: self.len,
        }
    }
}

impl<T> fmt::Debug for SparseArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseArray")
            .field("depth", &self.depth())
            .field("len", &self.len)
            .finish()
    }
}

struct Frame<'a, T> {
    node: &'a Node<T>,
    base: u32,
    shift: u32,
    next: usize,
}

/// Iterator over `(key, &value)` pairs of a [`SparseArray`].
pub struct Iter<'a, T> {
    stack: Vec<Frame<'a, T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (u32, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;
            if top.next >= FANOUT {
                self.stack.pop();
                continue;
            }
            let (node, base, shift, index) = (top.node, top.base, top.shift, top.next);
            top.next += 1;
            #[allow(clippy::cast_possible_truncation)]
            let digit = index as u32;
            match node {
                Node::Leaf(values) => {
                    if let Some(value) = &values[index] {
                        return Some((base | digit, value));
                    }
                }
                Node::Branch(children) => {
                    if let Some(child) = &children[index] {
                        self.stack.push(Frame {
                            node: child,
                            base: base | (digit << shift),
                            shift: shift - BITS,
                            next: 0,
                        });
                    }
                }
            }
        }
    }
}

impl<'a, T> IntoIterator for &'a SparseArray<T> {
    type Item = (u32, &'a T);
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_lookup() {
        let mut array = SparseArray::new(32);
        for key in [0u32, 1, 255, 256, 65_535, 65_536, 0x00ab_cdef, u32::MAX] {
            array.insert(key, key.wrapping_mul(3));
        }
        for key in [0u32, 1, 255, 256, 65_535, 65_536, 0x00ab_cdef, u32::MAX] {
            assert_eq!(array.lookup(key), Some(&key.wrapping_mul(3)));
        }
        assert_eq!(array.len(), 8);
    }

    #[test]
    fn test_unset_key_is_empty() {
        let mut array = SparseArray::new(16);
        array.insert(10, "ten");
        assert_eq!(array.lookup(11), None);
        assert_eq!(array.lookup(266), None);
        // Out of range for a 16-bit trie.
        assert_eq!(array.lookup(1 << 20), None);
    }

    #[test]
    fn test_depth_normalization() {
        assert_eq!(SparseArray::<u8>::new(0).depth(), 8);
        assert_eq!(SparseArray::<u8>::new(9).depth(), 16);
        assert_eq!(SparseArray::<u8>::new(24).depth(), 24);
        assert_eq!(SparseArray::<u8>::new(64).depth(), 32);
    }

    #[test]
    fn test_copy_on_write_isolates_writers() {
        let mut original = SparseArray::new(16);
        original.insert(7, 'a');
        original.insert(300, 'b');

        let mut copy = original.clone();
        assert!(copy.ptr_eq(&original));

        copy.insert(7, 'z');
        copy.insert(9, 'c');

        assert!(!copy.ptr_eq(&original));
        assert_eq!(original.lookup(7), Some(&'a'));
        assert_eq!(original.lookup(9), None);
        assert_eq!(copy.lookup(7), Some(&'z'));
        // Untouched entries are still visible through the copy.
        assert_eq!(copy.lookup(300), Some(&'b'));
    }

    #[test]
    fn test_expand_depth_preserves_keys() {
        let mut array = SparseArray::new(8);
        for key in 0..256u32 {
            array.insert(key, key);
        }
        array.expand_depth(24);
        assert_eq!(array.depth(), 24);
        for key in 0..256u32 {
            assert_eq!(array.lookup(key), Some(&key));
        }
        assert_eq!(array.lookup(256), None);
        assert_eq!(array.len(), 256);
    }

    #[test]
    fn test_insert_beyond_depth_expands() {
        let mut array = SparseArray::new(8);
        array.insert(3, 3u32);
        array.insert(70_000, 70_000);
        assert_eq!(array.depth(), 24);
        assert_eq!(array.lookup(3), Some(&3));
        assert_eq!(array.lookup(70_000), Some(&70_000));
    }

    #[test]
    fn test_remove_tombstones_entry() {
        let mut array = SparseArray::new(16);
        array.insert(42, 1);
        array.insert(43, 2);
        assert_eq!(array.remove(42), Some(1));
        assert_eq!(array.remove(42), None);
        assert_eq!(array.lookup(42), None);
        assert_eq!(array.lookup(43), Some(&2));
        assert_eq!(array.len(), 1);
    }

    #[test]
    fn test_remove_absent_key_keeps_sharing() {
        let mut original = SparseArray::new(16);
        original.insert(1, 1);
        let mut copy = original.clone();
        assert_eq!(copy.remove(2), None);
        assert!(copy.ptr_eq(&original));
    }

    #[test]
    fn test_iter_is_ordered() {
        let mut array = SparseArray::new(32);
        for key in [900_000u32, 5, 70_000, 0, 256] {
            array.insert(key, ());
        }
        let keys: Vec<u32> = array.iter().map(|(key, ())| key).collect();
        assert_eq!(keys, vec![0, 5, 256, 70_000, 900_000]);
    }

    #[test]
    fn test_replace_returns_previous() {
        let mut array = SparseArray::new(8);
        assert_eq!(array.insert(1, "first"), None);
        assert_eq!(array.insert(1, "second"), Some("first"));
        assert_eq!(array.len(), 1);
    }
}
