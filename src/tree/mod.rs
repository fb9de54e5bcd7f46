//! The persistent B+ tree engine (C4): search, insert-with-split, and
//! leaf-chain iteration, with a small LRU of decoded node objects sitting
//! in front of the block cache (spec.md §4.4).

mod dot;
pub mod iter;
mod node;

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::trace;

use crate::block::block_id_valid;
use crate::cache::{BlockCache, CacheDelegate, LruCache};
use crate::codec::Codec;
use crate::error::Result;

pub use self::iter::Cursor;
pub use self::node::{Node, NodeId, NODE_ID_INVALID};

pub type SharedBlockCache = Rc<RefCell<BlockCache>>;
pub type SharedNode<K, V> = Rc<RefCell<Node<K, V>>>;

/// The subset of B+ tree state persisted in the store header (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeState {
    pub root_id: NodeId,
    pub first_leaf: NodeId,
    pub last_leaf: NodeId,
}

impl TreeState {
    pub fn empty() -> Self {
        TreeState {
            root_id: NODE_ID_INVALID,
            first_leaf: NODE_ID_INVALID,
            last_leaf: NODE_ID_INVALID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
}

/// Result of a leaf/inner search: the node reached and the position within
/// it, plus whether the key was actually present there.
pub struct Lookup<K, V> {
    pub node: SharedNode<K, V>,
    pub pos: usize,
    pub found: bool,
}

/// Enforces "at most one live node object per id", mirroring
/// `crate::cache::BlockManager` for decoded nodes: a node evicted from the
/// LRU while still held elsewhere must not be silently re-decoded into a
/// second, diverging copy.
struct NodeManager<K, V> {
    objects: HashMap<NodeId, Weak<RefCell<Node<K, V>>>>,
}

impl<K, V> NodeManager<K, V> {
    fn new() -> Self {
        NodeManager { objects: HashMap::new() }
    }

    /// Returns the live node object for `id`, decoding a fresh one via
    /// `make` only if none is currently alive.
    fn get_or_insert(
        &mut self,
        id: NodeId,
        make: impl FnOnce() -> Result<Node<K, V>>,
    ) -> Result<SharedNode<K, V>> {
        if let Some(weak) = self.objects.get(&id) {
            if let Some(rc) = weak.upgrade() {
                return Ok(rc);
            }
        }
        let rc = Rc::new(RefCell::new(make()?));
        self.objects.insert(id, Rc::downgrade(&rc));
        Ok(rc)
    }

    fn register(&mut self, id: NodeId, rc: &SharedNode<K, V>) {
        self.objects.insert(id, Rc::downgrade(rc));
    }
}

struct NodeCacheDelegate<K, V> {
    blocks: SharedBlockCache,
    max_rank: usize,
    manager: NodeManager<K, V>,
}

impl<K: Codec, V: Codec> CacheDelegate<NodeId, SharedNode<K, V>> for NodeCacheDelegate<K, V> {
    fn on_miss(&mut self, key: NodeId) -> Result<SharedNode<K, V>> {
        let blocks = self.blocks.clone();
        let max_rank = self.max_rank;
        self.manager.get_or_insert(key, || {
            let block = blocks.borrow_mut().get(key)?;
            let b = block.borrow();
            Node::decode(b.data(), key, max_rank)
        })
    }

    fn on_eviction(&mut self, key: NodeId, value: &SharedNode<K, V>) -> Result<()> {
        let node = value.borrow();
        let block = self.blocks.borrow_mut().get(key)?;
        let mut b = block.borrow_mut();
        node.encode(b.data_mut())?;
        trace!("wrote back node {} on node-cache eviction", key);
        Ok(())
    }
}

/// The B+ tree (C4): order `B` (keys per node in `[ceil(B/2)-1, 2B-1]`),
/// leaf-linked, with a persistent root.
pub struct BTree<K, V> {
    order: usize,
    max_rank: usize,
    min_rank: usize,
    root_id: NodeId,
    first_leaf: NodeId,
    last_leaf: NodeId,
    nodes: LruCache<NodeId, SharedNode<K, V>, NodeCacheDelegate<K, V>>,
    blocks: SharedBlockCache,
}

impl<K: Codec, V: Codec> BTree<K, V> {
    pub fn new(order: usize, state: TreeState, blocks: SharedBlockCache, node_cache_size: usize) -> Self {
        let max_rank = 2 * order - 1;
        let min_rank = order.div_ceil(2).saturating_sub(1);
        let delegate = NodeCacheDelegate {
            blocks: blocks.clone(),
            max_rank,
            manager: NodeManager::new(),
        };
        BTree {
            order,
            max_rank,
            min_rank,
            root_id: state.root_id,
            first_leaf: state.first_leaf,
            last_leaf: state.last_leaf,
            nodes: LruCache::new(node_cache_size, delegate),
            blocks,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn max_rank(&self) -> usize {
        self.max_rank
    }

    pub fn min_rank(&self) -> usize {
        self.min_rank
    }

    pub fn has_root(&self) -> bool {
        block_id_valid(self.root_id)
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn state(&self) -> TreeState {
        TreeState {
            root_id: self.root_id,
            first_leaf: self.first_leaf,
            last_leaf: self.last_leaf,
        }
    }

    pub(crate) fn load_node(&mut self, id: NodeId) -> Result<SharedNode<K, V>> {
        self.nodes.get(id)
    }

    fn alloc_node(&mut self, leaf: bool) -> Result<SharedNode<K, V>> {
        let id = self.blocks.borrow_mut().alloc_id(1)?;
        self.blocks.borrow_mut().get_fresh(id)?;
        let node = if leaf {
            Node::new_leaf(id)
        } else {
            Node::new_inner(id)
        };
        let rc = Rc::new(RefCell::new(node));
        self.nodes.delegate_mut().manager.register(id, &rc);
        self.nodes.insert(id, rc.clone())?;
        Ok(rc)
    }

    /// Creates an empty root leaf if the tree has none yet.
    pub fn ensure_root(&mut self) -> Result<SharedNode<K, V>> {
        if self.has_root() {
            return self.load_node(self.root_id);
        }
        let root = self.alloc_node(true)?;
        let id = root.borrow().id;
        self.root_id = id;
        self.first_leaf = id;
        self.last_leaf = id;
        Ok(root)
    }

    fn child_index(node: &Node<K, V>, key: &K) -> usize {
        node.keys
            .iter()
            .position(|k| K::compare(key, k) != Ordering::Greater)
            .unwrap_or(node.keys.len())
    }

    fn leaf_position(node: &Node<K, V>, key: &K) -> (usize, bool) {
        match node.keys.iter().position(|k| K::compare(key, k) != Ordering::Greater) {
            Some(i) => (i, K::compare(key, &node.keys[i]) == Ordering::Equal),
            None => (node.keys.len(), false),
        }
    }

    /// Descends from the root to the leaf that would hold `key`.
    pub fn search(&mut self, key: &K) -> Result<Lookup<K, V>> {
        self.ensure_root()?;
        let mut current = self.load_node(self.root_id)?;
        loop {
            let (is_leaf, next_child) = {
                let node = current.borrow();
                if node.leaf {
                    (true, None)
                } else {
                    let i = Self::child_index(&node, key);
                    (false, Some(node.children[i]))
                }
            };
            if is_leaf {
                let node = current.borrow();
                let (pos, found) = Self::leaf_position(&node, key);
                drop(node);
                return Ok(Lookup { node: current, pos, found });
            }
            current = self.load_node(next_child.expect("inner node always has a child"))?;
        }
    }

    /// Inserts `key -> value`, overwriting the existing value (and
    /// reporting `Updated`) if `key` is already present.
    pub fn insert(&mut self, key: K, value: V) -> Result<InsertOutcome> {
        let lookup = self.search(&key)?;
        if lookup.found {
            let mut node = lookup.node.borrow_mut();
            node.values[lookup.pos] = value;
            return Ok(InsertOutcome::Updated);
        }

        let leaf_id = lookup.node.borrow().id;
        {
            let mut leaf = lookup.node.borrow_mut();
            leaf.keys.insert(lookup.pos, key);
            leaf.values.insert(lookup.pos, value);
        }

        let overflowed = lookup.node.borrow().rank() > self.max_rank;
        if overflowed {
            let (median, right_id) = self.split_leaf(lookup.node.clone())?;
            self.insert_into_parent(leaf_id, median, right_id)?;
        }

        Ok(InsertOutcome::Inserted)
    }

    /// Splices `key`'s entry out of its leaf, if present, without any
    /// rebalancing (no merge or redistribution: the B+ tree engine exposes
    /// no delete operation of its own — spec.md §4.4 lists only search and
    /// insert — this exists solely to back `Store::rename`'s tree-level key
    /// rewrite). A leaf may end up under the usual minimum-rank bound as a
    /// result; that is an accepted consequence of there being no delete
    /// algorithm to ground a rebalance in.
    pub(crate) fn remove_leaf_entry(&mut self, key: &K) -> Result<Option<V>> {
        let lookup = self.search(key)?;
        if !lookup.found {
            return Ok(None);
        }
        let mut node = lookup.node.borrow_mut();
        node.keys.remove(lookup.pos);
        Ok(Some(node.values.remove(lookup.pos)))
    }

    fn split_leaf(&mut self, left: SharedNode<K, V>) -> Result<(K, NodeId)> {
        let right = self.alloc_node(true)?;
        let right_id = right.borrow().id;

        let (left_id, old_right_id, median) = {
            let mut l = left.borrow_mut();
            let n = l.rank();
            let mid = n / 2;

            let mut r = right.borrow_mut();
            r.keys = l.keys.split_off(mid);
            r.values = l.values.split_off(mid);
            r.parent_id = l.parent_id;

            let old_right_id = l.right_id;
            r.left_id = l.id;
            r.right_id = old_right_id;
            l.right_id = right_id;

            (l.id, old_right_id, l.keys[mid - 1].clone())
        };

        if block_id_valid(old_right_id) {
            self.load_node(old_right_id)?.borrow_mut().left_id = right_id;
        } else {
            self.last_leaf = right_id;
        }
        debug_assert_eq!(left_id, left.borrow().id);

        Ok((median, right_id))
    }

    fn split_inner(&mut self, left: SharedNode<K, V>) -> Result<(K, NodeId)> {
        let right = self.alloc_node(false)?;
        let right_id = right.borrow().id;

        let (median, moved_children) = {
            let mut l = left.borrow_mut();
            let n = l.rank();
            let mid = n / 2;

            let median = l.keys[mid].clone();

            let mut r = right.borrow_mut();
            r.keys = l.keys.split_off(mid + 1);
            l.keys.pop(); // drop the median itself from the left side
            r.children = l.children.split_off(mid + 1);
            r.parent_id = l.parent_id;

            (median, r.children.clone())
        };

        for child_id in moved_children {
            self.load_node(child_id)?.borrow_mut().parent_id = right_id;
        }

        Ok((median, right_id))
    }

    /// Attaches `(median, right)` as the new separator/child pair above
    /// `left`, splitting the parent (and so on up to the root) if that
    /// overflows it.
    fn insert_into_parent(&mut self, left_id: NodeId, median: K, right_id: NodeId) -> Result<()> {
        let left = self.load_node(left_id)?;
        let parent_id = left.borrow().parent_id;

        if !block_id_valid(parent_id) {
            let new_root = self.alloc_node(false)?;
            let new_root_id = new_root.borrow().id;
            {
                let mut r = new_root.borrow_mut();
                r.keys.push(median);
                r.children.push(left_id);
                r.children.push(right_id);
            }
            left.borrow_mut().parent_id = new_root_id;
            self.load_node(right_id)?.borrow_mut().parent_id = new_root_id;
            self.root_id = new_root_id;
            return Ok(());
        }

        let parent = self.load_node(parent_id)?;
        let idx = {
            let p = parent.borrow();
            p.children
                .iter()
                .position(|&c| c == left_id)
                .expect("left child must be registered in its parent")
        };
        {
            let mut p = parent.borrow_mut();
            p.keys.insert(idx, median);
            p.children.insert(idx + 1, right_id);
        }
        self.load_node(right_id)?.borrow_mut().parent_id = parent_id;

        let overflowed = parent.borrow().rank() > self.max_rank;
        if overflowed {
            let (med, new_right_id) = self.split_inner(parent.clone())?;
            self.insert_into_parent(parent_id, med, new_right_id)?;
        }

        Ok(())
    }

    /// Flushes the decoded-node cache, write-backing every modified node
    /// into the (still in-memory) block cache. Does not itself touch disk;
    /// call `BlockCache::flush` afterward (the store facade's `close` does
    /// both in the correct order).
    pub fn flush(&mut self) -> Result<()> {
        self.nodes.flush()
    }

    pub fn node_cache_len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockFile;
    use crate::hash::Fingerprint;
    use crate::locator::DataLocator;

    fn fresh_tree(order: usize) -> BTree<Fingerprint, DataLocator> {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(tmp.path()).ok();
        let file = BlockFile::open(tmp.path(), 4096).unwrap();
        let blocks = Rc::new(RefCell::new(BlockCache::new(file, 64)));
        BTree::new(order, TreeState::empty(), blocks, 64)
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::new(0, s.as_bytes())
    }

    #[test]
    fn starts_empty() {
        let tree = fresh_tree(4);
        assert!(!tree.has_root());
    }

    #[test]
    fn insert_then_search_finds_it() {
        let mut tree = fresh_tree(4);
        tree.insert(fp("a"), DataLocator::new(1, 0)).unwrap();
        let lookup = tree.search(&fp("a")).unwrap();
        assert!(lookup.found);
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let mut tree = fresh_tree(4);
        tree.insert(fp("a"), DataLocator::new(1, 0)).unwrap();
        let outcome = tree.insert(fp("a"), DataLocator::new(2, 5)).unwrap();
        assert_eq!(outcome, InsertOutcome::Updated);
        let lookup = tree.search(&fp("a")).unwrap();
        assert_eq!(lookup.node.borrow().values[lookup.pos].block_id(), 2);
    }

    #[test]
    fn many_inserts_keep_every_key_searchable() {
        let mut tree = fresh_tree(4);
        let keys: Vec<Fingerprint> = (0..500).map(|i| fp(&format!("key-{i}"))).collect();
        for (i, k) in keys.iter().enumerate() {
            tree.insert(*k, DataLocator::new(i as u32, 0)).unwrap();
        }
        for (i, k) in keys.iter().enumerate() {
            let lookup = tree.search(k).unwrap();
            assert!(lookup.found, "missing key at insert index {i}");
            assert_eq!(lookup.node.borrow().values[lookup.pos].block_id(), i as u32);
        }
    }

    #[test]
    fn leaf_chain_is_consistent_after_many_splits() {
        let mut tree = fresh_tree(4);
        for i in 0..300 {
            tree.insert(fp(&format!("k{i}")), DataLocator::new(i, 0)).unwrap();
        }

        let mut id = tree.first_leaf;
        let mut count = 0;
        let mut prev_id = NODE_ID_INVALID;
        loop {
            let node = tree.load_node(id).unwrap();
            let node = node.borrow();
            assert_eq!(node.left_id, prev_id);
            count += node.rank();
            prev_id = id;
            if !block_id_valid(node.right_id) {
                assert_eq!(id, tree.last_leaf);
                break;
            }
            let next = node.right_id;
            drop(node);
            id = next;
        }
        assert_eq!(count, 300);
    }

    #[test]
    fn nodes_stay_within_rank_bounds() {
        let mut tree = fresh_tree(4);
        for i in 0..1000 {
            tree.insert(fp(&format!("key-{i:04}")), DataLocator::new(i, 0)).unwrap();
        }
        let mut stack = vec![tree.root_id()];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = tree.load_node(id).unwrap();
            let node = node.borrow();
            assert!(node.rank() <= tree.max_rank());
            if id != tree.root_id() {
                assert!(node.rank() >= tree.min_rank(), "node {} rank {} below min {}", id, node.rank(), tree.min_rank());
            }
            for &c in &node.children {
                stack.push(c);
            }
        }
    }
}
