//! A single bidirectional cursor backing both the forward and reverse
//! iterators (spec.md §4.4, §9 "Iterators" design note): forward and
//! reverse views are the same cursor machinery with a direction flag,
//! not two separate implementations.

use crate::codec::Codec;
use crate::error::Result;

use super::{BTree, NodeId, NODE_ID_INVALID};

/// Positions at `(leaf_id, index)` within the leaf chain. `next`/`prev`
/// cross leaf boundaries by following `right_id`/`left_id`; an iterator
/// may change direction in place without losing its position.
#[derive(Debug, Clone)]
pub struct Cursor {
    leaf_id: NodeId,
    pos: usize,
    exhausted: bool,
}

impl Cursor {
    pub fn at_end() -> Self {
        Cursor {
            leaf_id: NODE_ID_INVALID,
            pos: 0,
            exhausted: true,
        }
    }

    pub fn first<K: Codec, V: Codec>(tree: &mut BTree<K, V>) -> Result<Self> {
        tree.ensure_root()?;
        let leaf_id = tree.first_leaf;
        let leaf = tree.load_node(leaf_id)?;
        let empty = leaf.borrow().rank() == 0;
        Ok(Cursor {
            leaf_id,
            pos: 0,
            exhausted: empty,
        })
    }

    pub fn last<K: Codec, V: Codec>(tree: &mut BTree<K, V>) -> Result<Self> {
        tree.ensure_root()?;
        let leaf_id = tree.last_leaf;
        let leaf = tree.load_node(leaf_id)?;
        let rank = leaf.borrow().rank();
        Ok(Cursor {
            leaf_id,
            pos: rank.saturating_sub(1),
            exhausted: rank == 0,
        })
    }

    pub fn end() -> Self {
        Cursor::at_end()
    }

    pub fn is_end(&self) -> bool {
        self.exhausted
    }

    pub fn entry<K: Codec, V: Codec>(&self, tree: &mut BTree<K, V>) -> Result<Option<(K, V)>> {
        if self.exhausted {
            return Ok(None);
        }
        let leaf = tree.load_node(self.leaf_id)?;
        let leaf = leaf.borrow();
        Ok(Some((leaf.keys[self.pos].clone(), leaf.values[self.pos].clone())))
    }

    pub fn key<K: Codec, V: Codec>(&self, tree: &mut BTree<K, V>) -> Result<Option<K>> {
        Ok(self.entry(tree)?.map(|(k, _)| k))
    }

    pub fn next<K: Codec, V: Codec>(&mut self, tree: &mut BTree<K, V>) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        let leaf = tree.load_node(self.leaf_id)?;
        let (rank, right_id) = {
            let leaf = leaf.borrow();
            (leaf.rank(), leaf.right_id)
        };
        if self.pos + 1 < rank {
            self.pos += 1;
            return Ok(true);
        }
        if crate::block::block_id_valid(right_id) {
            self.leaf_id = right_id;
            self.pos = 0;
            let next_rank = tree.load_node(self.leaf_id)?.borrow().rank();
            if next_rank == 0 {
                self.exhausted = true;
                return Ok(false);
            }
            return Ok(true);
        }
        self.exhausted = true;
        Ok(false)
    }

    pub fn prev<K: Codec, V: Codec>(&mut self, tree: &mut BTree<K, V>) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        if self.pos > 0 {
            self.pos -= 1;
            return Ok(true);
        }
        let left_id = tree.load_node(self.leaf_id)?.borrow().left_id;
        if crate::block::block_id_valid(left_id) {
            self.leaf_id = left_id;
            let rank = tree.load_node(self.leaf_id)?.borrow().rank();
            if rank == 0 {
                self.exhausted = true;
                return Ok(false);
            }
            self.pos = rank - 1;
            return Ok(true);
        }
        self.exhausted = true;
        Ok(false)
    }
}
