//! The B+ tree node codec (C3): a node's in-memory shape and its
//! serialization into exactly one block (spec.md §4.3).

use byteorder::{ByteOrder, LittleEndian};

use crate::block::{BlockId, BLOCK_ID_INVALID};
use crate::codec::Codec;
use crate::error::{Error, Result};

pub type NodeId = BlockId;
pub const NODE_ID_INVALID: NodeId = BLOCK_ID_INVALID;

const FLAG_LEAF: u16 = 0b1;
const HEADER_SIZE: usize = 20;

/// One B+ tree node (order `B`, so `rank` keys with `⌈B/2⌉-1 <= rank <=
/// 2B-1`, except the root which may have fewer).
///
/// Inner nodes keep `children.len() == keys.len() + 1`; leaves keep
/// `values.len() == keys.len()` and link into the leaf chain via
/// `left_id`/`right_id`.
#[derive(Debug, Clone)]
pub struct Node<K, V> {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub left_id: NodeId,
    pub right_id: NodeId,
    pub leaf: bool,
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub children: Vec<NodeId>,
}

impl<K: Codec, V: Codec> Node<K, V> {
    pub fn new_leaf(id: NodeId) -> Self {
        Node {
            id,
            parent_id: NODE_ID_INVALID,
            left_id: NODE_ID_INVALID,
            right_id: NODE_ID_INVALID,
            leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn new_inner(id: NodeId) -> Self {
        Node {
            id,
            parent_id: NODE_ID_INVALID,
            left_id: NODE_ID_INVALID,
            right_id: NODE_ID_INVALID,
            leaf: false,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.keys.len()
    }

    /// Serializes this node into exactly one block (`dst.len()` must equal
    /// the store's block size). Fails if the encoded payload would overrun
    /// the block — the caller should treat that as corruption of the
    /// B+ tree's size invariants rather than something to recover from.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        let rank = self.rank();
        if dst.len() < HEADER_SIZE {
            return Err(Error::Corrupt(self.id));
        }

        let mut flags = 0u16;
        if self.leaf {
            flags |= FLAG_LEAF;
        }
        LittleEndian::write_u16(&mut dst[0..2], flags);
        LittleEndian::write_u16(&mut dst[2..4], rank as u16);
        LittleEndian::write_u32(&mut dst[4..8], self.parent_id);
        LittleEndian::write_u32(&mut dst[8..12], self.left_id);
        LittleEndian::write_u32(&mut dst[12..16], self.right_id);
        LittleEndian::write_u32(&mut dst[16..20], self.id);

        let mut cursor = HEADER_SIZE;
        for key in &self.keys {
            let n = key
                .encode(&mut dst[cursor..])
                .ok_or(Error::Corrupt(self.id))?;
            cursor += n;
        }

        if self.leaf {
            for value in &self.values {
                let n = value
                    .encode(&mut dst[cursor..])
                    .ok_or(Error::Corrupt(self.id))?;
                cursor += n;
            }
        } else {
            for &child in &self.children {
                if dst.len() < cursor + 4 {
                    return Err(Error::Corrupt(self.id));
                }
                LittleEndian::write_u32(&mut dst[cursor..cursor + 4], child);
                cursor += 4;
            }
        }

        for byte in &mut dst[cursor..] {
            *byte = 0;
        }

        Ok(())
    }

    /// Deserializes a node from `src` (one block's worth of bytes), which
    /// must have been written at block id `expected_id`. `max_rank` is
    /// `2B-1`; a decoded rank above that is reported as corruption.
    pub fn decode(src: &[u8], expected_id: NodeId, max_rank: usize) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(Error::Corrupt(expected_id));
        }

        let flags = LittleEndian::read_u16(&src[0..2]);
        let rank = LittleEndian::read_u16(&src[2..4]) as usize;
        let parent_id = LittleEndian::read_u32(&src[4..8]);
        let left_id = LittleEndian::read_u32(&src[8..12]);
        let right_id = LittleEndian::read_u32(&src[12..16]);
        let node_id = LittleEndian::read_u32(&src[16..20]);

        if node_id != expected_id {
            return Err(Error::Corrupt(expected_id));
        }
        if rank > max_rank {
            return Err(Error::Corrupt(expected_id));
        }

        let leaf = flags & FLAG_LEAF != 0;

        let mut cursor = HEADER_SIZE;
        let mut keys = Vec::with_capacity(rank);
        for _ in 0..rank {
            let (key, n) = K::decode(&src[cursor..]).ok_or(Error::Corrupt(expected_id))?;
            keys.push(key);
            cursor += n;
        }

        let mut values = Vec::new();
        let mut children = Vec::new();

        if leaf {
            values.reserve(rank);
            for _ in 0..rank {
                let (value, n) = V::decode(&src[cursor..]).ok_or(Error::Corrupt(expected_id))?;
                values.push(value);
                cursor += n;
            }
        } else {
            children.reserve(rank + 1);
            for _ in 0..=rank {
                if src.len() < cursor + 4 {
                    return Err(Error::Corrupt(expected_id));
                }
                children.push(LittleEndian::read_u32(&src[cursor..cursor + 4]));
                cursor += 4;
            }
        }

        Ok(Node {
            id: node_id,
            parent_id,
            left_id,
            right_id,
            leaf,
            keys,
            values,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Fingerprint;
    use crate::locator::DataLocator;

    #[test]
    fn leaf_roundtrip() {
        let mut node: Node<Fingerprint, DataLocator> = Node::new_leaf(7);
        node.parent_id = 3;
        node.left_id = 1;
        node.right_id = 2;
        node.keys.push(Fingerprint::new(0, b"a"));
        node.keys.push(Fingerprint::new(0, b"b"));
        node.values.push(DataLocator::new(10, 0));
        node.values.push(DataLocator::new(10, 50));

        let mut buf = vec![0u8; 4096];
        node.encode(&mut buf).unwrap();

        let decoded: Node<Fingerprint, DataLocator> = Node::decode(&buf, 7, 9).unwrap();
        assert!(decoded.leaf);
        assert_eq!(decoded.rank(), 2);
        assert_eq!(decoded.parent_id, 3);
        assert_eq!(decoded.left_id, 1);
        assert_eq!(decoded.right_id, 2);
        assert_eq!(decoded.values[1].offset(), 50);
    }

    #[test]
    fn inner_roundtrip() {
        let mut node: Node<Fingerprint, DataLocator> = Node::new_inner(4);
        node.keys.push(Fingerprint::new(0, b"m"));
        node.children.push(1);
        node.children.push(2);

        let mut buf = vec![0u8; 4096];
        node.encode(&mut buf).unwrap();

        let decoded: Node<Fingerprint, DataLocator> = Node::decode(&buf, 4, 9).unwrap();
        assert!(!decoded.leaf);
        assert_eq!(decoded.children, vec![1, 2]);
    }

    #[test]
    fn mismatched_node_id_is_corrupt() {
        let node: Node<Fingerprint, DataLocator> = Node::new_leaf(7);
        let mut buf = vec![0u8; 4096];
        node.encode(&mut buf).unwrap();

        assert!(matches!(
            Node::<Fingerprint, DataLocator>::decode(&buf, 8, 9),
            Err(Error::Corrupt(8))
        ));
    }

    #[test]
    fn rank_over_limit_is_corrupt() {
        let mut node: Node<Fingerprint, DataLocator> = Node::new_leaf(7);
        for i in 0..5u8 {
            node.keys.push(Fingerprint::new(0, &[i]));
            node.values.push(DataLocator::new(0, i as i16));
        }
        let mut buf = vec![0u8; 4096];
        node.encode(&mut buf).unwrap();

        assert!(matches!(
            Node::<Fingerprint, DataLocator>::decode(&buf, 7, 3),
            Err(Error::Corrupt(7))
        ));
    }
}
