//! The store header (persisted in block 0): magic, version, configuration,
//! user-header slots, and the packed tree/heap state (spec.md §3, §6).

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::error::{Error, Result};
use crate::heap::HeapState;
use crate::tree::TreeState;

pub const MAGIC: &[u8; 4] = b"MWHD";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Total bytes reserved for user-header slot strings (spec.md §3: "≤240
/// bytes total").
pub const USER_HEADER_BUDGET: usize = 240;

const FIXED_SIZE: usize = 4 + 2 + 2 + 4 + 2; // magic, major, minor, blocksize, B
const TREE_STATE_SIZE: usize = 4 + 4 + 4; // root_id, first_leaf, last_leaf
const HEAP_STATE_SIZE: usize = 4 + 4 + 4 + 8; // first_block_id, current_block_id, current_offset, current_avail

/// `next_node_id` from spec.md §3's B+ tree state is not stored separately:
/// node ids are block ids, so it coincides exactly with the block file's
/// own `next_id`, which is already recovered from file length on open.
#[derive(Debug, Clone)]
pub struct Header {
    pub block_size: u32,
    pub order: u16,
    pub user_slots: Vec<String>,
    pub tree_state: TreeState,
    pub heap_state: HeapState,
}

impl Header {
    pub fn new(block_size: u32, order: u16) -> Self {
        Header {
            block_size,
            order,
            user_slots: Vec::new(),
            tree_state: TreeState::empty(),
            heap_state: HeapState::empty(),
        }
    }

    /// Validates this freshly-read header against the configuration the
    /// caller asked to open with.
    pub fn validate(&self, expected_block_size: u32, expected_order: u16) -> Result<()> {
        if self.block_size != expected_block_size {
            return Err(Error::BadVersion(format!(
                "block size mismatch: file has {}, caller asked for {}",
                self.block_size, expected_block_size
            )));
        }
        if self.order != expected_order {
            return Err(Error::BadVersion(format!(
                "tree order mismatch: file has {}, caller asked for {}",
                self.order, expected_order
            )));
        }
        Ok(())
    }

    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < FIXED_SIZE {
            return Err(Error::Corrupt(0));
        }
        dst[0..4].copy_from_slice(MAGIC);
        LittleEndian::write_u16(&mut dst[4..6], VERSION_MAJOR);
        LittleEndian::write_u16(&mut dst[6..8], VERSION_MINOR);
        LittleEndian::write_u32(&mut dst[8..12], self.block_size);
        LittleEndian::write_u16(&mut dst[12..14], self.order);

        let mut cursor = FIXED_SIZE;
        let slots_start = cursor;
        cursor += 2; // slot count, filled in below

        let mut count = 0u16;
        for slot in &self.user_slots {
            let bytes = slot.as_bytes();
            if cursor + 2 + bytes.len() > slots_start + 2 + USER_HEADER_BUDGET {
                return Err(Error::InvalidArgument("user header slots exceed 240-byte budget".into()));
            }
            LittleEndian::write_u16(&mut dst[cursor..cursor + 2], bytes.len() as u16);
            cursor += 2;
            dst[cursor..cursor + bytes.len()].copy_from_slice(bytes);
            cursor += bytes.len();
            count += 1;
        }
        LittleEndian::write_u16(&mut dst[slots_start..slots_start + 2], count);

        cursor = slots_start + 2 + USER_HEADER_BUDGET;
        if dst.len() < cursor + TREE_STATE_SIZE + HEAP_STATE_SIZE {
            return Err(Error::Corrupt(0));
        }

        LittleEndian::write_u32(&mut dst[cursor..cursor + 4], self.tree_state.root_id);
        LittleEndian::write_u32(&mut dst[cursor + 4..cursor + 8], self.tree_state.first_leaf);
        LittleEndian::write_u32(&mut dst[cursor + 8..cursor + 12], self.tree_state.last_leaf);
        cursor += TREE_STATE_SIZE;

        LittleEndian::write_u32(&mut dst[cursor..cursor + 4], self.heap_state.first_block_id);
        LittleEndian::write_u32(&mut dst[cursor + 4..cursor + 8], self.heap_state.current_block_id);
        LittleEndian::write_u32(&mut dst[cursor + 8..cursor + 12], self.heap_state.current_offset);
        LittleEndian::write_u64(&mut dst[cursor + 12..cursor + 20], self.heap_state.current_avail);
        cursor += HEAP_STATE_SIZE;

        for byte in &mut dst[cursor..] {
            *byte = 0;
        }
        Ok(())
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FIXED_SIZE || &src[0..4] != MAGIC {
            return Err(Error::BadVersion("missing or corrupt header magic".into()));
        }
        let major = LittleEndian::read_u16(&src[4..6]);
        let minor = LittleEndian::read_u16(&src[6..8]);
        if major != VERSION_MAJOR {
            return Err(Error::BadVersion(format!("unsupported major version {major}.{minor}")));
        }
        if minor != VERSION_MINOR {
            warn!("header minor version {} differs from supported {}", minor, VERSION_MINOR);
        }

        let block_size = LittleEndian::read_u32(&src[8..12]);
        let order = LittleEndian::read_u16(&src[12..14]);

        let mut cursor = FIXED_SIZE;
        let slots_start = cursor;
        let count = LittleEndian::read_u16(&src[cursor..cursor + 2]);
        cursor += 2;

        let mut user_slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if cursor + 2 > src.len() {
                return Err(Error::Corrupt(0));
            }
            let len = LittleEndian::read_u16(&src[cursor..cursor + 2]) as usize;
            cursor += 2;
            if cursor + len > src.len() || cursor + len > slots_start + 2 + USER_HEADER_BUDGET {
                return Err(Error::Corrupt(0));
            }
            let s = std::str::from_utf8(&src[cursor..cursor + len])
                .map_err(|_| Error::Corrupt(0))?
                .to_string();
            user_slots.push(s);
            cursor += len;
        }

        cursor = slots_start + 2 + USER_HEADER_BUDGET;
        if src.len() < cursor + TREE_STATE_SIZE + HEAP_STATE_SIZE {
            return Err(Error::Corrupt(0));
        }

        let tree_state = TreeState {
            root_id: LittleEndian::read_u32(&src[cursor..cursor + 4]),
            first_leaf: LittleEndian::read_u32(&src[cursor + 4..cursor + 8]),
            last_leaf: LittleEndian::read_u32(&src[cursor + 8..cursor + 12]),
        };
        cursor += TREE_STATE_SIZE;

        let heap_state = HeapState {
            first_block_id: LittleEndian::read_u32(&src[cursor..cursor + 4]),
            current_block_id: LittleEndian::read_u32(&src[cursor + 4..cursor + 8]),
            current_offset: LittleEndian::read_u32(&src[cursor + 8..cursor + 12]),
            current_avail: LittleEndian::read_u64(&src[cursor + 12..cursor + 20]),
        };

        Ok(Header {
            block_size,
            order,
            user_slots,
            tree_state,
            heap_state,
        })
    }
}
