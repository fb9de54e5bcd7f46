//! The value heap (C5): variable-length byte strings packed into blocks as
//! length-prefixed envelopes, addressed by `SizedLocator` (spec.md §4.5).

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::block::{block_id_valid, BlockId};
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::locator::{DataLocator, SizedLocator, LENGTH_PREFIX_SIZE};

/// The heap's packing-cursor state, persisted in the store header alongside
/// the B+ tree state (spec.md §3 "Value-heap state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapState {
    pub first_block_id: BlockId,
    pub current_block_id: BlockId,
    pub current_offset: u32,
    pub current_avail: u64,
}

impl HeapState {
    pub fn empty() -> Self {
        HeapState {
            first_block_id: crate::block::BLOCK_ID_INVALID,
            current_block_id: crate::block::BLOCK_ID_INVALID,
            current_offset: 0,
            current_avail: 0,
        }
    }
}

/// The value heap. Holds no data of its own beyond the packing cursor; all
/// bytes live in blocks fetched through the shared `BlockCache`.
pub struct Heap {
    state: HeapState,
    blocks: Rc<RefCell<BlockCache>>,
    block_size: usize,
}

impl Heap {
    pub fn new(state: HeapState, blocks: Rc<RefCell<BlockCache>>) -> Self {
        let block_size = blocks.borrow().block_size();
        Heap { state, blocks, block_size }
    }

    pub fn state(&self) -> HeapState {
        self.state
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn single_block_span(&self) -> bool {
        self.state.current_avail <= self.block_size as u64
    }

    /// Allocates a fresh envelope able to hold `content_len` content bytes,
    /// writes `content`, and returns its `SizedLocator` (envelope view).
    pub fn allocate(&mut self, content: &[u8]) -> Result<SizedLocator> {
        let env = content.len() as u64 + LENGTH_PREFIX_SIZE as u64;

        if !(env <= self.state.current_avail && self.single_block_span()) {
            self.open_new_span(env)?;
        }

        let locator = DataLocator::new(self.state.current_block_id, self.state.current_offset as i16);
        let sized = SizedLocator::new(locator, env as u32);

        self.state.current_offset += env as u32;
        self.state.current_avail -= env;

        let bs = self.block_size as u32;
        self.state.current_block_id += self.state.current_offset / bs;
        self.state.current_offset %= bs;

        self.write_envelope(sized, content)?;
        trace!("heap: allocated {} content bytes at block {} offset {}", content.len(), locator.block_id(), locator.offset());
        Ok(sized)
    }

    fn open_new_span(&mut self, env: u64) -> Result<()> {
        let tail = self.state.current_offset as u64 % self.block_size as u64;
        let room_in_current = if tail == 0 { 0 } else { self.block_size as u64 - tail };
        let n_blocks = (env + room_in_current).div_ceil(self.block_size as u64).max(1) as u32;

        let first = self.blocks.borrow_mut().alloc_id(n_blocks)?;
        for i in 0..n_blocks {
            self.blocks.borrow_mut().get_fresh(first + i)?;
        }

        if !block_id_valid(self.state.first_block_id) {
            self.state.first_block_id = first;
        }
        self.state.current_block_id = first;
        self.state.current_offset = 0;
        self.state.current_avail = n_blocks as u64 * self.block_size as u64;
        Ok(())
    }

    /// Writes the 4-byte length prefix plus `content` across however many
    /// blocks the envelope spans.
    fn write_envelope(&mut self, sized: SizedLocator, content: &[u8]) -> Result<()> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE as usize];
        LittleEndian::write_u32(&mut prefix, content.len() as u32);

        let mut cursor = sized.data_locator();
        self.write_bytes(&mut cursor, &prefix)?;
        self.write_bytes(&mut cursor, content)?;
        Ok(())
    }

    fn write_bytes(&mut self, cursor: &mut DataLocator, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let block_id = cursor.block_id();
            let offset = cursor.uoffset() as usize;
            let room = self.block_size - offset;
            let n = room.min(data.len());

            let block = self.blocks.borrow_mut().get(block_id)?;
            block.borrow_mut().data_mut()[offset..offset + n].copy_from_slice(&data[..n]);

            cursor.delta(n as i64, self.block_size);
            data = &data[n..];
        }
        Ok(())
    }

    fn read_bytes(&mut self, cursor: &mut DataLocator, dst: &mut [u8]) -> Result<()> {
        let mut remaining = dst.len();
        let mut written = 0;
        while remaining > 0 {
            let block_id = cursor.block_id();
            let offset = cursor.uoffset() as usize;
            let room = self.block_size - offset;
            let n = room.min(remaining);

            let block = self.blocks.borrow_mut().get(block_id)?;
            dst[written..written + n].copy_from_slice(&block.borrow().data()[offset..offset + n]);

            cursor.delta(n as i64, self.block_size);
            written += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Reads the length prefix and returns the envelope re-addressed as a
    /// `SizedLocator` whose `envelope_size` reflects the actual stored size.
    pub fn locate(&mut self, locator: DataLocator) -> Result<SizedLocator> {
        if !locator.valid(self.block_size) {
            return Err(Error::Corrupt(locator.block_id()));
        }
        let mut cursor = locator;
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE as usize];
        self.read_bytes(&mut cursor, &mut prefix)?;
        let content_len = LittleEndian::read_u32(&prefix);
        Ok(SizedLocator::new(locator, content_len + LENGTH_PREFIX_SIZE))
    }

    /// Reads the whole value addressed by `locator` (a bare `DataLocator`,
    /// as persisted in the tree).
    pub fn read_value(&mut self, locator: DataLocator) -> Result<Vec<u8>> {
        let sized = self.locate(locator)?;
        let contents = sized.contents(self.block_size);
        let mut buf = vec![0u8; contents.contents_size() as usize];
        let mut cursor = contents.data_locator();
        self.read_bytes(&mut cursor, &mut buf)?;
        Ok(buf)
    }

    /// Reads up to `len` bytes starting at `cursor` (a contents-relative
    /// `SizedLocator`, as tracked by a streaming `Search`), returning the
    /// bytes read and the remaining (unread) contents locator.
    pub fn read_chunk(&mut self, cursor: SizedLocator, len: usize) -> Result<(Vec<u8>, SizedLocator)> {
        let take = len.min(cursor.contents_size() as usize);
        let mut buf = vec![0u8; take];
        let mut loc = cursor.data_locator();
        self.read_bytes(&mut loc, &mut buf)?;

        let mut rest = cursor;
        rest.delta(take as i64, self.block_size);
        rest.shrink(take as u32);
        Ok((buf, rest))
    }

    /// Overwrites the content of an existing envelope in place. Caller must
    /// have already checked `new_content.len() + 4 <= sized.envelope_size()`.
    pub fn overwrite_in_place(&mut self, sized: SizedLocator, new_content: &[u8]) -> Result<()> {
        debug_assert!(new_content.len() as u32 + LENGTH_PREFIX_SIZE <= sized.envelope_size());
        self.write_envelope(SizedLocator::new(sized.data_locator(), new_content.len() as u32 + LENGTH_PREFIX_SIZE), new_content)
    }

    /// Whether `new_len` content bytes would still fit within `sized`'s
    /// existing envelope (spec.md §4.5 update semantics).
    pub fn fits_in_place(sized: SizedLocator, new_len: usize) -> bool {
        new_len as u32 + LENGTH_PREFIX_SIZE <= sized.envelope_size()
    }
}
