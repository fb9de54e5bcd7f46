use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};

use super::{block_id_valid, BlockId, BLOCK_ID_INVALID};
use crate::error::{Error, Result};

/// The flat on-disk file, sliced into `block_size`-sized regions (C1).
///
/// `BlockFile` owns the file descriptor and is the only thing in the crate
/// that calls into `std::fs`. Everything above it (the cache, the tree, the
/// value heap) goes through block ids; `BlockFile` is where an id finally
/// becomes a byte offset.
pub struct BlockFile {
    path: PathBuf,
    file: File,
    block_size: usize,
    next_id: BlockId,
    created: bool,
}

impl BlockFile {
    /// Opens `path` if it exists, or creates it (with a zeroed block 0)
    /// otherwise.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("empty path".into()));
        }

        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut bf = if existed {
            let len = file.metadata()?.len();
            let next_id = (len / block_size as u64) as BlockId;
            debug!("opened existing block file {:?} ({} blocks)", path, next_id);
            BlockFile {
                path: path.to_path_buf(),
                file,
                block_size,
                next_id,
                created: false,
            }
        } else {
            debug!("creating new block file {:?}", path);
            let zero = vec![0u8; block_size];
            file.write_all(&zero)?;
            file.flush()?;
            BlockFile {
                path: path.to_path_buf(),
                file,
                block_size,
                next_id: 1,
                created: true,
            }
        };

        bf.file.seek(SeekFrom::Start(0))?;
        Ok(bf)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub fn next_id(&self) -> BlockId {
        self.next_id
    }

    pub fn first_id(&self) -> BlockId {
        0
    }

    pub fn has_id(&self, id: BlockId) -> bool {
        block_id_valid(id) && id < self.next_id
    }

    /// Returns the first id of a contiguous run of `n` fresh ids.
    pub fn alloc_id(&mut self, n: u32) -> Result<BlockId> {
        if n == 0 {
            return Err(Error::InvalidArgument("alloc_id(0)".into()));
        }
        let first = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(n)
            .ok_or_else(|| Error::InvalidArgument("block id space exhausted".into()))?;
        trace!("alloc_id({}) -> {}", n, first);
        Ok(first)
    }

    /// Semantically "free"; there is no free list in this design (see
    /// SPEC_FULL.md §9) so disposal never reclaims space.
    pub fn dispose(&mut self, _id: BlockId, _count: u32) -> Result<()> {
        Ok(())
    }

    pub fn read(&mut self, id: BlockId, dst: &mut [u8]) -> Result<()> {
        if !self.has_id(id) {
            return Err(Error::Corrupt(id));
        }
        debug_assert_eq!(dst.len(), self.block_size);
        self.file.seek(SeekFrom::Start(id as u64 * self.block_size as u64))?;
        self.file.read_exact(dst)?;
        Ok(())
    }

    pub fn write(&mut self, id: BlockId, src: &[u8]) -> Result<()> {
        if !block_id_valid(id) {
            return Err(Error::InvalidArgument("write to invalid block id".into()));
        }
        debug_assert_eq!(src.len(), self.block_size);
        self.file.seek(SeekFrom::Start(id as u64 * self.block_size as u64))?;
        self.file.write_all(src)?;
        if id >= self.next_id {
            self.next_id = id + 1;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flushes and drops the file handle. Further operations on this
    /// `BlockFile` will fail once this has been called; callers should
    /// discard it.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn create_then_reopen_recovers_next_id() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::remove_file(tmp.path()).ok();
        let path = tmp.path().to_path_buf();

        {
            let mut bf = BlockFile::open(&path, 64).unwrap();
            assert!(bf.created());
            assert_eq!(bf.next_id(), 1);
            let id = bf.alloc_id(2).unwrap();
            assert_eq!(id, 1);
            bf.write(1, &[1u8; 64]).unwrap();
            bf.write(2, &[2u8; 64]).unwrap();
        }

        {
            let bf = BlockFile::open(&path, 64).unwrap();
            assert!(!bf.created());
            assert_eq!(bf.next_id(), 3);
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn read_rejects_unallocated_id() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::remove_file(tmp.path()).ok();
        let mut bf = BlockFile::open(tmp.path(), 64).unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(bf.read(99, &mut buf), Err(Error::Corrupt(99))));
        std::fs::remove_file(tmp.path()).ok();
    }

    #[test]
    fn write_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::remove_file(tmp.path()).ok();
        let mut bf = BlockFile::open(tmp.path(), 64).unwrap();
        let id = bf.alloc_id(1).unwrap();
        let payload = [9u8; 64];
        bf.write(id, &payload).unwrap();
        let mut buf = [0u8; 64];
        bf.read(id, &mut buf).unwrap();
        assert_eq!(buf, payload);
        std::fs::remove_file(tmp.path()).ok();
    }
}
