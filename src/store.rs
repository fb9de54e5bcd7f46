//! The store facade (C6): ties the block file, block cache, B+ tree, and
//! value heap together behind `open`/`close` and the `get`/`put`/`has`/
//! `rename`/`find`/iteration API (spec.md §4.6).

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use log::{debug, error, info};

use crate::block::BlockFile;
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::hash::Fingerprint;
use crate::header::Header;
use crate::heap::Heap;
use crate::locator::{DataLocator, SizedLocator};
use crate::tree::{BTree, Cursor};

const DEFAULT_BLOCK_SIZE: u32 = 4096;
const DEFAULT_ORDER: u16 = 5;
const DEFAULT_BLOCK_CACHE_SIZE: usize = 1024;
const DEFAULT_NODE_CACHE_SIZE: usize = 1024;

/// Builder for store configuration, mirroring the fluent
/// `options()....build(path)` shape used elsewhere in this codebase.
#[derive(Debug, Clone)]
pub struct Options {
    block_size: u32,
    order: u16,
    block_cache_size: usize,
    node_cache_size: usize,
    uid: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            block_size: DEFAULT_BLOCK_SIZE,
            order: DEFAULT_ORDER,
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
            node_cache_size: DEFAULT_NODE_CACHE_SIZE,
            uid: 0,
        }
    }
}

impl Options {
    pub fn block_size(mut self, value: u32) -> Self {
        self.block_size = value;
        self
    }

    pub fn order(mut self, value: u16) -> Self {
        self.order = value;
        self
    }

    pub fn block_cache_size(mut self, value: usize) -> Self {
        self.block_cache_size = value;
        self
    }

    pub fn node_cache_size(mut self, value: usize) -> Self {
        self.node_cache_size = value;
        self
    }

    /// Reserves a small integer tag prepended to every hashed key, so
    /// multiple logical keyspaces can share one file (spec.md §4.6).
    pub fn uid(mut self, value: u32) -> Self {
        self.uid = value;
        self
    }

    pub fn build(self, path: impl AsRef<Path>) -> Result<Store> {
        Store::open(self, path)
    }
}

/// A streaming read cursor returned by `Store::find`, tracking how much of
/// an envelope's contents remain unread (spec.md §4.6 `get(search,
/// partial_len)`).
#[derive(Debug, Clone, Copy)]
pub struct Search {
    contents: SizedLocator,
}

impl Search {
    pub fn remaining(&self) -> usize {
        self.contents.contents_size() as usize
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

enum Direction {
    Forward,
    Reverse,
}

/// Iterates a store's entries in hash order (forward) or reverse hash order
/// (spec.md §4.6). Yields the 20-byte key fingerprint alongside the
/// materialized value, since the original user key is not recoverable from
/// its one-way hash.
pub struct Iter<'a> {
    store: &'a mut Store,
    cursor: Cursor,
    direction: Direction,
    started: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<(Fingerprint, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
        } else {
            let advanced = match self.direction {
                Direction::Forward => self.cursor.next(&mut self.store.tree),
                Direction::Reverse => self.cursor.prev(&mut self.store.tree),
            };
            match advanced {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }

        if self.cursor.is_end() {
            return None;
        }

        match self.cursor.entry(&mut self.store.tree) {
            Ok(Some((fp, locator))) => match self.store.heap.read_value(locator) {
                Ok(value) => Some(Ok((fp, value))),
                Err(e) => Some(Err(e)),
            },
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// The key/value store itself. Not `Send`/`Sync`: every layer below it
/// shares `Rc<RefCell<_>>` block handles with no internal locking, matching
/// the single-threaded cooperative model of spec.md §5.
pub struct Store {
    blocks: Rc<RefCell<BlockCache>>,
    tree: BTree<Fingerprint, DataLocator>,
    heap: Heap,
    uid: u32,
    block_size: u32,
    order: u16,
    open: bool,
}

impl Store {
    pub fn options() -> Options {
        Options::default()
    }

    fn open(options: Options, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = BlockFile::open(path, options.block_size as usize)?;
        let created = file.created();
        let blocks = Rc::new(RefCell::new(BlockCache::new(file, options.block_cache_size)));

        let header = {
            let block0 = blocks.borrow_mut().get(0)?;
            if created {
                info!("initializing new store header at {:?}", path);
                let header = Header::new(options.block_size, options.order);
                header.encode(block0.borrow_mut().data_mut())?;
                header
            } else {
                let header = Header::decode(block0.borrow().data())?;
                header.validate(options.block_size, options.order)?;
                debug!("opened existing store {:?} (root={})", path, header.tree_state.root_id);
                header
            }
        };

        let tree = BTree::new(options.order as usize, header.tree_state, blocks.clone(), options.node_cache_size);
        let heap = Heap::new(header.heap_state, blocks.clone());

        Ok(Store {
            blocks,
            tree,
            heap,
            uid: options.uid,
            block_size: options.block_size,
            order: options.order,
            open: true,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    fn fingerprint(&self, key: &[u8]) -> Fingerprint {
        Fingerprint::new(self.uid, key)
    }

    /// Writes the header, flushes the decoded-node cache into the block
    /// cache, then flushes the block cache (writing back every dirty block)
    /// and the underlying file.
    pub fn close(mut self) -> Result<()> {
        self.check_open()?;
        self.open = false;

        self.tree.flush()?;

        let header = Header {
            block_size: self.block_size,
            order: self.order,
            user_slots: vec![format!("uid:{}", self.uid)],
            tree_state: self.tree.state(),
            heap_state: self.heap.state(),
        };
        {
            let block0 = self.blocks.borrow_mut().get(0)?;
            header.encode(block0.borrow_mut().data_mut())?;
        }

        self.blocks.borrow_mut().flush()?;
        Ok(())
    }

    pub fn has(&mut self, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        let fp = self.fingerprint(key);
        Ok(self.tree.search(&fp)?.found)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_open()?;
        let fp = self.fingerprint(key);
        let lookup = self.tree.search(&fp)?;
        if !lookup.found {
            return Err(Error::NotFound);
        }
        let locator = lookup.node.borrow().values[lookup.pos];
        self.heap.read_value(locator)
    }

    /// Positions a streaming read cursor at the start of `key`'s value
    /// without materializing it, for use with `read_chunk`/`read_remainder`.
    pub fn find(&mut self, key: &[u8]) -> Result<Search> {
        self.check_open()?;
        let fp = self.fingerprint(key);
        let lookup = self.tree.search(&fp)?;
        if !lookup.found {
            return Err(Error::NotFound);
        }
        let locator = lookup.node.borrow().values[lookup.pos];
        let sized = self.heap.locate(locator)?;
        Ok(Search {
            contents: sized.contents(self.heap.block_size()),
        })
    }

    /// Reads up to `len` bytes from `search`, advancing it past what was
    /// read (spec.md §4.6 `get(search, partial_len)`).
    pub fn read_chunk(&mut self, search: &mut Search, len: usize) -> Result<Vec<u8>> {
        self.check_open()?;
        let (bytes, rest) = self.heap.read_chunk(search.contents, len)?;
        search.contents = rest;
        Ok(bytes)
    }

    /// Reads whatever is left of `search`'s value.
    pub fn read_remainder(&mut self, search: &mut Search) -> Result<Vec<u8>> {
        let len = search.remaining();
        self.read_chunk(search, len)
    }

    /// Inserts or overwrites `key -> value`. With `overwrite = false`, an
    /// existing key is reported as `AlreadyExists` instead.
    ///
    /// A 128-bit fingerprint collision between two different keys under the
    /// same `uid` is not detected; the second `put` silently overwrites the
    /// first's mapping (spec.md §9 open question).
    pub fn put(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        self.check_open()?;
        let fp = self.fingerprint(key);
        let lookup = self.tree.search(&fp)?;

        if lookup.found {
            if !overwrite {
                return Err(Error::AlreadyExists);
            }
            let old_locator = lookup.node.borrow().values[lookup.pos];
            let sized = self.heap.locate(old_locator)?;
            if Heap::fits_in_place(sized, value.len()) {
                self.heap.overwrite_in_place(sized, value)?;
                return Ok(());
            }
            debug!("put: value grew past its envelope, orphaning old envelope at block {}", old_locator.block_id());
        }

        let sized = self.heap.allocate(value)?;
        self.tree.insert(fp, sized.data_locator())?;
        Ok(())
    }

    /// Rewrites `old_key`'s tree entry under `new_key`, leaving the
    /// envelope untouched. If `new_key` already maps to something, that
    /// mapping is overwritten, matching `put`'s collision semantics
    /// (spec.md §9 open question).
    pub fn rename(&mut self, old_key: &[u8], new_key: &[u8]) -> Result<()> {
        self.check_open()?;
        let old_fp = self.fingerprint(old_key);
        let locator = self.tree.remove_leaf_entry(&old_fp)?.ok_or(Error::NotFound)?;
        let new_fp = self.fingerprint(new_key);
        self.tree.insert(new_fp, locator)?;
        Ok(())
    }

    /// Forward iterator, yielding entries in ascending fingerprint order.
    pub fn iter(&mut self) -> Result<Iter<'_>> {
        self.check_open()?;
        let cursor = Cursor::first(&mut self.tree)?;
        Ok(Iter {
            store: self,
            cursor,
            direction: Direction::Forward,
            started: false,
        })
    }

    /// Reverse iterator, yielding entries in descending fingerprint order.
    pub fn iter_rev(&mut self) -> Result<Iter<'_>> {
        self.check_open()?;
        let cursor = Cursor::last(&mut self.tree)?;
        Ok(Iter {
            store: self,
            cursor,
            direction: Direction::Reverse,
            started: false,
        })
    }

    /// Writes a Graphviz dump of the current tree shape, for debugging.
    pub fn dot_graph(&mut self, path: impl AsRef<Path>, display: bool) -> Result<()> {
        self.check_open()?;
        self.tree.dot_graph(path, display)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.open {
            error!("Store dropped without close(): pending writes may be lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> std::path::PathBuf {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        std::fs::remove_file(&path).ok();
        path
    }

    #[test]
    fn empty_open_has_and_get_miss() {
        let path = temp_path();
        let mut store = Store::options().block_size(512).build(&path).unwrap();
        assert!(!store.has(b"x").unwrap());
        assert!(matches!(store.get(b"x"), Err(Error::NotFound)));
        store.close().unwrap();

        let mut reopened = Store::options().block_size(512).build(&path).unwrap();
        assert!(!reopened.has(b"x").unwrap());
        reopened.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn basic_put_get_has() {
        let path = temp_path();
        let mut store = Store::options().block_size(512).build(&path).unwrap();
        store.put(b"foo", b"bar", true).unwrap();
        store.put(b"Mickey", b"Mouse", true).unwrap();

        assert!(store.has(b"foo").unwrap());
        assert!(store.has(b"Mickey").unwrap());
        assert_eq!(store.get(b"foo").unwrap(), b"bar");
        assert_eq!(store.get(b"Mickey").unwrap(), b"Mouse");
        assert!(matches!(store.get(b"Boston"), Err(Error::NotFound)));
        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn put_overwrite_false_on_existing_key_fails() {
        let path = temp_path();
        let mut store = Store::options().block_size(512).build(&path).unwrap();
        store.put(b"k", b"v1", true).unwrap();
        assert!(matches!(store.put(b"k", b"v2", false), Err(Error::AlreadyExists)));
        assert_eq!(store.get(b"k").unwrap(), b"v1");
        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn persistence_across_reopen_with_iteration() {
        let path = temp_path();
        let pairs: Vec<(&[u8], &[u8])> = vec![
            (b"foo", b"bar"),
            (b"Mickey", b"Mouse"),
            (b"color", b"blue"),
            (b"z", b"534"),
            (b"height", b"928m"),
            (b"aaa", b"12"),
        ];

        {
            let mut store = Store::options().block_size(512).build(&path).unwrap();
            for (k, v) in &pairs {
                store.put(k, v, true).unwrap();
            }
            store.close().unwrap();
        }

        let mut store = Store::options().block_size(512).build(&path).unwrap();
        for (k, v) in &pairs {
            assert_eq!(&store.get(k).unwrap(), v);
        }

        let collected: Vec<_> = store.iter().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(collected.len(), pairs.len());
        for w in collected.windows(2) {
            assert!(w[0].0.as_bytes() <= w[1].0.as_bytes());
        }

        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn streaming_read_in_chunks() {
        let path = temp_path();
        let mut store = Store::options().block_size(512).build(&path).unwrap();
        let value = b"Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat laborum.";
        store.put(b"longish", value, true).unwrap();

        let mut search = store.find(b"longish").unwrap();
        let c1 = store.read_chunk(&mut search, 6).unwrap();
        let c2 = store.read_chunk(&mut search, 6).unwrap();
        let c3 = store.read_chunk(&mut search, 6).unwrap();
        let c4 = store.read_chunk(&mut search, 4).unwrap();
        assert_eq!(&c1, b"Lorem ");
        assert_eq!(&c2, b"ipsum ");
        assert_eq!(&c3, b"dolor ");
        assert_eq!(&c4, b"sit ");

        let rest = store.read_remainder(&mut search).unwrap();
        assert!(rest.ends_with(b"laborum."));
        assert!(search.is_exhausted());

        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn large_values_survive_reopen() {
        use rand::RngCore;
        let path = temp_path();
        let mut rng = rand::thread_rng();
        let mut v1 = vec![0u8; 8192];
        let mut v2 = vec![0u8; 8192];
        rng.fill_bytes(&mut v1);
        rng.fill_bytes(&mut v2);

        {
            let mut store = Store::options().build(&path).unwrap();
            store.put(b"big1", &v1, true).unwrap();
            store.put(b"big2", &v2, true).unwrap();
            store.close().unwrap();
        }

        let mut store = Store::options().build(&path).unwrap();
        assert_eq!(store.get(b"big1").unwrap(), v1);
        assert_eq!(store.get(b"big2").unwrap(), v2);
        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bulk_random_pairs_survive_reopen_and_iterate() {
        use rand::Rng;
        let path = temp_path();
        let mut rng = rand::thread_rng();

        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for _ in 0..300 {
            let klen = rng.gen_range(1..=20);
            let vlen = rng.gen_range(1..=256);
            let key: Vec<u8> = (0..klen).map(|_| rng.gen()).collect();
            let value: Vec<u8> = (0..vlen).map(|_| rng.gen()).collect();
            pairs.push((key, value));
        }

        {
            let mut store = Store::options().build(&path).unwrap();
            for (k, v) in &pairs {
                store.put(k, v, true).unwrap();
            }
            store.close().unwrap();
        }

        let mut store = Store::options().build(&path).unwrap();
        for (k, v) in &pairs {
            assert_eq!(&store.get(k).unwrap(), v);
        }

        let collected: Vec<_> = store.iter().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(collected.len(), pairs.len());

        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rename_moves_value_to_new_key() {
        let path = temp_path();
        let mut store = Store::options().block_size(512).build(&path).unwrap();
        store.put(b"old", b"value", true).unwrap();
        store.rename(b"old", b"new").unwrap();
        assert!(!store.has(b"old").unwrap());
        assert_eq!(store.get(b"new").unwrap(), b"value");
        store.close().unwrap();
        std::fs::remove_file(&path).ok();
    }
}
