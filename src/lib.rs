//! An embedded, single-file, on-disk B+ tree key/value store.
//!
//! Four layers interlock behind [`Store`]: a flat [`block`] file, a
//! write-back [`cache`] enforcing at-most-one-live-block-per-id, a
//! persistent, leaf-linked [`tree`], and a [`heap`] of length-prefixed
//! value envelopes. Keys are hashed to a fixed-size [`hash::Fingerprint`]
//! before ever reaching the tree.
//!
//! ```no_run
//! use kvault::Store;
//!
//! # fn main() -> kvault::Result<()> {
//! let mut store = Store::options().build("example.kv")?;
//! store.put(b"foo", b"bar", true)?;
//! assert_eq!(store.get(b"foo")?, b"bar");
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod cache;
pub mod codec;
pub mod error;
pub mod hash;
pub mod header;
pub mod heap;
pub mod locator;
pub mod store;
pub mod tree;

pub use codec::Codec;
pub use error::{Error, Result};
pub use hash::Fingerprint;
pub use store::{Options, Search, Store};
