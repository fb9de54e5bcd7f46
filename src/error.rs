use std::io;
use thiserror::Error;

/// The error taxonomy surfaced by every fallible store operation.
///
/// `NotFound` is always a normal return from `get`/`find`/`has`, never a
/// propagated failure from a lower layer. `Corrupt` and `Io` leave the store
/// open but in an undefined state; callers should close it.
#[derive(Debug, Error)]
pub enum Error {
    /// Key absent. Only ever returned from `get`/`find`.
    #[error("key not found")]
    NotFound,

    /// `put` with `overwrite = false` on a key that already exists.
    #[error("key already exists")]
    AlreadyExists,

    /// A block's contents failed a codec or invariant check.
    #[error("corrupt block {0}")]
    Corrupt(u32),

    /// The underlying file failed a read, write, or seek.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Header major/minor, block size, or order did not match what the
    /// caller requested, or the magic bytes were wrong.
    #[error("version mismatch: {0}")]
    BadVersion(String),

    /// Operation attempted on a store that is not open.
    #[error("store is not open")]
    NotOpen,

    /// A key, path, or configuration value was rejected on its own merits
    /// (too long, empty, zero, etc).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
