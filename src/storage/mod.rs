//! Byte-addressable backing storage for the chunk cache.
//!
//! A single logical address space is split across fixed-capacity files (see
//! [`layout::StorageLayout`]). Storage knows nothing about chunks and never validates what it
//! returns; integrity checks belong to the journal and the strategy.

mod file;
pub(crate) mod layout;
mod mapped;

use std::{io, ops::Range};

use bytes::Bytes;

use crate::config::{CacheConfig, StorageBackend};

pub use file::FileStorage;
pub use mapped::MappedStorage;

pub trait CacheStorage: Send + Sync {
    /// Reads `size` bytes at `offset` into a new buffer.
    fn read(&self, offset: u64, size: usize) -> io::Result<Bytes>;

    /// Reads `dest.len()` bytes at `offset` into `dest`.
    fn read_into(&self, offset: u64, dest: &mut [u8]) -> io::Result<()>;

    /// Accepts a write without waiting for it to reach the disk. Fails without writing anything
    /// when the range overlaps bytes still borrowed from [`CacheStorage::read`].
    fn write_async(&self, offset: u64, data: Bytes) -> io::Result<()>;

    /// Whether a live zero-copy read borrows any byte of `range`.
    fn is_pinned(&self, _range: Range<u64>) -> bool {
        false
    }

    /// Makes every accepted write durable.
    fn flush(&self) -> io::Result<()>;

    /// Whether any backing file was created or resized when this storage was opened.
    fn is_newly_created(&self) -> bool;

    fn capacity(&self) -> u64;
}

/// Opens the storage backend selected by `config`.
pub fn open(config: &CacheConfig) -> io::Result<Box<dyn CacheStorage>> {
    let storage: Box<dyn CacheStorage> = match config.storage_backend {
        StorageBackend::Blocking => Box::new(FileStorage::open(
            &config.directory,
            config.cache_size,
            config.file_capacity,
            config.write_buffer_size,
        )?),
        StorageBackend::Mapped => Box::new(MappedStorage::open(
            &config.directory,
            config.cache_size,
            config.file_capacity,
        )?),
    };

    Ok(storage)
}
