//! On-demand install cache.
//!
//! Content is addressed by chunk ids. An [`InstallManager`] resolves requested packages into the
//! chunks they need, downloads the missing ones by content hash and stores them in a persistent
//! arena cache made of a journal and a storage backend. [`ContentHandle`]s keep installed chunks
//! from being purged.

mod chunk;
pub mod config;
mod content_handle;
pub mod download;
pub mod error;
mod journal;
mod manager;
pub mod metrics;
pub mod resolver;
mod storage;
pub mod strategy;

pub use chunk::{
    ChunkId, ChunkKind, ContentHash, OtherKind, PackageId, CHUNK_ID_SIZE, CONTENT_HASH_SIZE,
};
pub use content_handle::ContentHandle;
pub use journal::{CacheEntry, ChunkInfo};
pub use manager::{
    InstallCallback, InstallCompletion, InstallManager, InstallOptions, InstallProgress,
    MaintenanceCallback, ProgressCallback, RequestHandle, RequestId,
};
