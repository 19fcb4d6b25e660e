use std::io::Error as IoError;

use reqwest::Error as ReqError;
use thiserror::Error as ThisError;
use tokio::task::JoinError;

use crate::{ChunkId, ContentHash, PackageId};

pub type CacheResult<T> = Result<T, CacheError>;
pub type InstallResult<T> = Result<T, InstallError>;

/// Error reported to the caller of an install request.
#[derive(Debug, ThisError)]
pub enum InstallError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("unknown chunk ids: {} missing packages, {} missing chunks", packages.len(), chunks.len())]
    UnknownChunkId {
        packages: Vec<PackageId>,
        chunks: Vec<ChunkId>,
    },
    #[error("chunk read error: {0}")]
    ReadError(#[from] DownloadError),
    #[error("request cancelled")]
    Cancelled,
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Failure of a single chunk download.
#[derive(Debug, ThisError)]
pub enum DownloadError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("hash mismatch for chunk {id}: expected {expected}, got {actual}")]
    HashMismatch {
        id: ChunkId,
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("download task joining error: {0}")]
    JoinTask(#[from] JoinError),
    #[error("download cancelled")]
    Cancelled,
}

#[derive(Debug, ThisError)]
pub enum TransportError {
    #[error("download request error: {0}")]
    Request(#[from] ReqError),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("invalid chunk URL: {0}")]
    InvalidUrl(String),
}

/// Error returned by cache maintenance and by opening the cache.
#[derive(Debug, ThisError)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] IoError),
    #[error("background task joining error: {0}")]
    JoinTask(#[from] JoinError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] IoError),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
