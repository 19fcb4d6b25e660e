//! Cache configuration.
//!
//! [`CacheConfig`] can be built in code or loaded from a TOML file. Missing fields fall back to
//! [`CacheConfig::default`].

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const GIB: u64 = 1 << 30;
const MIB: u64 = 1 << 20;

/// Backing storage implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Blocking file I/O with a double-buffered write-behind queue.
    Blocking,
    /// Memory-mapped backing files.
    Mapped,
}

/// Journal implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalBackend {
    Paged,
    Simple,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding the journal and the storage files.
    pub directory: PathBuf,
    /// Total arena size in bytes.
    pub cache_size: u64,
    /// Capacity of a single backing file.
    pub file_capacity: u64,
    /// Fraction of the arena that may be invalid before the whole cache is abandoned.
    pub abandon_threshold: f64,
    /// Interval of the periodic flush, in milliseconds.
    pub flush_interval_ms: u64,
    /// Drop all cached content on open.
    pub force_invalidate: bool,
    pub storage_backend: StorageBackend,
    pub journal_backend: JournalBackend,
    /// Writes up to this size are queued; larger writes go straight to disk.
    pub write_buffer_size: usize,
    pub max_concurrent_downloads: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: Self::default_directory(),
            cache_size: 4 * GIB,
            file_capacity: 2 * GIB,
            abandon_threshold: 0.5,
            flush_interval_ms: 10_000,
            force_invalidate: false,
            storage_backend: StorageBackend::Blocking,
            journal_backend: JournalBackend::Paged,
            write_buffer_size: 4 * MIB as usize,
            max_concurrent_downloads: 8,
        }
    }
}

impl CacheConfig {
    /// Platform cache directory, falling back to the working directory.
    pub fn default_directory() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chunk-install-cache")
    }

    /// Default configuration rooted at `directory`.
    pub fn with_directory<P>(directory: P) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            directory: directory.as_ref().to_owned(),
            ..Self::default()
        }
    }

    pub fn load<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        tracing::debug!("loading cache config from {}", path.as_ref().display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size == 0 || self.file_capacity == 0 {
            return Err(ConfigError::Invalid(
                "cache size and file capacity must be non-zero".to_owned(),
            ));
        }

        if self.file_capacity > self.cache_size {
            return Err(ConfigError::Invalid(format!(
                "file capacity {} exceeds cache size {}",
                self.file_capacity, self.cache_size
            )));
        }

        if !(self.abandon_threshold > 0.0 && self.abandon_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "abandon threshold {} is outside (0, 1]",
                self.abandon_threshold
            )));
        }

        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "flush interval must be non-zero".to_owned(),
            ));
        }

        if self.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid(
                "at least one concurrent download is required".to_owned(),
            ));
        }

        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Invalid byte count at which the arena gets abandoned.
    pub fn abandon_bytes(&self) -> u64 {
        (self.cache_size as f64 * self.abandon_threshold) as u64
    }
}
