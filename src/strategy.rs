//! Arena caching policy over a journal and a storage backend.
//!
//! Cached ranges are appended at an arena cursor that only moves forward. Invalidated ranges are
//! not reclaimed individually: their size is added to an invalid byte count, and once that count
//! reaches the abandon threshold the whole cache is dropped and the cursor reset. `defrag` is the
//! one operation that compacts the arena in place.

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::{
    config::CacheConfig,
    error::CacheResult,
    journal::{self, CacheEntry, CacheJournal, ChunkInfo},
    metrics::MetricsSink,
    storage::{self, CacheStorage},
    ChunkId, ChunkKind, ContentHash,
};

/// Bytes read from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedChunk {
    pub bytes: Bytes,
    pub kind: ChunkKind,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeOptions {
    /// Stop once at least this many bytes were purged. Everything unreferenced goes when unset.
    pub bytes_to_purge: Option<u64>,
    /// Compact the arena after purging.
    pub defrag: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged_chunks: usize,
    pub purged_bytes: u64,
    pub defrag: Option<DefragReport>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DefragOptions {
    /// Skip the defrag when the space past the arena cursor already covers this many bytes.
    pub bytes_to_free: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DefragReport {
    /// Set when nothing was done, either because enough space was already free or because a
    /// live read still borrows bytes that would move.
    pub skipped: bool,
    pub moved_entries: usize,
    pub moved_bytes: u64,
    /// Entries dropped because their stored bytes no longer matched their hash.
    pub dropped_entries: usize,
    /// How far the arena cursor moved back.
    pub reclaimed_bytes: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked_entries: usize,
    pub verified_bytes: u64,
    pub corrupt_entries: usize,
    pub invalidated_chunks: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    pub capacity: u64,
    pub cursor: u64,
    pub invalid_bytes: u64,
    pub live_bytes: u64,
    pub chunk_count: usize,
    pub entry_count: usize,
}

#[derive(Debug, Default)]
struct Arena {
    cursor: u64,
    invalid_bytes: u64,
}

pub struct CacheStrategy {
    journal: Box<dyn CacheJournal>,
    storage: Box<dyn CacheStorage>,
    arena: Mutex<Arena>,
    abandon_bytes: u64,
    max_write_size: u64,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStrategy")
            .field("arena", &self.arena)
            .field("abandon_bytes", &self.abandon_bytes)
            .field("capacity", &self.storage.capacity())
            .finish_non_exhaustive()
    }
}

impl CacheStrategy {
    /// Opens the storage and journal selected by `config` and restores the arena state.
    #[tracing::instrument(skip_all, fields(directory = format_args!("{}", config.directory.display())), err(Debug))]
    pub fn open(config: &CacheConfig, metrics: Arc<dyn MetricsSink>) -> CacheResult<Self> {
        config.validate()?;

        let storage = storage::open(config)?;
        let journal = journal::open(config)?;

        let strategy = Self {
            journal,
            storage,
            arena: Mutex::new(Arena::default()),
            abandon_bytes: config.abandon_bytes(),
            max_write_size: config.file_capacity,
            metrics,
        };

        strategy.restore(config.force_invalidate)?;
        Ok(strategy)
    }

    fn restore(&self, force_invalidate: bool) -> io::Result<()> {
        let capacity = self.storage.capacity();
        let mut cursor = 0;
        let mut live_bytes = 0;
        let mut out_of_bounds = false;

        self.journal.iterate_entries(&mut |_, entry| {
            cursor = cursor.max(entry.storage_end());
            live_bytes += entry.storage_size;
            out_of_bounds |= entry.storage_end() > capacity;
        });

        let invalid_bytes = cursor.saturating_sub(live_bytes);
        let over_threshold = invalid_bytes > self.abandon_bytes;

        let reason = if force_invalidate {
            Some("invalidation forced by configuration")
        } else if self.storage.is_newly_created() {
            Some("storage was newly created")
        } else if out_of_bounds {
            Some("journal references bytes beyond the storage capacity")
        } else if over_threshold {
            Some("invalid bytes exceed the abandon threshold")
        } else {
            None
        };

        let mut arena = self.arena.lock().unwrap();
        match reason {
            Some(reason) => {
                tracing::info!("invalidating cache on open: {reason}");
                self.journal.invalidate_all();
                self.journal.flush(true)?;
                *arena = Arena::default();
            }
            None => {
                *arena = Arena {
                    cursor,
                    invalid_bytes,
                };
                tracing::info!(cursor, invalid_bytes, capacity, "restored cache arena");
            }
        }

        Ok(())
    }

    /// Returns the bytes of `size` bytes at `offset` of `id`, verified against the stored hash.
    /// A mismatch counts as a miss and drops everything cached for `id`.
    pub fn read_chunk(&self, id: &ChunkId, offset: u64, size: u64) -> Option<CachedChunk> {
        let mut arena = self.arena.lock().unwrap();
        let entry = self.lookup(id, offset, size)?;

        match self.storage.read(entry.storage_offset, entry.storage_size as usize) {
            Ok(bytes) if self.verify_read(&mut arena, id, &entry, &bytes) => {
                self.metrics.on_cache_hit(size);
                Some(CachedChunk {
                    bytes,
                    kind: entry.kind,
                })
            }
            Ok(_) => None,
            Err(e) => {
                self.read_failed(&mut arena, id, &e);
                None
            }
        }
    }

    /// Same as [`CacheStrategy::read_chunk`], copying `dest.len()` bytes into `dest`.
    pub fn read_chunk_into(&self, id: &ChunkId, offset: u64, dest: &mut [u8]) -> Option<ChunkKind> {
        let mut arena = self.arena.lock().unwrap();
        let size = dest.len() as u64;
        let entry = self.lookup(id, offset, size)?;

        match self.storage.read_into(entry.storage_offset, dest) {
            Ok(()) if self.verify_read(&mut arena, id, &entry, dest) => {
                self.metrics.on_cache_hit(size);
                Some(entry.kind)
            }
            Ok(()) => None,
            Err(e) => {
                self.read_failed(&mut arena, id, &e);
                None
            }
        }
    }

    fn lookup(&self, id: &ChunkId, offset: u64, size: u64) -> Option<CacheEntry> {
        let entry = self.journal.try_get_entry(id, offset, size);
        if entry.is_none() {
            self.metrics.on_cache_miss();
        }
        entry
    }

    fn verify_read(
        &self,
        arena: &mut Arena,
        id: &ChunkId,
        entry: &CacheEntry,
        bytes: &[u8],
    ) -> bool {
        if ContentHash::of(bytes) == entry.hash {
            return true;
        }

        tracing::warn!(%id, storage_offset = entry.storage_offset, "cached bytes do not match their hash");
        self.metrics.on_hash_mismatch();
        self.metrics.on_cache_miss();
        self.invalidate_locked(arena, id);
        false
    }

    fn read_failed(&self, arena: &mut Arena, id: &ChunkId, e: &io::Error) {
        tracing::warn!(%id, "failed to read cached chunk: {e}");
        self.metrics.on_cache_miss();
        self.invalidate_locked(arena, id);
    }

    /// Caches `bytes` as the range starting at `offset` of `id`.
    ///
    /// Returns whether the range is cached afterwards. Writes that do not fit in the remaining
    /// arena, or that exceed one backing file, are dropped.
    #[tracing::instrument(skip(self, bytes, info), fields(size = bytes.len()))]
    pub fn cache_chunk(
        &self,
        id: &ChunkId,
        offset: u64,
        bytes: Bytes,
        kind: ChunkKind,
        info: &ChunkInfo,
    ) -> bool {
        let size = bytes.len() as u64;
        let mut arena = self.arena.lock().unwrap();

        if !self.journal.set_chunk_info(id, info) {
            tracing::debug!("mod tag changed, dropping stale ranges");
            self.invalidate_locked(&mut arena, id);

            if !self.journal.set_chunk_info(id, info) {
                tracing::warn!("chunk info rejected after invalidation");
                return false;
            }
        }

        if self.journal.try_get_entry(id, offset, size).is_some() {
            return true;
        }

        let fits = size <= self.max_write_size
            && arena
                .cursor
                .checked_add(size)
                .is_some_and(|end| end <= self.storage.capacity());

        if !fits {
            tracing::debug!(cursor = arena.cursor, "not enough arena space, dropping write");
            self.metrics.on_cache_write_dropped(size);
            return false;
        }

        let entry = CacheEntry {
            offset,
            size,
            storage_offset: arena.cursor,
            storage_size: size,
            hash: ContentHash::of(&bytes),
            kind,
        };

        if let Err(e) = self.storage.write_async(entry.storage_offset, bytes) {
            tracing::warn!("failed to queue cache write: {e}");
            self.metrics.on_cache_write_dropped(size);
            return false;
        }

        self.journal.add_entry(id, &entry);
        arena.cursor += size;
        self.metrics.on_cache_write(size);
        true
    }

    /// Whether the whole chunk (`0..size`) is cached under `mod_tag`.
    pub fn is_cached(&self, id: &ChunkId, mod_tag: u64, size: u64) -> bool {
        let _arena = self.arena.lock().unwrap();

        self.journal
            .try_get_chunk_info(id)
            .is_some_and(|info| info.mod_tag == Some(mod_tag))
            && self.journal.try_get_entry(id, 0, size).is_some()
    }

    pub fn invalidate(&self, id: &ChunkId) {
        let mut arena = self.arena.lock().unwrap();
        self.invalidate_locked(&mut arena, id);
    }

    pub fn invalidate_all(&self) {
        let mut arena = self.arena.lock().unwrap();
        self.journal.invalidate_all();
        *arena = Arena::default();
    }

    fn invalidate_locked(&self, arena: &mut Arena, id: &ChunkId) {
        let removed: u64 = self
            .journal
            .invalidate(id)
            .iter()
            .map(|entry| entry.storage_size)
            .sum();

        if removed == 0 {
            return;
        }

        arena.invalid_bytes += removed;
        self.metrics.on_invalidate(removed);

        if arena.invalid_bytes >= self.abandon_bytes {
            tracing::info!(
                invalid_bytes = arena.invalid_bytes,
                threshold = self.abandon_bytes,
                "abandoning cache"
            );
            self.journal.invalidate_all();
            *arena = Arena::default();
            self.metrics.on_abandon();

            if let Err(e) = self.journal.flush(false) {
                tracing::error!("failed to schedule journal flush: {e}");
            }
        }
    }

    /// Makes every cached range durable. Storage is flushed before the journal that points
    /// into it.
    pub fn flush(&self) -> io::Result<()> {
        let _arena = self.arena.lock().unwrap();
        self.storage.flush()?;
        self.journal.flush(true)
    }

    /// Flushes every `interval` until the strategy is dropped.
    pub fn spawn_flush_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let strategy = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(strategy) = strategy.upgrade() else {
                    break;
                };

                match tokio::task::spawn_blocking(move || strategy.flush()).await {
                    Ok(Ok(())) => tracing::debug!("periodic cache flush done"),
                    Ok(Err(e)) => tracing::error!("periodic cache flush failed: {e}"),
                    Err(e) => tracing::error!("periodic cache flush task failed: {e}"),
                }
            }
        })
    }

    /// Invalidates chunks not in `referenced`, lowest storage offset first.
    #[tracing::instrument(skip(self, referenced), fields(referenced = referenced.len()), err(Debug))]
    pub fn purge(
        &self,
        referenced: &HashSet<ChunkId>,
        options: &PurgeOptions,
    ) -> CacheResult<PurgeReport> {
        let mut arena = self.arena.lock().unwrap();

        let mut candidates: HashMap<ChunkId, (u64, u64)> = HashMap::new();
        self.journal.iterate_chunk_ids(&mut |id, _| {
            if !referenced.contains(id) {
                candidates.insert(*id, (u64::MAX, 0));
            }
        });
        self.journal.iterate_entries(&mut |id, entry| {
            if let Some((first_offset, bytes)) = candidates.get_mut(id) {
                *first_offset = (*first_offset).min(entry.storage_offset);
                *bytes += entry.storage_size;
            }
        });

        let mut candidates: Vec<_> = candidates.into_iter().collect();
        candidates.sort_unstable_by_key(|(id, (first_offset, _))| (*first_offset, *id));

        let mut report = PurgeReport::default();
        for (id, _) in candidates {
            if options
                .bytes_to_purge
                .is_some_and(|target| report.purged_bytes >= target)
            {
                break;
            }

            // Purging never abandons the arena, that would drop referenced chunks too.
            let removed: u64 = self
                .journal
                .invalidate(&id)
                .iter()
                .map(|entry| entry.storage_size)
                .sum();

            arena.invalid_bytes += removed;
            report.purged_bytes += removed;
            report.purged_chunks += 1;
            self.metrics.on_invalidate(removed);
        }

        if options.defrag {
            report.defrag = Some(self.defrag_locked(&mut arena)?);
        } else {
            self.journal.flush(true)?;
        }

        tracing::info!(
            purged_chunks = report.purged_chunks,
            purged_bytes = report.purged_bytes,
            "purged cache"
        );

        Ok(report)
    }

    /// Compacts live entries to the start of the arena, dropping any whose bytes fail
    /// verification.
    #[tracing::instrument(skip(self), err(Debug))]
    pub fn defrag(&self, options: &DefragOptions) -> CacheResult<DefragReport> {
        let mut arena = self.arena.lock().unwrap();

        let free = self.storage.capacity().saturating_sub(arena.cursor);
        if options.bytes_to_free.is_some_and(|wanted| free >= wanted) {
            tracing::debug!(free, "enough free space, skipping defrag");
            return Ok(DefragReport {
                skipped: true,
                ..DefragReport::default()
            });
        }

        self.defrag_locked(&mut arena)
    }

    fn defrag_locked(&self, arena: &mut Arena) -> CacheResult<DefragReport> {
        if self.storage.is_pinned(0..arena.cursor) {
            tracing::warn!("cached bytes are borrowed by a reader, skipping defrag");
            self.journal.flush(true)?;
            return Ok(DefragReport {
                skipped: true,
                ..DefragReport::default()
            });
        }

        let mut infos = Vec::new();
        let mut live = Vec::new();
        self.journal
            .iterate_chunk_ids(&mut |id, info| infos.push((*id, *info)));
        self.journal
            .iterate_entries(&mut |id, entry| live.push((*id, *entry)));
        live.sort_unstable_by_key(|(_, entry)| entry.storage_offset);

        let mut report = DefragReport::default();
        let mut corrupt = HashSet::new();
        let mut kept = Vec::with_capacity(live.len());
        let mut cursor = 0;

        for (id, entry) in live {
            // Owned copy: the destination may overlap the source.
            let mut buf = vec![0; entry.storage_size as usize];
            let intact = self
                .storage
                .read_into(entry.storage_offset, &mut buf)
                .is_ok()
                && ContentHash::of(&buf) == entry.hash;

            if !intact {
                tracing::warn!(%id, storage_offset = entry.storage_offset, "dropping corrupt entry");
                report.dropped_entries += 1;
                corrupt.insert(id);
                continue;
            }

            if entry.storage_offset != cursor {
                self.storage.write_async(cursor, Bytes::from(buf))?;
                report.moved_entries += 1;
                report.moved_bytes += entry.storage_size;
            }

            kept.push((
                id,
                CacheEntry {
                    storage_offset: cursor,
                    ..entry
                },
            ));
            cursor += entry.storage_size;
        }

        self.storage.flush()?;

        self.journal.invalidate_all();
        for (id, info) in infos.iter().filter(|(id, _)| !corrupt.contains(id)) {
            self.journal.set_chunk_info(id, info);
        }

        let mut invalid_bytes = 0;
        for (id, entry) in &kept {
            if corrupt.contains(id) {
                invalid_bytes += entry.storage_size;
            } else {
                self.journal.add_entry(id, entry);
            }
        }
        self.journal.flush(true)?;

        report.reclaimed_bytes = arena.cursor.saturating_sub(cursor);
        *arena = Arena {
            cursor,
            invalid_bytes,
        };

        tracing::info!(
            moved_entries = report.moved_entries,
            reclaimed_bytes = report.reclaimed_bytes,
            dropped_entries = report.dropped_entries,
            "defragmented cache"
        );

        Ok(report)
    }

    /// Re-hashes every cached range and invalidates chunks with corrupt data.
    #[tracing::instrument(skip(self), err(Debug))]
    pub fn verify(&self) -> CacheResult<VerifyReport> {
        let mut arena = self.arena.lock().unwrap();

        let mut entries = Vec::new();
        self.journal
            .iterate_entries(&mut |id, entry| entries.push((*id, *entry)));

        let mut report = VerifyReport::default();
        let mut corrupt = HashSet::new();

        for (id, entry) in entries {
            report.checked_entries += 1;

            let mut buf = vec![0; entry.storage_size as usize];
            let intact = self
                .storage
                .read_into(entry.storage_offset, &mut buf)
                .is_ok()
                && ContentHash::of(&buf) == entry.hash;

            if intact {
                report.verified_bytes += entry.storage_size;
            } else {
                report.corrupt_entries += 1;
                corrupt.insert(id);
            }
        }

        report.invalidated_chunks = corrupt.len();
        for id in &corrupt {
            self.metrics.on_hash_mismatch();
            self.invalidate_locked(&mut arena, id);
        }

        if !corrupt.is_empty() {
            tracing::warn!(
                corrupt_entries = report.corrupt_entries,
                "cache verification found corrupt entries"
            );
            self.journal.flush(true)?;
        }

        Ok(report)
    }

    pub fn usage(&self) -> CacheUsage {
        let arena = self.arena.lock().unwrap();

        let mut usage = CacheUsage {
            capacity: self.storage.capacity(),
            cursor: arena.cursor,
            invalid_bytes: arena.invalid_bytes,
            ..CacheUsage::default()
        };

        self.journal.iterate_chunk_ids(&mut |_, _| usage.chunk_count += 1);
        self.journal.iterate_entries(&mut |_, entry| {
            usage.entry_count += 1;
            usage.live_bytes += entry.storage_size;
        });

        usage
    }
}

impl Drop for CacheStrategy {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!("failed to flush cache on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::{
        config::{JournalBackend, StorageBackend},
        metrics::CacheCounters,
    };

    const CAPACITY: u64 = 64 * 1024;

    fn config(dir: &TempDir) -> CacheConfig {
        let mut config = CacheConfig::with_directory(dir.path());
        config.cache_size = CAPACITY;
        config.file_capacity = CAPACITY / 2;
        config.write_buffer_size = 1024;
        config
    }

    /// One config per storage and journal backend pairing, each in its own directory.
    fn backend_configs(dir: &TempDir) -> Vec<CacheConfig> {
        [
            (StorageBackend::Blocking, JournalBackend::Paged),
            (StorageBackend::Mapped, JournalBackend::Simple),
        ]
        .into_iter()
        .map(|(storage, journal)| {
            let mut config = config(dir);
            config.directory = dir.path().join(format!("{storage:?}-{journal:?}"));
            config.storage_backend = storage;
            config.journal_backend = journal;
            config
        })
        .collect()
    }

    fn open(config: &CacheConfig) -> (CacheStrategy, Arc<CacheCounters>) {
        let counters = Arc::new(CacheCounters::default());
        let strategy = CacheStrategy::open(config, counters.clone()).unwrap();
        (strategy, counters)
    }

    fn id(key: u64) -> ChunkId {
        ChunkId::new(key, 0, ChunkKind::PackageData)
    }

    fn payload(key: u64, size: usize) -> Bytes {
        Bytes::from((0..size).map(|i| (i as u64 ^ key) as u8).collect::<Vec<_>>())
    }

    fn cache(strategy: &CacheStrategy, key: u64, size: usize) -> bool {
        strategy.cache_chunk(
            &id(key),
            0,
            payload(key, size),
            ChunkKind::PackageData,
            &ChunkInfo::with_mod_tag(key),
        )
    }

    #[test]
    fn cached_chunks_read_back_on_every_backend() {
        let dir = TempDir::new("strategy").unwrap();

        for config in backend_configs(&dir) {
            let (strategy, counters) = open(&config);
            assert!(cache(&strategy, 1, 100));
            assert!(cache(&strategy, 2, 3000));

            let chunk = strategy.read_chunk(&id(2), 0, 3000).unwrap();
            assert_eq!(chunk.bytes, payload(2, 3000));
            assert_eq!(chunk.kind, ChunkKind::PackageData);

            let mut dest = vec![0; 100];
            assert_eq!(
                strategy.read_chunk_into(&id(1), 0, &mut dest),
                Some(ChunkKind::PackageData)
            );
            assert_eq!(dest, payload(1, 100));

            assert!(strategy.read_chunk(&id(1), 0, 50).is_none());
            assert!(strategy.is_cached(&id(1), 1, 100));
            assert!(!strategy.is_cached(&id(1), 9, 100));

            let snapshot = counters.snapshot();
            assert_eq!(snapshot.hits, 2);
            assert_eq!(snapshot.misses, 1);
            assert_eq!(snapshot.writes, 2);
        }
    }

    #[test]
    fn invalidated_chunk_always_misses() {
        let dir = TempDir::new("strategy").unwrap();
        let (strategy, _) = open(&config(&dir));

        assert!(cache(&strategy, 1, 256));
        strategy.invalidate(&id(1));
        assert!(strategy.read_chunk(&id(1), 0, 256).is_none());
        assert_eq!(strategy.usage().invalid_bytes, 256);

        // Recaching appends at the cursor.
        assert!(cache(&strategy, 1, 256));
        assert_eq!(strategy.usage().cursor, 512);
    }

    #[test]
    fn mod_tag_change_replaces_ranges() {
        let dir = TempDir::new("strategy").unwrap();
        let (strategy, _) = open(&config(&dir));

        assert!(cache(&strategy, 1, 64));
        assert!(strategy.cache_chunk(
            &id(1),
            0,
            payload(7, 64),
            ChunkKind::PackageData,
            &ChunkInfo::with_mod_tag(2),
        ));

        assert!(!strategy.is_cached(&id(1), 1, 64));
        assert!(strategy.is_cached(&id(1), 2, 64));
        assert_eq!(strategy.read_chunk(&id(1), 0, 64).unwrap().bytes, payload(7, 64));
    }

    #[test]
    fn writes_that_do_not_fit_are_dropped() {
        let dir = TempDir::new("strategy").unwrap();
        let (strategy, counters) = open(&config(&dir));

        assert!(!cache(&strategy, 1, (CAPACITY / 2) as usize + 1));
        assert!(cache(&strategy, 2, (CAPACITY / 2) as usize));
        assert!(cache(&strategy, 3, (CAPACITY / 2) as usize - 10));
        assert!(!cache(&strategy, 4, 11));
        assert!(cache(&strategy, 5, 10));

        assert_eq!(counters.snapshot().dropped_writes, 2);
        assert_eq!(strategy.usage().cursor, CAPACITY);
    }

    #[test]
    fn crossing_abandon_threshold_empties_the_cache() {
        let dir = TempDir::new("strategy").unwrap();

        for mut config in backend_configs(&dir) {
            config.abandon_threshold = 0.25;
            let (strategy, counters) = open(&config);

            let quarter = (CAPACITY / 4) as usize;
            assert!(cache(&strategy, 1, quarter - 1));
            assert!(cache(&strategy, 2, 2));
            assert!(cache(&strategy, 3, 100));

            strategy.invalidate(&id(2));
            assert_eq!(strategy.usage().cursor, quarter as u64 + 101);

            strategy.invalidate(&id(1));
            let usage = strategy.usage();
            assert_eq!(usage.cursor, 0);
            assert_eq!(usage.entry_count, 0);
            assert!(strategy.read_chunk(&id(3), 0, 100).is_none());
            assert_eq!(counters.snapshot().abandons, 1);

            // The arena is reused from the start.
            assert!(cache(&strategy, 4, 100));
            assert_eq!(strategy.read_chunk(&id(4), 0, 100).unwrap().bytes, payload(4, 100));
        }
    }

    #[test]
    fn abandon_threshold_is_inclusive() {
        let dir = TempDir::new("strategy").unwrap();
        let mut config = config(&dir);
        config.abandon_threshold = 0.25;
        let (strategy, counters) = open(&config);

        let quarter = (CAPACITY / 4) as usize;
        assert!(cache(&strategy, 1, quarter - 1));
        assert!(cache(&strategy, 2, 1));
        assert!(cache(&strategy, 3, 100));

        strategy.invalidate(&id(1));
        assert_eq!(counters.snapshot().abandons, 0);

        strategy.invalidate(&id(2));
        assert_eq!(strategy.usage().cursor, 0);
        assert_eq!(counters.snapshot().abandons, 1);
    }

    #[test]
    fn reopen_invalidates_only_above_threshold() {
        let dir = TempDir::new("strategy").unwrap();
        let mut config = config(&dir);
        let quarter = CAPACITY / 4;

        {
            let (strategy, _) = open(&config);
            assert!(cache(&strategy, 1, quarter as usize));
            assert!(cache(&strategy, 2, 100));
            strategy.invalidate(&id(1));
        }

        config.abandon_threshold = 0.25;
        {
            let (strategy, _) = open(&config);
            let usage = strategy.usage();
            assert_eq!(usage.invalid_bytes, quarter);
            assert_eq!(usage.entry_count, 1);
        }

        config.abandon_threshold = 0.2;
        let (strategy, _) = open(&config);
        assert_eq!(strategy.usage().entry_count, 0);
        assert!(strategy.read_chunk(&id(2), 0, 100).is_none());
    }

    #[test]
    fn held_reads_survive_arena_reuse() {
        let dir = TempDir::new("strategy").unwrap();

        for mut config in backend_configs(&dir) {
            config.abandon_threshold = 0.001;
            let (strategy, counters) = open(&config);

            assert!(cache(&strategy, 1, 256));
            let held = strategy.read_chunk(&id(1), 0, 256).unwrap().bytes;

            // Abandons the arena, the next write lands where chunk 1 was.
            strategy.invalidate(&id(1));
            assert_eq!(strategy.usage().cursor, 0);
            let recached = cache(&strategy, 9, 256);

            assert_eq!(held, payload(1, 256));
            assert_eq!(ContentHash::of(&held), ContentHash::of(&payload(1, 256)));

            if config.storage_backend == StorageBackend::Mapped {
                // The held view pins its range until dropped.
                assert!(!recached);
                assert_eq!(counters.snapshot().dropped_writes, 1);
                drop(held);
                assert!(cache(&strategy, 9, 256));
            } else {
                assert!(recached);
            }

            assert_eq!(strategy.read_chunk(&id(9), 0, 256).unwrap().bytes, payload(9, 256));
        }
    }

    #[test]
    fn defrag_waits_for_held_reads() {
        let dir = TempDir::new("strategy").unwrap();
        let mut config = config(&dir);
        config.storage_backend = StorageBackend::Mapped;
        let (strategy, _) = open(&config);

        assert!(cache(&strategy, 1, 100));
        assert!(cache(&strategy, 2, 100));
        strategy.invalidate(&id(1));

        let held = strategy.read_chunk(&id(2), 0, 100).unwrap().bytes;
        let report = strategy.defrag(&DefragOptions::default()).unwrap();
        assert!(report.skipped);
        assert_eq!(strategy.usage().cursor, 200);
        assert_eq!(held, payload(2, 100));

        drop(held);
        let report = strategy.defrag(&DefragOptions::default()).unwrap();
        assert!(!report.skipped);
        assert_eq!(report.reclaimed_bytes, 100);
        assert_eq!(strategy.read_chunk(&id(2), 0, 100).unwrap().bytes, payload(2, 100));
    }

    #[test]
    fn corrupt_storage_is_a_miss() {
        let dir = TempDir::new("strategy").unwrap();
        let config = config(&dir);
        let (strategy, counters) = open(&config);

        assert!(cache(&strategy, 1, 128));
        assert!(cache(&strategy, 2, 128));
        strategy.flush().unwrap();

        // Overwrite the first chunk's bytes behind the journal's back.
        strategy
            .storage
            .write_async(0, Bytes::from(vec![0xff; 16]))
            .unwrap();

        assert!(strategy.read_chunk(&id(1), 0, 128).is_none());
        assert!(strategy.read_chunk(&id(1), 0, 128).is_none());
        assert!(strategy.read_chunk(&id(2), 0, 128).is_some());
        assert_eq!(counters.snapshot().hash_mismatches, 1);
    }

    #[test]
    fn reopen_restores_cursor_and_invalid_bytes() {
        let dir = TempDir::new("strategy").unwrap();

        for config in backend_configs(&dir) {
            {
                let (strategy, _) = open(&config);
                assert!(cache(&strategy, 1, 100));
                assert!(cache(&strategy, 2, 200));
                assert!(cache(&strategy, 3, 300));
                strategy.invalidate(&id(2));
            }

            let (strategy, _) = open(&config);
            let usage = strategy.usage();
            assert_eq!(usage.cursor, 600);
            assert_eq!(usage.invalid_bytes, 200);
            assert_eq!(usage.live_bytes, 400);
            assert_eq!(strategy.read_chunk(&id(3), 0, 300).unwrap().bytes, payload(3, 300));
            drop(strategy);

            let mut forced = config.clone();
            forced.force_invalidate = true;
            let (strategy, _) = open(&forced);
            assert_eq!(strategy.usage().entry_count, 0);
        }
    }

    #[test]
    fn purge_keeps_referenced_and_defrag_compacts() {
        let dir = TempDir::new("strategy").unwrap();

        for config in backend_configs(&dir) {
            let (strategy, _) = open(&config);

            for key in 1..=4 {
                assert!(cache(&strategy, key, 100 * key as usize));
            }

            let referenced = HashSet::from([id(2), id(4)]);
            let report = strategy
                .purge(
                    &referenced,
                    &PurgeOptions {
                        bytes_to_purge: None,
                        defrag: true,
                    },
                )
                .unwrap();

            assert_eq!(report.purged_chunks, 2);
            assert_eq!(report.purged_bytes, 400);
            let defrag = report.defrag.unwrap();
            assert_eq!(defrag.moved_entries, 2);
            assert_eq!(defrag.reclaimed_bytes, 400);

            let usage = strategy.usage();
            assert_eq!(usage.cursor, 600);
            assert_eq!(usage.invalid_bytes, 0);
            assert!(strategy.read_chunk(&id(1), 0, 100).is_none());
            assert_eq!(strategy.read_chunk(&id(2), 0, 200).unwrap().bytes, payload(2, 200));
            assert_eq!(strategy.read_chunk(&id(4), 0, 400).unwrap().bytes, payload(4, 400));
        }
    }

    #[test]
    fn purge_stops_after_requested_bytes() {
        let dir = TempDir::new("strategy").unwrap();
        let (strategy, _) = open(&config(&dir));

        for key in 1..=3 {
            assert!(cache(&strategy, key, 100));
        }

        let report = strategy
            .purge(
                &HashSet::new(),
                &PurgeOptions {
                    bytes_to_purge: Some(150),
                    defrag: false,
                },
            )
            .unwrap();

        // Oldest first: chunks 1 and 2 go, 3 stays.
        assert_eq!(report.purged_chunks, 2);
        assert!(strategy.read_chunk(&id(3), 0, 100).is_some());
        assert!(strategy.read_chunk(&id(1), 0, 100).is_none());
    }

    #[test]
    fn defrag_is_skipped_when_enough_space_is_free() {
        let dir = TempDir::new("strategy").unwrap();

        for config in backend_configs(&dir) {
            let (strategy, _) = open(&config);

            assert!(cache(&strategy, 1, 1000));
            assert!(cache(&strategy, 2, 1000));
            strategy.invalidate(&id(1));

            let report = strategy
                .defrag(&DefragOptions {
                    bytes_to_free: Some(CAPACITY - 2000),
                })
                .unwrap();
            assert!(report.skipped);
            assert_eq!(strategy.usage().cursor, 2000);

            let report = strategy
                .defrag(&DefragOptions {
                    bytes_to_free: Some(CAPACITY),
                })
                .unwrap();
            assert!(!report.skipped);
            assert_eq!(report.reclaimed_bytes, 1000);
            assert_eq!(strategy.read_chunk(&id(2), 0, 1000).unwrap().bytes, payload(2, 1000));
        }
    }

    #[test]
    fn verify_invalidates_corrupt_chunks() {
        let dir = TempDir::new("strategy").unwrap();

        for config in backend_configs(&dir) {
            let (strategy, _) = open(&config);

            assert!(cache(&strategy, 1, 64));
            assert!(cache(&strategy, 2, 64));
            strategy
                .storage
                .write_async(64, Bytes::from_static(b"garbage"))
                .unwrap();

            let report = strategy.verify().unwrap();
            assert_eq!(report.checked_entries, 2);
            assert_eq!(report.corrupt_entries, 1);
            assert_eq!(report.invalidated_chunks, 1);
            assert!(strategy.is_cached(&id(1), 1, 64));
            assert!(!strategy.is_cached(&id(2), 2, 64));
        }
    }
}
