//! Persistent index from chunk ids to chunk info and cached byte ranges.
//!
//! Two formats implement [`CacheJournal`]. The paged journal keeps a table of self-describing
//! fixed-size pages and rewrites only dirty pages; the simple journal rewrites one flat blob on
//! every flush. Corruption found while loading is repaired, never reported to callers.

mod paged;
mod record;
mod simple;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    config::{CacheConfig, JournalBackend},
    ChunkId, ChunkKind, ContentHash,
};

pub(crate) use paged::PagedJournal;
pub(crate) use simple::SimpleJournal;

/// Per chunk metadata. Every field is optional and merged on update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Version tag. Cached ranges are only valid for the tag they were written with.
    pub mod_tag: Option<u64>,
    pub raw_size: Option<u64>,
    pub raw_block_size: Option<u32>,
}

impl ChunkInfo {
    pub fn with_mod_tag(mod_tag: u64) -> Self {
        Self {
            mod_tag: Some(mod_tag),
            ..Self::default()
        }
    }
}

/// A cached byte range of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    /// Offset within the chunk.
    pub offset: u64,
    pub size: u64,
    /// Location in the backing storage.
    pub storage_offset: u64,
    pub storage_size: u64,
    /// Hash of the stored bytes.
    pub hash: ContentHash,
    pub kind: ChunkKind,
}

impl CacheEntry {
    pub fn storage_end(&self) -> u64 {
        self.storage_offset + self.storage_size
    }
}

pub trait CacheJournal: Send + Sync {
    /// Merges `info` into the stored chunk info. Returns `false`, changing nothing, when a mod
    /// tag is already stored and differs from the supplied one.
    fn set_chunk_info(&self, id: &ChunkId, info: &ChunkInfo) -> bool;

    fn try_get_chunk_info(&self, id: &ChunkId) -> Option<ChunkInfo>;

    /// Returns `false` if an entry already exists for the exact `(offset, size)` pair. Callers
    /// set the chunk info first; entries without one are dropped on reload.
    fn add_entry(&self, id: &ChunkId, entry: &CacheEntry) -> bool;

    fn try_get_entry(&self, id: &ChunkId, offset: u64, size: u64) -> Option<CacheEntry>;

    /// Drops the chunk info and every entry of `id`, returning the removed entries.
    fn invalidate(&self, id: &ChunkId) -> Vec<CacheEntry>;

    fn invalidate_all(&self);

    /// The callbacks run with the journal locked and must not call back into it.
    fn iterate_chunk_ids(&self, f: &mut dyn FnMut(&ChunkId, &ChunkInfo));

    fn iterate_entries(&self, f: &mut dyn FnMut(&ChunkId, &CacheEntry));

    fn iterate_entries_for_id(&self, id: &ChunkId, f: &mut dyn FnMut(&CacheEntry));

    /// `immediate` writes all dirty state before returning. Otherwise a background flush is
    /// scheduled; requests made while one is pending are coalesced.
    fn flush(&self, immediate: bool) -> io::Result<()>;
}

/// Opens the journal format selected by `config`.
pub fn open(config: &CacheConfig) -> io::Result<Box<dyn CacheJournal>> {
    std::fs::create_dir_all(&config.directory)?;

    let journal: Box<dyn CacheJournal> = match config.journal_backend {
        JournalBackend::Paged => Box::new(PagedJournal::open(&config.directory)?),
        JournalBackend::Simple => Box::new(SimpleJournal::open(&config.directory)?),
    };

    Ok(journal)
}

/// Outcome of merging a chunk info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InfoUpdate {
    Conflict,
    Inserted,
    Updated,
    Unchanged,
}

/// In-memory view shared by both journal formats.
#[derive(Debug, Default)]
pub(crate) struct JournalIndex {
    infos: HashMap<ChunkId, ChunkInfo>,
    entries: HashMap<ChunkId, BTreeMap<(u64, u64), CacheEntry>>,
}

impl JournalIndex {
    pub fn set_chunk_info(&mut self, id: &ChunkId, update: &ChunkInfo) -> InfoUpdate {
        let Some(info) = self.infos.get_mut(id) else {
            self.infos.insert(*id, *update);
            return InfoUpdate::Inserted;
        };

        if let (Some(current), Some(new)) = (info.mod_tag, update.mod_tag) {
            if current != new {
                return InfoUpdate::Conflict;
            }
        }

        let merged = ChunkInfo {
            mod_tag: update.mod_tag.or(info.mod_tag),
            raw_size: update.raw_size.or(info.raw_size),
            raw_block_size: update.raw_block_size.or(info.raw_block_size),
        };

        if merged == *info {
            InfoUpdate::Unchanged
        } else {
            *info = merged;
            InfoUpdate::Updated
        }
    }

    pub fn chunk_info(&self, id: &ChunkId) -> Option<ChunkInfo> {
        self.infos.get(id).copied()
    }

    pub fn add_entry(&mut self, id: &ChunkId, entry: &CacheEntry) -> bool {
        let ranges = self.entries.entry(*id).or_default();
        if ranges.contains_key(&(entry.offset, entry.size)) {
            return false;
        }

        ranges.insert((entry.offset, entry.size), *entry);
        true
    }

    pub fn entry(&self, id: &ChunkId, offset: u64, size: u64) -> Option<CacheEntry> {
        self.entries
            .get(id)
            .and_then(|ranges| ranges.get(&(offset, size)))
            .copied()
    }

    /// Removes `id`, returning whether it had a chunk info and the removed entries.
    pub fn remove(&mut self, id: &ChunkId) -> (bool, Vec<CacheEntry>) {
        let had_info = self.infos.remove(id).is_some();
        let entries = self
            .entries
            .remove(id)
            .map(|ranges| ranges.into_values().collect())
            .unwrap_or_default();

        (had_info, entries)
    }

    pub fn clear(&mut self) {
        self.infos.clear();
        self.entries.clear();
    }

    pub fn infos(&self) -> impl Iterator<Item = (&ChunkId, &ChunkInfo)> {
        self.infos.iter()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ChunkId, &CacheEntry)> {
        self.entries
            .iter()
            .flat_map(|(id, ranges)| ranges.values().map(move |entry| (id, entry)))
    }

    pub fn entries_of(&self, id: &ChunkId) -> impl Iterator<Item = &CacheEntry> {
        self.entries.get(id).into_iter().flat_map(BTreeMap::values)
    }

    pub fn info_count(&self) -> usize {
        self.infos.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }
}

/// Records read from disk, each tagged with where it came from.
#[derive(Debug)]
pub(crate) struct LoadedRecords<T> {
    pub infos: Vec<(ChunkId, ChunkInfo, T)>,
    pub entries: Vec<(ChunkId, CacheEntry, T)>,
}

impl<T> Default for LoadedRecords<T> {
    fn default() -> Self {
        Self {
            infos: Vec::new(),
            entries: Vec::new(),
        }
    }
}

/// Result of validating loaded records against each other.
#[derive(Debug)]
pub(crate) struct Repaired<T> {
    pub index: JournalIndex,
    pub kept_infos: Vec<(ChunkId, T)>,
    pub kept_entries: Vec<(ChunkId, CacheEntry, T)>,
    pub dropped: Vec<T>,
}

impl<T> LoadedRecords<T> {
    /// Drops chunk ids whose info is stored more than once, entries without a chunk info and
    /// entries repeating an `(offset, size)` pair.
    pub fn repair(self) -> Repaired<T> {
        let mut counts: HashMap<ChunkId, usize> = HashMap::new();
        for (id, _, _) in &self.infos {
            *counts.entry(*id).or_default() += 1;
        }
        let repeated: HashSet<ChunkId> = counts
            .into_iter()
            .filter_map(|(id, count)| (count > 1).then_some(id))
            .collect();

        let mut index = JournalIndex::default();
        let mut kept_infos = Vec::new();
        let mut kept_entries = Vec::new();
        let mut dropped = Vec::new();

        for (id, info, origin) in self.infos {
            if repeated.contains(&id) {
                dropped.push(origin);
            } else {
                index.infos.insert(id, info);
                kept_infos.push((id, origin));
            }
        }

        let mut orphans = 0;
        let mut duplicates = 0;
        for (id, entry, origin) in self.entries {
            if !index.infos.contains_key(&id) {
                orphans += 1;
                dropped.push(origin);
            } else if !index.add_entry(&id, &entry) {
                duplicates += 1;
                dropped.push(origin);
            } else {
                kept_entries.push((id, entry, origin));
            }
        }

        if !repeated.is_empty() || orphans > 0 || duplicates > 0 {
            tracing::warn!(
                repeated_ids = repeated.len(),
                orphans,
                duplicates,
                "invalidated inconsistent journal records"
            );
        }

        Repaired {
            index,
            kept_infos,
            kept_entries,
            dropped,
        }
    }
}

/// Journal state behind the lock of a [`Journal`].
pub(crate) trait JournalState: Send + 'static {
    fn index(&self) -> &JournalIndex;
    fn set_chunk_info(&mut self, id: &ChunkId, info: &ChunkInfo) -> bool;
    fn add_entry(&mut self, id: &ChunkId, entry: &CacheEntry) -> bool;
    fn invalidate(&mut self, id: &ChunkId) -> Vec<CacheEntry>;
    fn invalidate_all(&mut self);
    /// Writes every pending change to disk.
    fn flush_dirty(&mut self) -> io::Result<()>;
}

/// Lock and flush scheduling shared by the journal formats.
#[derive(Debug)]
pub(crate) struct Journal<S> {
    shared: Arc<Shared<S>>,
}

#[derive(Debug)]
struct Shared<S> {
    state: Mutex<S>,
    flush_scheduled: AtomicBool,
}

impl<S: JournalState> Journal<S> {
    pub(crate) fn from_state(state: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                flush_scheduled: AtomicBool::new(false),
            }),
        }
    }

    fn flush_now(shared: &Shared<S>) -> io::Result<()> {
        shared.flush_scheduled.store(false, Ordering::Release);
        shared.state.lock().unwrap().flush_dirty()
    }

    fn schedule_flush(&self) {
        if self.shared.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = self.shared.clone();
        let task = move || {
            if let Err(e) = Self::flush_now(&shared) {
                tracing::error!("background journal flush failed: {e}");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(task)),
            Err(_) => task(),
        }
    }
}

impl<S: JournalState> CacheJournal for Journal<S> {
    fn set_chunk_info(&self, id: &ChunkId, info: &ChunkInfo) -> bool {
        self.shared.state.lock().unwrap().set_chunk_info(id, info)
    }

    fn try_get_chunk_info(&self, id: &ChunkId) -> Option<ChunkInfo> {
        self.shared.state.lock().unwrap().index().chunk_info(id)
    }

    fn add_entry(&self, id: &ChunkId, entry: &CacheEntry) -> bool {
        self.shared.state.lock().unwrap().add_entry(id, entry)
    }

    fn try_get_entry(&self, id: &ChunkId, offset: u64, size: u64) -> Option<CacheEntry> {
        self.shared
            .state
            .lock()
            .unwrap()
            .index()
            .entry(id, offset, size)
    }

    fn invalidate(&self, id: &ChunkId) -> Vec<CacheEntry> {
        self.shared.state.lock().unwrap().invalidate(id)
    }

    fn invalidate_all(&self) {
        self.shared.state.lock().unwrap().invalidate_all();
    }

    fn iterate_chunk_ids(&self, f: &mut dyn FnMut(&ChunkId, &ChunkInfo)) {
        let state = self.shared.state.lock().unwrap();
        for (id, info) in state.index().infos() {
            f(id, info);
        }
    }

    fn iterate_entries(&self, f: &mut dyn FnMut(&ChunkId, &CacheEntry)) {
        let state = self.shared.state.lock().unwrap();
        for (id, entry) in state.index().entries() {
            f(id, entry);
        }
    }

    fn iterate_entries_for_id(&self, id: &ChunkId, f: &mut dyn FnMut(&CacheEntry)) {
        let state = self.shared.state.lock().unwrap();
        for entry in state.index().entries_of(id) {
            f(entry);
        }
    }

    fn flush(&self, immediate: bool) -> io::Result<()> {
        if immediate {
            Self::flush_now(&self.shared)
        } else {
            self.schedule_flush();
            Ok(())
        }
    }
}
