//! Paged journal format.
//!
//! ```text
//! +----------------------+
//! | File header          |  64 bytes
//! +----------------------+
//! | Page 0               |  4096 bytes: 48 byte page header + payload
//! | Page 1               |
//! | ...                  |
//! +----------------------+
//! ```
//!
//! Every page describes itself (magic, version, type, record count, payload size and a BLAKE3
//! hash of the payload). Pages are appended through a bump allocator and rewritten in place when
//! dirty. The header is written last, so a page appended by an interrupted flush is not counted
//! and gets ignored on reload. Any page that fails validation discards the whole journal.

use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{ChunkId, ContentHash};

use super::{
    record::{self, Reader, ENTRY_RECORD_SIZE, INFO_RECORD_SIZE},
    CacheEntry, ChunkInfo, InfoUpdate, Journal, JournalIndex, JournalState, LoadedRecords,
};

pub(crate) const FILE_NAME: &str = "journal.bin";
const FILE_MAGIC: [u8; 8] = *b"CHKJRNL\0";
const FILE_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 64;

pub(crate) const PAGE_SIZE: usize = 4096;
const PAGE_MAGIC: u32 = 0x4547_4150;
const PAGE_VERSION: u16 = 1;
const PAGE_HEADER_SIZE: usize = 48;
const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

pub(crate) type PagedJournal = Journal<PagedState>;

impl PagedJournal {
    #[tracing::instrument(fields(directory = format_args!("{}", directory.display())), err(Debug))]
    pub(crate) fn open(directory: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(directory)?;
        Ok(Self::from_state(PagedState::load(directory.join(FILE_NAME))?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    ChunkInfo = 1,
    Entry = 2,
}

impl PageKind {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PageKind::ChunkInfo),
            2 => Some(PageKind::Entry),
            _ => None,
        }
    }

    fn record_size(self) -> usize {
        match self {
            PageKind::ChunkInfo => INFO_RECORD_SIZE,
            PageKind::Entry => ENTRY_RECORD_SIZE,
        }
    }

    fn max_records(self) -> usize {
        PAGE_PAYLOAD_SIZE / self.record_size()
    }
}

/// What occupies a page slot. The record itself lives in the [`JournalIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SlotKey {
    Info(ChunkId),
    Entry(ChunkId, u64, u64),
}

impl SlotKey {
    fn kind(&self) -> PageKind {
        match self {
            SlotKey::Info(_) => PageKind::ChunkInfo,
            SlotKey::Entry(..) => PageKind::Entry,
        }
    }
}

#[derive(Debug)]
struct Page {
    kind: PageKind,
    file_offset: u64,
    slots: Vec<Option<SlotKey>>,
    used: usize,
}

impl Page {
    fn new(kind: PageKind, file_offset: u64) -> Self {
        Self {
            kind,
            file_offset,
            slots: vec![None; kind.max_records()],
            used: 0,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Bitmap(Vec<u64>);

impl Bitmap {
    fn set(&mut self, bit: usize) {
        let word = bit / 64;
        if word >= self.0.len() {
            self.0.resize(word + 1, 0);
        }
        self.0[word] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: usize) {
        if let Some(word) = self.0.get_mut(bit / 64) {
            *word &= !(1 << (bit % 64));
        }
    }

    fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(index, &word)| {
            (0..64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| index * 64 + bit)
        })
    }

    fn is_empty(&self) -> bool {
        self.0.iter().all(|word| *word == 0)
    }

    fn reset(&mut self) {
        self.0.clear();
    }
}

#[derive(Debug)]
pub(crate) struct PagedState {
    path: PathBuf,
    index: JournalIndex,
    pages: Vec<Page>,
    slots: HashMap<SlotKey, (usize, usize)>,
    dirty: Bitmap,
    /// Pages with at least one free slot.
    free: Bitmap,
    next_page_offset: u64,
    /// Set by `invalidate_all`; the next flush truncates the file before writing pages.
    truncate: bool,
}

impl PagedState {
    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            index: JournalIndex::default(),
            pages: Vec::new(),
            slots: HashMap::new(),
            dirty: Bitmap::default(),
            free: Bitmap::default(),
            next_page_offset: HEADER_SIZE,
            truncate: false,
        }
    }

    fn load(path: PathBuf) -> io::Result<Self> {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("no journal found, starting empty");
                return Ok(Self::empty(path));
            }
            Err(e) => return Err(e),
        };

        match Self::parse(&bytes) {
            Ok((page_kinds, records)) => Ok(Self::from_records(path, &page_kinds, records)),
            Err(reason) => {
                tracing::warn!(
                    path = format_args!("{}", path.display()),
                    "discarding corrupt journal: {reason}"
                );
                let mut state = Self::empty(path);
                state.truncate = true;
                Ok(state)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn parse(bytes: &[u8]) -> Result<(Vec<PageKind>, LoadedRecords<(usize, usize)>), String> {
        let header = bytes
            .get(..HEADER_SIZE as usize)
            .ok_or_else(|| "file too small to contain header".to_owned())?;

        let mut reader = Reader(header);
        if reader.array::<8>() != FILE_MAGIC {
            return Err("invalid file magic".to_owned());
        }
        let version = reader.u32();
        if version != FILE_VERSION {
            return Err(format!("unsupported version {version} (expected {FILE_VERSION})"));
        }
        let page_size = reader.u32() as usize;
        if page_size != PAGE_SIZE {
            return Err(format!("unexpected page size {page_size}"));
        }
        let page_count = reader.u32() as usize;

        let mut page_kinds = Vec::with_capacity(page_count);
        let mut records = LoadedRecords::default();

        for page_index in 0..page_count {
            let start = HEADER_SIZE as usize + page_index * PAGE_SIZE;
            let page = bytes
                .get(start..start + PAGE_SIZE)
                .ok_or_else(|| format!("page {page_index} is truncated"))?;

            let (kind, count, payload) = Self::parse_page(page)
                .map_err(|reason| format!("page {page_index}: {reason}"))?;

            for (slot, buf) in payload.chunks_exact(kind.record_size()).take(count).enumerate() {
                match kind {
                    PageKind::ChunkInfo => {
                        let (id, info) = record::decode_info(buf);
                        records.infos.push((id, info, (page_index, slot)));
                    }
                    PageKind::Entry => {
                        let (id, entry) = record::decode_entry(buf);
                        records.entries.push((id, entry, (page_index, slot)));
                    }
                }
            }

            page_kinds.push(kind);
        }

        Ok((page_kinds, records))
    }

    fn parse_page(page: &[u8]) -> Result<(PageKind, usize, &[u8]), String> {
        let mut reader = Reader(&page[..PAGE_HEADER_SIZE]);

        if reader.u32() != PAGE_MAGIC {
            return Err("invalid page magic".to_owned());
        }
        let version = reader.u16();
        if version != PAGE_VERSION {
            return Err(format!("unsupported page version {version}"));
        }
        let tag = reader.u8();
        let kind = PageKind::from_u8(tag).ok_or_else(|| format!("unknown page type {tag}"))?;
        let _reserved = reader.u8();
        let count = reader.u32() as usize;
        let payload_size = reader.u32() as usize;
        let hash = ContentHash::from_bytes(reader.array());

        if count > kind.max_records() || payload_size != count * kind.record_size() {
            return Err(format!(
                "inconsistent record count {count} for payload size {payload_size}"
            ));
        }

        let payload = &page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + payload_size];
        if ContentHash::of(payload) != hash {
            return Err("payload hash mismatch".to_owned());
        }

        Ok((kind, count, payload))
    }

    fn from_records(
        path: PathBuf,
        page_kinds: &[PageKind],
        records: LoadedRecords<(usize, usize)>,
    ) -> Self {
        let mut state = Self::empty(path);

        for &kind in page_kinds {
            let file_offset = state.next_page_offset;
            state.next_page_offset += PAGE_SIZE as u64;
            state.pages.push(Page::new(kind, file_offset));
        }

        let repaired = records.repair();
        state.index = repaired.index;

        for (id, origin) in repaired.kept_infos {
            state.occupy(SlotKey::Info(id), origin);
        }
        for (id, entry, origin) in repaired.kept_entries {
            state.occupy(SlotKey::Entry(id, entry.offset, entry.size), origin);
        }
        for (page, _) in repaired.dropped {
            state.dirty.set(page);
        }

        for (index, page) in state.pages.iter().enumerate() {
            if page.used < page.slots.len() {
                state.free.set(index);
            }
        }

        tracing::info!(
            pages = state.pages.len(),
            chunks = state.index.info_count(),
            entries = state.index.entry_count(),
            "loaded journal"
        );

        state
    }

    fn occupy(&mut self, key: SlotKey, (page, slot): (usize, usize)) {
        let target = &mut self.pages[page];
        target.slots[slot] = Some(key);
        target.used += 1;
        self.slots.insert(key, (page, slot));
    }

    fn allocate(&mut self, key: SlotKey) {
        let kind = key.kind();
        let free_page = self.free.ones().find(|&page| self.pages[page].kind == kind);
        let page = match free_page {
            Some(page) => page,
            None => {
                let file_offset = self.next_page_offset;
                self.next_page_offset += PAGE_SIZE as u64;
                self.pages.push(Page::new(kind, file_offset));
                self.free.set(self.pages.len() - 1);
                self.pages.len() - 1
            }
        };

        let target = &mut self.pages[page];
        let Some(slot) = target.slots.iter().position(Option::is_none) else {
            unreachable!("page in the free bitmap has no free slot");
        };
        target.slots[slot] = Some(key);
        target.used += 1;

        if target.used == target.slots.len() {
            self.free.clear(page);
        }
        self.dirty.set(page);
        self.slots.insert(key, (page, slot));
    }

    fn release(&mut self, key: &SlotKey) {
        if let Some((page, slot)) = self.slots.remove(key) {
            let target = &mut self.pages[page];
            target.slots[slot] = None;
            target.used -= 1;
            self.free.set(page);
            self.dirty.set(page);
        }
    }

    fn encode_page(&self, page: &Page) -> Vec<u8> {
        let mut payload = Vec::with_capacity(PAGE_PAYLOAD_SIZE);
        let mut count: u32 = 0;

        for key in page.slots.iter().flatten() {
            match *key {
                SlotKey::Info(id) => {
                    if let Some(info) = self.index.chunk_info(&id) {
                        record::encode_info(&id, &info, &mut payload);
                        count += 1;
                    }
                }
                SlotKey::Entry(id, offset, size) => {
                    if let Some(entry) = self.index.entry(&id, offset, size) {
                        record::encode_entry(&id, &entry, &mut payload);
                        count += 1;
                    }
                }
            }
        }

        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.extend_from_slice(&PAGE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&PAGE_VERSION.to_le_bytes());
        buf.push(page.kind as u8);
        buf.push(0);
        buf.extend_from_slice(&count.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(ContentHash::of(&payload).as_bytes());
        buf.extend_from_slice(&payload);
        buf.resize(PAGE_SIZE, 0);
        buf
    }

    fn encode_header(&self) -> [u8; HEADER_SIZE as usize] {
        let mut header = [0; HEADER_SIZE as usize];
        header[..8].copy_from_slice(&FILE_MAGIC);
        header[8..12].copy_from_slice(&FILE_VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        header[16..20].copy_from_slice(&(self.pages.len() as u32).to_le_bytes());
        header
    }
}

impl JournalState for PagedState {
    fn index(&self) -> &JournalIndex {
        &self.index
    }

    fn set_chunk_info(&mut self, id: &ChunkId, info: &ChunkInfo) -> bool {
        match self.index.set_chunk_info(id, info) {
            InfoUpdate::Conflict => false,
            InfoUpdate::Inserted => {
                self.allocate(SlotKey::Info(*id));
                true
            }
            InfoUpdate::Updated => {
                if let Some(&(page, _)) = self.slots.get(&SlotKey::Info(*id)) {
                    self.dirty.set(page);
                }
                true
            }
            InfoUpdate::Unchanged => true,
        }
    }

    fn add_entry(&mut self, id: &ChunkId, entry: &CacheEntry) -> bool {
        if !self.index.add_entry(id, entry) {
            return false;
        }

        self.allocate(SlotKey::Entry(*id, entry.offset, entry.size));
        true
    }

    fn invalidate(&mut self, id: &ChunkId) -> Vec<CacheEntry> {
        let (had_info, entries) = self.index.remove(id);

        if had_info {
            self.release(&SlotKey::Info(*id));
        }
        for entry in &entries {
            self.release(&SlotKey::Entry(*id, entry.offset, entry.size));
        }

        entries
    }

    fn invalidate_all(&mut self) {
        let path = std::mem::take(&mut self.path);
        *self = Self::empty(path);
        self.truncate = true;
    }

    #[tracing::instrument(skip(self), fields(path = format_args!("{}", self.path.display())), err(Debug))]
    fn flush_dirty(&mut self) -> io::Result<()> {
        if !self.truncate && self.dirty.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        if self.truncate {
            file.set_len(HEADER_SIZE)?;
        }

        let dirty: Vec<usize> = self.dirty.ones().collect();
        for &page in &dirty {
            let buf = self.encode_page(&self.pages[page]);
            file.seek(SeekFrom::Start(self.pages[page].file_offset))?;
            file.write_all(&buf)?;
        }

        // Pages must be durable before the header counts them.
        file.sync_data()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.encode_header())?;
        file.sync_data()?;

        tracing::debug!(pages = dirty.len(), "flushed journal pages");

        self.dirty.reset();
        self.truncate = false;
        Ok(())
    }
}
