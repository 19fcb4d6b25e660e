//! Flat journal format: a header followed by every chunk info record, then every entry record.
//!
//! The whole file is rewritten on flush, through a temporary file renamed over the old one.

use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::{ChunkId, ContentHash};

use super::{
    record::{self, Reader, ENTRY_RECORD_SIZE, INFO_RECORD_SIZE},
    CacheEntry, ChunkInfo, InfoUpdate, Journal, JournalIndex, JournalState, LoadedRecords,
};

pub(crate) const FILE_NAME: &str = "journal.simple.bin";
const FILE_MAGIC: [u8; 8] = *b"CHKJSMPL";
const FILE_VERSION: u32 = 1;
const HEADER_SIZE: usize = 8 + 4 + 4 + 4 + 32;

pub(crate) type SimpleJournal = Journal<SimpleState>;

impl SimpleJournal {
    #[tracing::instrument(fields(directory = format_args!("{}", directory.display())), err(Debug))]
    pub(crate) fn open(directory: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(directory)?;
        Ok(Self::from_state(SimpleState::load(directory.join(FILE_NAME))?))
    }
}

#[derive(Debug)]
pub(crate) struct SimpleState {
    path: PathBuf,
    index: JournalIndex,
    dirty: bool,
}

impl SimpleState {
    fn load(path: PathBuf) -> io::Result<Self> {
        let mut state = Self {
            path,
            index: JournalIndex::default(),
            dirty: false,
        };

        let bytes = match std::fs::read(&state.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("no journal found, starting empty");
                return Ok(state);
            }
            Err(e) => return Err(e),
        };

        match Self::parse(&bytes) {
            Ok(records) => {
                let repaired = records.repair();
                state.dirty = !repaired.dropped.is_empty();
                state.index = repaired.index;
                tracing::info!(
                    chunks = state.index.info_count(),
                    entries = state.index.entry_count(),
                    "loaded journal"
                );
            }
            Err(reason) => {
                tracing::warn!(
                    path = format_args!("{}", state.path.display()),
                    "discarding corrupt journal: {reason}"
                );
                state.dirty = true;
            }
        }

        Ok(state)
    }

    fn parse(bytes: &[u8]) -> Result<LoadedRecords<()>, String> {
        let header = bytes
            .get(..HEADER_SIZE)
            .ok_or_else(|| "file too small to contain header".to_owned())?;

        let mut reader = Reader(header);
        if reader.array::<8>() != FILE_MAGIC {
            return Err("invalid file magic".to_owned());
        }
        let version = reader.u32();
        if version != FILE_VERSION {
            return Err(format!("unsupported version {version} (expected {FILE_VERSION})"));
        }
        let info_count = reader.u32() as usize;
        let entry_count = reader.u32() as usize;
        let hash = ContentHash::from_bytes(reader.array());

        let payload = &bytes[HEADER_SIZE..];
        let infos_len = info_count * INFO_RECORD_SIZE;
        if payload.len() != infos_len + entry_count * ENTRY_RECORD_SIZE {
            return Err(format!(
                "payload of {} bytes does not hold {info_count} infos and {entry_count} entries",
                payload.len()
            ));
        }
        if ContentHash::of(payload) != hash {
            return Err("payload hash mismatch".to_owned());
        }

        let (infos, entries) = payload.split_at(infos_len);
        Ok(LoadedRecords {
            infos: infos
                .chunks_exact(INFO_RECORD_SIZE)
                .map(|buf| {
                    let (id, info) = record::decode_info(buf);
                    (id, info, ())
                })
                .collect(),
            entries: entries
                .chunks_exact(ENTRY_RECORD_SIZE)
                .map(|buf| {
                    let (id, entry) = record::decode_entry(buf);
                    (id, entry, ())
                })
                .collect(),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(
            self.index.info_count() * INFO_RECORD_SIZE
                + self.index.entry_count() * ENTRY_RECORD_SIZE,
        );
        for (id, info) in self.index.infos() {
            record::encode_info(id, info, &mut payload);
        }
        for (id, entry) in self.index.entries() {
            record::encode_entry(id, entry, &mut payload);
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&FILE_MAGIC);
        buf.extend_from_slice(&FILE_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.index.info_count() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.index.entry_count() as u32).to_le_bytes());
        buf.extend_from_slice(ContentHash::of(&payload).as_bytes());
        buf.extend_from_slice(&payload);
        buf
    }
}

impl JournalState for SimpleState {
    fn index(&self) -> &JournalIndex {
        &self.index
    }

    fn set_chunk_info(&mut self, id: &ChunkId, info: &ChunkInfo) -> bool {
        match self.index.set_chunk_info(id, info) {
            InfoUpdate::Conflict => false,
            InfoUpdate::Inserted | InfoUpdate::Updated => {
                self.dirty = true;
                true
            }
            InfoUpdate::Unchanged => true,
        }
    }

    fn add_entry(&mut self, id: &ChunkId, entry: &CacheEntry) -> bool {
        let added = self.index.add_entry(id, entry);
        self.dirty |= added;
        added
    }

    fn invalidate(&mut self, id: &ChunkId) -> Vec<CacheEntry> {
        let (had_info, entries) = self.index.remove(id);
        self.dirty |= had_info || !entries.is_empty();
        entries
    }

    fn invalidate_all(&mut self) {
        self.index.clear();
        self.dirty = true;
    }

    #[tracing::instrument(skip(self), fields(path = format_args!("{}", self.path.display())), err(Debug))]
    fn flush_dirty(&mut self) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&self.encode())?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        tracing::debug!(
            chunks = self.index.info_count(),
            entries = self.index.entry_count(),
            "rewrote journal"
        );

        self.dirty = false;
        Ok(())
    }
}
