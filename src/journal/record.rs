//! Fixed-size little-endian encoding of journal records, shared by both journal formats.

use crate::{
    chunk::{CHUNK_ID_SIZE, CONTENT_HASH_SIZE},
    ChunkId, ChunkKind, ContentHash,
};

use super::{CacheEntry, ChunkInfo};

pub(crate) const INFO_RECORD_SIZE: usize = CHUNK_ID_SIZE + 1 + 8 + 8 + 4;
pub(crate) const ENTRY_RECORD_SIZE: usize = CHUNK_ID_SIZE + 1 + 8 * 4 + CONTENT_HASH_SIZE;

const HAS_MOD_TAG: u8 = 1;
const HAS_RAW_SIZE: u8 = 1 << 1;
const HAS_RAW_BLOCK_SIZE: u8 = 1 << 2;

pub(crate) fn encode_info(id: &ChunkId, info: &ChunkInfo, out: &mut Vec<u8>) {
    let mut flags = 0;
    if info.mod_tag.is_some() {
        flags |= HAS_MOD_TAG;
    }
    if info.raw_size.is_some() {
        flags |= HAS_RAW_SIZE;
    }
    if info.raw_block_size.is_some() {
        flags |= HAS_RAW_BLOCK_SIZE;
    }

    out.extend_from_slice(id.as_bytes());
    out.push(flags);
    out.extend_from_slice(&info.mod_tag.unwrap_or_default().to_le_bytes());
    out.extend_from_slice(&info.raw_size.unwrap_or_default().to_le_bytes());
    out.extend_from_slice(&info.raw_block_size.unwrap_or_default().to_le_bytes());
}

/// Decodes one chunk info record. `buf` must hold exactly [`INFO_RECORD_SIZE`] bytes.
pub(crate) fn decode_info(buf: &[u8]) -> (ChunkId, ChunkInfo) {
    let mut reader = Reader(buf);
    let id = ChunkId::from_bytes(reader.array());
    let flags = reader.u8();
    let mod_tag = reader.u64();
    let raw_size = reader.u64();
    let raw_block_size = reader.u32();

    let info = ChunkInfo {
        mod_tag: (flags & HAS_MOD_TAG != 0).then_some(mod_tag),
        raw_size: (flags & HAS_RAW_SIZE != 0).then_some(raw_size),
        raw_block_size: (flags & HAS_RAW_BLOCK_SIZE != 0).then_some(raw_block_size),
    };

    (id, info)
}

pub(crate) fn encode_entry(id: &ChunkId, entry: &CacheEntry, out: &mut Vec<u8>) {
    out.extend_from_slice(id.as_bytes());
    out.push(entry.kind.as_u8());
    out.extend_from_slice(&entry.offset.to_le_bytes());
    out.extend_from_slice(&entry.size.to_le_bytes());
    out.extend_from_slice(&entry.storage_offset.to_le_bytes());
    out.extend_from_slice(&entry.storage_size.to_le_bytes());
    out.extend_from_slice(entry.hash.as_bytes());
}

/// Decodes one cache entry record. `buf` must hold exactly [`ENTRY_RECORD_SIZE`] bytes.
pub(crate) fn decode_entry(buf: &[u8]) -> (ChunkId, CacheEntry) {
    let mut reader = Reader(buf);
    let id = ChunkId::from_bytes(reader.array());
    let kind = ChunkKind::from_u8(reader.u8());

    let entry = CacheEntry {
        offset: reader.u64(),
        size: reader.u64(),
        storage_offset: reader.u64(),
        storage_size: reader.u64(),
        hash: ContentHash::from_bytes(reader.array()),
        kind,
    };

    (id, entry)
}

/// Little-endian cursor over a buffer whose length the caller already checked.
pub(crate) struct Reader<'a>(pub &'a [u8]);

impl Reader<'_> {
    pub fn array<const N: usize>(&mut self) -> [u8; N] {
        let (head, tail) = self.0.split_at(N);
        self.0 = tail;
        let mut out = [0; N];
        out.copy_from_slice(head);
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    pub fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.array())
    }
}
