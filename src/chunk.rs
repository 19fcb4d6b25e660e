use std::fmt::{self, Debug, Display, LowerHex};

/// Size in bytes of a serialized [`ChunkId`].
pub const CHUNK_ID_SIZE: usize = 12;

/// Size in bytes of a [`ContentHash`].
pub const CONTENT_HASH_SIZE: usize = 32;

/// Identifier of a package in the package graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId(pub u64);

impl Debug for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackageId({:016x})", self.0)
    }
}

impl Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Content category of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChunkKind {
    PackageData,
    BulkData,
    OptionalBulkData,
    MemoryMappedBulkData,
    ShaderCode,
    /// Any tag without a named variant, built through [`ChunkKind::from_u8`].
    Other(OtherKind),
}

/// Tag of a [`ChunkKind`] outside the named categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OtherKind(u8);

impl OtherKind {
    pub fn tag(self) -> u8 {
        self.0
    }
}

impl ChunkKind {
    /// Auxiliary categories looked up next to every resolved package.
    pub const BULK_DATA_KINDS: [ChunkKind; 3] = [
        ChunkKind::BulkData,
        ChunkKind::OptionalBulkData,
        ChunkKind::MemoryMappedBulkData,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            ChunkKind::PackageData => 1,
            ChunkKind::BulkData => 2,
            ChunkKind::OptionalBulkData => 3,
            ChunkKind::MemoryMappedBulkData => 4,
            ChunkKind::ShaderCode => 5,
            ChunkKind::Other(other) => other.tag(),
        }
    }

    pub fn from_u8(tag: u8) -> Self {
        match tag {
            1 => ChunkKind::PackageData,
            2 => ChunkKind::BulkData,
            3 => ChunkKind::OptionalBulkData,
            4 => ChunkKind::MemoryMappedBulkData,
            5 => ChunkKind::ShaderCode,
            other => ChunkKind::Other(OtherKind(other)),
        }
    }
}

/// Opaque fixed-size chunk identifier.
///
/// Layout: 8 byte little-endian key, 2 byte little-endian index, one reserved byte and the
/// [`ChunkKind`] tag in the last byte.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId([u8; CHUNK_ID_SIZE]);

impl ChunkId {
    pub fn new(key: u64, index: u16, kind: ChunkKind) -> Self {
        let mut bytes = [0; CHUNK_ID_SIZE];
        bytes[..8].copy_from_slice(&key.to_le_bytes());
        bytes[8..10].copy_from_slice(&index.to_le_bytes());
        bytes[11] = kind.as_u8();
        Self(bytes)
    }

    /// Main chunk of a package.
    pub fn package(package: PackageId) -> Self {
        Self::new(package.0, 0, ChunkKind::PackageData)
    }

    pub fn from_bytes(bytes: [u8; CHUNK_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHUNK_ID_SIZE] {
        &self.0
    }

    pub fn key(&self) -> u64 {
        let mut key = [0; 8];
        key.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(key)
    }

    pub fn index(&self) -> u16 {
        u16::from_le_bytes([self.0[8], self.0[9]])
    }

    pub fn kind(&self) -> ChunkKind {
        ChunkKind::from_u8(self.0[11])
    }

    /// Same key and index, different category.
    pub fn with_kind(&self, kind: ChunkKind) -> Self {
        let mut bytes = self.0;
        bytes[11] = kind.as_u8();
        Self(bytes)
    }
}

impl Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({:x})", HexBytes(&self.0))
    }
}

impl Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", HexBytes(&self.0))
    }
}

/// BLAKE3 digest of a byte range.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContentHash([u8; CONTENT_HASH_SIZE]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; CONTENT_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_SIZE] {
        &self.0
    }

    /// Modification tag derived from the digest, used to version cached chunk ranges.
    pub fn tag(&self) -> u64 {
        let mut tag = [0; 8];
        tag.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(tag)
    }

    pub fn to_hex(&self) -> String {
        format!("{:x}", HexBytes(&self.0))
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:x})", HexBytes(&self.0))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", HexBytes(&self.0))
    }
}

struct HexBytes<'a>(&'a [u8]);

impl LowerHex for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_layout() {
        let id = ChunkId::new(0x0102_0304_0506_0708, 7, ChunkKind::BulkData);

        assert_eq!(id.key(), 0x0102_0304_0506_0708);
        assert_eq!(id.index(), 7);
        assert_eq!(id.kind(), ChunkKind::BulkData);
        assert_eq!(id.to_string(), "080706050403020107000002");

        let optional = id.with_kind(ChunkKind::OptionalBulkData);
        assert_eq!(optional.key(), id.key());
        assert_ne!(optional, id);
    }

    #[test]
    fn kind_tags_round_trip() {
        for tag in 0..=u8::MAX {
            assert_eq!(ChunkKind::from_u8(tag).as_u8(), tag);
        }

        assert_eq!(ChunkKind::from_u8(1), ChunkKind::PackageData);
        let ChunkKind::Other(other) = ChunkKind::from_u8(42) else {
            panic!("tag 42 has no named kind");
        };
        assert_eq!(other.tag(), 42);
        assert_eq!(ChunkKind::from_u8(42), ChunkKind::from_u8(42));
    }

    #[test]
    fn hash_tag_is_stable() {
        let hash = ContentHash::of(b"payload");
        assert_eq!(hash, ContentHash::of(b"payload"));
        assert_ne!(hash.tag(), ContentHash::of(b"other").tag());
        assert_eq!(hash.to_hex().len(), CONTENT_HASH_SIZE * 2);
    }
}
