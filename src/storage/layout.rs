use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use rangemap::RangeMap;

/// Part of a logical byte range that lives in a single backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub file: usize,
    pub file_offset: u64,
    pub len: usize,
    /// Position of this segment within the requested range.
    pub buf_offset: usize,
}

/// Partitioning of the logical address space into fixed-capacity backing files.
#[derive(Debug, Clone)]
pub(crate) struct StorageLayout {
    files: RangeMap<u64, usize>,
    file_sizes: Vec<u64>,
    capacity: u64,
}

impl StorageLayout {
    pub fn new(capacity: u64, file_capacity: u64) -> Self {
        let mut files = RangeMap::new();
        let mut file_sizes = Vec::new();
        let mut start = 0;

        while start < capacity {
            let end = (start + file_capacity).min(capacity);
            files.insert(start..end, file_sizes.len());
            file_sizes.push(end - start);
            start = end;
        }

        Self {
            files,
            file_sizes,
            capacity,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn file_sizes(&self) -> &[u64] {
        &self.file_sizes
    }

    pub fn file_path(directory: &Path, index: usize) -> PathBuf {
        directory.join(format!("cache.{index}.bin"))
    }

    /// Splits `offset..offset + size` at file boundaries. A range may touch at most two files.
    pub fn segments(&self, offset: u64, size: usize) -> io::Result<Vec<Segment>> {
        let end = offset
            .checked_add(size as u64)
            .filter(|end| *end <= self.capacity)
            .ok_or_else(|| Self::out_of_range(offset, size))?;

        let mut segments = Vec::with_capacity(2);
        let mut cursor = offset;

        while cursor < end {
            let (range, &file) = self
                .files
                .get_key_value(&cursor)
                .ok_or_else(|| Self::out_of_range(offset, size))?;

            let len = (range.end.min(end) - cursor) as usize;
            segments.push(Segment {
                file,
                file_offset: cursor - range.start,
                len,
                buf_offset: (cursor - offset) as usize,
            });
            cursor += len as u64;
        }

        if segments.len() > 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {offset}+{size} spans more than two backing files"),
            ));
        }

        Ok(segments)
    }

    /// Opens (creating or resizing as needed) every backing file. The flag reports whether any
    /// file had to be created or resized.
    pub fn open_files(&self, directory: &Path) -> io::Result<(Vec<File>, bool)> {
        std::fs::create_dir_all(directory)?;

        let mut newly_created = false;
        let mut files = Vec::with_capacity(self.file_sizes.len());

        for (index, &size) in self.file_sizes.iter().enumerate() {
            let path = Self::file_path(directory, index);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            if file.metadata()?.len() != size {
                tracing::info!(
                    path = format_args!("{}", path.display()),
                    size,
                    "resizing cache storage file"
                );
                file.set_len(size)?;
                newly_created = true;
            }

            files.push(file);
        }

        Ok((files, newly_created))
    }

    fn out_of_range(offset: u64, size: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("range {offset}+{size} is outside the cache storage"),
        )
    }
}
