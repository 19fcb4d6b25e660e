use std::{
    collections::BTreeMap,
    fs::File,
    io,
    ops::Range,
    path::Path,
    ptr,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use memmap2::MmapRaw;

use super::{
    layout::{Segment, StorageLayout},
    CacheStorage,
};

/// Storage backed by memory-mapped files.
///
/// Reads that stay within one backing file return a zero-copy view of the mapping. The view pins
/// its range until dropped: writes overlapping a pinned range are refused, so the bytes a view
/// hands out never change underneath it.
#[derive(Debug)]
pub struct MappedStorage {
    layout: StorageLayout,
    maps: Vec<Arc<MappedFile>>,
    /// Held by every access to the mapping.
    pins: Arc<Mutex<Pins>>,
    newly_created: bool,
}

/// Logical ranges borrowed by live views.
#[derive(Debug, Default)]
struct Pins {
    next_token: u64,
    ranges: BTreeMap<u64, Range<u64>>,
}

impl Pins {
    fn pin(&mut self, range: Range<u64>) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.ranges.insert(token, range);
        token
    }

    fn overlaps(&self, range: &Range<u64>) -> bool {
        self.ranges
            .values()
            .any(|pinned| pinned.start < range.end && range.start < pinned.end)
    }
}

/// Releases a pinned range on drop.
struct PinGuard {
    pins: Arc<Mutex<Pins>>,
    token: u64,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pins.lock().unwrap().ranges.remove(&self.token);
    }
}

#[derive(Debug)]
struct MappedFile {
    map: MmapRaw,
    // Kept open for the lifetime of the mapping.
    _file: File,
}

/// Zero-copy window into a mapped file.
struct MappedView {
    file: Arc<MappedFile>,
    offset: usize,
    len: usize,
    _pin: PinGuard,
}

impl AsRef<[u8]> for MappedView {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: the range was bounds-checked against the file size by the layout, the mapping
        // lives as long as `self.file` and no write reaches the range while `_pin` is held.
        unsafe { std::slice::from_raw_parts(self.file.map.as_ptr().add(self.offset), self.len) }
    }
}

impl MappedStorage {
    #[tracing::instrument(fields(directory = format_args!("{}", directory.display())), err(Debug))]
    pub fn open(directory: &Path, capacity: u64, file_capacity: u64) -> io::Result<Self> {
        let layout = StorageLayout::new(capacity, file_capacity);
        let (files, newly_created) = layout.open_files(directory)?;

        let maps = files
            .into_iter()
            .map(|file| {
                let map = MmapRaw::map_raw(&file)?;
                Ok(Arc::new(MappedFile { map, _file: file }))
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            layout,
            maps,
            pins: Arc::default(),
            newly_created,
        })
    }
}

impl CacheStorage for MappedStorage {
    fn read(&self, offset: u64, size: usize) -> io::Result<Bytes> {
        let segments = self.layout.segments(offset, size)?;

        if let [segment] = segments.as_slice() {
            let token = self.pins.lock().unwrap().pin(offset..offset + size as u64);
            let view = MappedView {
                file: self.maps[segment.file].clone(),
                offset: segment.file_offset as usize,
                len: segment.len,
                _pin: PinGuard {
                    pins: self.pins.clone(),
                    token,
                },
            };
            return Ok(Bytes::from_owner(view));
        }

        let mut buf = vec![0; size];
        self.read_into(offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn read_into(&self, offset: u64, dest: &mut [u8]) -> io::Result<()> {
        let segments = self.layout.segments(offset, dest.len())?;
        let _pins = self.pins.lock().unwrap();

        for Segment {
            file,
            file_offset,
            len,
            buf_offset,
        } in segments
        {
            let map = &self.maps[file].map;
            // SAFETY: bounds were checked by the layout against the mapped file size.
            unsafe {
                ptr::copy_nonoverlapping(
                    map.as_ptr().add(file_offset as usize),
                    dest[buf_offset..].as_mut_ptr(),
                    len,
                );
            }
        }

        Ok(())
    }

    fn write_async(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let segments = self.layout.segments(offset, data.len())?;
        let pins = self.pins.lock().unwrap();

        if pins.overlaps(&(offset..offset + data.len() as u64)) {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "range is borrowed by a live read",
            ));
        }

        for Segment {
            file,
            file_offset,
            len,
            buf_offset,
        } in segments
        {
            let map = &self.maps[file].map;
            // SAFETY: bounds were checked by the layout against the mapped file size.
            unsafe {
                ptr::copy_nonoverlapping(
                    data[buf_offset..].as_ptr(),
                    map.as_mut_ptr().add(file_offset as usize),
                    len,
                );
            }
        }

        Ok(())
    }

    fn is_pinned(&self, range: Range<u64>) -> bool {
        self.pins.lock().unwrap().overlaps(&range)
    }

    fn flush(&self) -> io::Result<()> {
        let _pins = self.pins.lock().unwrap();
        self.maps.iter().try_for_each(|file| file.map.flush())
    }

    fn is_newly_created(&self) -> bool {
        self.newly_created
    }

    fn capacity(&self) -> u64 {
        self.layout.capacity()
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn live_views_keep_their_bytes() {
        let dir = TempDir::new("mapped").unwrap();
        let storage = MappedStorage::open(dir.path(), 2048, 1024).unwrap();

        storage.write_async(0, Bytes::from(vec![1; 64])).unwrap();
        let view = storage.read(0, 64).unwrap();
        assert!(storage.is_pinned(32..40));
        assert!(!storage.is_pinned(64..128));

        let err = storage.write_async(32, Bytes::from(vec![2; 64])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        storage.write_async(64, Bytes::from(vec![3; 64])).unwrap();
        assert!(view.iter().all(|b| *b == 1));

        drop(view);
        assert!(!storage.is_pinned(0..2048));
        storage.write_async(32, Bytes::from(vec![2; 64])).unwrap();
        assert_eq!(&storage.read(30, 4).unwrap()[..], &[1, 1, 2, 2]);
    }

    #[test]
    fn reads_spanning_files_are_copies() {
        let dir = TempDir::new("mapped").unwrap();
        let storage = MappedStorage::open(dir.path(), 2048, 1024).unwrap();

        storage
            .write_async(1020, Bytes::from_static(b"boundary"))
            .unwrap();
        let copy = storage.read(1020, 8).unwrap();
        assert!(!storage.is_pinned(0..2048));

        storage.write_async(1020, Bytes::from_static(b"BOUNDARY")).unwrap();
        assert_eq!(&copy[..], b"boundary");
    }
}
