use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
    path::Path,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::JoinHandle,
};

use bytes::Bytes;
use rangemap::RangeSet;

use super::{
    layout::{Segment, StorageLayout},
    CacheStorage,
};

/// Blocking file storage with a double-buffered write-behind queue.
///
/// Small writes accumulate in a front buffer. Once it holds `write_buffer_size` bytes it is
/// swapped with the back buffer, which a background writer thread drains to disk. Writes larger
/// than the buffer bypass the queue and are written synchronously.
#[derive(Debug)]
pub struct FileStorage {
    layout: StorageLayout,
    files: Arc<Vec<Mutex<File>>>,
    queue: Arc<WriteQueue>,
    writer: Option<JoinHandle<()>>,
    write_buffer_size: usize,
    newly_created: bool,
}

#[derive(Debug)]
struct PendingWrite {
    offset: u64,
    data: Bytes,
}

#[derive(Debug, Default)]
struct QueueState {
    front: Vec<PendingWrite>,
    front_bytes: usize,
    back: Option<Vec<PendingWrite>>,
    /// The writer thread took the back buffer and is still writing it.
    writing: bool,
    /// Logical ranges with bytes not yet on disk.
    pending: RangeSet<u64>,
    error: Option<io::Error>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct WriteQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl FileStorage {
    #[tracing::instrument(fields(directory = format_args!("{}", directory.display())), err(Debug))]
    pub fn open(
        directory: &Path,
        capacity: u64,
        file_capacity: u64,
        write_buffer_size: usize,
    ) -> io::Result<Self> {
        let layout = StorageLayout::new(capacity, file_capacity);
        let (files, newly_created) = layout.open_files(directory)?;
        let files: Arc<Vec<_>> = Arc::new(files.into_iter().map(Mutex::new).collect());
        let queue = Arc::new(WriteQueue::default());

        let writer = {
            let layout = layout.clone();
            let files = files.clone();
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("cache-storage-writer".to_owned())
                .spawn(move || Self::writer_loop(&layout, &files, &queue))?
        };

        Ok(Self {
            layout,
            files,
            queue,
            writer: Some(writer),
            write_buffer_size,
            newly_created,
        })
    }

    fn writer_loop(layout: &StorageLayout, files: &[Mutex<File>], queue: &WriteQueue) {
        loop {
            let batch = {
                let mut state = queue.state.lock().unwrap();
                loop {
                    if let Some(batch) = state.back.take() {
                        state.writing = true;
                        break batch;
                    }
                    if state.shutdown {
                        return;
                    }
                    state = queue.changed.wait(state).unwrap();
                }
            };

            let res = batch
                .iter()
                .try_for_each(|write| Self::write_segments(layout, files, write.offset, &write.data))
                .and_then(|()| Self::sync_files(files));

            let mut state = queue.state.lock().unwrap();
            state.writing = false;
            state.pending = Self::ranges_of(&state.front);
            if let Err(e) = res {
                tracing::error!("cache storage write-behind failed: {e}");
                state.error.get_or_insert(e);
            }
            queue.changed.notify_all();
        }
    }

    fn write_segments(
        layout: &StorageLayout,
        files: &[Mutex<File>],
        offset: u64,
        data: &[u8],
    ) -> io::Result<()> {
        for Segment {
            file,
            file_offset,
            len,
            buf_offset,
        } in layout.segments(offset, data.len())?
        {
            let mut file = files[file].lock().unwrap();
            file.seek(SeekFrom::Start(file_offset))?;
            file.write_all(&data[buf_offset..buf_offset + len])?;
        }

        Ok(())
    }

    fn sync_files(files: &[Mutex<File>]) -> io::Result<()> {
        files
            .iter()
            .try_for_each(|file| file.lock().unwrap().sync_data())
    }

    fn ranges_of(writes: &[PendingWrite]) -> RangeSet<u64> {
        writes
            .iter()
            .filter(|write| !write.data.is_empty())
            .map(|write| write.offset..write.offset + write.data.len() as u64)
            .collect()
    }

    /// Hands the front buffer to the writer thread, waiting for the previous batch to finish.
    fn swap_buffers<'a>(
        &'a self,
        mut state: MutexGuard<'a, QueueState>,
    ) -> MutexGuard<'a, QueueState> {
        while state.back.is_some() || state.writing {
            state = self.queue.changed.wait(state).unwrap();
        }

        if !state.front.is_empty() {
            state.back = Some(mem::take(&mut state.front));
            state.front_bytes = 0;
            self.queue.changed.notify_all();
        }

        state
    }

    /// Flushes the queue if any byte of `offset..offset + len` is still pending.
    fn settle_range(&self, offset: u64, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }

        let overlaps = self
            .queue
            .state
            .lock()
            .unwrap()
            .pending
            .overlaps(&(offset..offset + len as u64));

        if overlaps {
            self.flush()?;
        }

        Ok(())
    }
}

impl CacheStorage for FileStorage {
    fn read(&self, offset: u64, size: usize) -> io::Result<Bytes> {
        let mut buf = vec![0; size];
        self.read_into(offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn read_into(&self, offset: u64, dest: &mut [u8]) -> io::Result<()> {
        self.settle_range(offset, dest.len())?;

        for Segment {
            file,
            file_offset,
            len,
            buf_offset,
        } in self.layout.segments(offset, dest.len())?
        {
            let mut file = self.files[file].lock().unwrap();
            file.seek(SeekFrom::Start(file_offset))?;
            file.read_exact(&mut dest[buf_offset..buf_offset + len])?;
        }

        Ok(())
    }

    fn write_async(&self, offset: u64, data: Bytes) -> io::Result<()> {
        // Validate the range up front so the writer thread never sees a bad write.
        self.layout.segments(offset, data.len())?;

        if data.len() > self.write_buffer_size {
            self.settle_range(offset, data.len())?;
            return Self::write_segments(&self.layout, &self.files, offset, &data);
        }

        let mut state = self.queue.state.lock().unwrap();
        if !data.is_empty() {
            state.pending.insert(offset..offset + data.len() as u64);
        }
        state.front_bytes += data.len();
        state.front.push(PendingWrite { offset, data });

        if state.front_bytes >= self.write_buffer_size {
            drop(self.swap_buffers(state));
        }

        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let state = self.queue.state.lock().unwrap();
        let mut state = self.swap_buffers(state);

        while state.back.is_some() || state.writing {
            state = self.queue.changed.wait(state).unwrap();
        }

        if let Some(e) = state.error.take() {
            return Err(e);
        }
        drop(state);

        Self::sync_files(&self.files)
    }

    fn is_newly_created(&self) -> bool {
        self.newly_created
    }

    fn capacity(&self) -> u64 {
        self.layout.capacity()
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!("failed to flush cache storage on drop: {e}");
        }

        self.queue.state.lock().unwrap().shutdown = true;
        self.queue.changed.notify_all();

        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::error!("cache storage writer thread panicked");
            }
        }
    }
}
