//! Memory-mapped, append-only partition files
//!
//! Each partition file starts with an 8-byte header holding the committed
//! write offset, so a reopened handle resumes after the last record instead
//! of after the preallocated tail.

use super::codec::RECORD_HEADER_LEN;
use crate::{ReportError, Result, Timestamp};
use bytes::Bytes;
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Bytes reserved for the committed-offset header
pub const FILE_HEADER_LEN: u64 = 8;

/// Partition a given object's records land in
pub fn partition_for(object_id: u32, partitions: u32) -> u32 {
    object_id % partitions.max(1)
}

/// Path of a partition file inside a shard directory
pub fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("partition_{}.bin", partition))
}

/// One mapped partition file
pub struct FileHandle {
    path: PathBuf,
    inner: RwLock<HandleInner>,
}

struct HandleInner {
    file: File,
    /// Next write position, always <= capacity once mapped
    offset: u64,
    /// Mapped length
    capacity: u64,
    mmap: Option<MmapMut>,
}

impl FileHandle {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let size = file.metadata()?.len();

        let (offset, mmap) = if size == 0 {
            (FILE_HEADER_LEN, None)
        } else {
            if size < FILE_HEADER_LEN {
                return Err(ReportError::Corruption(format!(
                    "{}: {} bytes is shorter than the header",
                    path.display(),
                    size
                )));
            }
            // SAFETY: the file is open read/write and `size` bytes long; the
            // mapping is only touched under this handle's lock.
            let mmap = unsafe { MmapMut::map_mut(&file)? };
            let mut header = [0u8; 8];
            header.copy_from_slice(&mmap[..8]);
            // A zero header means the file was extended but never written
            let committed = match u64::from_le_bytes(header) {
                0 => FILE_HEADER_LEN,
                committed => committed,
            };
            if committed < FILE_HEADER_LEN || committed > size {
                return Err(ReportError::Corruption(format!(
                    "{}: committed offset {} outside file of {} bytes",
                    path.display(),
                    committed,
                    size
                )));
            }
            (committed, Some(mmap))
        };

        debug!(path = %path.display(), offset, size, "opened partition file");

        Ok(Self {
            path,
            inner: RwLock::new(HandleInner {
                file,
                offset,
                capacity: size,
                mmap,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current write offset
    pub fn offset(&self) -> u64 {
        self.inner.read().offset
    }

    /// Current mapped capacity
    pub fn capacity(&self) -> u64 {
        self.inner.read().capacity
    }

    /// Make room for `required` more bytes at the write offset.
    ///
    /// Grows to `offset + max(growth, required)`: flush, `set_len`, remap.
    /// Capacity never shrinks.
    pub fn ensure_capacity(&self, required: u64, growth: u64) -> Result<()> {
        let mut inner = self.inner.write();
        Self::grow_locked(&mut inner, required, growth)
    }

    fn grow_locked(inner: &mut HandleInner, required: u64, growth: u64) -> Result<()> {
        if inner.offset + required <= inner.capacity {
            return Ok(());
        }

        if let Some(mmap) = inner.mmap.take() {
            mmap.flush()?;
        }

        let new_capacity = inner.offset + growth.max(required);
        inner.file.set_len(new_capacity)?;
        // SAFETY: the file was just resized to `new_capacity`; the old map
        // has been dropped above.
        let mut mmap = unsafe { MmapMut::map_mut(&inner.file)? };
        mmap[..8].copy_from_slice(&inner.offset.to_le_bytes());
        inner.mmap = Some(mmap);
        inner.capacity = new_capacity;
        Ok(())
    }

    /// Append an encoded record and return the offset it starts at
    pub fn append(&self, record: &[u8], growth: u64) -> Result<u64> {
        let mut inner = self.inner.write();
        let len = record.len() as u64;
        Self::grow_locked(&mut inner, len, growth)?;

        let start = inner.offset;
        let end = start + len;
        let mmap = inner
            .mmap
            .as_mut()
            .ok_or_else(|| ReportError::Corruption("partition file is not mapped".into()))?;
        mmap[start as usize..end as usize].copy_from_slice(record);
        mmap[..8].copy_from_slice(&end.to_le_bytes());
        inner.offset = end;
        Ok(start)
    }

    /// Read the record at `offset`, returning its timestamp and payload
    pub fn read_record(&self, offset: u64) -> Result<(Timestamp, Bytes)> {
        let inner = self.inner.read();
        let mmap = inner.mmap.as_ref().ok_or_else(|| {
            ReportError::Corruption(format!("{}: read from unmapped file", self.path.display()))
        })?;
        let limit = inner.offset as usize;
        let start = offset as usize;
        let header_end = start + RECORD_HEADER_LEN;
        if start < FILE_HEADER_LEN as usize || header_end > limit {
            return Err(ReportError::Corruption(format!(
                "{}: record header at {} past end {}",
                self.path.display(),
                offset,
                limit
            )));
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&mmap[start..start + 4]);
        let timestamp = u32::from_le_bytes(word);
        word.copy_from_slice(&mmap[start + 4..header_end]);
        let len = u32::from_le_bytes(word) as usize;

        let end = header_end + len;
        if end > limit {
            return Err(ReportError::Corruption(format!(
                "{}: record at {} of {} bytes past end {}",
                self.path.display(),
                offset,
                len,
                limit
            )));
        }
        Ok((timestamp, Bytes::copy_from_slice(&mmap[header_end..end])))
    }

    /// Flush dirty pages to disk
    pub fn flush(&self) -> Result<()> {
        if let Some(mmap) = self.inner.read().mmap.as_ref() {
            mmap.flush()?;
        }
        Ok(())
    }
}

/// Owns the partition files of one shard
pub struct FileManager {
    dir: PathBuf,
    growth: u64,
    handles: RwLock<HashMap<u32, Arc<FileHandle>>>,
}

impl FileManager {
    pub fn new(dir: impl Into<PathBuf>, growth: u64) -> Self {
        Self {
            dir: dir.into(),
            growth: growth.max(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn growth(&self) -> u64 {
        self.growth
    }

    /// Shared handle for a partition, opened on first use
    pub fn get_handle(&self, partition: u32) -> Result<Arc<FileHandle>> {
        if let Some(handle) = self.handles.read().get(&partition) {
            return Ok(handle.clone());
        }

        let mut handles = self.handles.write();
        if let Some(handle) = handles.get(&partition) {
            return Ok(handle.clone());
        }

        fs::create_dir_all(&self.dir)?;
        let handle = Arc::new(FileHandle::open(partition_path(&self.dir, partition))?);
        handles.insert(partition, handle.clone());
        Ok(handle)
    }

    /// Grow a handle so `required` bytes fit at its offset
    pub fn ensure_capacity(&self, handle: &FileHandle, required: u64) -> Result<()> {
        handle.ensure_capacity(required, self.growth)
    }

    pub fn append(&self, partition: u32, record: &[u8]) -> Result<u64> {
        self.get_handle(partition)?.append(record, self.growth)
    }

    /// Number of open partition handles
    pub fn open_handles(&self) -> usize {
        self.handles.read().len()
    }

    pub fn flush(&self) -> Result<()> {
        for handle in self.handles.read().values() {
            handle.flush()?;
        }
        Ok(())
    }

    /// Flush and release every handle
    pub fn close(&self) -> Result<()> {
        let mut handles = self.handles.write();
        let mut first_err = None;
        for (_, handle) in handles.drain() {
            if let Err(e) = handle.flush() {
                tracing::error!(path = %handle.path().display(), error = %e, "flush on close failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::encode_record;
    use tempfile::TempDir;

    #[test]
    fn test_partition_is_stable() {
        for object in [0u32, 1, 7, 1_000_003, u32::MAX] {
            let p = partition_for(object, 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(object, 4));
        }
        assert_eq!(partition_for(10, 4), 2);
        assert_eq!(partition_for(10, 0), 0);
    }

    #[test]
    fn test_same_handle_returned() {
        let dir = TempDir::new().unwrap();
        let files = FileManager::new(dir.path().join("shard"), 64);

        let a = files.get_handle(1).unwrap();
        let b = files.get_handle(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(files.open_handles(), 1);
        assert!(dir.path().join("shard/partition_1.bin").exists());
    }

    #[test]
    fn test_append_grows_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let files = FileManager::new(dir.path(), 16);
        let handle = files.get_handle(0).unwrap();
        assert_eq!(handle.capacity(), 0);

        let mut offsets = Vec::new();
        for i in 0..10u32 {
            let record = encode_record(1000 + i, &u64::from(i).to_le_bytes()).unwrap();
            offsets.push(handle.append(&record, files.growth()).unwrap());
            assert!(handle.offset() <= handle.capacity());
        }
        assert_eq!(offsets[0], FILE_HEADER_LEN);
        assert_eq!(offsets[1], FILE_HEADER_LEN + 16);

        for (i, offset) in offsets.iter().enumerate() {
            let (ts, payload) = handle.read_record(*offset).unwrap();
            assert_eq!(ts, 1000 + i as u32);
            assert_eq!(&payload[..], &(i as u64).to_le_bytes());
        }
    }

    #[test]
    fn test_record_larger_than_growth() {
        let dir = TempDir::new().unwrap();
        let files = FileManager::new(dir.path(), 4);
        let big = "x".repeat(100);
        let record = encode_record(5, big.as_bytes()).unwrap();

        let offset = files.append(3, &record).unwrap();
        let (ts, payload) = files.get_handle(3).unwrap().read_record(offset).unwrap();
        assert_eq!(ts, 5);
        assert_eq!(payload.len(), 100);
    }

    #[test]
    fn test_ensure_capacity_only_grows() {
        let dir = TempDir::new().unwrap();
        let files = FileManager::new(dir.path(), 32);
        let handle = files.get_handle(0).unwrap();

        files.ensure_capacity(&handle, 10).unwrap();
        let first = handle.capacity();
        assert_eq!(first, FILE_HEADER_LEN + 32);

        files.ensure_capacity(&handle, 10).unwrap();
        assert_eq!(handle.capacity(), first);
    }

    #[test]
    fn test_read_past_end_is_error() {
        let dir = TempDir::new().unwrap();
        let files = FileManager::new(dir.path(), 64);
        let handle = files.get_handle(0).unwrap();
        handle.append(&encode_record(1, &[1; 8]).unwrap(), 64).unwrap();

        assert!(matches!(
            handle.read_record(FILE_HEADER_LEN + 16),
            Err(ReportError::Corruption(_))
        ));
        assert!(handle.read_record(0).is_err());
    }

    #[test]
    fn test_reopen_resumes_at_committed_offset() {
        let dir = TempDir::new().unwrap();
        let first_offset;
        {
            let files = FileManager::new(dir.path(), 1024);
            first_offset = files.append(0, &encode_record(1, &[7; 8]).unwrap()).unwrap();
            files.close().unwrap();
        }

        let files = FileManager::new(dir.path(), 1024);
        let handle = files.get_handle(0).unwrap();
        assert_eq!(handle.offset(), FILE_HEADER_LEN + 16);
        assert_eq!(handle.capacity(), FILE_HEADER_LEN + 1024);

        let second = handle.append(&encode_record(2, &[8; 8]).unwrap(), 1024).unwrap();
        assert_eq!(second, FILE_HEADER_LEN + 16);
        assert_eq!(handle.read_record(first_offset).unwrap().0, 1);
        assert_eq!(handle.read_record(second).unwrap().0, 2);
    }

    #[test]
    fn test_extended_file_without_header_opens_empty() {
        let dir = TempDir::new().unwrap();
        let path = partition_path(dir.path(), 2);
        File::create(&path).unwrap().set_len(512).unwrap();

        let files = FileManager::new(dir.path(), 64);
        let handle = files.get_handle(2).unwrap();
        assert_eq!(handle.offset(), FILE_HEADER_LEN);
        assert_eq!(handle.capacity(), 512);

        let offset = handle.append(&encode_record(9, &[1; 8]).unwrap(), 64).unwrap();
        assert_eq!(offset, FILE_HEADER_LEN);
        assert_eq!(handle.read_record(offset).unwrap().0, 9);
    }

    #[test]
    fn test_short_header_is_corruption() {
        let dir = TempDir::new().unwrap();
        fs::write(partition_path(dir.path(), 0), [1u8, 2, 3]).unwrap();

        let files = FileManager::new(dir.path(), 64);
        assert!(matches!(files.get_handle(0), Err(ReportError::Corruption(_))));
    }
}
