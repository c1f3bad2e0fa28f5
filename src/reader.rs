// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `Reader`: random-access backing storage for a demuxer, yielding `Data<u8>` views on
//! demand. Two implementations: an in-memory buffer, and a memory-mapped file.

use crate::data::Data;
use base::{bail, Error};
use std::sync::Arc;

pub trait Reader: Send + Sync {
    /// Total size of the backing source, in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads `size` bytes starting at `offset`. Fails `ReaderError` on a short read, and
    /// `OutOfRange` if the requested range exceeds `len()`.
    fn read(&self, offset: u64, size: u32) -> Result<Data<u8>, Error>;
}

/// An in-memory backing: the whole file already loaded (or mapped) into one `Data<u8>`.
pub struct MemoryReader {
    data: Data<u8>,
}

impl MemoryReader {
    pub fn new(data: Data<u8>) -> MemoryReader {
        MemoryReader { data }
    }
}

impl Reader for MemoryReader {
    fn len(&self) -> u64 {
        self.data.count() as u64
    }

    fn read(&self, offset: u64, size: u32) -> Result<Data<u8>, Error> {
        if offset > u32::MAX as u64 {
            bail!(OutOfRange, msg("offset {} exceeds 32-bit range", offset));
        }
        let offset = offset as u32;
        let end = offset
            .checked_add(size)
            .ok_or_else(|| base::err!(Overflow, msg("offset {} + size {} overflows", offset, size)))?;
        if end as u64 > self.len() {
            bail!(ReaderError, msg("short read: [{}, {}) exceeds length {}", offset, end, self.len()));
        }
        let mut view = self.data.clone();
        view.set_bounds(offset, end)?;
        Ok(view)
    }
}

/// A memory-mapped file backing. `Data::from_file`/`from_fd` already do the mapping; this
/// just bounds-checks and slices the resulting full-file view, the same as
/// [`MemoryReader`] but constructed directly from a path or fd.
pub struct FileReader {
    inner: MemoryReader,
}

impl FileReader {
    pub fn open(path: &std::path::Path) -> Result<FileReader, Error> {
        Ok(FileReader { inner: MemoryReader::new(Data::from_file(path)?) })
    }

    pub fn from_fd(file: &std::fs::File) -> Result<FileReader, Error> {
        Ok(FileReader { inner: MemoryReader::new(Data::from_fd(file)?) })
    }
}

impl Reader for FileReader {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn read(&self, offset: u64, size: u32) -> Result<Data<u8>, Error> {
        self.inner.read(offset, size)
    }
}

/// A handle demuxer sample payload-thunks hold a weak reference to. Once the owning
/// demuxer/file is dropped, `upgrade()` fails rather than returning stale bytes.
#[derive(Clone)]
pub struct SharedReader(Arc<dyn Reader>);

impl SharedReader {
    pub fn new(reader: Arc<dyn Reader>) -> SharedReader {
        SharedReader(reader)
    }

    pub fn downgrade(&self) -> WeakReader {
        WeakReader(Arc::downgrade(&self.0))
    }

    pub fn read(&self, offset: u64, size: u32) -> Result<Data<u8>, Error> {
        self.0.read(offset, size)
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }
}

#[derive(Clone)]
pub struct WeakReader(std::sync::Weak<dyn Reader>);

impl WeakReader {
    /// Fails `Uninitialized` if the backing demuxer/file has already been dropped.
    pub fn upgrade(&self) -> Result<SharedReader, Error> {
        self.0
            .upgrade()
            .map(SharedReader)
            .ok_or_else(|| base::err!(Uninitialized, msg("reader dropped before payload thunk was run")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_reader_reads_subrange() {
        let r = MemoryReader::new(Data::from_vec(vec![1u8, 2, 3, 4, 5]));
        let view = r.read(1, 3).unwrap();
        assert_eq!(view.as_slice(), &[2, 3, 4]);
    }

    #[test]
    fn memory_reader_rejects_short_read() {
        let r = MemoryReader::new(Data::from_vec(vec![1u8, 2, 3]));
        assert_eq!(r.read(1, 10).unwrap_err().kind(), base::ErrorKind::ReaderError);
    }

    #[test]
    fn weak_reader_fails_after_drop() {
        let shared = SharedReader::new(Arc::new(MemoryReader::new(Data::from_vec(vec![1u8, 2, 3]))));
        let weak = shared.downgrade();
        drop(shared);
        assert_eq!(weak.upgrade().unwrap_err().kind(), base::ErrorKind::Uninitialized);
    }
}
