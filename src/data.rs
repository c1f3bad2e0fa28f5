// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `Data<T>`: a bounded, reference-counted view over a byte or sample buffer.
//!
//! A `(buffer, [a, b))` pair: multiple `Data` views can share one backing buffer, each with
//! its own independent bounds. `Arc`'s drop glue guarantees the backing storage is released
//! exactly once, once the last view referencing it goes away.

use base::{bail, check, err, Error};
use std::sync::Arc;

/// Element types a [`Data`] view can hold, collapsed to a single index width across the
/// byte-buffer and sample-buffer cases.
pub trait DataElement: Copy + Send + Sync + 'static + PartialEq {
    /// Reinterprets a byte slice as a slice of `Self`. Only ever called for `u8`; a
    /// memory-mapped backing is never constructed for any other element type.
    fn reinterpret(bytes: &[u8]) -> &[Self];
}

impl DataElement for u8 {
    fn reinterpret(bytes: &[u8]) -> &[u8] {
        bytes
    }
}

impl DataElement for i16 {
    fn reinterpret(_bytes: &[u8]) -> &[i16] {
        unreachable!("Data<i16> is never file-backed")
    }
}

enum Backing<T> {
    Owned(Vec<T>),
    Mapped(Mapping),
}

impl<T: DataElement> Backing<T> {
    fn as_slice(&self) -> &[T] {
        match self {
            Backing::Owned(v) => v,
            Backing::Mapped(m) => T::reinterpret(m.as_bytes()),
        }
    }

    fn len(&self) -> u32 {
        match self {
            Backing::Owned(v) => v.len() as u32,
            Backing::Mapped(m) => m.len,
        }
    }
}

/// A memory-mapped region, munmap'd when the last [`Data`] view referencing it drops.
struct Mapping {
    ptr: *mut std::ffi::c_void,
    len: u32,
    map_len: usize,
}

// Safety: the mapping is read-only (`PROT_READ`) and never mutated through `ptr`.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn as_bytes(&self) -> &[u8] {
        // Safety: `ptr`/`map_len` describe a live mmap for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len as usize) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Safety: `ptr`/`map_len` came from a successful `mmap` and are munmap'd exactly once.
        unsafe {
            let _ = nix::sys::mman::munmap(
                std::ptr::NonNull::new_unchecked(self.ptr),
                self.map_len,
            );
        }
    }
}

/// A bounded, reference-counted view over a buffer of `T`.
///
/// `Clone` is cheap: it shares the backing buffer (an `Arc`) and copies only the `[a, b)`
/// range. For a true deep copy into fresh, unshared storage, use [`Data::deep_clone`].
pub struct Data<T: DataElement> {
    buf: Arc<Backing<T>>,
    a: u32,
    b: u32,
}

impl<T: DataElement> Clone for Data<T> {
    fn clone(&self) -> Self {
        Data {
            buf: self.buf.clone(),
            a: self.a,
            b: self.b,
        }
    }
}

impl<T: DataElement> Data<T> {
    /// Takes ownership of `v`, with the initial bounds spanning the whole buffer.
    pub fn from_vec(v: Vec<T>) -> Data<T> {
        let len = v.len() as u32;
        Data {
            buf: Arc::new(Backing::Owned(v)),
            a: 0,
            b: len,
        }
    }

    /// Allocates `len` zeroed elements. Used by the muxer to build an output range in place
    /// before [`Data::copy`]ing samples into it.
    pub fn empty_of_length(len: u32) -> Data<T>
    where
        T: Default,
    {
        Data::from_vec(vec![T::default(); len as usize])
    }

    pub fn a(&self) -> u32 {
        self.a
    }

    pub fn b(&self) -> u32 {
        self.b
    }

    pub fn count(&self) -> u32 {
        self.b - self.a
    }

    pub fn capacity(&self) -> u32 {
        self.buf.len()
    }

    /// Mutates only the view's range; never touches the backing buffer.
    pub fn set_bounds(&mut self, a: u32, b: u32) -> Result<(), Error> {
        if a > b || b > self.buf.len() {
            bail!(
                OutOfRange,
                msg("set_bounds({}, {}) out of capacity {}", a, b, self.buf.len())
            );
        }
        self.a = a;
        self.b = b;
        Ok(())
    }

    pub fn as_slice(&self) -> &[T] {
        &self.buf.as_slice()[self.a as usize..self.b as usize]
    }

    /// `operator()(x)`: the element at absolute index `x` (not relative to `a`).
    pub fn get(&self, x: u32) -> Result<T, Error> {
        if x >= self.buf.len() {
            bail!(OutOfRange, msg("index {} >= capacity {}", x, self.buf.len()));
        }
        Ok(self.buf.as_slice()[x as usize])
    }

    /// Writes `src` starting at this view's `a`, growing `b` to `a + src.count()`.
    /// Fails `OutOfRange` if that would exceed capacity, and `InvalidArguments` if this view's
    /// backing buffer is shared (in-place accumulation needs exclusive ownership).
    pub fn copy(&mut self, src: &Data<T>) -> Result<(), Error> {
        let want_len = src.count();
        if want_len + self.a > self.buf.len() {
            bail!(OutOfRange, msg("copy of {} bytes at {} exceeds capacity {}", want_len, self.a, self.buf.len()));
        }
        let src_slice: Vec<T> = src.as_slice().to_vec();
        let buf = Arc::get_mut(&mut self.buf).ok_or_else(|| {
            err!(InvalidArguments, msg("cannot copy into a shared Data view"))
        })?;
        match buf {
            Backing::Owned(v) => {
                v[self.a as usize..(self.a + want_len) as usize].copy_from_slice(&src_slice);
            }
            Backing::Mapped(_) => {
                bail!(InvalidArguments, msg("cannot copy into a memory-mapped Data view"));
            }
        }
        self.b = self.a + want_len;
        Ok(())
    }

    /// Deep-copies the current `[a, b)` range into a freshly allocated, unshared buffer.
    pub fn deep_clone(&self) -> Data<T> {
        Data::from_vec(self.as_slice().to_vec())
    }
}

impl Data<u8> {
    /// Memory-maps `path` read-only.
    pub fn from_file(path: &std::path::Path) -> Result<Data<u8>, Error> {
        let file = std::fs::File::open(path).map_err(|e| err!(ReaderError, source(e)))?;
        Data::from_fd(&file)
    }

    /// Memory-maps an already-open file descriptor, duplicating it so the mapping outlives
    /// the caller's `File`.
    pub fn from_fd(file: &std::fs::File) -> Result<Data<u8>, Error> {
        use std::os::unix::io::AsRawFd;
        let meta = file.metadata().map_err(|e| err!(ReaderError, source(e)))?;
        let size = meta.len();
        if size == 0 {
            bail!(Invalid, msg("file is empty"));
        }
        if size > u32::MAX as u64 {
            bail!(Unsupported, msg("file size {} too large", size));
        }
        let fd = nix::unistd::dup(file.as_raw_fd()).map_err(|e| err!(ReaderError, source(e)))?;
        let map_len = size as usize;
        // Safety: `fd` is a valid, duplicated file descriptor whose lifetime this mapping owns.
        let ptr = unsafe {
            nix::sys::mman::mmap(
                None,
                std::num::NonZeroUsize::new(map_len).unwrap(),
                nix::sys::mman::ProtFlags::PROT_READ,
                nix::sys::mman::MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| err!(ReaderError, source(e)))?;
        let mapping = Mapping {
            ptr: ptr.as_ptr(),
            len: size as u32,
            map_len,
        };
        Ok(Data {
            buf: Arc::new(Backing::Mapped(mapping)),
            a: 0,
            b: size as u32,
        })
    }
}

impl<T: DataElement> PartialEq for Data<T> {
    /// Compares the live byte range, not identity.
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}
impl<T: DataElement> Eq for Data<T> {}

impl std::fmt::Debug for Data<u8> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Data<u8>[{}..{}]", self.a, self.b)
    }
}

/// Asserts `a <= b` as an internal-only invariant.
pub(crate) fn assert_ordered(a: u32, b: u32) -> Result<(), Error> {
    check!(a <= b, "a ({}) > b ({})", a, b);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_buffer_set_bounds_is_local() {
        let d = Data::from_vec(vec![1u8, 2, 3, 4, 5]);
        let mut view = d.clone();
        view.set_bounds(1, 3).unwrap();
        assert_eq!(view.as_slice(), &[2, 3]);
        assert_eq!(d.as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn set_bounds_rejects_out_of_capacity() {
        let mut d = Data::from_vec(vec![1u8, 2, 3]);
        assert_eq!(d.set_bounds(0, 4).unwrap_err().kind(), base::ErrorKind::OutOfRange);
    }

    #[test]
    fn equality_is_content_based_not_identity() {
        let a = Data::from_vec(vec![9u8, 9, 9]);
        let b = Data::from_vec(vec![9u8, 9, 9]);
        assert_eq!(a, b);
    }

    #[test]
    fn copy_writes_from_a_and_grows_b() {
        let mut dst = Data::<u8>::empty_of_length(8);
        dst.set_bounds(2, 2).unwrap();
        let src = Data::from_vec(vec![7u8, 8, 9]);
        dst.copy(&src).unwrap();
        assert_eq!(dst.a(), 2);
        assert_eq!(dst.b(), 5);
        assert_eq!(dst.as_slice(), &[7, 8, 9]);
    }

    #[test]
    fn deep_clone_is_independent() {
        let a = Data::from_vec(vec![1u8, 2, 3]);
        let mut b = a.deep_clone();
        b.set_bounds(0, 1).unwrap();
        b.copy(&Data::from_vec(vec![9u8])).unwrap();
        assert_eq!(b.as_slice(), &[9]);
        assert_eq!(a.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn copy_into_shared_view_is_rejected() {
        let mut dst = Data::<u8>::empty_of_length(4);
        let _other_view = dst.clone(); // now shared, Arc::get_mut fails
        let err = dst.copy(&Data::from_vec(vec![1u8])).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::InvalidArguments);
    }
}
