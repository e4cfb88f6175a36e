// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Random-access storage abstraction for reading content archives.
//!
//! Every layer of an archive — the raw file, a decrypted partition body, an
//! integrity-checked data region — is exposed as a [`Storage`]: a read-only,
//! seekless byte source addressed by absolute offset. Adapters own their
//! inner source through an `Arc`, so independent partition chains can share
//! one raw archive without aliasing a file cursor.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Which level of a hash tree a mismatch was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeLayer {
    /// The root hash layer failed against the stored master-hash list.
    Master,
    /// Intermediate hash layer `k` failed against its parent layer.
    Hash(usize),
    /// A data block failed against the lowest hash layer.
    Data,
}

impl fmt::Display for TreeLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeLayer::Master => write!(f, "master"),
            TreeLayer::Hash(k) => write!(f, "hash[{k}]"),
            TreeLayer::Data => write!(f, "data"),
        }
    }
}

/// Errors from storage reads.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("read of {len} bytes at offset 0x{offset:X} exceeds size 0x{size:X}")]
    OutOfRange { offset: u64, len: usize, size: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("hash mismatch in {layer} layer at block {block_index}")]
    HashMismatch { layer: TreeLayer, block_index: u64 },
}

/// A read-only random-access byte source.
///
/// Reads are exact: `read_at` either fills the whole buffer or fails. They
/// are idempotent and side-effect free, and `size()` is constant for the
/// lifetime of the source.
pub trait Storage: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` with the bytes at `[offset, offset + buf.len())`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;
}

/// Bounds-check a read request against a source size.
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> Result<(), StorageError> {
    if offset.checked_add(len as u64).is_none_or(|end| end > size) {
        return Err(StorageError::OutOfRange { offset, len, size });
    }
    Ok(())
}

/// Read `len` bytes from a storage into a new Vec.
pub fn read_vec(storage: &dyn Storage, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
    let mut buf = vec![0u8; len];
    storage.read_at(offset, &mut buf)?;
    Ok(buf)
}

/// Read an entire storage into a new Vec.
pub fn read_all(storage: &dyn Storage) -> Result<Vec<u8>, StorageError> {
    read_vec(storage, 0, storage.size() as usize)
}

// ---------------------------------------------------------------------------
// FileStorage — filesystem-backed Storage
// ---------------------------------------------------------------------------

/// A [`Storage`] backed by a file on the host filesystem.
///
/// Each read opens a fresh handle, so cloned chains over the same archive
/// never contend for one file cursor.
pub struct FileStorage {
    path: PathBuf,
    size: u64,
}

impl FileStorage {
    /// Open a file at the given path.
    pub fn open(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
        })
    }
}

impl Storage for FileStorage {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        use std::io::{Read, Seek, SeekFrom};
        check_range(offset, buf.len(), self.size)?;
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VecStorage — in-memory Storage
// ---------------------------------------------------------------------------

/// A [`Storage`] backed by an in-memory byte buffer.
pub struct VecStorage {
    data: Vec<u8>,
}

impl VecStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Storage for VecStorage {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.size())?;
        let offset = offset as usize;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SliceStorage — a window into another Storage
// ---------------------------------------------------------------------------

/// A [`Storage`] presenting `[base, base + len)` of a parent source as a new
/// source starting at offset 0.
///
/// Used for partition bodies and per-entry file views. No allocation on the
/// read path; requests are bounds-checked against the window, then forwarded.
pub struct SliceStorage {
    parent: Arc<dyn Storage>,
    base: u64,
    len: u64,
}

impl SliceStorage {
    pub fn new(parent: Arc<dyn Storage>, base: u64, len: u64) -> Self {
        Self { parent, base, len }
    }
}

impl Storage for SliceStorage {
    fn size(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.len)?;
        self.parent.read_at(self.base + offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_vec_storage() {
        let data = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let storage = VecStorage::new(data.clone());

        assert_eq!(storage.size(), 5);
        assert_eq!(read_all(&storage).unwrap(), data);

        let mut buf = [0u8; 2];
        storage.read_at(2, &mut buf).unwrap();
        assert_eq!(buf, [0x03, 0x04]);
    }

    #[test]
    fn test_vec_storage_out_of_range() {
        let storage = VecStorage::new(vec![0u8; 4]);
        let mut buf = [0u8; 3];
        assert!(matches!(
            storage.read_at(2, &mut buf),
            Err(StorageError::OutOfRange {
                offset: 2,
                len: 3,
                size: 4
            })
        ));
        // Offset + len overflowing u64 is out of range, not a panic
        assert!(matches!(
            storage.read_at(u64::MAX - 1, &mut buf),
            Err(StorageError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_slice_forwards_to_parent() {
        let parent: Arc<dyn Storage> =
            Arc::new(VecStorage::new(vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
        let slice = SliceStorage::new(parent.clone(), 2, 3);

        assert_eq!(slice.size(), 3);
        assert_eq!(read_all(&slice).unwrap(), vec![0xCC, 0xDD, 0xEE]);

        // slice.read_at(o, n) == parent.read_at(base + o, n) for every in-range o, n
        for offset in 0..3u64 {
            for len in 0..=(3 - offset as usize) {
                let mut from_slice = vec![0u8; len];
                let mut from_parent = vec![0u8; len];
                slice.read_at(offset, &mut from_slice).unwrap();
                parent.read_at(2 + offset, &mut from_parent).unwrap();
                assert_eq!(from_slice, from_parent);
            }
        }
    }

    #[test]
    fn test_slice_rejects_reads_past_window() {
        let parent: Arc<dyn Storage> = Arc::new(VecStorage::new(vec![0u8; 16]));
        let slice = SliceStorage::new(parent, 4, 8);

        let mut buf = [0u8; 8];
        slice.read_at(0, &mut buf).unwrap();

        // In range for the parent, out of range for the window
        assert!(matches!(
            slice.read_at(4, &mut buf),
            Err(StorageError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_nested_slices() {
        let parent: Arc<dyn Storage> = Arc::new(VecStorage::new((0u8..32).collect()));
        let outer = Arc::new(SliceStorage::new(parent, 8, 16));
        let inner = SliceStorage::new(outer, 4, 8);

        assert_eq!(inner.size(), 8);
        assert_eq!(read_all(&inner).unwrap(), (12u8..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[0x10, 0x20, 0x30, 0x40]).unwrap();
        drop(f);

        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(storage.size(), 4);

        let mut buf = [0u8; 2];
        storage.read_at(1, &mut buf).unwrap();
        assert_eq!(buf, [0x20, 0x30]);

        assert!(matches!(
            storage.read_at(3, &mut buf),
            Err(StorageError::OutOfRange { .. })
        ));
    }
}
