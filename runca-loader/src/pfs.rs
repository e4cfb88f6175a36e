// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! PFS0 (Partition File System) parser.
//!
//! The flat archive format used inside NCA partitions (ExeFS) and NSP
//! packages: a header with magic, entry count and string-table size,
//! followed by entry descriptors, the string table, and file data.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::vfs::{SliceStorage, Storage, StorageError};

/// PFS0 magic: 'P', 'F', 'S', '0'.
const PFS0_MAGIC: u32 = u32::from_le_bytes([b'P', b'F', b'S', b'0']);

/// PFS0 header size (magic + num_entries + strtab_size + padding).
const PFS0_HEADER_SIZE: usize = 0x10;

/// Size of a PFS0 entry descriptor.
const PFS0_ENTRY_SIZE: usize = 0x18;

/// Errors from PFS parsing.
#[derive(Debug, Error)]
pub enum PfsError {
    #[error("source too small for PFS0: need {expected}, got {actual}")]
    DataTooSmall { expected: usize, actual: u64 },

    #[error("invalid PFS0 magic: got 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("string table entry out of bounds")]
    StringOutOfBounds,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A single file entry within the partition.
#[derive(Debug, Clone)]
pub struct PfsEntry {
    /// File name from string table.
    pub name: String,
    /// Offset of the file data relative to the data region start.
    pub data_offset: u64,
    /// Size of the file data.
    pub data_size: u64,
}

/// Parsed PFS0 partition.
#[derive(Debug, Clone)]
pub struct Pfs {
    /// File entries.
    pub entries: Vec<PfsEntry>,
    /// Offset from the start of the source where file data begins.
    pub data_offset: u64,
}

impl Pfs {
    /// Parse a PFS0 from a [`Storage`] at a given base offset.
    pub fn parse(storage: &dyn Storage, base_offset: u64) -> Result<Self, PfsError> {
        let header_data = read_from(storage, base_offset, PFS0_HEADER_SIZE)?;
        let mut cur = Cursor::new(&header_data[..]);

        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != PFS0_MAGIC {
            return Err(PfsError::InvalidMagic(magic));
        }

        let num_entries = cur.read_u32::<LittleEndian>()? as usize;
        let strtab_size = cur.read_u32::<LittleEndian>()? as usize;
        let _reserved = cur.read_u32::<LittleEndian>()?;

        let entries_size = num_entries * PFS0_ENTRY_SIZE;
        let table_data = read_from(
            storage,
            base_offset + PFS0_HEADER_SIZE as u64,
            entries_size + strtab_size,
        )?;

        let entry_table = &table_data[..entries_size];
        let strtab = &table_data[entries_size..];

        let mut entries = Vec::with_capacity(num_entries);
        for i in 0..num_entries {
            let e_offset = i * PFS0_ENTRY_SIZE;
            let mut ecur = Cursor::new(&entry_table[e_offset..e_offset + PFS0_ENTRY_SIZE]);

            let data_offset = ecur.read_u64::<LittleEndian>()?;
            let data_size = ecur.read_u64::<LittleEndian>()?;
            let strtab_offset = ecur.read_u32::<LittleEndian>()? as usize;

            let name = read_strtab_entry(strtab, strtab_offset)?;

            entries.push(PfsEntry {
                name,
                data_offset,
                data_size,
            });
        }

        let data_offset =
            base_offset + PFS0_HEADER_SIZE as u64 + entries_size as u64 + strtab_size as u64;

        Ok(Pfs {
            entries,
            data_offset,
        })
    }

    /// Find an entry by name.
    pub fn entry(&self, name: &str) -> Option<&PfsEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// All entry names in table order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Open one file as a sub-storage of the partition source.
    pub fn open_file(&self, source: Arc<dyn Storage>, name: &str) -> Option<Arc<dyn Storage>> {
        self.entry(name).map(|entry| {
            Arc::new(SliceStorage::new(
                source,
                self.data_offset + entry.data_offset,
                entry.data_size,
            )) as Arc<dyn Storage>
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Read a null-terminated string from the string table at the given offset.
fn read_strtab_entry(strtab: &[u8], offset: usize) -> Result<String, PfsError> {
    if offset >= strtab.len() {
        return Err(PfsError::StringOutOfBounds);
    }
    let end = strtab[offset..]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(strtab.len() - offset);
    Ok(String::from_utf8_lossy(&strtab[offset..offset + end]).into_owned())
}

/// Read `size` bytes, reporting short sources as a PFS-level error.
fn read_from(storage: &dyn Storage, offset: u64, size: usize) -> Result<Vec<u8>, PfsError> {
    if size == 0 {
        return Ok(vec![]);
    }
    let available = storage.size().saturating_sub(offset);
    if available < size as u64 {
        return Err(PfsError::DataTooSmall {
            expected: size,
            actual: available,
        });
    }
    let mut buf = vec![0u8; size];
    storage.read_at(offset, &mut buf)?;
    Ok(buf)
}
