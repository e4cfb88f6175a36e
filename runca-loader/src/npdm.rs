// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! NPDM (program descriptor meta) parsing.
//!
//! Found as `main.npdm` in the ExeFS partition of a Program archive. Only
//! the pieces the archive verifier consumes are parsed: the META
//! identification fields and the ACID descriptor, whose embedded RSA public
//! key signs the second NCA header signature.
//!
//! ## Layout
//! ```text
//! META blob:
//! [0x00] Magic "META"
//! [0x20] TitleName (null-padded, 16 bytes)
//! [0x78] AcidOffset (u32 LE, relative to file start)
//! [0x7C] AcidSize   (u32 LE)
//!
//! ACID blob (at AcidOffset):
//! [0x000] RSA-2048 signature    (0x100)
//! [0x100] RSA-2048 public key   (0x100) - verifies NCA header signature 2
//! [0x200] Magic "ACID"
//! [0x204] Size                  (u32 LE)
//! [0x208] Flags                 (u32 LE)
//! [0x210] ProgramIdMin          (u64 LE)
//! [0x218] ProgramIdMax          (u64 LE)
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use runca_crypto::key_manager::RsaModulus;
use thiserror::Error;

use crate::vfs::{read_vec, Storage, StorageError};

const META_MAGIC: u32 = u32::from_le_bytes(*b"META");
const ACID_MAGIC: u32 = u32::from_le_bytes(*b"ACID");

/// Minimum META blob size to reach the ACID offset fields.
const META_MIN_SIZE: usize = 0x80;

/// Minimum ACID blob size to reach the fields we parse.
const ACID_MIN_SIZE: usize = 0x220;

/// Errors from NPDM parsing.
#[derive(Debug, Error)]
pub enum NpdmError {
    #[error("NPDM too small: need at least {need} bytes, got {got}")]
    TooSmall { need: usize, got: u64 },

    #[error("invalid META magic: got 0x{0:08X}")]
    BadMagic(u32),

    #[error("invalid ACID magic: got 0x{0:08X}")]
    BadAcidMagic(u32),

    #[error("ACID region [0x{offset:X}, +0x{size:X}) exceeds NPDM bounds")]
    AcidOutOfBounds { offset: u32, size: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// ACID - the signed access-control descriptor.
#[derive(Debug, Clone)]
pub struct Acid {
    /// RSA-2048 modulus that verifies the NCA header's second signature.
    pub header2_modulus: RsaModulus,
    pub flags: u32,
    pub program_id_min: u64,
    pub program_id_max: u64,
}

impl Acid {
    /// The RSA public key material for NCA header signature 2.
    pub fn header2_rsa_modulus(&self) -> &RsaModulus {
        &self.header2_modulus
    }
}

/// Parsed NPDM, limited to what archive verification needs.
#[derive(Debug, Clone)]
pub struct Npdm {
    /// Human-readable title name from the META header.
    pub title_name: String,
    pub acid: Acid,
}

impl Npdm {
    /// Parse an NPDM occupying `[offset, offset + size)` of a storage.
    pub fn parse(storage: &dyn Storage, offset: u64, size: u64) -> Result<Self, NpdmError> {
        if size < META_MIN_SIZE as u64 {
            return Err(NpdmError::TooSmall {
                need: META_MIN_SIZE,
                got: size,
            });
        }
        let meta = read_vec(storage, offset, META_MIN_SIZE)?;

        let mut cur = Cursor::new(&meta[..]);
        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != META_MAGIC {
            return Err(NpdmError::BadMagic(magic));
        }

        let title_name = String::from_utf8_lossy(
            &meta[0x20..0x30][..meta[0x20..0x30]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(0x10)],
        )
        .into_owned();

        let mut cur = Cursor::new(&meta[0x78..0x80]);
        let acid_offset = cur.read_u32::<LittleEndian>()?;
        let acid_size = cur.read_u32::<LittleEndian>()?;

        if (acid_size as usize) < ACID_MIN_SIZE
            || acid_offset as u64 + acid_size as u64 > size
        {
            return Err(NpdmError::AcidOutOfBounds {
                offset: acid_offset,
                size: acid_size,
            });
        }

        let acid_raw = read_vec(storage, offset + acid_offset as u64, ACID_MIN_SIZE)?;

        let mut cur = Cursor::new(&acid_raw[0x200..]);
        let acid_magic = cur.read_u32::<LittleEndian>()?;
        if acid_magic != ACID_MAGIC {
            return Err(NpdmError::BadAcidMagic(acid_magic));
        }
        let _acid_blob_size = cur.read_u32::<LittleEndian>()?;
        let flags = cur.read_u32::<LittleEndian>()?;
        let _reserved = cur.read_u32::<LittleEndian>()?;
        let program_id_min = cur.read_u64::<LittleEndian>()?;
        let program_id_max = cur.read_u64::<LittleEndian>()?;

        let mut header2_modulus = [0u8; 0x100];
        header2_modulus.copy_from_slice(&acid_raw[0x100..0x200]);

        Ok(Self {
            title_name,
            acid: Acid {
                header2_modulus,
                flags,
                program_id_min,
                program_id_max,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::build_npdm;
    use crate::vfs::VecStorage;

    #[test]
    fn test_parse_npdm() {
        let modulus = [0x42u8; 0x100];
        let raw = build_npdm(&modulus);
        let storage = VecStorage::new(raw.clone());

        let npdm = Npdm::parse(&storage, 0, raw.len() as u64).unwrap();
        assert_eq!(npdm.title_name, "fixture");
        assert_eq!(npdm.acid.header2_rsa_modulus(), &modulus);
    }

    #[test]
    fn test_parse_npdm_at_offset() {
        let modulus = [0x13u8; 0x100];
        let raw = build_npdm(&modulus);
        let mut padded = vec![0u8; 0x30];
        padded.extend_from_slice(&raw);
        let storage = VecStorage::new(padded);

        let npdm = Npdm::parse(&storage, 0x30, raw.len() as u64).unwrap();
        assert_eq!(npdm.acid.header2_rsa_modulus(), &modulus);
    }

    #[test]
    fn test_bad_meta_magic() {
        let storage = VecStorage::new(vec![0u8; 0x400]);
        assert!(matches!(
            Npdm::parse(&storage, 0, 0x400),
            Err(NpdmError::BadMagic(0))
        ));
    }

    #[test]
    fn test_bad_acid_magic() {
        let modulus = [0u8; 0x100];
        let mut raw = build_npdm(&modulus);
        // The ACID magic lives at acid_offset + 0x200
        let acid_offset = u32::from_le_bytes(raw[0x78..0x7C].try_into().unwrap()) as usize;
        raw[acid_offset + 0x200] = b'X';
        let storage = VecStorage::new(raw.clone());
        assert!(matches!(
            Npdm::parse(&storage, 0, raw.len() as u64),
            Err(NpdmError::BadAcidMagic(_))
        ));
    }

    #[test]
    fn test_too_small() {
        let storage = VecStorage::new(vec![0u8; 0x40]);
        assert!(matches!(
            Npdm::parse(&storage, 0, 0x40),
            Err(NpdmError::TooSmall { .. })
        ));
    }
}
