// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transparent AES-128-CTR decryption over a [`Storage`].
//!
//! The adapter presents the same offsets and size as its inner source, with
//! every read decrypted on the fly. The counter for the AES block at
//! absolute offset `o` is the big-endian 128-bit value
//! `(seed << 64) | (o >> 4)`, so decryption is stateless across calls and
//! any byte range can be read without touching prior bytes.

use std::sync::Arc;

use runca_crypto::aes_ctr;
use runca_crypto::Key128;

use crate::vfs::{check_range, Storage, StorageError};

/// AES block size; reads are expanded to this alignment.
const BLOCK_SIZE: u64 = 16;

/// Upper bound on per-read scratch.
const CHUNK_SIZE: u64 = 0x10000;

/// A [`Storage`] adapter that decrypts its inner source with AES-128-CTR.
///
/// Offsets are absolute: a partition chain slices after wrapping
/// (`SliceStorage::new(CtrStorage::new(...), offset, size)`), so the
/// partition's position in the archive flows into the block counters.
pub struct CtrStorage {
    inner: Arc<dyn Storage>,
    key: Key128,
    seed: u64,
}

impl CtrStorage {
    /// `seed` is the fs-header's 8-byte counter seed, forming the upper half
    /// of the 128-bit counter.
    pub fn new(inner: Arc<dyn Storage>, key: Key128, seed: u64) -> Self {
        Self { inner, key, seed }
    }
}

impl Storage for CtrStorage {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.size())?;
        if buf.is_empty() {
            return Ok(());
        }

        let end = offset + buf.len() as u64;
        let aligned_start = offset & !(BLOCK_SIZE - 1);
        // Block-align the end of the span, but never read past the source.
        let aligned_end = end
            .checked_add(BLOCK_SIZE - 1)
            .map_or(self.size(), |e| (e & !(BLOCK_SIZE - 1)).min(self.size()));

        let mut scratch = vec![0u8; CHUNK_SIZE.min(aligned_end - aligned_start) as usize];
        let mut chunk_start = aligned_start;
        while chunk_start < aligned_end {
            let chunk_len = CHUNK_SIZE.min(aligned_end - chunk_start) as usize;
            let chunk = &mut scratch[..chunk_len];
            self.inner.read_at(chunk_start, chunk)?;

            let iv = aes_ctr::make_body_ctr(self.seed, chunk_start);
            aes_ctr::apply_ctr(&self.key, &iv, chunk);

            // Copy the part of this chunk that overlaps the request.
            let copy_start = offset.max(chunk_start);
            let copy_end = end.min(chunk_start + chunk_len as u64);
            buf[(copy_start - offset) as usize..(copy_end - offset) as usize]
                .copy_from_slice(&chunk[(copy_start - chunk_start) as usize..(copy_end - chunk_start) as usize]);

            chunk_start += chunk_len as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{read_all, read_vec, SliceStorage, VecStorage};

    /// CTR-encrypt `plain` as if it sat at absolute offset `base`.
    fn encrypt_at(plain: &[u8], key: &Key128, seed: u64, base: u64) -> Vec<u8> {
        assert_eq!(base % 16, 0);
        let mut data = plain.to_vec();
        let iv = aes_ctr::make_body_ctr(seed, base);
        aes_ctr::apply_ctr(key, &iv, &mut data);
        data
    }

    #[test]
    fn test_decrypts_whole_source() {
        let key: Key128 = [0x31; 16];
        let seed = 0x1122_3344_5566_7788;
        let plain: Vec<u8> = (0..256u32).map(|i| (i * 7) as u8).collect();

        let inner = Arc::new(VecStorage::new(encrypt_at(&plain, &key, seed, 0)));
        let ctr = CtrStorage::new(inner, key, seed);
        assert_eq!(read_all(&ctr).unwrap(), plain);
    }

    #[test]
    fn test_unaligned_reads() {
        let key: Key128 = [0x07; 16];
        let seed = 42;
        let plain: Vec<u8> = (0..1024u32).map(|i| (i ^ 0x5A) as u8).collect();

        let inner = Arc::new(VecStorage::new(encrypt_at(&plain, &key, seed, 0)));
        let ctr = CtrStorage::new(inner, key, seed);

        for &(offset, len) in &[(1u64, 1usize), (15, 2), (7, 100), (1000, 24), (16, 16)] {
            let got = read_vec(&ctr, offset, len).unwrap();
            assert_eq!(&got, &plain[offset as usize..offset as usize + len]);
        }
    }

    #[test]
    fn test_split_reads_equal_one_read() {
        let key: Key128 = [0xC4; 16];
        let seed = 9;
        let plain: Vec<u8> = (0..512u32).map(|i| i as u8).collect();

        let inner = Arc::new(VecStorage::new(encrypt_at(&plain, &key, seed, 0)));
        let ctr = CtrStorage::new(inner, key, seed);

        let whole = read_vec(&ctr, 10, 200).unwrap();
        for split in [1usize, 16, 33, 199] {
            let mut parts = read_vec(&ctr, 10, split).unwrap();
            parts.extend(read_vec(&ctr, 10 + split as u64, 200 - split).unwrap());
            assert_eq!(parts, whole);
        }
    }

    #[test]
    fn test_crosses_chunk_boundary() {
        // Larger than the 64 KiB scratch, so one read spans two chunks.
        let key: Key128 = [0x88; 16];
        let seed = 3;
        let plain: Vec<u8> = (0..0x1_8000u32).map(|i| (i % 251) as u8).collect();

        let inner = Arc::new(VecStorage::new(encrypt_at(&plain, &key, seed, 0)));
        let ctr = CtrStorage::new(inner, key, seed);

        let got = read_vec(&ctr, 0xFFF0, 0x40).unwrap();
        assert_eq!(&got, &plain[0xFFF0..0x10030]);
        assert_eq!(read_all(&ctr).unwrap(), plain);
    }

    #[test]
    fn test_partition_offset_feeds_counter() {
        // Data encrypted at absolute offset 0x400 decrypts through a slice
        // placed there, because counters derive from absolute offsets.
        let key: Key128 = [0x5F; 16];
        let seed = 0xAB;
        let plain = b"partition payload at an absolute offset".to_vec();

        let mut archive = vec![0u8; 0x400 + plain.len()];
        archive[0x400..].copy_from_slice(&encrypt_at(&plain, &key, seed, 0x400));

        let inner = Arc::new(VecStorage::new(archive));
        let ctr = Arc::new(CtrStorage::new(inner, key, seed));
        let partition = SliceStorage::new(ctr, 0x400, plain.len() as u64);

        assert_eq!(read_all(&partition).unwrap(), plain);
    }

    #[test]
    fn test_out_of_range() {
        let key = [0u8; 16];
        let inner = Arc::new(VecStorage::new(vec![0u8; 32]));
        let ctr = CtrStorage::new(inner, key, 0);
        let mut buf = [0u8; 16];
        assert!(matches!(
            ctr.read_at(20, &mut buf),
            Err(StorageError::OutOfRange { .. })
        ));
    }
}
