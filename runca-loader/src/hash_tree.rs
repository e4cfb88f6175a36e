// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hierarchical hash-tree verification over a [`Storage`].
//!
//! Partitions carry one of two tree schemes in their fs-header superblock:
//! HierarchicalSha256 (one hash layer, the master hash covers the whole hash
//! table) or HierarchicalIntegrity ("IVFC", up to six levels, per-block
//! sparse zero-hash semantics). Both normalise to a [`HashTreeMeta`]; the
//! [`HashTreeStorage`] adapter verifies every intermediate layer at
//! construction and every data block on read.
//!
//! Layer offsets are relative to the decrypted partition view, not the
//! archive.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::vfs::{check_range, Storage, StorageError, TreeLayer};

/// Size of the hash superblock inside an fs-header.
pub const HASH_SUPERBLOCK_LEN: usize = 0x138;

/// SHA-256 digest length.
const HASH_LEN: usize = 32;

/// IVFC magic: "IVFC".
const IVFC_MAGIC: u32 = u32::from_le_bytes([b'I', b'V', b'F', b'C']);

/// Maximum number of IVFC level entries (hash layers + data layer).
const IVFC_MAX_LEVELS: usize = 6;

/// Errors from hash-tree setup.
#[derive(Debug, Error)]
pub enum HashTreeError {
    #[error("invalid IVFC magic: got 0x{0:08X}")]
    BadIvfcMagic(u32),

    #[error("unsupported hash layer count: {0}")]
    BadLayerCount(u32),

    #[error("invalid master hash size: {0}")]
    BadMasterHashSize(u32),

    #[error("hash layer has zero block size")]
    ZeroBlockSize,

    #[error("layer {layer} holds {available} hashes but {needed} are covered")]
    LayerTooSmall {
        layer: usize,
        available: u64,
        needed: u64,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One layer of the tree: a byte region of the partition plus the chunk size
/// its contents are hashed in.
#[derive(Debug, Clone, Copy)]
pub struct LayerInfo {
    pub offset: u64,
    pub size: u64,
    pub block_size: u32,
}

impl LayerInfo {
    /// Number of hash-covered blocks in this layer.
    fn block_count(&self) -> u64 {
        self.size.div_ceil(self.block_size as u64)
    }
}

/// Normalised description of a hash tree, independent of which superblock
/// variant it came from.
#[derive(Debug, Clone)]
pub struct HashTreeMeta {
    /// Root hashes authenticating the topmost hash layer.
    pub master_hashes: Vec<[u8; HASH_LEN]>,
    /// Hash layers, root first.
    pub hash_layers: Vec<LayerInfo>,
    /// The authenticated data region.
    pub data_layer: LayerInfo,
    /// Zero-pad a short final block before hashing (HierarchicalSha256).
    pub align_final_block: bool,
}

impl HashTreeMeta {
    /// Import a HierarchicalSha256 superblock.
    ///
    /// Layout: master hash (0x20), hash block size (u32), layer count (u32,
    /// always 2), then two regions {offset u64, size u64}: the hash table
    /// and the data region. The single master hash covers the entire hash
    /// table, so the hash layer's block size is the whole region.
    pub fn from_hierarchical_sha256(raw: &[u8]) -> Result<Self, HashTreeError> {
        let mut cur = Cursor::new(&raw[HASH_LEN..]);
        let mut master_hash = [0u8; HASH_LEN];
        master_hash.copy_from_slice(&raw[..HASH_LEN]);

        let hash_block_size = cur.read_u32::<LittleEndian>().map_err(StorageError::Io)?;
        let layer_count = cur.read_u32::<LittleEndian>().map_err(StorageError::Io)?;
        if layer_count != 2 {
            return Err(HashTreeError::BadLayerCount(layer_count));
        }
        if hash_block_size == 0 {
            return Err(HashTreeError::ZeroBlockSize);
        }

        let hash_offset = cur.read_u64::<LittleEndian>().map_err(StorageError::Io)?;
        let hash_size = cur.read_u64::<LittleEndian>().map_err(StorageError::Io)?;
        let data_offset = cur.read_u64::<LittleEndian>().map_err(StorageError::Io)?;
        let data_size = cur.read_u64::<LittleEndian>().map_err(StorageError::Io)?;

        Ok(Self {
            master_hashes: vec![master_hash],
            hash_layers: vec![LayerInfo {
                offset: hash_offset,
                size: hash_size,
                block_size: hash_size.max(1) as u32,
            }],
            data_layer: LayerInfo {
                offset: data_offset,
                size: data_size,
                block_size: hash_block_size,
            },
            align_final_block: true,
        })
    }

    /// Import a HierarchicalIntegrity ("IVFC") superblock.
    ///
    /// Layout: magic, version, master hash size, layer count, six level
    /// entries {offset u64, size u64, block size log2 u32, reserved u32},
    /// salt seed (0x20), master hash list. Of the `layer_count` populated
    /// levels the first `layer_count - 1` are hash layers and the last is
    /// the data layer.
    pub fn from_hierarchical_integrity(raw: &[u8]) -> Result<Self, HashTreeError> {
        let mut cur = Cursor::new(raw);
        let magic = cur.read_u32::<LittleEndian>().map_err(StorageError::Io)?;
        if magic != IVFC_MAGIC {
            return Err(HashTreeError::BadIvfcMagic(magic));
        }
        let _version = cur.read_u32::<LittleEndian>().map_err(StorageError::Io)?;
        let master_hash_size = cur.read_u32::<LittleEndian>().map_err(StorageError::Io)?;
        let layer_count = cur.read_u32::<LittleEndian>().map_err(StorageError::Io)?;

        if !(2..=IVFC_MAX_LEVELS as u32).contains(&layer_count) {
            return Err(HashTreeError::BadLayerCount(layer_count));
        }
        if master_hash_size == 0
            || master_hash_size as usize % HASH_LEN != 0
            || 0xC0 + master_hash_size as usize > HASH_SUPERBLOCK_LEN
        {
            return Err(HashTreeError::BadMasterHashSize(master_hash_size));
        }

        let mut levels = Vec::with_capacity(layer_count as usize);
        for i in 0..IVFC_MAX_LEVELS {
            let offset = cur.read_u64::<LittleEndian>().map_err(StorageError::Io)?;
            let size = cur.read_u64::<LittleEndian>().map_err(StorageError::Io)?;
            let block_size_log2 = cur.read_u32::<LittleEndian>().map_err(StorageError::Io)?;
            let _reserved = cur.read_u32::<LittleEndian>().map_err(StorageError::Io)?;
            if i < layer_count as usize {
                if block_size_log2 >= 32 {
                    return Err(HashTreeError::ZeroBlockSize);
                }
                levels.push(LayerInfo {
                    offset,
                    size,
                    block_size: 1u32 << block_size_log2,
                });
            }
        }

        let master_hashes = raw[0xC0..0xC0 + master_hash_size as usize]
            .chunks_exact(HASH_LEN)
            .map(|c| {
                let mut h = [0u8; HASH_LEN];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let data_layer = levels.pop().expect("layer_count >= 2");
        Ok(Self {
            master_hashes,
            hash_layers: levels,
            data_layer,
            align_final_block: false,
        })
    }
}

/// A [`Storage`] adapter exposing the verified data region of a hash tree.
///
/// Construction reads every hash layer into memory and verifies the chain up
/// to the master-hash list; reads verify data blocks against the resident
/// lowest layer. All-zero expected hashes mark never-written blocks: such
/// reads yield zeroes without touching the inner source.
pub struct HashTreeStorage {
    inner: Arc<dyn Storage>,
    data: LayerInfo,
    /// Lowest hash layer, one 32-byte entry per data block.
    block_hashes: Vec<u8>,
    align_final_block: bool,
}

impl std::fmt::Debug for HashTreeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTreeStorage")
            .field("data", &self.data)
            .field("block_hashes_len", &self.block_hashes.len())
            .field("align_final_block", &self.align_final_block)
            .finish()
    }
}

impl HashTreeStorage {
    pub fn new(inner: Arc<dyn Storage>, meta: &HashTreeMeta) -> Result<Self, HashTreeError> {
        let mut layers = Vec::with_capacity(meta.hash_layers.len());
        for layer in &meta.hash_layers {
            let mut bytes = vec![0u8; layer.size as usize];
            inner.read_at(layer.offset, &mut bytes)?;
            layers.push(bytes);
        }

        // Root layer against the stored master hashes, then each layer
        // against its parent, top down.
        let root = &meta.hash_layers[0];
        let master_flat: Vec<u8> = meta.master_hashes.iter().flatten().copied().collect();
        verify_layer(
            &layers[0],
            root,
            &master_flat,
            TreeLayer::Master,
            meta.align_final_block,
        )?;
        for k in 1..meta.hash_layers.len() {
            verify_layer(
                &layers[k],
                &meta.hash_layers[k],
                &layers[k - 1],
                TreeLayer::Hash(k),
                meta.align_final_block,
            )?;
        }

        let block_hashes = layers.pop().expect("at least one hash layer");
        let needed = meta.data_layer.block_count();
        let available = (block_hashes.len() / HASH_LEN) as u64;
        if available < needed {
            return Err(HashTreeError::LayerTooSmall {
                layer: meta.hash_layers.len(),
                available,
                needed,
            });
        }

        Ok(Self {
            inner,
            data: meta.data_layer,
            block_hashes,
            align_final_block: meta.align_final_block,
        })
    }
}

/// Verify a layer's contents against the flat hash list covering it.
fn verify_layer(
    bytes: &[u8],
    layer: &LayerInfo,
    parent_hashes: &[u8],
    tag: TreeLayer,
    align: bool,
) -> Result<(), HashTreeError> {
    let needed = layer.block_count();
    let available = (parent_hashes.len() / HASH_LEN) as u64;
    if available < needed {
        let layer_idx = match tag {
            TreeLayer::Hash(k) => k,
            _ => 0,
        };
        return Err(HashTreeError::LayerTooSmall {
            layer: layer_idx,
            available,
            needed,
        });
    }

    for (i, chunk) in bytes.chunks(layer.block_size as usize).enumerate() {
        let expected = &parent_hashes[i * HASH_LEN..(i + 1) * HASH_LEN];
        if expected.iter().all(|&b| b == 0) {
            // Unwritten region; nothing to check at this level.
            continue;
        }
        let digest = hash_block(chunk, layer.block_size as usize, align);
        if digest[..] != *expected {
            return Err(StorageError::HashMismatch {
                layer: tag,
                block_index: i as u64,
            }
            .into());
        }
    }
    Ok(())
}

/// SHA-256 of one block, zero-padded to `block_size` when `align` is set and
/// the block is short.
fn hash_block(chunk: &[u8], block_size: usize, align: bool) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(chunk);
    if align && chunk.len() < block_size {
        let pad = [0u8; 64];
        let mut remaining = block_size - chunk.len();
        while remaining > 0 {
            let n = remaining.min(pad.len());
            hasher.update(&pad[..n]);
            remaining -= n;
        }
    }
    hasher.finalize().into()
}

impl Storage for HashTreeStorage {
    fn size(&self) -> u64 {
        self.data.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.data.size)?;
        if buf.is_empty() {
            return Ok(());
        }

        let bs = self.data.block_size as u64;
        let end = offset + buf.len() as u64;
        let first_block = offset / bs;
        let last_block = (end - 1) / bs;

        let mut scratch = vec![0u8; self.data.block_size as usize];
        for block in first_block..=last_block {
            let block_off = block * bs;
            let block_len = bs.min(self.data.size - block_off) as usize;

            let copy_start = offset.max(block_off);
            let copy_end = end.min(block_off + block_len as u64);
            let dst = &mut buf[(copy_start - offset) as usize..(copy_end - offset) as usize];

            let idx = block as usize * HASH_LEN;
            let expected = &self.block_hashes[idx..idx + HASH_LEN];
            if expected.iter().all(|&b| b == 0) {
                // Never-written block: defined to read as zeroes.
                dst.fill(0);
                continue;
            }

            let chunk = &mut scratch[..block_len];
            self.inner.read_at(self.data.offset + block_off, chunk)?;
            let digest = hash_block(chunk, self.data.block_size as usize, self.align_final_block);
            if digest[..] != *expected {
                return Err(StorageError::HashMismatch {
                    layer: TreeLayer::Data,
                    block_index: block,
                });
            }

            dst.copy_from_slice(
                &chunk[(copy_start - block_off) as usize..(copy_end - block_off) as usize],
            );
        }
        Ok(())
    }
}
