// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! NCA content archive reader.
//!
//! An archive embeds up to four partitions, each independently encrypted and
//! hash-protected. [`NcaReader::open`] runs the fixed pipeline — decrypt the
//! header block, hash it, parse it, derive body keys, assemble partition
//! reader chains — before anything is reported, so diagnostics come out
//! coherent. Signature verification is a separate, optional phase whose
//! failures are warnings, never fatal.
//!
//! A fatal error (bad magic, fs-header hash mismatch) aborts the whole
//! parse. A partition whose reader cannot be assembled records its failure
//! and is skipped; the remaining partitions still load.

use std::sync::Arc;

use runca_crypto::{aes_ctr, keygen, Key128, Key256, Keyset};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ctr_storage::CtrStorage;
use crate::hash_tree::{HashTreeError, HashTreeMeta, HashTreeStorage};
use crate::header::{
    ContentType, EncryptionType, FormatType, FsHeader, HashType, HeaderBlock, NcaHeader,
    PartitionEntry, FS_HEADER_VERSION, NCA_HEADER_BLOCK_SIZE,
};
use crate::npdm::Npdm;
use crate::pfs::Pfs;
use crate::signature::{self, SignatureCheck, SignatureReport};
use crate::vfs::{read_vec, SliceStorage, Storage, StorageError};

/// ExeFS entry holding the manifest that keys header signature 2.
const NPDM_EXEFS_PATH: &str = "main.npdm";

/// Key-area slots: XTS key halves, then the CTR key.
const KEY_AREA_SLOT_XTS0: usize = 0;
const KEY_AREA_SLOT_XTS1: usize = 1;
const KEY_AREA_SLOT_CTR: usize = 2;

/// Archive-fatal errors.
#[derive(Debug, Error)]
pub enum NcaError {
    #[error("NCA header block too small: need 0x{NCA_HEADER_BLOCK_SIZE:X} bytes, got 0x{0:X}")]
    HeaderTooSmall(usize),

    #[error("missing header key for NCA decryption")]
    MissingHeaderKey,

    #[error("invalid NCA magic after decryption: got 0x{0:08X}")]
    BadMagic(u32),

    #[error("NCA fs header [{index}] hash mismatch")]
    FsHeaderHashMismatch { index: usize },

    #[error("NCA fs header [{index}] version {version} unsupported")]
    UnsupportedFsHeaderVersion { index: usize, version: u16 },

    #[error("partition table entry {index} out of order or overlapping")]
    InvalidPartitionTable { index: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures that disable a single partition without aborting the archive.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("missing key: {0}")]
    MissingKey(&'static str),

    #[error("unsupported encryption type: {0:?}")]
    UnsupportedEncryption(EncryptionType),

    #[error("unsupported hash type: {0:?}")]
    UnsupportedHashType(HashType),

    #[error("unknown format type: {0:?}")]
    UnsupportedFormat(FormatType),

    #[error(transparent)]
    HashTree(#[from] HashTreeError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One key-area slot: the wrapped key and, when the KAEK was available, the
/// unwrapped value.
#[derive(Debug, Clone, Copy)]
pub struct KeyAreaEntry {
    pub index: usize,
    pub encrypted: Key128,
    pub decrypted: Option<Key128>,
}

/// Body keys selected for this archive.
#[derive(Debug, Clone, Default)]
pub struct BodyKeys {
    /// AES-CTR key for partition bodies.
    pub aes_ctr: Option<Key128>,
    /// AES-XTS key pair (halves concatenated).
    pub aes_xts: Option<Key256>,
    /// Non-empty key-area slots, for diagnostics and display.
    pub key_area: Vec<KeyAreaEntry>,
}

/// A declared partition and, when assembly succeeded, its reader chain.
pub struct PartitionInfo {
    /// Slot index in the partition table.
    pub index: usize,
    /// Absolute offset in the archive.
    pub offset: u64,
    pub size: u64,
    pub format_type: FormatType,
    pub hash_type: HashType,
    pub encryption_type: EncryptionType,
    /// Effective AES-CTR counter at the partition start.
    pub ctr_iv: Key128,
    /// Normalised hash-tree description, when the partition carries one.
    pub hash_meta: Option<HashTreeMeta>,
    /// The assembled reader, or `None` with `fail_reason` set.
    pub storage: Option<Arc<dyn Storage>>,
    pub fail_reason: Option<PartitionError>,
}

impl std::fmt::Debug for PartitionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionInfo")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("format_type", &self.format_type)
            .field("hash_type", &self.hash_type)
            .field("encryption_type", &self.encryption_type)
            .field("ctr_iv", &self.ctr_iv)
            .field("hash_meta", &self.hash_meta)
            .field("storage_present", &self.storage.is_some())
            .field("fail_reason", &self.fail_reason)
            .finish()
    }
}

/// Select body keys per the archive header and available keyset material.
///
/// Ticket-sourced title keys take over when a rights ID is set; otherwise
/// keys come from the decrypted key area. Manual body keys in the keyset
/// override both sources.
pub fn derive_body_keys(header: &NcaHeader, keys: &Keyset) -> BodyKeys {
    let revision = keygen::master_key_revision(header.key_generation_old, header.key_generation);
    let kaek = keys.key_area_key(header.kaek_index, revision);

    let mut key_area = Vec::new();
    for (index, encrypted) in header.encrypted_key_area.iter().enumerate() {
        if keygen::is_zero_key(encrypted) {
            continue;
        }
        key_area.push(KeyAreaEntry {
            index,
            encrypted: *encrypted,
            decrypted: kaek.as_ref().map(|k| keygen::unwrap_key(encrypted, k)),
        });
    }

    let mut aes_ctr_key = None;
    let mut aes_xts_key = None;

    if header.has_rights_id() {
        // Keys must come from a ticket; the key area is ignored.
        if let Some(titlekek) = keys.titlekek(revision) {
            if let Some(wrapped) = keys.manual_title_key_ctr() {
                aes_ctr_key = Some(keygen::unwrap_key(&wrapped, &titlekek));
            }
            if let Some(wrapped) = keys.manual_title_key_xts() {
                let lo: Key128 = wrapped[..16].try_into().expect("16-byte half");
                let hi: Key128 = wrapped[16..].try_into().expect("16-byte half");
                let mut pair = [0u8; 32];
                pair[..16].copy_from_slice(&keygen::unwrap_key(&lo, &titlekek));
                pair[16..].copy_from_slice(&keygen::unwrap_key(&hi, &titlekek));
                aes_xts_key = Some(pair);
            }
        }
    } else {
        let slot = |want: usize| {
            key_area
                .iter()
                .find(|e| e.index == want)
                .and_then(|e| e.decrypted)
        };
        aes_ctr_key = slot(KEY_AREA_SLOT_CTR);
        if let (Some(k0), Some(k1)) = (slot(KEY_AREA_SLOT_XTS0), slot(KEY_AREA_SLOT_XTS1)) {
            let mut pair = [0u8; 32];
            pair[..16].copy_from_slice(&k0);
            pair[16..].copy_from_slice(&k1);
            aes_xts_key = Some(pair);
        }
    }

    // Manually-supplied body keys win over both derivation sources.
    if let Some(manual) = keys.manual_body_key_ctr() {
        aes_ctr_key = Some(manual);
    }
    if let Some(manual) = keys.manual_body_key_xts() {
        aes_xts_key = Some(manual);
    }

    BodyKeys {
        aes_ctr: aes_ctr_key,
        aes_xts: aes_xts_key,
        key_area,
    }
}

/// An opened archive: parsed headers, derived keys, and per-partition
/// reader chains.
pub struct NcaReader {
    header: HeaderBlock,
    header_hash: [u8; 32],
    body_keys: BodyKeys,
    partitions: Vec<PartitionInfo>,
}

impl std::fmt::Debug for NcaReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NcaReader")
            .field("header", &self.header)
            .field("header_hash", &self.header_hash)
            .field("body_keys", &self.body_keys)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl NcaReader {
    /// Open an archive over a storage. Runs header decryption, parsing, key
    /// derivation and partition assembly; signature checks run separately
    /// via [`NcaReader::verify_signatures`].
    pub fn open(source: Arc<dyn Storage>, keys: &Keyset) -> Result<Self, NcaError> {
        let header_key = keys.header_key().ok_or(NcaError::MissingHeaderKey)?;
        if source.size() < NCA_HEADER_BLOCK_SIZE as u64 {
            return Err(NcaError::HeaderTooSmall(source.size() as usize));
        }

        let raw = read_vec(source.as_ref(), 0, NCA_HEADER_BLOCK_SIZE)?;
        let header = HeaderBlock::decrypt_and_parse(&raw, &header_key)?;
        let header_hash = header.header_hash();

        log::info!(
            "NCA {} content_type={:?} program_id=0x{:016X}",
            header.main.version.as_str(),
            header.main.content_type,
            header.main.program_id
        );

        let body_keys = derive_body_keys(&header.main, keys);

        let mut partitions = Vec::new();
        for index in 0..header.main.partitions.len() {
            let entry = header.main.partitions[index];
            if !entry.is_present() {
                continue;
            }
            partitions.push(assemble_partition(
                &source, &header, index, &entry, &body_keys,
            )?);
        }

        Ok(Self {
            header,
            header_hash,
            body_keys,
            partitions,
        })
    }

    pub fn header(&self) -> &NcaHeader {
        &self.header.main
    }

    pub fn fs_header(&self, index: usize) -> &FsHeader {
        &self.header.fs_headers[index]
    }

    /// SHA-256 of the main-header region, the message both signatures cover.
    pub fn header_hash(&self) -> [u8; 32] {
        self.header_hash
    }

    pub fn body_keys(&self) -> &BodyKeys {
        &self.body_keys
    }

    /// All declared partitions, in table order.
    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    /// The partition at a given table index, if declared.
    pub fn partition(&self, index: usize) -> Option<&PartitionInfo> {
        self.partitions.iter().find(|p| p.index == index)
    }

    /// The assembled reader for a partition, if it built.
    pub fn partition_storage(&self, index: usize) -> Option<Arc<dyn Storage>> {
        self.partition(index).and_then(|p| p.storage.clone())
    }

    /// Open a built PFS partition's listing.
    pub fn open_pfs(&self, index: usize) -> Option<Result<Pfs, crate::pfs::PfsError>> {
        let storage = self.partition_storage(index)?;
        Some(Pfs::parse(storage.as_ref(), 0))
    }

    /// Verify both header signatures. Failures are reported and logged as
    /// warnings; nothing here aborts processing.
    pub fn verify_signatures(&self, keys: &Keyset) -> SignatureReport {
        let fixed_key = match keys.header_sign_modulus() {
            None => SignatureCheck::Skipped("header signing key not loaded".into()),
            Some(modulus) => self.check_signature(&modulus, &self.header.signature_main),
        };
        if let SignatureCheck::Invalid(reason) = &fixed_key {
            log::warn!("NCA header main signature: FAIL ({reason})");
        }

        let acid = self.verify_acid_signature();
        if let SignatureCheck::Invalid(reason) = &acid {
            log::warn!("NCA header ACID signature: FAIL ({reason})");
        }

        SignatureReport { fixed_key, acid }
    }

    fn check_signature(&self, modulus: &[u8], sig: &[u8]) -> SignatureCheck {
        match signature::verify_pss_sha256(modulus, self.header.main_header_bytes(), sig) {
            Ok(true) => SignatureCheck::Valid,
            Ok(false) => SignatureCheck::Invalid("signature mismatch".into()),
            Err(e) => SignatureCheck::Invalid(e.to_string()),
        }
    }

    /// Signature 2 applies only to Program archives and is keyed by the ACID
    /// public key inside the ExeFS `main.npdm`. Every structural failure on
    /// the way degrades to a reported reason.
    fn verify_acid_signature(&self) -> SignatureCheck {
        if self.header.main.content_type != ContentType::Program {
            return SignatureCheck::Skipped("not a Program archive".into());
        }

        let Some(partition) = self.partition(0) else {
            return SignatureCheck::Invalid("No ExeFs partition".into());
        };
        if partition.format_type != FormatType::Pfs {
            return SignatureCheck::Invalid("No ExeFs partition".into());
        }
        let Some(storage) = partition.storage.clone() else {
            return SignatureCheck::Invalid("ExeFs unreadable".into());
        };

        let pfs = match Pfs::parse(storage.as_ref(), 0) {
            Ok(pfs) => pfs,
            Err(_) => return SignatureCheck::Invalid("ExeFs unreadable".into()),
        };
        let Some(entry) = pfs.entry(NPDM_EXEFS_PATH) else {
            return SignatureCheck::Invalid(format!("{NPDM_EXEFS_PATH} not present in ExeFs"));
        };

        let npdm = match Npdm::parse(
            storage.as_ref(),
            pfs.data_offset + entry.data_offset,
            entry.data_size,
        ) {
            Ok(npdm) => npdm,
            Err(e) => return SignatureCheck::Invalid(format!("{NPDM_EXEFS_PATH}: {e}")),
        };

        match signature::verify_pss_sha256(
            npdm.acid.header2_rsa_modulus(),
            self.header.main_header_bytes(),
            &self.header.signature_acid,
        ) {
            Ok(true) => SignatureCheck::Valid,
            Ok(false) => SignatureCheck::Invalid("signature mismatch".into()),
            Err(e) => SignatureCheck::Invalid(e.to_string()),
        }
    }
}

/// Validate one partition's fs-header and build its reader chain. Hash or
/// version failures on the fs-header are archive-fatal; chain-build failures
/// are recorded on the partition.
fn assemble_partition(
    source: &Arc<dyn Storage>,
    header: &HeaderBlock,
    index: usize,
    entry: &PartitionEntry,
    body_keys: &BodyKeys,
) -> Result<PartitionInfo, NcaError> {
    let calc: [u8; 32] = Sha256::digest(header.fs_header_bytes(index)).into();
    if calc != header.main.fs_header_hashes[index] {
        return Err(NcaError::FsHeaderHashMismatch { index });
    }

    let fs = &header.fs_headers[index];
    if fs.version != FS_HEADER_VERSION {
        return Err(NcaError::UnsupportedFsHeaderVersion {
            index,
            version: fs.version,
        });
    }

    let offset = entry.offset();
    let size = entry.size();

    let mut info = PartitionInfo {
        index,
        offset,
        size,
        format_type: fs.format_type,
        hash_type: fs.hash_type,
        encryption_type: fs.encryption_type,
        ctr_iv: aes_ctr::make_body_ctr(fs.ctr_seed, offset),
        hash_meta: None,
        storage: None,
        fail_reason: None,
    };

    match build_chain(source, offset, size, fs, body_keys) {
        Ok((storage, hash_meta)) => {
            info.storage = Some(storage);
            info.hash_meta = hash_meta;
        }
        Err(err) => {
            log::warn!("NCA partition {index} not readable ({err})");
            info.fail_reason = Some(err);
        }
    }
    Ok(info)
}

/// Build a partition's reader chain inner-to-outer: slice over the optional
/// decryption adapter, then the optional hash-tree adapter.
fn build_chain(
    source: &Arc<dyn Storage>,
    offset: u64,
    size: u64,
    fs: &FsHeader,
    body_keys: &BodyKeys,
) -> Result<(Arc<dyn Storage>, Option<HashTreeMeta>), PartitionError> {
    match fs.format_type {
        FormatType::Pfs | FormatType::RomFs => {}
        other => return Err(PartitionError::UnsupportedFormat(other)),
    }

    let base: Arc<dyn Storage> = match fs.encryption_type {
        EncryptionType::None => Arc::new(SliceStorage::new(source.clone(), offset, size)),
        EncryptionType::AesCtr => {
            let key = body_keys
                .aes_ctr
                .ok_or(PartitionError::MissingKey("body AES-CTR key"))?;
            let decrypted = Arc::new(CtrStorage::new(source.clone(), key, fs.ctr_seed));
            Arc::new(SliceStorage::new(decrypted, offset, size))
        }
        other @ (EncryptionType::AesXts | EncryptionType::AesCtrEx) => {
            return Err(PartitionError::UnsupportedEncryption(other));
        }
        other => return Err(PartitionError::UnsupportedEncryption(other)),
    };

    match fs.hash_type {
        HashType::None => Ok((base, None)),
        HashType::HierarchicalSha256 => {
            let meta = HashTreeMeta::from_hierarchical_sha256(&fs.hash_superblock)?;
            let tree = HashTreeStorage::new(base, &meta)?;
            Ok((Arc::new(tree), Some(meta)))
        }
        HashType::HierarchicalIntegrity => {
            let meta = HashTreeMeta::from_hierarchical_integrity(&fs.hash_superblock)?;
            let tree = HashTreeStorage::new(base, &meta)?;
            Ok((Arc::new(tree), Some(meta)))
        }
        other => Err(PartitionError::UnsupportedHashType(other)),
    }
}
