// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! NCA header block decryption and parsing.
//!
//! The first 0xC00 bytes of an archive are AES-128-XTS encrypted (sector
//! size 0x200): two signatures and the main header in sectors 0-1, then four
//! fs-header slots. NCA3 encrypts the fs-header slots with continuous sector
//! numbers 2-5; NCA2 encrypts each slot independently as sector 0.
//!
//! ## Main header layout (decrypted, offsets within the 0x200-byte header)
//! ```text
//! [0x00] Magic            "NCA2" / "NCA3"
//! [0x04] DistributionType (1 byte)
//! [0x05] ContentType      (1 byte)
//! [0x06] KeyGenerationOld (1 byte)
//! [0x07] KaekIndex        (1 byte)
//! [0x08] ContentSize      (u64 LE)
//! [0x10] ProgramId        (u64 LE)
//! [0x18] ContentIndex     (u32 LE)
//! [0x1C] SdkAddonVersion  (u32 LE)
//! [0x20] KeyGeneration    (1 byte)
//! [0x30] RightsId         (0x10 bytes)
//! [0x40] PartitionTable   (4 × {start_block u32, end_block u32, 8 reserved})
//! [0x80] FsHeaderHashes   (4 × 0x20 bytes SHA-256)
//! [0x100] EncryptedKeyArea (4 × 0x10 bytes)
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use runca_crypto::aes_xts::{self, NCA_SECTOR_SIZE};
use runca_crypto::Key256;

use crate::hash_tree::HASH_SUPERBLOCK_LEN;
use crate::nca::NcaError;

/// Size of the encrypted header block.
pub const NCA_HEADER_BLOCK_SIZE: usize = 0xC00;

/// Offset / size of the main header within the block.
pub const MAIN_HEADER_OFFSET: usize = 0x200;
pub const MAIN_HEADER_SIZE: usize = 0x200;

/// Offset of the first fs-header slot; each slot is one sector.
pub const FS_HEADER_OFFSET: usize = 0x400;
pub const FS_HEADER_SIZE: usize = 0x200;

/// Number of fs-header slots / partition-table entries.
pub const PARTITION_COUNT: usize = 4;

/// Partition-table offsets are in units of media blocks.
pub const MEDIA_BLOCK_SIZE: u64 = 0x200;

/// The only fs-header version this reader understands.
pub const FS_HEADER_VERSION: u16 = 2;

const NCA2_MAGIC: u32 = u32::from_le_bytes(*b"NCA2");
const NCA3_MAGIC: u32 = u32::from_le_bytes(*b"NCA3");

/// NCA container version, decided by the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaVersion {
    Nca2,
    Nca3,
}

impl NcaVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            NcaVersion::Nca2 => "NCA2",
            NcaVersion::Nca3 => "NCA3",
        }
    }
}

/// Distribution type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionType {
    Download,
    GameCard,
    Unknown(u8),
}

impl From<u8> for DistributionType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Download,
            1 => Self::GameCard,
            x => Self::Unknown(x),
        }
    }
}

/// Content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
    Unknown(u8),
}

impl From<u8> for ContentType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Program,
            1 => Self::Meta,
            2 => Self::Control,
            3 => Self::Manual,
            4 => Self::Data,
            5 => Self::PublicData,
            x => Self::Unknown(x),
        }
    }
}

/// Partition filesystem format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatType {
    RomFs,
    Pfs,
    Unknown(u8),
}

impl From<u8> for FormatType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::RomFs,
            1 => Self::Pfs,
            x => Self::Unknown(x),
        }
    }
}

/// Partition hash scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    Auto,
    None,
    HierarchicalSha256,
    HierarchicalIntegrity,
    Unknown(u8),
}

impl From<u8> for HashType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Auto,
            1 => Self::None,
            2 => Self::HierarchicalSha256,
            3 => Self::HierarchicalIntegrity,
            x => Self::Unknown(x),
        }
    }
}

/// Partition encryption scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    Auto,
    None,
    AesXts,
    AesCtr,
    AesCtrEx,
    Unknown(u8),
}

impl From<u8> for EncryptionType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Auto,
            1 => Self::None,
            2 => Self::AesXts,
            3 => Self::AesCtr,
            4 => Self::AesCtrEx,
            x => Self::Unknown(x),
        }
    }
}

/// One partition-table entry. Offsets are in media blocks; an all-zero entry
/// means the slot is unused.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionEntry {
    pub start_block: u32,
    pub end_block: u32,
}

impl PartitionEntry {
    pub fn is_present(&self) -> bool {
        self.start_block != 0 || self.end_block != 0
    }

    pub fn offset(&self) -> u64 {
        self.start_block as u64 * MEDIA_BLOCK_SIZE
    }

    pub fn size(&self) -> u64 {
        (self.end_block as u64).saturating_sub(self.start_block as u64) * MEDIA_BLOCK_SIZE
    }
}

/// Parsed main header.
#[derive(Debug, Clone)]
pub struct NcaHeader {
    pub version: NcaVersion,
    pub distribution_type: DistributionType,
    pub content_type: ContentType,
    pub key_generation_old: u8,
    pub key_generation: u8,
    /// Key area encryption key index (0=Application, 1=Ocean, 2=System).
    pub kaek_index: u8,
    pub content_size: u64,
    pub program_id: u64,
    pub content_index: u32,
    /// Byte-packed major.minor.micro SDK version.
    pub sdk_addon_version: u32,
    /// All zeros when no ticket is required.
    pub rights_id: [u8; 16],
    pub partitions: [PartitionEntry; PARTITION_COUNT],
    pub fs_header_hashes: [[u8; 32]; PARTITION_COUNT],
    pub encrypted_key_area: [[u8; 16]; PARTITION_COUNT],
}

impl NcaHeader {
    /// True when body keys must come from a ticket rather than the key area.
    pub fn has_rights_id(&self) -> bool {
        self.rights_id.iter().any(|&b| b != 0)
    }

    pub fn rights_id_hex(&self) -> String {
        hex::encode(self.rights_id)
    }
}

/// Parsed fs-header for one partition slot.
#[derive(Debug, Clone)]
pub struct FsHeader {
    pub version: u16,
    pub format_type: FormatType,
    pub hash_type: HashType,
    pub encryption_type: EncryptionType,
    /// Raw 0x138-byte hash superblock, interpreted per hash type.
    pub hash_superblock: [u8; HASH_SUPERBLOCK_LEN],
    /// Upper half of the body AES-CTR counter.
    pub ctr_seed: u64,
}

/// The decrypted header block: signatures, parsed headers, and the decrypted
/// bytes retained for hash and signature checks.
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    pub signature_main: [u8; 0x100],
    pub signature_acid: [u8; 0x100],
    pub main: NcaHeader,
    pub fs_headers: [FsHeader; PARTITION_COUNT],
    decrypted: Vec<u8>,
}

impl HeaderBlock {
    /// Decrypt and parse the 0xC00-byte header block.
    pub fn decrypt_and_parse(raw: &[u8], header_key: &Key256) -> Result<Self, NcaError> {
        if raw.len() < NCA_HEADER_BLOCK_SIZE {
            return Err(NcaError::HeaderTooSmall(raw.len()));
        }
        let decrypted = decrypt_header_block(&raw[..NCA_HEADER_BLOCK_SIZE], header_key);
        Self::parse(decrypted)
    }

    fn parse(decrypted: Vec<u8>) -> Result<Self, NcaError> {
        let mut signature_main = [0u8; 0x100];
        let mut signature_acid = [0u8; 0x100];
        signature_main.copy_from_slice(&decrypted[..0x100]);
        signature_acid.copy_from_slice(&decrypted[0x100..0x200]);

        let main = parse_main_header(
            &decrypted[MAIN_HEADER_OFFSET..MAIN_HEADER_OFFSET + MAIN_HEADER_SIZE],
        )?;

        let mut fs_headers = Vec::with_capacity(PARTITION_COUNT);
        for i in 0..PARTITION_COUNT {
            let off = FS_HEADER_OFFSET + i * FS_HEADER_SIZE;
            fs_headers.push(parse_fs_header(&decrypted[off..off + FS_HEADER_SIZE])?);
        }
        let fs_headers: [FsHeader; PARTITION_COUNT] =
            fs_headers.try_into().expect("exactly four fs headers");

        Ok(Self {
            signature_main,
            signature_acid,
            main,
            fs_headers,
            decrypted,
        })
    }

    /// The decrypted main-header region, the message both header signatures
    /// cover.
    pub fn main_header_bytes(&self) -> &[u8] {
        &self.decrypted[MAIN_HEADER_OFFSET..MAIN_HEADER_OFFSET + MAIN_HEADER_SIZE]
    }

    /// SHA-256 of the main-header region.
    pub fn header_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        Sha256::digest(self.main_header_bytes()).into()
    }

    /// The decrypted bytes of one fs-header slot.
    pub fn fs_header_bytes(&self, index: usize) -> &[u8] {
        let off = FS_HEADER_OFFSET + index * FS_HEADER_SIZE;
        &self.decrypted[off..off + FS_HEADER_SIZE]
    }
}

/// Decrypt the 0xC00-byte header block with the keyset's header key.
///
/// Sectors 0-1 always decrypt with continuous sector numbers. The magic then
/// selects the fs-header slot scheme: continuous sectors 2-5 for NCA3,
/// per-slot sector 0 for NCA2.
pub fn decrypt_header_block(raw: &[u8], header_key: &Key256) -> Vec<u8> {
    let mut out = raw[..NCA_HEADER_BLOCK_SIZE].to_vec();

    aes_xts::decrypt_aes_xts(header_key, 0, NCA_SECTOR_SIZE, &mut out[..FS_HEADER_OFFSET]);

    let is_nca2 = &out[MAIN_HEADER_OFFSET..MAIN_HEADER_OFFSET + 4] == b"NCA2";
    for slot in 0..PARTITION_COUNT {
        let off = FS_HEADER_OFFSET + slot * FS_HEADER_SIZE;
        let sector = if is_nca2 { 0 } else { (slot + 2) as u64 };
        aes_xts::decrypt_aes_xts(
            header_key,
            sector,
            NCA_SECTOR_SIZE,
            &mut out[off..off + FS_HEADER_SIZE],
        );
    }
    out
}

fn parse_main_header(hdr: &[u8]) -> Result<NcaHeader, NcaError> {
    let mut cur = Cursor::new(hdr);

    let magic = cur.read_u32::<LittleEndian>()?;
    let version = match magic {
        NCA2_MAGIC => NcaVersion::Nca2,
        NCA3_MAGIC => NcaVersion::Nca3,
        _ => return Err(NcaError::BadMagic(magic)),
    };

    let distribution_type = DistributionType::from(cur.read_u8()?);
    let content_type = ContentType::from(cur.read_u8()?);
    let key_generation_old = cur.read_u8()?;
    let kaek_index = cur.read_u8()?;
    let content_size = cur.read_u64::<LittleEndian>()?;
    let program_id = cur.read_u64::<LittleEndian>()?;
    let content_index = cur.read_u32::<LittleEndian>()?;
    let sdk_addon_version = cur.read_u32::<LittleEndian>()?;
    let key_generation = hdr[0x20];

    let mut rights_id = [0u8; 16];
    rights_id.copy_from_slice(&hdr[0x30..0x40]);

    let mut partitions = [PartitionEntry::default(); PARTITION_COUNT];
    let mut cur = Cursor::new(&hdr[0x40..0x80]);
    for entry in &mut partitions {
        let start_block = cur.read_u32::<LittleEndian>()?;
        let end_block = cur.read_u32::<LittleEndian>()?;
        let _reserved = cur.read_u64::<LittleEndian>()?;
        *entry = PartitionEntry {
            start_block,
            end_block,
        };
    }

    // Present entries must be ascending and non-overlapping.
    let mut prev_end = 0u64;
    for (i, entry) in partitions.iter().enumerate() {
        if !entry.is_present() {
            continue;
        }
        if entry.offset() < prev_end || entry.end_block < entry.start_block {
            return Err(NcaError::InvalidPartitionTable { index: i });
        }
        prev_end = entry.offset() + entry.size();
    }

    let mut fs_header_hashes = [[0u8; 32]; PARTITION_COUNT];
    for (i, hash) in fs_header_hashes.iter_mut().enumerate() {
        hash.copy_from_slice(&hdr[0x80 + i * 0x20..0x80 + (i + 1) * 0x20]);
    }

    let mut encrypted_key_area = [[0u8; 16]; PARTITION_COUNT];
    for (i, key) in encrypted_key_area.iter_mut().enumerate() {
        key.copy_from_slice(&hdr[0x100 + i * 0x10..0x100 + (i + 1) * 0x10]);
    }

    Ok(NcaHeader {
        version,
        distribution_type,
        content_type,
        key_generation_old,
        key_generation,
        kaek_index,
        content_size,
        program_id,
        content_index,
        sdk_addon_version,
        rights_id,
        partitions,
        fs_header_hashes,
        encrypted_key_area,
    })
}

fn parse_fs_header(slot: &[u8]) -> Result<FsHeader, NcaError> {
    let mut cur = Cursor::new(slot);
    let version = cur.read_u16::<LittleEndian>()?;
    let format_type = FormatType::from(cur.read_u8()?);
    let hash_type = HashType::from(cur.read_u8()?);
    let encryption_type = EncryptionType::from(cur.read_u8()?);

    let mut hash_superblock = [0u8; HASH_SUPERBLOCK_LEN];
    hash_superblock.copy_from_slice(&slot[0x08..0x08 + HASH_SUPERBLOCK_LEN]);

    let mut cur = Cursor::new(&slot[0x140..0x148]);
    let ctr_seed = cur.read_u64::<LittleEndian>()?;

    Ok(FsHeader {
        version,
        format_type,
        hash_type,
        encryption_type,
        hash_superblock,
        ctr_seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header_key() -> Key256 {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    /// Plaintext header block with the given magic and recognisable fs-header
    /// slot fill.
    fn plain_block(magic: &[u8; 4]) -> Vec<u8> {
        let mut block = vec![0u8; NCA_HEADER_BLOCK_SIZE];
        block[MAIN_HEADER_OFFSET..MAIN_HEADER_OFFSET + 4].copy_from_slice(magic);
        for slot in 0..PARTITION_COUNT {
            let off = FS_HEADER_OFFSET + slot * FS_HEADER_SIZE;
            block[off..off + 2].copy_from_slice(&FS_HEADER_VERSION.to_le_bytes());
            block[off + 2] = 1; // PFS
            block[off + 3] = 1; // hash: None
            block[off + 4] = 1; // encryption: None
            block[off + 0x140] = slot as u8 + 1; // distinct ctr seed per slot
        }
        block
    }

    fn encrypt_nca3(plain: &[u8], key: &Key256) -> Vec<u8> {
        let mut enc = plain.to_vec();
        aes_xts::encrypt_aes_xts(key, 0, NCA_SECTOR_SIZE, &mut enc);
        enc
    }

    fn encrypt_nca2(plain: &[u8], key: &Key256) -> Vec<u8> {
        let mut enc = plain.to_vec();
        aes_xts::encrypt_aes_xts(key, 0, NCA_SECTOR_SIZE, &mut enc[..FS_HEADER_OFFSET]);
        for slot in 0..PARTITION_COUNT {
            let off = FS_HEADER_OFFSET + slot * FS_HEADER_SIZE;
            aes_xts::encrypt_aes_xts(key, 0, NCA_SECTOR_SIZE, &mut enc[off..off + FS_HEADER_SIZE]);
        }
        enc
    }

    #[test]
    fn test_decrypt_nca3_continuous_sectors() {
        let key = test_header_key();
        let plain = plain_block(b"NCA3");
        let enc = encrypt_nca3(&plain, &key);
        assert_eq!(decrypt_header_block(&enc, &key), plain);
    }

    #[test]
    fn test_decrypt_nca2_per_slot_sectors() {
        let key = test_header_key();
        let plain = plain_block(b"NCA2");
        let enc = encrypt_nca2(&plain, &key);
        assert_eq!(decrypt_header_block(&enc, &key), plain);

        // The slot scheme matters: an NCA2 block encrypted with continuous
        // sectors does not survive the per-slot decryption path.
        let wrong = encrypt_nca3(&plain, &key);
        let decrypted = decrypt_header_block(&wrong, &key);
        assert_eq!(&decrypted[..FS_HEADER_OFFSET], &plain[..FS_HEADER_OFFSET]);
        assert_ne!(&decrypted[FS_HEADER_OFFSET..], &plain[FS_HEADER_OFFSET..]);
    }

    #[test]
    fn test_parse_main_header_fields() {
        let mut block = plain_block(b"NCA3");
        let h = MAIN_HEADER_OFFSET;
        block[h + 0x04] = 1; // GameCard
        block[h + 0x05] = 0; // Program
        block[h + 0x06] = 2; // key generation old
        block[h + 0x07] = 1; // Ocean
        block[h + 0x08..h + 0x10].copy_from_slice(&0x12345678u64.to_le_bytes());
        block[h + 0x10..h + 0x18].copy_from_slice(&0x0100AABBCCDD0000u64.to_le_bytes());
        block[h + 0x18..h + 0x1C].copy_from_slice(&7u32.to_le_bytes());
        block[h + 0x1C..h + 0x20].copy_from_slice(&0x000C0A01u32.to_le_bytes());
        block[h + 0x20] = 5; // key generation
        block[h + 0x30] = 0xFF; // rights id

        // Two partitions: blocks [6, 8) and [8, 12)
        block[h + 0x40..h + 0x44].copy_from_slice(&6u32.to_le_bytes());
        block[h + 0x44..h + 0x48].copy_from_slice(&8u32.to_le_bytes());
        block[h + 0x50..h + 0x54].copy_from_slice(&8u32.to_le_bytes());
        block[h + 0x54..h + 0x58].copy_from_slice(&12u32.to_le_bytes());

        block[h + 0x100] = 0xEE; // first key-area entry

        let parsed = HeaderBlock::parse(block).unwrap();
        let main = &parsed.main;
        assert_eq!(main.version, NcaVersion::Nca3);
        assert_eq!(main.distribution_type, DistributionType::GameCard);
        assert_eq!(main.content_type, ContentType::Program);
        assert_eq!(main.key_generation_old, 2);
        assert_eq!(main.key_generation, 5);
        assert_eq!(main.kaek_index, 1);
        assert_eq!(main.content_size, 0x12345678);
        assert_eq!(main.program_id, 0x0100AABBCCDD0000);
        assert_eq!(main.content_index, 7);
        assert_eq!(main.sdk_addon_version, 0x000C0A01);
        assert!(main.has_rights_id());

        assert!(main.partitions[0].is_present());
        assert_eq!(main.partitions[0].offset(), 6 * MEDIA_BLOCK_SIZE);
        assert_eq!(main.partitions[0].size(), 2 * MEDIA_BLOCK_SIZE);
        assert!(main.partitions[1].is_present());
        assert!(!main.partitions[2].is_present());

        assert_eq!(main.encrypted_key_area[0][0], 0xEE);

        assert_eq!(parsed.fs_headers[0].version, FS_HEADER_VERSION);
        assert_eq!(parsed.fs_headers[0].format_type, FormatType::Pfs);
        assert_eq!(parsed.fs_headers[0].encryption_type, EncryptionType::None);
        assert_eq!(parsed.fs_headers[0].ctr_seed, 1);
        assert_eq!(parsed.fs_headers[3].ctr_seed, 4);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let block = plain_block(b"NCA9");
        assert!(matches!(
            HeaderBlock::parse(block),
            Err(NcaError::BadMagic(_))
        ));
    }

    #[test]
    fn test_overlapping_partitions_rejected() {
        let mut block = plain_block(b"NCA3");
        let h = MAIN_HEADER_OFFSET;
        // [6, 10) then [8, 12): overlap
        block[h + 0x40..h + 0x44].copy_from_slice(&6u32.to_le_bytes());
        block[h + 0x44..h + 0x48].copy_from_slice(&10u32.to_le_bytes());
        block[h + 0x50..h + 0x54].copy_from_slice(&8u32.to_le_bytes());
        block[h + 0x54..h + 0x58].copy_from_slice(&12u32.to_le_bytes());

        assert!(matches!(
            HeaderBlock::parse(block),
            Err(NcaError::InvalidPartitionTable { index: 1 })
        ));
    }

    #[test]
    fn test_header_hash_covers_main_header() {
        use sha2::{Digest, Sha256};
        let block = plain_block(b"NCA3");
        let expected: [u8; 32] =
            Sha256::digest(&block[MAIN_HEADER_OFFSET..MAIN_HEADER_OFFSET + MAIN_HEADER_SIZE])
                .into();
        let parsed = HeaderBlock::parse(block).unwrap();
        assert_eq!(parsed.header_hash(), expected);
    }
}
