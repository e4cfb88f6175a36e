// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synthetic archive fixtures: known-plaintext NCA images built with known
//! keys, for exercising the full decrypt-and-verify pipeline.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cipher::generic_array::GenericArray;
use rsa::pss::SigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

use runca_crypto::aes_ctr;
use runca_crypto::aes_xts::{self, NCA_SECTOR_SIZE};
use runca_crypto::key_manager::key_names;
use runca_crypto::{Key128, Key256, Keyset};

use crate::hash_tree::HASH_SUPERBLOCK_LEN;
use crate::header::{
    FS_HEADER_OFFSET, FS_HEADER_SIZE, FS_HEADER_VERSION, MEDIA_BLOCK_SIZE, NCA_HEADER_BLOCK_SIZE,
    PARTITION_COUNT,
};

pub(crate) const CONTENT_TYPE_PROGRAM: u8 = 0;
pub(crate) const CONTENT_TYPE_DATA: u8 = 4;

pub(crate) const FORMAT_ROMFS: u8 = 0;
pub(crate) const FORMAT_PFS: u8 = 1;

pub(crate) const HASH_NONE: u8 = 1;
pub(crate) const HASH_HIERARCHICAL_SHA256: u8 = 2;
pub(crate) const HASH_HIERARCHICAL_INTEGRITY: u8 = 3;

pub(crate) const ENCRYPTION_NONE: u8 = 1;
pub(crate) const ENCRYPTION_AES_XTS: u8 = 2;
pub(crate) const ENCRYPTION_AES_CTR: u8 = 3;

pub(crate) const TEST_HEADER_KEY: Key256 = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
    0xFF, 0x0F, 0x1E, 0x2D, 0x3C, 0x4B, 0x5A, 0x69, 0x78, 0x87, 0x96, 0xA5, 0xB4, 0xC3, 0xD2,
    0xE1, 0xF0,
];

pub(crate) const TEST_KAEK: Key128 = [0x4B; 16];

const DEFAULT_BODY_CTR_KEY: Key128 = [0xB7; 16];

/// Generate a fresh RSA-2048 signing key.
pub(crate) fn test_rsa_key() -> RsaPrivateKey {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, 2048).expect("RSA key generation")
}

/// The big-endian public modulus of a signing key, zero-padded to 0x100.
pub(crate) fn rsa_modulus(key: &RsaPrivateKey) -> [u8; 0x100] {
    let bytes = key.to_public_key().n().to_bytes_be();
    let mut modulus = [0u8; 0x100];
    modulus[0x100 - bytes.len()..].copy_from_slice(&bytes);
    modulus
}

/// AES-128-ECB wrap a key; the inverse of `keygen::unwrap_key`.
pub(crate) fn wrap_key(plain: &Key128, kek: &Key128) -> Key128 {
    let cipher = Aes128::new(GenericArray::from_slice(kek));
    let mut block = GenericArray::clone_from_slice(plain);
    cipher.encrypt_block(&mut block);
    block.into()
}

fn sign_pss(key: &RsaPrivateKey, message: &[u8]) -> [u8; 0x100] {
    let mut rng = rand::thread_rng();
    let sig = SigningKey::<Sha256>::new(key.clone())
        .sign_with_rng(&mut rng, message)
        .to_bytes();
    let mut out = [0u8; 0x100];
    out[0x100 - sig.len()..].copy_from_slice(&sig);
    out
}

/// Build a minimal PFS0 binary with the given file entries.
pub(crate) fn build_pfs0(files: &[(&str, &[u8])]) -> Vec<u8> {
    let num_entries = files.len();

    let mut strtab: Vec<u8> = Vec::new();
    let mut strtab_offsets = Vec::new();
    for (name, _) in files {
        strtab_offsets.push(strtab.len());
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    while strtab.len() % 4 != 0 {
        strtab.push(0);
    }

    let mut data = Vec::new();
    data.extend_from_slice(b"PFS0");
    data.extend_from_slice(&(num_entries as u32).to_le_bytes());
    data.extend_from_slice(&(strtab.len() as u32).to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());

    let mut running_offset: u64 = 0;
    for (i, (_, content)) in files.iter().enumerate() {
        data.extend_from_slice(&running_offset.to_le_bytes());
        data.extend_from_slice(&(content.len() as u64).to_le_bytes());
        data.extend_from_slice(&(strtab_offsets[i] as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        running_offset += content.len() as u64;
    }

    data.extend_from_slice(&strtab);
    for (_, content) in files {
        data.extend_from_slice(content);
    }
    data
}

/// Build a 0x400-byte NPDM blob whose ACID carries the given public modulus.
pub(crate) fn build_npdm(modulus: &[u8; 0x100]) -> Vec<u8> {
    const ACID_OFFSET: usize = 0x80;
    const ACID_SIZE: usize = 0x220;

    let mut npdm = vec![0u8; 0x400];
    npdm[..4].copy_from_slice(b"META");
    npdm[0x20..0x27].copy_from_slice(b"fixture");
    npdm[0x78..0x7C].copy_from_slice(&(ACID_OFFSET as u32).to_le_bytes());
    npdm[0x7C..0x80].copy_from_slice(&(ACID_SIZE as u32).to_le_bytes());

    let acid = ACID_OFFSET;
    // [acid + 0x000] signature left zeroed
    npdm[acid + 0x100..acid + 0x200].copy_from_slice(modulus);
    npdm[acid + 0x200..acid + 0x204].copy_from_slice(b"ACID");
    npdm[acid + 0x204..acid + 0x208].copy_from_slice(&(ACID_SIZE as u32).to_le_bytes());
    npdm
}

/// SHA-256 each `block_size` chunk of `data` into a flat hash table.
fn hash_table(data: &[u8], block_size: usize, align: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in data.chunks(block_size) {
        let mut hasher = Sha256::new();
        hasher.update(chunk);
        if align && chunk.len() < block_size {
            hasher.update(vec![0u8; block_size - chunk.len()]);
        }
        let digest: [u8; 32] = hasher.finalize().into();
        out.extend_from_slice(&digest);
    }
    out
}

/// Build a HierarchicalSha256 partition image `[hash table][data]` plus its
/// superblock.
pub(crate) fn build_sha256_partition(
    data: &[u8],
    block_size: u32,
) -> (Vec<u8>, [u8; HASH_SUPERBLOCK_LEN]) {
    let table = hash_table(data, block_size as usize, true);
    let master: [u8; 32] = Sha256::digest(&table).into();

    let mut image = table.clone();
    image.extend_from_slice(data);

    let mut sb = [0u8; HASH_SUPERBLOCK_LEN];
    sb[..32].copy_from_slice(&master);
    sb[0x20..0x24].copy_from_slice(&block_size.to_le_bytes());
    sb[0x24..0x28].copy_from_slice(&2u32.to_le_bytes());
    sb[0x28..0x30].copy_from_slice(&0u64.to_le_bytes());
    sb[0x30..0x38].copy_from_slice(&(table.len() as u64).to_le_bytes());
    sb[0x38..0x40].copy_from_slice(&(table.len() as u64).to_le_bytes());
    sb[0x40..0x48].copy_from_slice(&(data.len() as u64).to_le_bytes());

    (image, sb)
}

/// Build a HierarchicalIntegrity partition image `[root]..[lowest][data]`
/// plus its superblock. Returns the data region's offset within the image.
pub(crate) fn build_ivfc_partition(
    data: &[u8],
    data_block_log2: u32,
    hash_block_log2: u32,
    hash_layer_count: usize,
) -> (Vec<u8>, [u8; HASH_SUPERBLOCK_LEN], u64) {
    let data_block = 1usize << data_block_log2;
    let hash_block = 1usize << hash_block_log2;

    // Hash layers built bottom-up, then flipped root-first.
    let mut layers: Vec<Vec<u8>> = Vec::new();
    let mut cur = hash_table(data, data_block, false);
    layers.push(cur.clone());
    for _ in 1..hash_layer_count {
        cur = hash_table(&cur, hash_block, false);
        layers.push(cur.clone());
    }
    layers.reverse();

    let masters = hash_table(&layers[0], hash_block, false);
    assert!(masters.len() <= 0x78, "master hash list overflows superblock");

    let mut offsets = Vec::with_capacity(layers.len());
    let mut off = 0u64;
    for layer in &layers {
        offsets.push(off);
        off += layer.len() as u64;
    }
    let data_offset = off;

    let mut image = Vec::new();
    for layer in &layers {
        image.extend_from_slice(layer);
    }
    image.extend_from_slice(data);

    let mut sb = [0u8; HASH_SUPERBLOCK_LEN];
    sb[..4].copy_from_slice(b"IVFC");
    sb[0x04..0x08].copy_from_slice(&0x20000u32.to_le_bytes());
    sb[0x08..0x0C].copy_from_slice(&(masters.len() as u32).to_le_bytes());
    sb[0x0C..0x10].copy_from_slice(&((hash_layer_count + 1) as u32).to_le_bytes());
    for (i, layer) in layers.iter().enumerate() {
        let base = 0x10 + i * 0x18;
        sb[base..base + 8].copy_from_slice(&offsets[i].to_le_bytes());
        sb[base + 8..base + 16].copy_from_slice(&(layer.len() as u64).to_le_bytes());
        sb[base + 16..base + 20].copy_from_slice(&hash_block_log2.to_le_bytes());
    }
    let data_entry = 0x10 + hash_layer_count * 0x18;
    sb[data_entry..data_entry + 8].copy_from_slice(&data_offset.to_le_bytes());
    sb[data_entry + 8..data_entry + 16].copy_from_slice(&(data.len() as u64).to_le_bytes());
    sb[data_entry + 16..data_entry + 20].copy_from_slice(&data_block_log2.to_le_bytes());
    sb[0xC0..0xC0 + masters.len()].copy_from_slice(&masters);

    (image, sb, data_offset)
}

/// One partition of a synthetic archive.
pub(crate) struct PartitionFixture {
    pub format: u8,
    pub encryption: u8,
    pub hash: u8,
    /// Plaintext partition image, hash layers included.
    pub image: Vec<u8>,
    pub superblock: [u8; HASH_SUPERBLOCK_LEN],
    pub ctr_seed: u64,
}

impl PartitionFixture {
    pub fn new(
        format: u8,
        encryption: u8,
        hash: u8,
        image: Vec<u8>,
        superblock: [u8; HASH_SUPERBLOCK_LEN],
        ctr_seed: u64,
    ) -> Self {
        Self {
            format,
            encryption,
            hash,
            image,
            superblock,
            ctr_seed,
        }
    }

    /// An unencrypted, unhashed PFS partition.
    pub fn plain_pfs(image: Vec<u8>) -> Self {
        Self::new(FORMAT_PFS, ENCRYPTION_NONE, HASH_NONE, image, [0u8; HASH_SUPERBLOCK_LEN], 0)
    }
}

/// A built archive and the keyset that opens it.
pub(crate) struct BuiltNca {
    pub bytes: Vec<u8>,
    pub keys: Keyset,
}

/// Assembles complete encrypted archives field by field.
pub(crate) struct NcaBuilder {
    magic: [u8; 4],
    content_type: u8,
    rights_id: [u8; 16],
    partitions: Vec<PartitionFixture>,
    body_ctr_key: Key128,
    sign_key: Option<RsaPrivateKey>,
    acid_sign_key: Option<RsaPrivateKey>,
    omit_kaek: bool,
    continuous_fs_slot_tweak: bool,
}

impl NcaBuilder {
    pub fn new(magic: &[u8; 4], content_type: u8) -> Self {
        Self {
            magic: *magic,
            content_type,
            rights_id: [0u8; 16],
            partitions: Vec::new(),
            body_ctr_key: DEFAULT_BODY_CTR_KEY,
            sign_key: None,
            acid_sign_key: None,
            omit_kaek: false,
            continuous_fs_slot_tweak: false,
        }
    }

    pub fn partition(mut self, fixture: PartitionFixture) -> Self {
        self.partitions.push(fixture);
        self
    }

    pub fn rights_id(mut self, rights_id: [u8; 16]) -> Self {
        self.rights_id = rights_id;
        self
    }

    pub fn body_ctr_key(mut self, key: Key128) -> Self {
        self.body_ctr_key = key;
        self
    }

    pub fn sign_key(mut self, key: RsaPrivateKey) -> Self {
        self.sign_key = Some(key);
        self
    }

    pub fn acid_sign_key(mut self, key: RsaPrivateKey) -> Self {
        self.acid_sign_key = Some(key);
        self
    }

    /// Leave the key-area encryption key out of the returned keyset.
    pub fn omit_kaek(mut self) -> Self {
        self.omit_kaek = true;
        self
    }

    /// Encrypt NCA2 fs-header slots with the (wrong) continuous NCA3 tweak
    /// stream instead of per-slot sector 0.
    pub fn continuous_fs_slot_tweak(mut self) -> Self {
        self.continuous_fs_slot_tweak = true;
        self
    }

    pub fn build(self) -> BuiltNca {
        assert!(self.partitions.len() <= PARTITION_COUNT);
        let has_rights_id = self.rights_id.iter().any(|&b| b != 0);

        // Lay out and encrypt partition bodies.
        let mut bodies = Vec::new();
        let mut entries = Vec::new();
        let mut cursor = NCA_HEADER_BLOCK_SIZE as u64;
        for fixture in &self.partitions {
            let mut image = fixture.image.clone();
            let padded = image.len().next_multiple_of(MEDIA_BLOCK_SIZE as usize);
            image.resize(padded, 0);

            let offset = cursor;
            cursor += image.len() as u64;
            entries.push((
                (offset / MEDIA_BLOCK_SIZE) as u32,
                (cursor / MEDIA_BLOCK_SIZE) as u32,
            ));

            if fixture.encryption == ENCRYPTION_AES_CTR {
                let iv = aes_ctr::make_body_ctr(fixture.ctr_seed, offset);
                aes_ctr::apply_ctr(&self.body_ctr_key, &iv, &mut image);
            }
            bodies.push(image);
        }

        // Plaintext fs-header slots.
        let mut fs_slots = vec![[0u8; FS_HEADER_SIZE]; PARTITION_COUNT];
        for (slot, fixture) in fs_slots.iter_mut().zip(&self.partitions) {
            slot[..2].copy_from_slice(&FS_HEADER_VERSION.to_le_bytes());
            slot[2] = fixture.format;
            slot[3] = fixture.hash;
            slot[4] = fixture.encryption;
            slot[0x08..0x08 + HASH_SUPERBLOCK_LEN].copy_from_slice(&fixture.superblock);
            slot[0x140..0x148].copy_from_slice(&fixture.ctr_seed.to_le_bytes());
        }

        // Main header.
        let mut main = [0u8; 0x200];
        main[..4].copy_from_slice(&self.magic);
        main[0x05] = self.content_type;
        main[0x08..0x10].copy_from_slice(&cursor.to_le_bytes());
        main[0x10..0x18].copy_from_slice(&0x0100_0000_0000_1000u64.to_le_bytes());
        main[0x1C..0x20].copy_from_slice(&0x000C_0A01u32.to_le_bytes());
        main[0x30..0x40].copy_from_slice(&self.rights_id);
        for (i, (start, end)) in entries.iter().enumerate() {
            let base = 0x40 + i * 0x10;
            main[base..base + 4].copy_from_slice(&start.to_le_bytes());
            main[base + 4..base + 8].copy_from_slice(&end.to_le_bytes());
        }
        for (i, slot) in fs_slots.iter().enumerate() {
            let digest: [u8; 32] = Sha256::digest(slot).into();
            main[0x80 + i * 0x20..0x80 + (i + 1) * 0x20].copy_from_slice(&digest);
        }
        if !has_rights_id {
            let wrapped = wrap_key(&self.body_ctr_key, &TEST_KAEK);
            main[0x120..0x130].copy_from_slice(&wrapped);
        }

        let signature_main = self
            .sign_key
            .as_ref()
            .map(|k| sign_pss(k, &main))
            .unwrap_or([0u8; 0x100]);
        let signature_acid = self
            .acid_sign_key
            .as_ref()
            .map(|k| sign_pss(k, &main))
            .unwrap_or([0u8; 0x100]);

        // Assemble the plaintext file, then encrypt the header block.
        let mut bytes = Vec::with_capacity(cursor as usize);
        bytes.extend_from_slice(&signature_main);
        bytes.extend_from_slice(&signature_acid);
        bytes.extend_from_slice(&main);
        for slot in &fs_slots {
            bytes.extend_from_slice(slot);
        }
        for body in &bodies {
            bytes.extend_from_slice(body);
        }

        let per_slot = self.magic == *b"NCA2" && !self.continuous_fs_slot_tweak;
        aes_xts::encrypt_aes_xts(
            &TEST_HEADER_KEY,
            0,
            NCA_SECTOR_SIZE,
            &mut bytes[..FS_HEADER_OFFSET],
        );
        for slot in 0..PARTITION_COUNT {
            let off = FS_HEADER_OFFSET + slot * FS_HEADER_SIZE;
            let sector = if per_slot { 0 } else { (slot + 2) as u64 };
            aes_xts::encrypt_aes_xts(
                &TEST_HEADER_KEY,
                sector,
                NCA_SECTOR_SIZE,
                &mut bytes[off..off + FS_HEADER_SIZE],
            );
        }

        // Keyset that opens this archive.
        let mut keys = Keyset::new();
        keys.set_key(key_names::HEADER_KEY, &TEST_HEADER_KEY);
        if !has_rights_id && !self.omit_kaek {
            keys.set_key("key_area_key_application_00", &TEST_KAEK);
        }
        if let Some(sign_key) = &self.sign_key {
            keys.set_key(key_names::HEADER_SIGN_KEY_MODULUS, &rsa_modulus(sign_key));
        }

        BuiltNca { bytes, keys }
    }
}
