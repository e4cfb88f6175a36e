// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! AES-128-XTS for the NCA header block.
//!
//! XTS mode uses two AES-128 keys (total 256 bits). The NCA `header_key` is
//! split: first 16 bytes = data key, last 16 bytes = tweak key.
//!
//! Each 0x200-byte sector is processed independently with a sector-number
//! tweak. The sector number is stored big-endian in the upper half of the
//! tweak block (Nintendo's non-standard variant; IEEE XTS would store it
//! little-endian from byte 0).

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cipher::generic_array::GenericArray;

use crate::key_manager::Key256;

/// AES block size in bytes.
const AES_BLOCK_SIZE: usize = 16;

/// NCA header sector size for XTS.
pub const NCA_SECTOR_SIZE: usize = 0x200;

/// Decrypt data in-place using AES-128-XTS with the given 256-bit key.
///
/// `key`: 256-bit key (first 16 bytes = data key, last 16 bytes = tweak key).
/// `sector`: sector number applied to the first sector; subsequent sectors
/// increment from it.
/// `sector_size`: size of each XTS sector (0x200 for NCA headers).
pub fn decrypt_aes_xts(key: &Key256, sector: u64, sector_size: usize, data: &mut [u8]) {
    let data_key = Aes128::new(GenericArray::from_slice(&key[..16]));
    let tweak_key = Aes128::new(GenericArray::from_slice(&key[16..32]));

    for (s, sector_data) in data.chunks_mut(sector_size).enumerate() {
        let mut tweak = make_tweak(&tweak_key, sector + s as u64);
        for block in sector_data.chunks_exact_mut(AES_BLOCK_SIZE) {
            xor_block(block, &tweak);
            let mut cipher_block = GenericArray::clone_from_slice(block);
            data_key.decrypt_block(&mut cipher_block);
            block.copy_from_slice(&cipher_block);
            xor_block(block, &tweak);
            gf128_mul_alpha(&mut tweak);
        }
    }
}

/// Encrypt data in-place using AES-128-XTS; the inverse of [`decrypt_aes_xts`].
pub fn encrypt_aes_xts(key: &Key256, sector: u64, sector_size: usize, data: &mut [u8]) {
    let data_key = Aes128::new(GenericArray::from_slice(&key[..16]));
    let tweak_key = Aes128::new(GenericArray::from_slice(&key[16..32]));

    for (s, sector_data) in data.chunks_mut(sector_size).enumerate() {
        let mut tweak = make_tweak(&tweak_key, sector + s as u64);
        for block in sector_data.chunks_exact_mut(AES_BLOCK_SIZE) {
            xor_block(block, &tweak);
            let mut cipher_block = GenericArray::clone_from_slice(block);
            data_key.encrypt_block(&mut cipher_block);
            block.copy_from_slice(&cipher_block);
            xor_block(block, &tweak);
            gf128_mul_alpha(&mut tweak);
        }
    }
}

/// Compute the initial tweak for a sector: encrypt the big-endian sector
/// number (upper 8 bytes of the tweak block) with the tweak key.
fn make_tweak(tweak_key: &Aes128, sector_num: u64) -> [u8; 16] {
    let mut tweak = [0u8; 16];
    tweak[8..].copy_from_slice(&sector_num.to_be_bytes());
    let mut tweak_block = GenericArray::clone_from_slice(&tweak);
    tweak_key.encrypt_block(&mut tweak_block);
    tweak.copy_from_slice(&tweak_block);
    tweak
}

/// XOR a 16-byte block with a tweak value.
#[inline]
fn xor_block(block: &mut [u8], tweak: &[u8; 16]) {
    for (b, t) in block.iter_mut().zip(tweak.iter()) {
        *b ^= *t;
    }
}

/// Multiply a value in GF(2^128) by alpha (x), used for XTS tweak advancement.
///
/// Left-shift of the 128-bit value with conditional XOR of the reduction
/// polynomial (x^128 + x^7 + x^2 + x + 1 → feedback byte 0x87).
fn gf128_mul_alpha(tweak: &mut [u8; 16]) {
    let mut carry = 0u8;
    for byte in tweak.iter_mut() {
        let new_carry = *byte >> 7;
        *byte = (*byte << 1) | carry;
        carry = new_carry;
    }
    if carry != 0 {
        tweak[0] ^= 0x87;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gf128_mul_alpha() {
        let mut tweak = [0u8; 16];
        tweak[0] = 0x01;
        gf128_mul_alpha(&mut tweak);
        assert_eq!(tweak[0], 0x02);

        // Carry propagation between bytes
        let mut tweak2 = [0u8; 16];
        tweak2[0] = 0x80;
        gf128_mul_alpha(&mut tweak2);
        assert_eq!(tweak2[0], 0x00);
        assert_eq!(tweak2[1], 0x01);
    }

    #[test]
    fn test_gf128_mul_alpha_reduction() {
        // Carry out of byte[15] MSB → XOR with 0x87
        let mut tweak = [0u8; 16];
        tweak[15] = 0x80;
        gf128_mul_alpha(&mut tweak);
        assert_eq!(tweak[0], 0x87);
        assert_eq!(tweak[15], 0x00);
    }

    #[test]
    fn test_xts_round_trip() {
        let key: Key256 = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b,
            0x1c, 0x1d, 0x1e, 0x1f,
        ];

        let plaintext = vec![0x42u8; NCA_SECTOR_SIZE];
        let mut data = plaintext.clone();

        encrypt_aes_xts(&key, 0, NCA_SECTOR_SIZE, &mut data);
        assert_ne!(data, plaintext);

        decrypt_aes_xts(&key, 0, NCA_SECTOR_SIZE, &mut data);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_xts_multi_sector() {
        let key: Key256 = [0xAA; 32];
        let plaintext = vec![0x55u8; NCA_SECTOR_SIZE * 3];
        let mut data = plaintext.clone();

        encrypt_aes_xts(&key, 0, NCA_SECTOR_SIZE, &mut data);
        assert_ne!(data, plaintext);

        decrypt_aes_xts(&key, 0, NCA_SECTOR_SIZE, &mut data);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_xts_sector_number_matters() {
        // The same ciphertext decrypted under a different sector tweak must
        // not produce the original plaintext.
        let key: Key256 = [0x3C; 32];
        let plaintext = vec![0x99u8; NCA_SECTOR_SIZE];

        let mut data = plaintext.clone();
        encrypt_aes_xts(&key, 2, NCA_SECTOR_SIZE, &mut data);

        let mut wrong = data.clone();
        decrypt_aes_xts(&key, 3, NCA_SECTOR_SIZE, &mut wrong);
        assert_ne!(wrong, plaintext);

        decrypt_aes_xts(&key, 2, NCA_SECTOR_SIZE, &mut data);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_xts_sectors_advance_from_start() {
        // Encrypting three sectors in one call equals encrypting each sector
        // separately with its own sector number.
        let key: Key256 = [0x77; 32];
        let plaintext = vec![0x12u8; NCA_SECTOR_SIZE * 3];

        let mut whole = plaintext.clone();
        encrypt_aes_xts(&key, 4, NCA_SECTOR_SIZE, &mut whole);

        let mut pieces = plaintext.clone();
        for s in 0..3 {
            let range = s * NCA_SECTOR_SIZE..(s + 1) * NCA_SECTOR_SIZE;
            encrypt_aes_xts(&key, 4 + s as u64, NCA_SECTOR_SIZE, &mut pieces[range]);
        }
        assert_eq!(whole, pieces);
    }
}
