// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Key derivation for NCA bodies.
//!
//! The header carries two overlapping key-generation bytes for historical
//! reasons; the effective generation is the larger of the two, and
//! generations 0 and 1 both map to master-key revision 0. Key-area entries
//! and ticket title keys are wrapped with single-block AES-128-ECB.

use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;
use cipher::generic_array::GenericArray;

use crate::key_manager::Key128;

/// Map the header's key-generation bytes to a master-key revision.
///
/// Takes the larger of the old and new generation fields, then shifts to the
/// zero-based revision index (generations 0 and 1 are both revision 0).
pub fn master_key_revision(key_generation_old: u8, key_generation: u8) -> u8 {
    key_generation_old.max(key_generation).saturating_sub(1)
}

/// True if every byte of the key is zero (absent key-area slot).
pub fn is_zero_key(key: &[u8]) -> bool {
    key.iter().all(|&b| b == 0)
}

/// Unwrap a single wrapped AES key with AES-128-ECB under `kek`.
///
/// Used both for key-area entries (kek = key-area encryption key) and for
/// ticket title keys (kek = titlekek at the archive's master-key revision).
pub fn unwrap_key(wrapped: &Key128, kek: &Key128) -> Key128 {
    let cipher = Aes128::new(GenericArray::from_slice(kek));
    let mut block = GenericArray::clone_from_slice(wrapped);
    cipher.decrypt_block(&mut block);
    block.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;

    fn wrap_key(plain: &Key128, kek: &Key128) -> Key128 {
        let cipher = Aes128::new(GenericArray::from_slice(kek));
        let mut block = GenericArray::clone_from_slice(plain);
        cipher.encrypt_block(&mut block);
        block.into()
    }

    #[test]
    fn test_master_key_revision() {
        assert_eq!(master_key_revision(0, 0), 0);
        assert_eq!(master_key_revision(1, 0), 0);
        assert_eq!(master_key_revision(0, 1), 0);
        assert_eq!(master_key_revision(2, 0), 1);
        assert_eq!(master_key_revision(0, 5), 4);
        // The larger of the two fields wins when they disagree
        assert_eq!(master_key_revision(3, 7), 6);
        assert_eq!(master_key_revision(7, 3), 6);
    }

    #[test]
    fn test_unwrap_key_inverts_wrap() {
        let kek: Key128 = [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ];
        let plain: Key128 = [0xA5; 16];
        let wrapped = wrap_key(&plain, &kek);
        assert_ne!(wrapped, plain);
        assert_eq!(unwrap_key(&wrapped, &kek), plain);
    }

    #[test]
    fn test_is_zero_key() {
        assert!(is_zero_key(&[0u8; 16]));
        let mut key = [0u8; 16];
        key[15] = 1;
        assert!(!is_zero_key(&key));
    }
}
