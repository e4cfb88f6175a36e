// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! AES-128-CTR keystream application for NCA partition bodies.

use crate::key_manager::Key128;
use cipher::{KeyIvInit, StreamCipher};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Apply the AES-128-CTR keystream to `data` in place.
///
/// CTR is symmetric, so the same call encrypts and decrypts.
///
/// `key`: 128-bit AES key.
/// `iv`: 128-bit initial counter (big-endian).
pub fn apply_ctr(key: &Key128, iv: &Key128, data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}

/// Build the body CTR for a partition at an absolute archive offset.
///
/// The counter layout is:
/// - Bytes [0..8]: the fs-header CTR seed (big-endian)
/// - Bytes [8..16]: offset / 0x10, i.e. the AES block index (big-endian)
pub fn make_body_ctr(seed: u64, offset: u64) -> Key128 {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&seed.to_be_bytes());
    iv[8..16].copy_from_slice(&(offset >> 4).to_be_bytes());
    iv
}
