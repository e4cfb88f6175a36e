// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod aes_ctr;
pub mod aes_xts;
pub mod key_manager;
pub mod keygen;
pub mod ticket;

pub use key_manager::{Key128, Key256, Keyset};
