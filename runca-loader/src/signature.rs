// SPDX-FileCopyrightText: 2025 runca contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! RSA-2048-PSS/SHA-256 verification of the NCA header signatures.
//!
//! Signature 1 is keyed by a fixed platform key distributed with the keyset;
//! signature 2 by the ACID public key embedded in the archive's own
//! `main.npdm`. Both cover the 0x200-byte main-header region. Signature
//! failures never abort archive processing; they surface as warnings.

use rsa::pss::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::{BigUint, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

/// Errors building the verification key; an actual mismatch is not an error
/// but a `false` result.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid RSA public key: {0}")]
    BadKey(rsa::errors::Error),

    #[error("malformed signature blob")]
    BadSignature,
}

/// Outcome of one signature check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    /// The check ran and failed, or could not be completed; carries the reason.
    Invalid(String),
    /// The check did not apply to this archive.
    Skipped(String),
}

impl SignatureCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureCheck::Valid)
    }
}

/// Results of both header signature checks.
#[derive(Debug, Clone)]
pub struct SignatureReport {
    /// Signature 1, fixed platform key.
    pub fixed_key: SignatureCheck,
    /// Signature 2, ACID key from `main.npdm` (Program archives only).
    pub acid: SignatureCheck,
}

/// Verify an RSA-2048-PSS/SHA-256 signature.
///
/// `modulus` is the big-endian public modulus (exponent 65537), `message`
/// the signed bytes, `signature` the raw big-endian signature block.
/// Returns `Ok(false)` on mismatch; errors only for unusable key material.
pub fn verify_pss_sha256(
    modulus: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<bool, SignatureError> {
    let key = RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from(65537u32),
    )
    .map_err(SignatureError::BadKey)?;
    let signature = Signature::try_from(signature).map_err(|_| SignatureError::BadSignature)?;
    Ok(VerifyingKey::<Sha256>::new(key)
        .verify(message, &signature)
        .is_ok())
}
