// HMAC-SHA256 for handshake envelopes and transcript binding.
// Numan Thabit 2025

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length of a full HMAC-SHA256 tag.
pub const HMAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Errors returned by HMAC verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HmacError {
    /// Supplied tag length did not match [`HMAC_LEN`].
    #[error("invalid hmac length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    /// Computed tag did not match the supplied tag.
    #[error("hmac verification failed")]
    VerificationFailed,
}

/// Computes HMAC-SHA256 over `message` with the given key.
#[must_use]
pub fn compute(key: &[u8], message: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&tag);
    out
}

/// Verifies `tag` against the message in constant time.
pub fn verify(key: &[u8], message: &[u8], tag: &[u8]) -> Result<(), HmacError> {
    if tag.len() != HMAC_LEN {
        return Err(HmacError::InvalidLength {
            expected: HMAC_LEN,
            actual: tag.len(),
        });
    }

    let expected = compute(key, message);
    if bool::from(expected.as_slice().ct_eq(tag)) {
        Ok(())
    } else {
        Err(HmacError::VerificationFailed)
    }
}
