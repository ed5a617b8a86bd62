// HKDF-SHA256 key schedule: extract, expand, and the session key set.
// Numan Thabit 2025

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::keys::SharedSecret;

/// Length of a pseudorandom key (SHA-256 output).
pub const PRK_LEN: usize = 32;

/// Length of a direction key.
pub const KEY_LEN: usize = 32;

/// Length of a direction nonce base.
pub const NONCE_BASE_LEN: usize = 12;

const INFO_KEY_I2R: &[u8] = b"veil_v1_key_i2r";
const INFO_KEY_R2I: &[u8] = b"veil_v1_key_r2i";
const INFO_NONCE_I2R: &[u8] = b"veil_v1_nonce_i2r";
const INFO_NONCE_R2I: &[u8] = b"veil_v1_nonce_r2i";

/// HKDF errors surfaced by helper functions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HkdfError {
    /// Requested output exceeded 255 * 32 bytes, or the PRK was malformed.
    #[error("hkdf output length invalid")]
    InvalidLength,
}

/// HKDF-Extract: (salt, ikm) -> prk.
#[must_use]
pub fn extract(salt: &[u8], ikm: &[u8]) -> [u8; PRK_LEN] {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    prk.into()
}

/// HKDF-Expand: fills `out` from the prk under the given info label.
pub fn expand(prk: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), HkdfError> {
    let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| HkdfError::InvalidLength)?;
    hk.expand(info, out).map_err(|_| HkdfError::InvalidLength)
}

/// Directional session keys established by a completed handshake.
///
/// One endpoint's `send_key` equals the peer's `recv_key`, and likewise for
/// the nonce bases. All material is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub send_key: [u8; KEY_LEN],
    pub recv_key: [u8; KEY_LEN],
    pub send_nonce_base: [u8; NONCE_BASE_LEN],
    pub recv_nonce_base: [u8; NONCE_BASE_LEN],
}

/// Derives the four directional outputs from the shared secret.
///
/// `session_id` (the transcript HMAC) salts the extract step, so the keys are
/// bound to the exact handshake that produced them.
pub fn derive_session_keys(
    shared: &SharedSecret,
    session_id: &[u8],
    is_initiator: bool,
) -> Result<SessionKeys, HkdfError> {
    let prk = extract(session_id, shared.as_bytes());

    let mut key_i2r = [0u8; KEY_LEN];
    let mut key_r2i = [0u8; KEY_LEN];
    let mut nonce_i2r = [0u8; NONCE_BASE_LEN];
    let mut nonce_r2i = [0u8; NONCE_BASE_LEN];

    expand(&prk, INFO_KEY_I2R, &mut key_i2r)?;
    expand(&prk, INFO_KEY_R2I, &mut key_r2i)?;
    expand(&prk, INFO_NONCE_I2R, &mut nonce_i2r)?;
    expand(&prk, INFO_NONCE_R2I, &mut nonce_r2i)?;

    let keys = if is_initiator {
        SessionKeys {
            send_key: key_i2r,
            recv_key: key_r2i,
            send_nonce_base: nonce_i2r,
            recv_nonce_base: nonce_r2i,
        }
    } else {
        SessionKeys {
            send_key: key_r2i,
            recv_key: key_i2r,
            send_nonce_base: nonce_r2i,
            recv_nonce_base: nonce_i2r,
        }
    };

    key_i2r.zeroize();
    key_r2i.zeroize();
    nonce_i2r.zeroize();
    nonce_r2i.zeroize();

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::EphemeralKeypair;

    fn shared_pair() -> (SharedSecret, SharedSecret) {
        let mut a = EphemeralKeypair::generate();
        let mut b = EphemeralKeypair::generate();
        let a_pub = a.public_bytes();
        let b_pub = b.public_bytes();
        (a.agree(&b_pub).unwrap(), b.agree(&a_pub).unwrap())
    }

    #[test]
    fn directional_keys_mirror() {
        let (shared_a, shared_b) = shared_pair();
        let session_id = [0xAAu8; 32];

        let initiator = derive_session_keys(&shared_a, &session_id, true).unwrap();
        let responder = derive_session_keys(&shared_b, &session_id, false).unwrap();

        assert_eq!(initiator.send_key, responder.recv_key);
        assert_eq!(initiator.recv_key, responder.send_key);
        assert_eq!(initiator.send_nonce_base, responder.recv_nonce_base);
        assert_eq!(initiator.recv_nonce_base, responder.send_nonce_base);
        assert_ne!(initiator.send_key, initiator.recv_key);
    }

    #[test]
    fn different_session_id_changes_keys() {
        let (shared, _) = shared_pair();
        let first = derive_session_keys(&shared, &[1u8; 32], true).unwrap();
        let second = derive_session_keys(&shared, &[2u8; 32], true).unwrap();
        assert_ne!(first.send_key, second.send_key);
    }

    #[test]
    fn expand_rejects_oversized_output() {
        let prk = extract(b"salt", b"ikm");
        let mut out = vec![0u8; 255 * 32 + 1];
        assert_eq!(expand(&prk, b"info", &mut out), Err(HkdfError::InvalidLength));
    }

    #[test]
    fn extract_expand_is_deterministic() {
        let prk = extract(b"salt", b"ikm");
        let mut a = [0u8; 42];
        let mut b = [0u8; 42];
        expand(&prk, b"label", &mut a).unwrap();
        expand(&prk, b"label", &mut b).unwrap();
        assert_eq!(a, b);
    }
}
