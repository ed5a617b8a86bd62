// ChaCha20-Poly1305-IETF seal/open and counter nonce derivation.
// Numan Thabit 2025

use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, KeyInit, Nonce,
};
use thiserror::Error;

/// Authentication tag length, appended to the ciphertext.
pub const TAG_LEN: usize = 16;

/// Nonce size for ChaCha20-Poly1305-IETF.
pub const NONCE_LEN: usize = 12;

/// Key size.
pub const KEY_LEN: usize = 32;

/// Errors returned by the AEAD helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// Authentication or decryption failed.
    #[error("decryption failed")]
    Decrypt,
}

/// Encrypts `plaintext`, returning ciphertext with the tag appended.
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from(*nonce);
    cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

/// Decrypts ciphertext+tag produced by [`seal`].
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from(*nonce);
    cipher
        .decrypt(
            &nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}

/// Derives the per-packet nonce: base XOR (0^4 || counter_le64).
///
/// The counter lands in the trailing 8 bytes little-endian, so nonces are
/// unique for a given key as long as counters never repeat.
#[must_use]
pub fn make_nonce(base: &[u8; NONCE_LEN], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    for (i, byte) in counter.to_le_bytes().iter().enumerate() {
        nonce[NONCE_LEN - 8 + i] ^= byte;
    }
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn seal_open_round_trip() {
        let key = [0x11u8; KEY_LEN];
        let nonce = [0x22u8; NONCE_LEN];
        let aad = b"packet-header";
        let plaintext = b"hello veilport";

        let sealed = seal(&key, &nonce, aad, plaintext).expect("seal");
        assert_eq!(sealed.len(), plaintext.len() + TAG_LEN);

        let opened = open(&key, &nonce, aad, &sealed).expect("open");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [0x33u8; KEY_LEN];
        let nonce = [0x44u8; NONCE_LEN];
        let mut sealed = seal(&key, &nonce, b"aad", b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert_eq!(open(&key, &nonce, b"aad", &sealed), Err(AeadError::Decrypt));
    }

    #[test]
    fn tampered_tag_fails() {
        let key = [0x55u8; KEY_LEN];
        let nonce = [0x66u8; NONCE_LEN];
        let mut sealed = seal(&key, &nonce, b"aad", b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert_eq!(open(&key, &nonce, b"aad", &sealed), Err(AeadError::Decrypt));
    }

    #[test]
    fn tampered_aad_fails() {
        let key = [0x77u8; KEY_LEN];
        let nonce = [0x88u8; NONCE_LEN];
        let sealed = seal(&key, &nonce, b"aad-one", b"payload").unwrap();
        assert_eq!(
            open(&key, &nonce, b"aad-two", &sealed),
            Err(AeadError::Decrypt)
        );
    }

    #[test]
    fn nonce_for_counter_zero_is_base() {
        let base = [0x5Au8; NONCE_LEN];
        assert_eq!(make_nonce(&base, 0), base);
    }

    proptest! {
        #[test]
        fn nonce_uniqueness(
            base in prop::array::uniform12(any::<u8>()),
            counters in prop::collection::hash_set(any::<u64>(), 1..64)
        ) {
            let mut seen = HashSet::new();
            for counter in counters {
                let nonce = make_nonce(&base, counter);
                prop_assert!(seen.insert(nonce), "duplicate nonce for distinct counters");
            }
        }

        #[test]
        fn round_trip_arbitrary(
            key in prop::array::uniform32(any::<u8>()),
            base in prop::array::uniform12(any::<u8>()),
            counter in any::<u64>(),
            aad in prop::collection::vec(any::<u8>(), 0..32),
            plaintext in prop::collection::vec(any::<u8>(), 0..512)
        ) {
            let nonce = make_nonce(&base, counter);
            let sealed = seal(&key, &nonce, &aad, &plaintext).unwrap();
            let opened = open(&key, &nonce, &aad, &sealed).unwrap();
            prop_assert_eq!(opened, plaintext);
        }
    }
}
