// X25519 ephemeral keys, shared-secret agreement, CSPRNG helpers.
// Numan Thabit 2025

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 public key length in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// X25519 shared secret length in bytes.
pub const SHARED_SECRET_LEN: usize = 32;

/// Errors from the key agreement step.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyExchangeError {
    /// Peer public key was not exactly 32 bytes.
    #[error("invalid peer public key length {0}")]
    InvalidPublicKeyLength(usize),
    /// The DH output was all-zero (weak or malicious peer key).
    #[error("key exchange produced a non-contributory secret")]
    NonContributory,
    /// The ephemeral secret was already consumed by a prior agreement.
    #[error("ephemeral secret already consumed")]
    SecretConsumed,
}

/// Ephemeral keypair generated once per handshake attempt.
///
/// The secret half is consumed by [`EphemeralKeypair::agree`]; a keypair can
/// complete exactly one key agreement before it must be regenerated.
pub struct EphemeralKeypair {
    secret: Option<EphemeralSecret>,
    public: PublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Runs X25519 against the peer's public key, consuming our secret.
    pub fn agree(&mut self, peer_public: &[u8]) -> Result<SharedSecret, KeyExchangeError> {
        let bytes: [u8; PUBLIC_KEY_LEN] = peer_public
            .try_into()
            .map_err(|_| KeyExchangeError::InvalidPublicKeyLength(peer_public.len()))?;
        let secret = self
            .secret
            .take()
            .ok_or(KeyExchangeError::SecretConsumed)?;
        let shared = secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(KeyExchangeError::NonContributory);
        }
        Ok(SharedSecret(*shared.as_bytes()))
    }
}

/// X25519 shared secret. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

#[cfg(test)]
impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(REDACTED)")
    }
}

/// Fills `buf` with bytes from the operating system CSPRNG.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Draws a random u64 from the operating system CSPRNG.
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

/// Constant-time equality over equal-length byte slices.
///
/// Length mismatch short-circuits to false; lengths are not secret here.
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
