//! AES-256-GCM encryption stage.
//!
//! Sealed payload layout:
//!
//! ```ascii
//!  0: nonce (12 bytes) - fixed random u32 prefix + u64 counter, both BE
//! 12: ciphertext (same length as the plaintext)
//!  *: GCM tag (16 bytes)
//! ```
//!
//! The stage adds 28 bytes per message. The random prefix is drawn once per
//! stage instance so two instances sharing a key do not reuse nonces.

use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{AeadInPlace, KeyInit, Nonce, Tag};

use crate::pipeline::{EncryptionStage, StageError};

/// Key length in bytes.
pub const KEY_LEN: usize = 32;
/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Errors raised by [`AesGcmEncryption`].
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    /// The key is not [`KEY_LEN`] bytes long.
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidKey(usize),
    /// The sealed payload is shorter than nonce + tag.
    #[error("sealed payload too short: {0} bytes")]
    Truncated(usize),
    /// Tag verification failed: wrong key or tampered bytes.
    #[error("authentication failed")]
    Authentication,
    /// The cipher refused to seal the payload.
    #[error("encryption failed")]
    Seal,
}

/// AES-256-GCM [`EncryptionStage`].
pub struct AesGcmEncryption {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_counter: AtomicU64,
}

impl AesGcmEncryption {
    /// Create the stage from a 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKey(key.len()))?;
        Ok(Self {
            cipher,
            nonce_fixed: rand::random(),
            nonce_counter: AtomicU64::new(0),
        })
    }

    fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        nonce[4..].copy_from_slice(
            &self
                .nonce_counter
                .fetch_add(1, Ordering::AcqRel)
                .to_be_bytes(),
        );
        nonce
    }
}

impl EncryptionStage for AesGcmEncryption {
    fn encrypt(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError> {
        let nonce = self.next_nonce();
        out.extend_from_slice(&nonce);
        let start = out.len();
        out.extend_from_slice(input);

        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::<Aes256Gcm>::from_slice(&nonce), b"", &mut out[start..])
            .map_err(|_| EncryptionError::Seal)?;
        out.extend_from_slice(tag.as_slice());
        Ok(())
    }

    fn decrypt(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), StageError> {
        if input.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::Truncated(input.len()).into());
        }

        let (nonce, rest) = input.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        let start = out.len();
        out.extend_from_slice(ciphertext);
        self.cipher
            .decrypt_in_place_detached(
                Nonce::<Aes256Gcm>::from_slice(nonce),
                b"",
                &mut out[start..],
                Tag::<Aes256Gcm>::from_slice(tag),
            )
            .map_err(|_| {
                out.truncate(start);
                EncryptionError::Authentication
            })?;
        Ok(())
    }
}
