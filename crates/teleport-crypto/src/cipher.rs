//! AES-256-GCM sealing for tunnel chunks

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;

use crate::key_exchange::SessionKey;

/// GCM nonce length
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Cipher errors
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Session key rejected by cipher")]
    InvalidKey,

    #[error("Failed to seal chunk")]
    Seal,

    #[error("Sealed chunk too short: {0} bytes")]
    Truncated(usize),

    #[error("Sealed chunk failed authentication")]
    Authentication,
}

/// Random 96-bit nonce from the OS generator
fn fresh_nonce() -> Nonce<<Aes256Gcm as AeadCore>::NonceSize> {
    Aes256Gcm::generate_nonce(&mut OsRng)
}

/// Seals and opens chunks with the per-session key
///
/// Cheap to clone; every relay in a session shares the same key.
#[derive(Clone)]
pub struct SessionCipher {
    inner: Arc<Aes256Gcm>,
}

impl SessionCipher {
    pub fn new(key: &SessionKey) -> Result<Self, CipherError> {
        let inner =
            Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CipherError::InvalidKey)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Seal `plaintext` under a fresh random nonce.
    ///
    /// Output layout is `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = fresh_nonce();
        let ciphertext = self
            .inner
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a chunk produced by [`SessionCipher::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Truncated(sealed.len()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.inner
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Authentication)
    }

    /// Size of a sealed chunk for `plaintext_len` bytes of input
    pub const fn sealed_len(plaintext_len: usize) -> usize {
        NONCE_LEN + plaintext_len + TAG_LEN
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(AES-256-GCM)")
    }
}
