//! Hashing, random tokens and at-rest encryption of integration secrets.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of an AES-256-GCM nonce in bytes.
pub const NONCE_LENGTH: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid encryption key")]
    InvalidKey,
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed (wrong key or tampered ciphertext)")]
    Decryption,
    #[error("stored nonce has {0} bytes, expected {NONCE_LENGTH}")]
    BadNonce(usize),
}

/// `n` bytes from the thread CSPRNG, hex encoded (`2n` characters).
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill(bytes.as_mut_slice());
    hex::encode(bytes)
}

/// SHA-256 of `input`, hex encoded.
pub fn sha256_hex(input: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(input.as_ref()))
}

/// Byte comparison whose running time does not depend on where the inputs
/// first differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Encrypted value plus the nonce it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// AES-256-GCM cipher for OAuth tokens stored in `integration_tokens`.
/// Every value gets a fresh random nonce.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &str) -> Result<Sealed, CryptoError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;
        Ok(Sealed {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    pub fn open(&self, sealed: &Sealed) -> Result<String, CryptoError> {
        if sealed.nonce.len() != NONCE_LENGTH {
            return Err(CryptoError::BadNonce(sealed.nonce.len()));
        }
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|_| CryptoError::Decryption)?;
        String::from_utf8(plain).map_err(|_| CryptoError::Decryption)
    }
}
