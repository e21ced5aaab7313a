//! Envelope encryption of biometric templates.
//!
//! Templates are sealed with AES-256-GCM under a key that only exists in the memory of the user
//! process. Each call to [`SymmetricKey::encrypt`] draws a fresh 96 bit nonce, which travels
//! base64 encoded in the `iv` field of the [`EncryptedPackage`].

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
    Key,
    Nonce,
};
use rand::{rngs::OsRng, Rng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::message::{Embedding, EncryptedPackage};

/// Length of the symmetric key in bytes.
pub const KEY_LENGTH: usize = 32;
/// Length of the GCM nonce in bytes.
pub const NONCE_LENGTH: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64 in `{field}`: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("expected a {expected} byte iv, got {actual} bytes")]
    InvalidIv { expected: usize, actual: usize },
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed: wrong key or tampered ciphertext")]
    Decryption,
    #[error("decrypted template is not a valid embedding: {0}")]
    Template(#[source] serde_json::Error),
}

/// A 256 bit AES key. Wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LENGTH]);

impl SymmetricKey {
    /// Draws a new key from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0_u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPackage, CryptoError> {
        let nonce = rand::thread_rng().gen::<[u8; NONCE_LENGTH]>();
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;
        Ok(EncryptedPackage {
            data: base64::encode(ciphertext),
            iv: base64::encode(nonce),
        })
    }

    /// Decrypts and authenticates a package produced by [`SymmetricKey::encrypt`].
    pub fn decrypt(&self, package: &EncryptedPackage) -> Result<Vec<u8>, CryptoError> {
        let nonce = base64::decode(&package.iv)
            .map_err(|source| CryptoError::Base64 { field: "iv", source })?;
        if nonce.len() != NONCE_LENGTH {
            return Err(CryptoError::InvalidIv {
                expected: NONCE_LENGTH,
                actual: nonce.len(),
            });
        }
        let ciphertext = base64::decode(&package.data)
            .map_err(|source| CryptoError::Base64 { field: "data", source })?;
        self.cipher()
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CryptoError::Decryption)
    }

    /// Serializes the embedding to JSON and encrypts it.
    pub fn encrypt_embedding(&self, embedding: &Embedding) -> Result<EncryptedPackage, CryptoError> {
        let mut plaintext = serde_json::to_vec(embedding).map_err(CryptoError::Template)?;
        let package = self.encrypt(&plaintext);
        plaintext.zeroize();
        package
    }

    /// Decrypts a package and parses the embedding inside.
    pub fn decrypt_embedding(&self, package: &EncryptedPackage) -> Result<Embedding, CryptoError> {
        let mut plaintext = self.decrypt(package)?;
        let embedding = serde_json::from_slice(&plaintext).map_err(CryptoError::Template);
        plaintext.zeroize();
        embedding
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}
