//! Credential encryption for values stored at rest.
//!
//! Ciphertexts are AES-256-GCM with a fresh 96-bit nonce per value and are stored as
//! `hex(nonce):hex(ciphertext)`. A context is built once at startup from
//! `encryption.key` and handed to whatever needs it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption key must be 32 bytes of hex")]
    InvalidKey,
    #[error("ciphertext is malformed: {0}")]
    Malformed(String),
    #[error("ciphertext failed authentication")]
    Authentication,
    #[error("encryption failed")]
    Encrypt,
}

#[derive(Clone)]
pub struct EncryptionContext {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext").field("cipher", &"<redacted>").finish()
    }
}

impl EncryptionContext {
    pub fn new(key: &SecretString) -> Result<Self, CryptoError> {
        Self::from_hex_key(key.expose_secret())
    }

    pub fn from_hex_key(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| CryptoError::InvalidKey)?;
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(&bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        Ok(format!("{}:{}", hex::encode(nonce_bytes), hex::encode(ciphertext)))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let (nonce_hex, ciphertext_hex) = stored
            .split_once(':')
            .ok_or_else(|| CryptoError::Malformed("missing nonce separator".to_string()))?;

        let nonce = hex::decode(nonce_hex)
            .map_err(|error| CryptoError::Malformed(format!("nonce: {error}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Malformed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let ciphertext = hex::decode(ciphertext_hex)
            .map_err(|error| CryptoError::Malformed(format!("ciphertext: {error}")))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::Authentication)?;

        String::from_utf8(plaintext).map_err(|error| CryptoError::Malformed(error.to_string()))
    }

    pub fn encrypt_secret(&self, secret: &SecretString) -> Result<String, CryptoError> {
        self.encrypt(secret.expose_secret())
    }

    pub fn decrypt_secret(&self, stored: &str) -> Result<SecretString, CryptoError> {
        self.decrypt(stored).map(SecretString::from)
    }
}
