//! AES-256-GCM vault for user exchange credentials.
//!
//! Ciphertext layout: 12-byte random IV, ciphertext, 16-byte auth tag, then
//! base64. The key is SHA-256 of the configured secret. A decrypt failure is
//! an unusable-credential error; there is no fallback.

use crate::domain::errors::CredentialError;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::Malformed {
                reason: "encryption failed".to_string(),
            })?;
        let mut packed = Vec::with_capacity(IV_LEN + ciphertext.len());
        packed.extend_from_slice(&iv);
        packed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(packed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CredentialError> {
        let packed = BASE64
            .decode(encoded)
            .map_err(|e| CredentialError::Malformed {
                reason: format!("base64: {e}"),
            })?;
        if packed.len() < IV_LEN + TAG_LEN {
            return Err(CredentialError::Malformed {
                reason: format!("ciphertext too short: {} bytes", packed.len()),
            });
        }
        let (iv, ciphertext) = packed.split_at(IV_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CredentialError::Malformed {
                reason: "authentication failed".to_string(),
            })?;
        String::from_utf8(plaintext).map_err(|e| CredentialError::Malformed {
            reason: format!("utf8: {e}"),
        })
    }
}
