use crate::SecurityError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const KEY_SALT: &[u8] = b"mycelix.mail.secret-cipher.v1";
const NONCE_LEN: usize = 12;

/// Reversible transform protecting account passwords at rest.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecurityError>;
    fn decrypt(&self, blob: &str) -> Result<String, SecurityError>;
}

/// AES-256-GCM with a key stretched from the master secret by Argon2id.
///
/// Blobs are `base64(nonce || ciphertext || tag)`; every call draws a fresh
/// nonce, so encrypting the same plaintext twice yields different blobs.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn from_master_key(master_key: &str) -> Result<Self, SecurityError> {
        if master_key.is_empty() {
            return Err(SecurityError::KeyDerivation(
                "master key must not be empty".to_string(),
            ));
        }

        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(master_key.as_bytes(), KEY_SALT, &mut key)
            .map_err(|err| SecurityError::KeyDerivation(err.to_string()))?;

        Ok(Self {
            cipher: Aes256Gcm::new(&key.into()),
        })
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecurityError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|err| SecurityError::Encryption(err.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    fn decrypt(&self, blob: &str) -> Result<String, SecurityError> {
        let combined = STANDARD
            .decode(blob.as_bytes())
            .map_err(|err| SecurityError::InvalidFormat(err.to_string()))?;
        if combined.len() <= NONCE_LEN {
            return Err(SecurityError::InvalidFormat(format!(
                "blob too short ({} bytes)",
                combined.len()
            )));
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|err| SecurityError::Decryption(err.to_string()))?;

        String::from_utf8(plaintext).map_err(|err| SecurityError::Decryption(err.to_string()))
    }
}
