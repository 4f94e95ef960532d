//! At-rest encryption for the GitHub token.
//!
//! Stored form: `base64(nonce[12] || ciphertext)` under AES-256-GCM.

use std::path::Path;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::info;

use crate::{Error, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub const DEFAULT_KEY_FILE: &str = "starcast_secret.key";

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Decode a base64 key as given in `SECRET_KEY`.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::config(format!("SECRET_KEY is not valid base64: {e}")))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::config(format!("SECRET_KEY must decode to {KEY_LEN} bytes")))?;
        Ok(Self::new(&key))
    }

    /// Load the key from `path`, generating and writing a fresh one if the
    /// file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_base64_key(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key: [u8; KEY_LEN] = rand::random();
                std::fs::write(path, STANDARD.encode(key))?;
                info!(path = %path.display(), "Generated new token encryption key");
                Ok(Self::new(&key))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| Error::Crypto("AES-GCM encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let raw = STANDARD
            .decode(stored)
            .map_err(|e| Error::Crypto(format!("stored token is not base64: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::Crypto("stored token is truncated".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("AES-GCM decryption failed".to_string()))?;
        String::from_utf8(plaintext).map_err(|e| Error::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypts_with_fresh_nonce_each_time() {
        let cipher = TokenCipher::new(&[7u8; KEY_LEN]);
        let a = cipher.encrypt("ghp_secret").unwrap();
        let b = cipher.encrypt("ghp_secret").unwrap();

        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), "ghp_secret");
        assert_eq!(cipher.decrypt(&b).unwrap(), "ghp_secret");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let stored = TokenCipher::new(&[1u8; KEY_LEN]).encrypt("t").unwrap();
        assert!(TokenCipher::new(&[2u8; KEY_LEN]).decrypt(&stored).is_err());
    }

    #[test]
    fn short_base64_key_is_rejected() {
        let err = TokenCipher::from_base64_key(&STANDARD.encode([0u8; 16])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn key_file_is_created_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");

        let first = TokenCipher::load_or_create(&path).unwrap();
        assert!(path.exists());
        let stored = first.encrypt("token").unwrap();

        let second = TokenCipher::load_or_create(&path).unwrap();
        assert_eq!(second.decrypt(&stored).unwrap(), "token");
    }
}
