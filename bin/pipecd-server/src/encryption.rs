//! Symmetric encryption keyed by the control-plane encryption key
//!
//! AES-256-GCM with the key derived as SHA-256 of the key file content.
//! Ciphertexts are base64 of `nonce || sealed`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use pipecd_common::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

const NONCE_LEN: usize = 12;

pub struct Encrypter {
    cipher: Aes256Gcm,
}

impl Encrypter {
    pub fn new(key: &[u8]) -> Self {
        let digest = Sha256::digest(key);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest));
        Self { cipher }
    }

    /// Read and trim the key file
    pub fn load_key(path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("failed to read encryption key {}: {e}", path.display())))?;
        let key = raw.trim();
        if key.is_empty() {
            return Err(Error::configuration(format!("encryption key {} is empty", path.display())));
        }
        Ok(key.as_bytes().to_vec())
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::internal(format!("failed to encrypt: {e}")))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let raw = BASE64
            .decode(ciphertext)
            .map_err(|e| Error::invalid_argument(format!("ciphertext is not base64: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::invalid_argument("ciphertext is too short"));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::invalid_argument("failed to decrypt"))?;
        String::from_utf8(plain).map_err(|e| Error::invalid_argument(format!("plaintext is not utf-8: {e}")))
    }
}
