//! Exchange credential encryption
//!
//! Blobs are `base64(nonce || ciphertext)` where the plaintext is the JSON
//! encoding of [`Credentials`] and the cipher is AES-256-GCM with a 96-bit
//! random nonce.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENCRYPTION_KEY_ENV: &str = "SECRETS_ENCRYPTION_KEY";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("credential decryption failed: {0}")]
    DecryptFailed(String),
    #[error("credential encryption failed: {0}")]
    EncryptFailed(String),
}

impl CredentialError {
    pub fn code(&self) -> &'static str {
        "CREDENTIALS_DECRYPT_FAILED"
    }
}

/// Decrypted API credentials for one exchange account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .finish()
    }
}

pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, blob: &str) -> Result<Credentials, CredentialError>;
}

/// AES-256-GCM credential store key
#[derive(Clone)]
pub struct SecretsManager {
    encryption_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for SecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsManager")
            .field("encryption_active", &self.is_encryption_active())
            .finish()
    }
}

impl SecretsManager {
    /// Key from `SECRETS_ENCRYPTION_KEY` (64 hex chars). A missing variable
    /// leaves encryption inactive; a malformed one is an error.
    pub fn from_env() -> Result<Self, CredentialError> {
        match std::env::var(ENCRYPTION_KEY_ENV) {
            Ok(hex_key) => Self::from_hex(&hex_key),
            Err(_) => Ok(Self {
                encryption_key: None,
            }),
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, CredentialError> {
        let bytes =
            hex::decode(hex_key.trim()).map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CredentialError> {
        if bytes.len() != KEY_LEN {
            return Err(CredentialError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            encryption_key: Some(bytes),
        })
    }

    pub fn is_encryption_active(&self) -> bool {
        self.encryption_key.is_some()
    }

    fn cipher(&self) -> Option<Aes256Gcm> {
        self.encryption_key
            .as_deref()
            .map(|k| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k)))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let cipher = self
            .cipher()
            .ok_or_else(|| CredentialError::EncryptFailed("no encryption key".into()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::EncryptFailed("cipher error".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt_str(&self, blob: &str) -> Result<String, CredentialError> {
        let cipher = self
            .cipher()
            .ok_or_else(|| CredentialError::DecryptFailed("no encryption key".into()))?;
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|e| CredentialError::DecryptFailed(format!("not base64: {}", e)))?;
        if raw.len() <= NONCE_LEN {
            return Err(CredentialError::DecryptFailed("blob too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::DecryptFailed("authentication tag mismatch".into()))?;
        String::from_utf8(plaintext).map_err(|e| CredentialError::DecryptFailed(e.to_string()))
    }

    pub fn encrypt_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<String, CredentialError> {
        let json = serde_json::to_string(credentials)
            .map_err(|e| CredentialError::EncryptFailed(e.to_string()))?;
        self.encrypt(&json)
    }
}

impl CredentialDecryptor for SecretsManager {
    fn decrypt(&self, blob: &str) -> Result<Credentials, CredentialError> {
        let json = self.decrypt_str(blob)?;
        serde_json::from_str(&json)
            .map_err(|e| CredentialError::DecryptFailed(format!("malformed credentials: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn creds() -> Credentials {
        Credentials {
            api_key: "ak".into(),
            api_secret: "shh".into(),
            passphrase: None,
        }
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let secrets = SecretsManager::from_hex(KEY).unwrap();
        let blob = secrets.encrypt_credentials(&creds()).unwrap();
        assert!(!blob.contains("shh"));
        assert_eq!(secrets.decrypt(&blob).unwrap(), creds());
    }

    #[test]
    fn test_nonce_is_fresh_per_encryption() {
        let secrets = SecretsManager::from_hex(KEY).unwrap();
        assert_ne!(secrets.encrypt("x").unwrap(), secrets.encrypt("x").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = SecretsManager::from_hex(KEY).unwrap().encrypt_credentials(&creds()).unwrap();
        let other = SecretsManager::from_bytes(vec![7u8; 32]).unwrap();
        let err = other.decrypt(&blob).unwrap_err();
        assert!(matches!(err, CredentialError::DecryptFailed(_)));
        assert_eq!(err.code(), "CREDENTIALS_DECRYPT_FAILED");
    }

    #[test]
    fn test_garbage_and_missing_key() {
        let secrets = SecretsManager::from_hex(KEY).unwrap();
        assert!(secrets.decrypt("%%%").is_err());
        assert!(secrets.decrypt("AAAA").is_err());

        let inactive = SecretsManager { encryption_key: None };
        assert!(!inactive.is_encryption_active());
        assert!(inactive.decrypt("anything").is_err());
    }

    #[test]
    fn test_key_length_checked() {
        assert!(matches!(
            SecretsManager::from_hex("abcd"),
            Err(CredentialError::InvalidKey(_))
        ));
        assert!(SecretsManager::from_hex("zz").is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", creds());
        assert!(!rendered.contains("shh"));
    }
}
