//! Credential vault: symmetric encryption of stored vendor API keys
//!
//! The key is SHA-256 of the server secret; each call draws a fresh 12-byte IV
//! and seals with AES-256-GCM. Ciphertext and IV are stored base64-encoded.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Version tag written with every record, for future key rotation
pub const KEY_VERSION: &str = "v1";

const IV_LEN: usize = 12;

/// Encrypted vendor key as persisted for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub ciphertext: String,
    pub iv: String,
    pub key_version: String,
}

impl CredentialRecord {
    /// Build a record from nullable columns; a row missing either half holds no key
    pub fn from_parts(
        ciphertext: Option<String>,
        iv: Option<String>,
        key_version: Option<String>,
    ) -> Option<Self> {
        match (ciphertext, iv) {
            (Some(ciphertext), Some(iv)) if !ciphertext.is_empty() && !iv.is_empty() => {
                Some(Self {
                    ciphertext,
                    iv,
                    key_version: key_version.unwrap_or_else(|| KEY_VERSION.to_string()),
                })
            }
            _ => None,
        }
    }
}

fn derive_cipher(secret: &str) -> Aes256Gcm {
    let digest = Sha256::digest(secret.as_bytes());
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(digest.as_slice()))
}

/// Encrypt a plaintext key under the server secret
pub fn encrypt(secret: &str, plaintext: &str) -> Result<CredentialRecord> {
    let cipher = derive_cipher(secret);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| Error::EncryptionFailed)?;

    Ok(CredentialRecord {
        ciphertext: STANDARD.encode(ciphertext),
        iv: STANDARD.encode(nonce.as_slice()),
        key_version: KEY_VERSION.to_string(),
    })
}

/// Decrypt a stored record; tampering, a wrong secret, or bad base64 all fail
pub fn decrypt(secret: &str, record: &CredentialRecord) -> Result<String> {
    let iv = STANDARD
        .decode(record.iv.trim())
        .map_err(|_| Error::DecryptionFailed)?;
    if iv.len() != IV_LEN {
        return Err(Error::DecryptionFailed);
    }
    let ciphertext = STANDARD
        .decode(record.ciphertext.trim())
        .map_err(|_| Error::DecryptionFailed)?;

    let cipher = derive_cipher(secret);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| Error::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| Error::DecryptionFailed)
}
