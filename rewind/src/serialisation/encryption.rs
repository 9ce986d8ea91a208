//! Encryption decorator with AES-256-GCM.
//!
//! # Security
//!
//! - AES-256-GCM provides authenticated encryption (confidentiality + integrity)
//! - Unique 96-bit nonce per write (cryptographically random)
//! - The response type name is bound as associated data, so a payload cannot
//!   be replayed under another type
//! - Keys should be provided via environment variables (never stored on disk)
//!
//! # Format
//!
//! ```text
//! [Magic: 1 byte (0xE0)] [Version: 1 byte] [Nonce: 12 bytes] [Ciphertext + Tag: N bytes]
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use bytes::Bytes;

use super::{SerialisationDecorationMetadata, SerialisationDecorator};
use crate::error::{CacheError, SerialisationError};
use crate::request::ResponseType;

const ENCRYPTION_MAGIC: u8 = 0xE0;
const ENCRYPTION_VERSION: u8 = 0x01;

/// Header size: magic (1) + version (1) + nonce (12)
const HEADER_SIZE: usize = 14;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Clone)]
pub struct EncryptionConfig {
    key: [u8; KEY_SIZE],
    /// Identifier for logging, not the key itself
    key_id: String,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key_id", &self.key_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn key_from_bytes(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CacheError> {
    <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| {
        CacheError::Config(format!(
            "Encryption key must be {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        ))
    })
}

impl EncryptionConfig {
    pub fn from_key(key: [u8; KEY_SIZE], key_id: impl Into<String>) -> Self {
        Self {
            key,
            key_id: key_id.into(),
        }
    }

    /// Create config from a 64-character hex string.
    pub fn from_hex(hex_key: &str, key_id: impl Into<String>) -> Result<Self, CacheError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| CacheError::Config(format!("Invalid hex key: {}", e)))?;
        Ok(Self::from_key(key_from_bytes(&bytes)?, key_id))
    }

    /// Create config from an environment variable holding a hex key.
    pub fn from_env(env_var: &str) -> Result<Self, CacheError> {
        let hex_key = std::env::var(env_var).map_err(|_| {
            CacheError::Config(format!("Environment variable '{}' not set", env_var))
        })?;
        Self::from_hex(&hex_key, format!("env:{}", env_var))
    }

    pub fn from_base64(b64_key: &str, key_id: impl Into<String>) -> Result<Self, CacheError> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let bytes = STANDARD
            .decode(b64_key.trim())
            .map_err(|e| CacheError::Config(format!("Invalid base64 key: {}", e)))?;
        Ok(Self::from_key(key_from_bytes(&bytes)?, key_id))
    }

    /// Generate a new random key.
    pub fn generate(key_id: impl Into<String>) -> Self {
        use aes_gcm::aead::rand_core::RngCore;

        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self::from_key(key, key_id)
    }

    /// Export key as hex string. Contains raw key material.
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Encrypts payloads whose metadata has `is_encrypted` set.
pub struct EncryptionDecorator {
    cipher: Aes256Gcm,
    key_id: String,
}

impl EncryptionDecorator {
    pub fn new(config: &EncryptionConfig) -> Result<Self, CacheError> {
        let cipher = Aes256Gcm::new_from_slice(&config.key)
            .map_err(|e| CacheError::Config(format!("Failed to initialize cipher: {}", e)))?;

        Ok(Self {
            cipher,
            key_id: config.key_id.clone(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn encrypt(&self, aad: &[u8], data: &[u8]) -> Result<Bytes, SerialisationError> {
        use aes_gcm::aead::rand_core::RngCore;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: data, aad })
            .map_err(|e| SerialisationError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut output = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        output.push(ENCRYPTION_MAGIC);
        output.push(ENCRYPTION_VERSION);
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);

        Ok(Bytes::from(output))
    }

    fn decrypt(&self, aad: &[u8], data: &[u8]) -> Result<Bytes, SerialisationError> {
        if data.len() < HEADER_SIZE {
            return Err(SerialisationError::Encryption(
                "Data too short to be encrypted".to_string(),
            ));
        }

        if data[0] != ENCRYPTION_MAGIC {
            return Err(SerialisationError::Encryption(
                "Invalid encryption header (not encrypted or corrupted)".to_string(),
            ));
        }

        if data[1] != ENCRYPTION_VERSION {
            return Err(SerialisationError::Encryption(format!(
                "Unsupported encryption version: {}",
                data[1]
            )));
        }

        let nonce = Nonce::from_slice(&data[2..HEADER_SIZE]);
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &data[HEADER_SIZE..],
                    aad,
                },
            )
            .map_err(|e| {
                SerialisationError::Encryption(format!(
                    "Decryption failed (wrong key or corrupted data): {}",
                    e
                ))
            })?;

        Ok(Bytes::from(plaintext))
    }
}

impl std::fmt::Debug for EncryptionDecorator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionDecorator")
            .field("key_id", &self.key_id)
            .field("algorithm", &"AES-256-GCM")
            .finish()
    }
}

impl SerialisationDecorator for EncryptionDecorator {
    fn decorate_serialisation(
        &self,
        response_type: &ResponseType,
        metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError> {
        if !metadata.is_encrypted {
            return Ok(payload);
        }
        self.encrypt(response_type.name().as_bytes(), &payload)
    }

    fn decorate_deserialisation(
        &self,
        response_type: &ResponseType,
        metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError> {
        if !metadata.is_encrypted {
            return Ok(payload);
        }
        self.decrypt(response_type.name().as_bytes(), &payload)
    }

    fn name(&self) -> &'static str {
        "encryption"
    }
}
