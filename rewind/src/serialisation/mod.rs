//! Layered, reversible serialisation of cached responses.
//!
//! A response is encoded to JSON, then passed through the decorators in
//! declared order on write and in reverse order on read. The standard chain
//! is:
//!
//! ```text
//! JSON -> compression -> encryption -> class-name framing -> store
//! ```
//!
//! Compression and encryption act only when the entry's
//! [`SerialisationDecorationMetadata`] asks for them; framing is
//! unconditional, so every persisted body starts with `<type-name>\n`.

mod compression;
mod encryption;
mod framing;
mod key;

pub use compression::{CompressionAlgorithm, CompressionDecorator};
pub use encryption::{EncryptionConfig, EncryptionDecorator};
pub use framing::ClassNameDecorator;
pub use key::{CacheKey, KeySerialiser};

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::{CacheError, SerialisationError};
use crate::request::ResponseType;

/// Payloads above this size are (de)serialised on the blocking pool.
const BLOCKING_THRESHOLD: usize = 64 * 1024;

/// Per-entry flags threaded through the decorator chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialisationDecorationMetadata {
    pub is_compressed: bool,
    pub is_encrypted: bool,
}

impl SerialisationDecorationMetadata {
    pub fn new(is_compressed: bool, is_encrypted: bool) -> Self {
        Self {
            is_compressed,
            is_encrypted,
        }
    }
}

/// One reversible step of the pipeline.
///
/// Implementations must be no-ops when the metadata flag they act on is
/// unset, and must fail with a [`SerialisationError`] rather than return
/// wrong bytes when a payload is corrupt.
pub trait SerialisationDecorator: Send + Sync {
    fn decorate_serialisation(
        &self,
        response_type: &ResponseType,
        metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError>;

    fn decorate_deserialisation(
        &self,
        response_type: &ResponseType,
        metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError>;

    fn name(&self) -> &'static str;
}

/// Ordered decorator chain plus JSON encoding.
#[derive(Clone)]
pub struct SerialisationManager {
    decorators: Arc<Vec<Box<dyn SerialisationDecorator>>>,
    can_encrypt: bool,
}

impl SerialisationManager {
    /// Build a manager from an explicit decorator list.
    ///
    /// `can_encrypt` tells the manager whether one of the decorators handles
    /// the encryption flag.
    pub fn new(decorators: Vec<Box<dyn SerialisationDecorator>>, can_encrypt: bool) -> Self {
        Self {
            decorators: Arc::new(decorators),
            can_encrypt,
        }
    }

    /// The standard chain: compression, encryption (when a key is
    /// configured), class-name framing.
    pub fn standard(
        compression: CompressionAlgorithm,
        encryption: Option<&EncryptionConfig>,
    ) -> Result<Self, CacheError> {
        let mut decorators: Vec<Box<dyn SerialisationDecorator>> =
            vec![Box::new(CompressionDecorator::new(compression))];
        if let Some(config) = encryption {
            decorators.push(Box::new(EncryptionDecorator::new(config)?));
        }
        decorators.push(Box::new(ClassNameDecorator));

        Ok(Self::new(decorators, encryption.is_some()))
    }

    pub fn can_encrypt(&self) -> bool {
        self.can_encrypt
    }

    fn check_metadata(
        &self,
        metadata: &SerialisationDecorationMetadata,
    ) -> Result<(), SerialisationError> {
        if metadata.is_encrypted && !self.can_encrypt {
            return Err(SerialisationError::Encryption(
                "No encryption key configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply every decorator in declared order.
    pub fn serialise_bytes(
        &self,
        response_type: &ResponseType,
        metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError> {
        self.check_metadata(metadata)?;
        self.decorators.iter().try_fold(payload, |payload, decorator| {
            decorator.decorate_serialisation(response_type, metadata, payload)
        })
    }

    /// Unwind every decorator in reverse order.
    pub fn deserialise_bytes(
        &self,
        response_type: &ResponseType,
        metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError> {
        self.check_metadata(metadata)?;
        self.decorators
            .iter()
            .rev()
            .try_fold(payload, |payload, decorator| {
                decorator.decorate_deserialisation(response_type, metadata, payload)
            })
    }

    /// Encode a response and run it through the chain.
    #[instrument(skip(self, response, response_type), fields(response_type = %response_type))]
    pub async fn serialise<R: Serialize>(
        &self,
        response: &R,
        response_type: &ResponseType,
        metadata: SerialisationDecorationMetadata,
    ) -> Result<Bytes, SerialisationError> {
        let json = Bytes::from(serde_json::to_vec(response)?);
        debug!("Serialising {} bytes ({:?})", json.len(), metadata);

        if json.len() < BLOCKING_THRESHOLD {
            return self.serialise_bytes(response_type, &metadata, json);
        }

        let manager = self.clone();
        let response_type = response_type.clone();
        tokio::task::spawn_blocking(move || manager.serialise_bytes(&response_type, &metadata, json))
            .await
            .map_err(|e| SerialisationError::Task(e.to_string()))?
    }

    /// Unwind the chain and decode the response.
    #[instrument(skip(self, response_type, payload), fields(response_type = %response_type, size = payload.len()))]
    pub async fn deserialise<R: DeserializeOwned>(
        &self,
        response_type: &ResponseType,
        metadata: SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<R, SerialisationError> {
        let body = if payload.len() < BLOCKING_THRESHOLD {
            self.deserialise_bytes(response_type, &metadata, payload)?
        } else {
            let manager = self.clone();
            let response_type = response_type.clone();
            tokio::task::spawn_blocking(move || {
                manager.deserialise_bytes(&response_type, &metadata, payload)
            })
            .await
            .map_err(|e| SerialisationError::Task(e.to_string()))??
        };
        Ok(serde_json::from_slice(&body)?)
    }

    /// Type name of a persisted body, read from its framing.
    pub fn stored_type_name(payload: &Bytes) -> Option<String> {
        ClassNameDecorator::split(payload)
            .ok()
            .map(|(name, _)| name.to_string())
    }
}

impl std::fmt::Debug for SerialisationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.decorators.iter().map(|d| d.name()).collect();
        f.debug_struct("SerialisationManager")
            .field("decorators", &names)
            .field("can_encrypt", &self.can_encrypt)
            .finish()
    }
}
