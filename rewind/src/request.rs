//! Request identity and hashing.
//!
//! A request is identified by its normalised URL (query parameters sorted),
//! its body and the type its response decodes into. The [`Hasher`] turns that
//! identity into a request hash and a class hash; together they address at
//! most one cache slot.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use url::Url;

/// Placeholder URL carried by requests that could not be hashed.
pub const DEFAULT_URL: &str = "http://127.0.0.1";

/// Sentinel hash carried by requests that could not be hashed.
pub const INVALID_HASH: &str = "no_hash";

/// Stable identity of a response type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseType {
    name: String,
}

impl ResponseType {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Identity of `R`, derived from its fully qualified type name.
    pub fn of<R: ?Sized + 'static>() -> Self {
        Self::new(std::any::type_name::<R>())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Request identity as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainRequestMetadata {
    pub response_type: ResponseType,
    pub url: String,
    pub request_body: Option<String>,
}

impl PlainRequestMetadata {
    pub fn new(response_type: ResponseType, url: impl Into<String>) -> Self {
        Self {
            response_type,
            url: url.into(),
            request_body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.request_body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRequestMetadata {
    pub plain: PlainRequestMetadata,
    pub request_hash: String,
    pub class_hash: String,
}

/// A request that could not be hashed. Caching is bypassed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRequestMetadata {
    pub plain: PlainRequestMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashedRequestMetadata {
    Valid(ValidRequestMetadata),
    Invalid(InvalidRequestMetadata),
}

impl HashedRequestMetadata {
    pub fn is_valid(&self) -> bool {
        matches!(self, HashedRequestMetadata::Valid(_))
    }

    pub fn plain(&self) -> &PlainRequestMetadata {
        match self {
            HashedRequestMetadata::Valid(valid) => &valid.plain,
            HashedRequestMetadata::Invalid(invalid) => &invalid.plain,
        }
    }

    pub fn response_type(&self) -> &ResponseType {
        &self.plain().response_type
    }

    /// The request URL, or [`DEFAULT_URL`] for invalid requests.
    pub fn url(&self) -> &str {
        match self {
            HashedRequestMetadata::Valid(valid) => &valid.plain.url,
            HashedRequestMetadata::Invalid(_) => DEFAULT_URL,
        }
    }

    pub fn request_hash(&self) -> &str {
        match self {
            HashedRequestMetadata::Valid(valid) => &valid.request_hash,
            HashedRequestMetadata::Invalid(_) => INVALID_HASH,
        }
    }

    pub fn class_hash(&self) -> &str {
        match self {
            HashedRequestMetadata::Valid(valid) => &valid.class_hash,
            HashedRequestMetadata::Invalid(_) => INVALID_HASH,
        }
    }
}

/// Computes request and class hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hasher;

impl Hasher {
    pub fn new() -> Self {
        Self
    }

    /// Hash a request. Never fails: unusable input yields
    /// [`HashedRequestMetadata::Invalid`].
    pub fn hash(&self, metadata: &PlainRequestMetadata) -> HashedRequestMetadata {
        if metadata.response_type.name().is_empty() {
            warn!("Cannot hash request for {}: empty response type", metadata.url);
            return invalid(metadata);
        }
        if metadata.response_type.name().contains('\n') {
            warn!(
                "Cannot hash request for {}: response type {:?} contains a newline",
                metadata.url,
                metadata.response_type.name()
            );
            return invalid(metadata);
        }

        let Some(normalised) = Self::normalise_url(&metadata.url) else {
            warn!("Cannot hash request: unusable URL {}", metadata.url);
            return invalid(metadata);
        };

        let mut input = normalised;
        if let Some(body) = &metadata.request_body {
            input.push_str("||");
            input.push_str(body);
        }

        HashedRequestMetadata::Valid(ValidRequestMetadata {
            plain: metadata.clone(),
            request_hash: Self::hash_text(&input),
            class_hash: Self::hash_text(metadata.response_type.name()),
        })
    }

    /// Hex-encoded SHA-256 of `text`.
    pub fn hash_text(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    /// Canonical form of `url`: scheme, host, explicit non-default port, path
    /// and query pairs sorted by key then value. Fragments are dropped.
    pub fn normalise_url(url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;

        let mut normalised = format!("{}://{}", parsed.scheme(), host);
        if let Some(port) = parsed.port() {
            normalised.push_str(&format!(":{}", port));
        }
        normalised.push_str(parsed.path());

        let mut pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if !pairs.is_empty() {
            pairs.sort();
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            normalised.push('?');
            normalised.push_str(&query);
        }

        Some(normalised)
    }
}

fn invalid(metadata: &PlainRequestMetadata) -> HashedRequestMetadata {
    HashedRequestMetadata::Invalid(InvalidRequestMetadata {
        plain: metadata.clone(),
    })
}
