//! Persisted key layout.
//!
//! Committed keys carry, in fixed order and separated by `_`:
//!
//! ```text
//! <request_hash>_<class_hash>_<cache_date_ms>_<expiry_date_ms>_<compressed 0|1>_<encrypted 0|1>
//! ```
//!
//! Every field is lowercase hex or decimal, so keys are valid file names.
//! Provisional keys (`pending-<request_hash>-<uuid>`) never parse as
//! committed keys.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::request::HashedRequestMetadata;
use crate::token::CacheToken;

const SEPARATOR: char = '_';
const FIELD_COUNT: usize = 6;
const PENDING_PREFIX: &str = "pending-";

/// A committed key broken into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub request_hash: String,
    pub class_hash: String,
    pub cache_date: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
    pub is_compressed: bool,
    pub is_encrypted: bool,
}

impl CacheKey {
    /// Prefix shared by every committed key of the same request and type.
    pub fn partial_key(&self) -> String {
        prefix(&self.request_hash, &self.class_hash)
    }
}

fn prefix(request_hash: &str, class_hash: &str) -> String {
    format!("{}{sep}{}{sep}", request_hash, class_hash, sep = SEPARATOR)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KeySerialiser;

impl KeySerialiser {
    /// Committed key for a token; `None` if the token has no dates yet.
    pub fn serialise(token: &CacheToken) -> Option<String> {
        let metadata = token.request_metadata();
        Some(Self::serialise_parts(&CacheKey {
            request_hash: metadata.request_hash().to_string(),
            class_hash: metadata.class_hash().to_string(),
            cache_date: token.cache_date()?,
            expiry_date: token.expiry_date()?,
            is_compressed: token.is_compressed(),
            is_encrypted: token.is_encrypted(),
        }))
    }

    pub fn serialise_parts(key: &CacheKey) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
            key.request_hash,
            key.class_hash,
            key.cache_date.timestamp_millis(),
            key.expiry_date.timestamp_millis(),
            u8::from(key.is_compressed),
            u8::from(key.is_encrypted),
            sep = SEPARATOR,
        )
    }

    /// Prefix shared by every committed key of a request.
    pub fn partial_key(metadata: &HashedRequestMetadata) -> String {
        prefix(metadata.request_hash(), metadata.class_hash())
    }

    /// A fresh provisional key for an in-flight write.
    pub fn pending_key(request_hash: &str) -> String {
        format!(
            "{}{}-{}",
            PENDING_PREFIX,
            request_hash,
            Uuid::new_v4().simple()
        )
    }

    pub fn is_pending(key: &str) -> bool {
        key.starts_with(PENDING_PREFIX)
    }

    /// Parse a committed key. Provisional or malformed keys yield `None`.
    pub fn parse(key: &str) -> Option<CacheKey> {
        if Self::is_pending(key) {
            return None;
        }

        let fields: Vec<&str> = key.split(SEPARATOR).collect();
        if fields.len() != FIELD_COUNT {
            return None;
        }

        let is_hash = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit());
        if !is_hash(fields[0]) || !is_hash(fields[1]) {
            return None;
        }

        let date = |s: &str| -> Option<DateTime<Utc>> {
            let millis: i64 = s.parse().ok()?;
            if millis < 0 {
                return None;
            }
            DateTime::from_timestamp_millis(millis)
        };
        let flag = |s: &str| match s {
            "0" => Some(false),
            "1" => Some(true),
            _ => None,
        };

        Some(CacheKey {
            request_hash: fields[0].to_string(),
            class_hash: fields[1].to_string(),
            cache_date: date(fields[2])?,
            expiry_date: date(fields[3])?,
            is_compressed: flag(fields[4])?,
            is_encrypted: flag(fields[5])?,
        })
    }
}
