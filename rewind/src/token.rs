//! Cache tokens and the status state machine.
//!
//! A [`CacheToken`] is created once per request attempt and never mutated:
//! each refinement (status, flags, dates) returns a new token.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operation::Operation;
use crate::request::HashedRequestMetadata;
use crate::serialisation::KeySerialiser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    /// The request instruction, before any lookup.
    Instruction,
    /// Response delivered without caching (bypass or failed write).
    NotCached,
    /// Response from the network with no prior cached data.
    Network,
    /// Cached response within its expiry date.
    Fresh,
    /// Cached response past its expiry date; a final response follows.
    Stale,
    /// Cached response past its expiry date, returned by an offline call.
    OfflineStale,
    /// Network response that replaced stale cached data.
    Refreshed,
    /// Stale cached response delivered after a failed refresh.
    CouldNotRefresh,
    /// Nothing to deliver.
    Empty,
    /// A completable operation (invalidate, clear) finished.
    Done,
}

struct Flags {
    is_final: bool,
    is_single: bool,
    is_fresh: bool,
    is_from_cache: bool,
    is_error: bool,
}

impl CacheStatus {
    const fn flags(self) -> Flags {
        let (is_final, is_single, is_fresh, is_from_cache, is_error) = match self {
            CacheStatus::Instruction => (false, false, false, false, false),
            CacheStatus::NotCached => (true, true, true, false, false),
            CacheStatus::Network => (true, true, true, false, false),
            CacheStatus::Fresh => (true, true, true, true, false),
            CacheStatus::Stale => (false, false, false, true, false),
            CacheStatus::OfflineStale => (true, false, false, true, false),
            CacheStatus::Refreshed => (true, false, true, false, false),
            CacheStatus::CouldNotRefresh => (true, false, false, true, true),
            CacheStatus::Empty => (true, false, true, false, true),
            CacheStatus::Done => (true, true, true, false, false),
        };
        Flags {
            is_final,
            is_single,
            is_fresh,
            is_from_cache,
            is_error,
        }
    }

    /// No further response follows this one.
    pub fn is_final(self) -> bool {
        let flags = self.flags();
        flags.is_final || flags.is_single
    }

    /// Neither preceded nor followed by another response.
    pub fn is_single(self) -> bool {
        self.flags().is_single
    }

    pub fn is_fresh(self) -> bool {
        self.flags().is_fresh
    }

    pub fn is_from_cache(self) -> bool {
        self.flags().is_from_cache
    }

    /// Responses with this status carry an exception in their metadata.
    pub fn is_error(self) -> bool {
        self.flags().is_error
    }

    /// `Fresh` strictly before `expiry`, `Stale` from `expiry` on.
    pub fn from_expiry(now: DateTime<Utc>, expiry: DateTime<Utc>) -> Self {
        if now < expiry {
            CacheStatus::Fresh
        } else {
            CacheStatus::Stale
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Instruction => "INSTRUCTION",
            CacheStatus::NotCached => "NOT_CACHED",
            CacheStatus::Network => "NETWORK",
            CacheStatus::Fresh => "FRESH",
            CacheStatus::Stale => "STALE",
            CacheStatus::OfflineStale => "OFFLINE_STALE",
            CacheStatus::Refreshed => "REFRESHED",
            CacheStatus::CouldNotRefresh => "COULD_NOT_REFRESH",
            CacheStatus::Empty => "EMPTY",
            CacheStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved operation bound to the request it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInstruction {
    pub operation: Operation,
    pub request_metadata: HashedRequestMetadata,
}

impl CacheInstruction {
    pub fn new(operation: Operation, request_metadata: HashedRequestMetadata) -> Self {
        Self {
            operation,
            request_metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheToken {
    instruction: CacheInstruction,
    status: CacheStatus,
    is_compressed: bool,
    is_encrypted: bool,
    fetch_date: Option<DateTime<Utc>>,
    cache_date: Option<DateTime<Utc>>,
    expiry_date: Option<DateTime<Utc>>,
}

impl CacheToken {
    /// A token for a request that has not been looked up yet.
    pub fn new(instruction: CacheInstruction) -> Self {
        Self {
            instruction,
            status: CacheStatus::Instruction,
            is_compressed: false,
            is_encrypted: false,
            fetch_date: None,
            cache_date: None,
            expiry_date: None,
        }
    }

    /// A token describing a persisted entry.
    pub fn cached(
        instruction: CacheInstruction,
        status: CacheStatus,
        is_compressed: bool,
        is_encrypted: bool,
        cache_date: DateTime<Utc>,
        expiry_date: DateTime<Utc>,
    ) -> Self {
        Self {
            instruction,
            status,
            is_compressed,
            is_encrypted,
            fetch_date: None,
            cache_date: Some(cache_date),
            expiry_date: Some(expiry_date),
        }
    }

    pub fn instruction(&self) -> &CacheInstruction {
        &self.instruction
    }

    pub fn operation(&self) -> &Operation {
        &self.instruction.operation
    }

    pub fn request_metadata(&self) -> &HashedRequestMetadata {
        &self.instruction.request_metadata
    }

    pub fn status(&self) -> CacheStatus {
        self.status
    }

    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    pub fn fetch_date(&self) -> Option<DateTime<Utc>> {
        self.fetch_date
    }

    pub fn cache_date(&self) -> Option<DateTime<Utc>> {
        self.cache_date
    }

    pub fn expiry_date(&self) -> Option<DateTime<Utc>> {
        self.expiry_date
    }

    /// Key prefix shared by every persisted version of this request.
    pub fn partial_key(&self) -> String {
        KeySerialiser::partial_key(self.request_metadata())
    }

    pub fn with_status(&self, status: CacheStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn with_flags(&self, is_compressed: bool, is_encrypted: bool) -> Self {
        Self {
            is_compressed,
            is_encrypted,
            ..self.clone()
        }
    }

    pub fn with_fetch_date(&self, fetch_date: DateTime<Utc>) -> Self {
        Self {
            fetch_date: Some(fetch_date),
            ..self.clone()
        }
    }

    /// Set the cache and expiry dates; `expiry_date` is clamped so it never
    /// precedes `cache_date`.
    pub fn with_dates(&self, cache_date: DateTime<Utc>, expiry_date: DateTime<Utc>) -> Self {
        Self {
            cache_date: Some(cache_date),
            expiry_date: Some(expiry_date.max(cache_date)),
            ..self.clone()
        }
    }

    /// Status of the persisted entry at `now`, or `NotCached` if the token
    /// carries no expiry date.
    pub fn status_at(&self, now: DateTime<Utc>) -> CacheStatus {
        match self.expiry_date {
            Some(expiry) => CacheStatus::from_expiry(now, expiry),
            None => CacheStatus::NotCached,
        }
    }
}
