//! Response caching for HTTP clients.
//!
//! A call is described by a [`RequestDescriptor`] and an [`Operation`]
//! (cache, refresh, offline, invalidate, clear). [`Rewind`] decides whether
//! to serve the cached response, fetch a fresh one, or both, and persists
//! responses through a pluggable backend with optional compression and
//! encryption.
//!
//! Every response carries [`CacheMetadata`]: the [`CacheToken`] describing
//! what the cache did, and the error if something failed along the way.

pub mod clock;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod operation;
pub mod persistence;
pub mod request;
pub mod serialisation;
pub mod statistics;
pub mod token;

pub use config::RewindConfig;
pub use error::{BoxError, CacheError, ErrorKind, HttpStatusError, NetworkFailure, Result};
pub use interceptor::{
    CacheMetadata, CacheResponse, CallDuration, RequestDescriptor, Rewind, RewindBuilder,
};
pub use operation::{CachePriority, Operation, OPERATION_HEADER};
pub use request::ResponseType;
pub use statistics::CacheStatistics;
pub use token::{CacheStatus, CacheToken};
