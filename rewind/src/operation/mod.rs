//! Cache operations: what the caller wants done with a request.

mod resolver;
mod serialiser;

pub use resolver::{CachePredicate, OperationResolver, OperationSource, ResolvedOperation};
pub use serialiser::{OperationParseError, OPERATION_HEADER};

use serde::{Deserialize, Serialize};

/// How a STALE hit is delivered by a `Cache` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    /// Deliver stale data straight away (refreshing in the background when
    /// stale-while-revalidate is enabled).
    #[default]
    StaleFirst,
    /// Try the network first and only fall back to stale data on failure.
    FreshPreferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Cache,
    Refresh,
    Offline,
    Invalidate,
    Clear,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Cache => "CACHE",
            OperationType::Refresh => "REFRESH",
            OperationType::Offline => "OFFLINE",
            OperationType::Invalidate => "INVALIDATE",
            OperationType::Clear => "CLEAR",
        }
    }

    /// Operations that never return response data, only a completion status.
    pub fn is_completable(&self) -> bool {
        matches!(self, OperationType::Invalidate | OperationType::Clear)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOperation {
    /// Freshness window; `None` uses the configured default.
    pub duration_secs: Option<u64>,
    pub fresh_only: bool,
    pub merge_on_error: Option<bool>,
    pub compress: Option<bool>,
    pub encrypt: Option<bool>,
    pub priority: Option<CachePriority>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOperation {
    pub duration_secs: Option<u64>,
    pub fresh_only: bool,
    pub merge_on_error: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineOperation {
    pub fresh_only: bool,
    pub merge_on_error: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearOperation {
    /// Restrict clearing to one response type name.
    pub type_to_clear: Option<String>,
    pub stale_entries_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Cache(CacheOperation),
    Refresh(RefreshOperation),
    Invalidate,
    Clear(ClearOperation),
    Offline(OfflineOperation),
}

impl Default for Operation {
    fn default() -> Self {
        Operation::Cache(CacheOperation::default())
    }
}

impl Operation {
    pub fn cache() -> Self {
        Self::default()
    }

    pub fn refresh() -> Self {
        Operation::Refresh(RefreshOperation::default())
    }

    pub fn offline() -> Self {
        Operation::Offline(OfflineOperation::default())
    }

    pub fn clear(type_to_clear: Option<String>, stale_entries_only: bool) -> Self {
        Operation::Clear(ClearOperation {
            type_to_clear,
            stale_entries_only,
        })
    }

    pub fn operation_type(&self) -> OperationType {
        match self {
            Operation::Cache(_) => OperationType::Cache,
            Operation::Refresh(_) => OperationType::Refresh,
            Operation::Invalidate => OperationType::Invalidate,
            Operation::Clear(_) => OperationType::Clear,
            Operation::Offline(_) => OperationType::Offline,
        }
    }

    pub fn fresh_only(&self) -> bool {
        match self {
            Operation::Cache(op) => op.fresh_only,
            Operation::Refresh(op) => op.fresh_only,
            Operation::Offline(op) => op.fresh_only,
            Operation::Invalidate | Operation::Clear(_) => false,
        }
    }

    pub fn duration_secs(&self) -> Option<u64> {
        match self {
            Operation::Cache(op) => op.duration_secs,
            Operation::Refresh(op) => op.duration_secs,
            _ => None,
        }
    }

    pub fn merge_on_error(&self) -> Option<bool> {
        match self {
            Operation::Cache(op) => op.merge_on_error,
            Operation::Refresh(op) => op.merge_on_error,
            Operation::Offline(op) => op.merge_on_error,
            _ => None,
        }
    }

    pub fn compress(&self) -> Option<bool> {
        match self {
            Operation::Cache(op) => op.compress,
            _ => None,
        }
    }

    pub fn encrypt(&self) -> Option<bool> {
        match self {
            Operation::Cache(op) => op.encrypt,
            _ => None,
        }
    }

    pub fn priority(&self) -> Option<CachePriority> {
        match self {
            Operation::Cache(op) => op.priority,
            _ => None,
        }
    }
}
