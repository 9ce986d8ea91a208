//! String form of an operation, as carried by the [`OPERATION_HEADER`].
//!
//! ```text
//! CACHE:<duration>:<fresh_only>:<merge_on_error>:<compress>:<encrypt>:<priority>
//! REFRESH:<duration>:<fresh_only>:<merge_on_error>
//! OFFLINE:<fresh_only>:<merge_on_error>
//! INVALIDATE
//! CLEAR:<type>:<stale_only>
//! ```
//!
//! Empty fields mean "unset". A bare type name uses defaults for every field.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::{
    CacheOperation, CachePriority, ClearOperation, OfflineOperation, Operation, OperationType,
    RefreshOperation,
};

/// Request header carrying a serialised operation.
pub const OPERATION_HEADER: &str = "X-Rewind-Operation";

const SEPARATOR: char = ':';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationParseError {
    #[error("Unknown operation type: {0}")]
    UnknownType(String),

    #[error("Expected {expected} fields for {operation}, got {found}")]
    FieldCount {
        operation: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },
}

impl FromStr for OperationType {
    type Err = OperationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CACHE" => Ok(OperationType::Cache),
            "REFRESH" => Ok(OperationType::Refresh),
            "OFFLINE" => Ok(OperationType::Offline),
            "INVALIDATE" => Ok(OperationType::Invalidate),
            "CLEAR" => Ok(OperationType::Clear),
            other => Err(OperationParseError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CachePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePriority::StaleFirst => "stale_first",
            CachePriority::FreshPreferred => "fresh_preferred",
        }
    }
}

impl FromStr for CachePriority {
    type Err = OperationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stale_first" => Ok(CachePriority::StaleFirst),
            "fresh_preferred" => Ok(CachePriority::FreshPreferred),
            other => Err(OperationParseError::InvalidValue {
                field: "priority",
                value: other.to_string(),
            }),
        }
    }
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.operation_type().as_str();
        match self {
            Operation::Cache(op) => write!(
                f,
                "{name}:{}:{}:{}:{}:{}:{}",
                opt(&op.duration_secs),
                op.fresh_only,
                opt(&op.merge_on_error),
                opt(&op.compress),
                opt(&op.encrypt),
                op.priority.map(|p| p.as_str()).unwrap_or_default(),
            ),
            Operation::Refresh(op) => write!(
                f,
                "{name}:{}:{}:{}",
                opt(&op.duration_secs),
                op.fresh_only,
                opt(&op.merge_on_error),
            ),
            Operation::Offline(op) => {
                write!(f, "{name}:{}:{}", op.fresh_only, opt(&op.merge_on_error))
            }
            Operation::Invalidate => f.write_str(name),
            Operation::Clear(op) => write!(
                f,
                "{name}:{}:{}",
                op.type_to_clear.as_deref().unwrap_or_default(),
                op.stale_entries_only
            ),
        }
    }
}

fn parse_bool(field: &'static str, value: &str) -> Result<Option<bool>, OperationParseError> {
    match value {
        "" => Ok(None),
        "true" => Ok(Some(true)),
        "false" => Ok(Some(false)),
        other => Err(OperationParseError::InvalidValue {
            field,
            value: other.to_string(),
        }),
    }
}

fn parse_u64(field: &'static str, value: &str) -> Result<Option<u64>, OperationParseError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| OperationParseError::InvalidValue {
            field,
            value: value.to_string(),
        })
}

fn fields<'a>(
    operation: &'static str,
    args: Option<&'a str>,
    expected: usize,
) -> Result<Vec<&'a str>, OperationParseError> {
    let fields: Vec<&str> = match args {
        Some(args) => args.split(SEPARATOR).collect(),
        None => vec![""; expected],
    };
    if fields.len() != expected {
        return Err(OperationParseError::FieldCount {
            operation,
            expected,
            found: fields.len(),
        });
    }
    Ok(fields)
}

impl FromStr for Operation {
    type Err = OperationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, args) = match s.split_once(SEPARATOR) {
            Some((name, args)) => (name, Some(args)),
            None => (s, None),
        };

        match name.parse::<OperationType>()? {
            OperationType::Cache => {
                let f = fields("CACHE", args, 6)?;
                Ok(Operation::Cache(CacheOperation {
                    duration_secs: parse_u64("duration", f[0])?,
                    fresh_only: parse_bool("fresh_only", f[1])?.unwrap_or(false),
                    merge_on_error: parse_bool("merge_on_error", f[2])?,
                    compress: parse_bool("compress", f[3])?,
                    encrypt: parse_bool("encrypt", f[4])?,
                    priority: match f[5] {
                        "" => None,
                        p => Some(p.parse()?),
                    },
                }))
            }
            OperationType::Refresh => {
                let f = fields("REFRESH", args, 3)?;
                Ok(Operation::Refresh(RefreshOperation {
                    duration_secs: parse_u64("duration", f[0])?,
                    fresh_only: parse_bool("fresh_only", f[1])?.unwrap_or(false),
                    merge_on_error: parse_bool("merge_on_error", f[2])?,
                }))
            }
            OperationType::Offline => {
                let f = fields("OFFLINE", args, 2)?;
                Ok(Operation::Offline(OfflineOperation {
                    fresh_only: parse_bool("fresh_only", f[0])?.unwrap_or(false),
                    merge_on_error: parse_bool("merge_on_error", f[1])?,
                }))
            }
            OperationType::Invalidate => match args {
                None => Ok(Operation::Invalidate),
                Some(args) => Err(OperationParseError::FieldCount {
                    operation: "INVALIDATE",
                    expected: 0,
                    found: args.split(SEPARATOR).count(),
                }),
            },
            OperationType::Clear => {
                // Type names may contain the separator (`a::B`), so the
                // stale flag is taken from the end.
                let (type_to_clear, stale) = match args {
                    None => ("", ""),
                    Some(args) => args.rsplit_once(SEPARATOR).ok_or(
                        OperationParseError::FieldCount {
                            operation: "CLEAR",
                            expected: 2,
                            found: 1,
                        },
                    )?,
                };
                Ok(Operation::Clear(ClearOperation {
                    type_to_clear: (!type_to_clear.is_empty()).then(|| type_to_clear.to_string()),
                    stale_entries_only: parse_bool("stale_only", stale)?.unwrap_or(false),
                }))
            }
        }
    }
}

impl Operation {
    /// Parse a header value, returning `None` for anything malformed.
    pub fn from_header(value: &str) -> Option<Self> {
        match value.parse() {
            Ok(op) => Some(op),
            Err(e) => {
                tracing::warn!("Ignoring malformed operation header '{}': {}", value, e);
                None
            }
        }
    }
}
