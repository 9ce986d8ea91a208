use std::fmt;
use std::io;

use thiserror::Error;

/// Boxed error returned by caller-supplied network fetches.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum SerialisationError {
    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialisation task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] rewind_storage::StorageError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] SerialisationError),

    #[error("Network error: {0}")]
    Network(NetworkFailure),

    #[error("No response available: {0}")]
    EmptyResponse(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    pub fn is_network(&self) -> bool {
        matches!(self, CacheError::Network(_))
    }

    pub fn network_failure(&self) -> Option<&NetworkFailure> {
        match self {
            CacheError::Network(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Coarse classification of a failed network call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No connectivity (refused, reset, unreachable)
    Network,
    Timeout,
    /// The server answered with a non-success status
    Http { status: u16 },
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "network unavailable"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Http { status } => write!(f, "HTTP {}", status),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct NetworkFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl NetworkFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the failure is due to missing connectivity rather than the
    /// server rejecting the call.
    pub fn is_connectivity(&self) -> bool {
        matches!(self.kind, ErrorKind::Network | ErrorKind::Timeout)
    }
}

/// Error a fetch can return to report a non-success HTTP status.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("HTTP status {status}")]
pub struct HttpStatusError {
    pub status: u16,
}

/// Maps errors returned by the caller's fetch into a [`NetworkFailure`].
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &(dyn std::error::Error + 'static)) -> NetworkFailure;
}

/// Classifies `std::io::Error` kinds and [`HttpStatusError`] anywhere in the
/// source chain, falling back to the message text.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn classify(&self, error: &(dyn std::error::Error + 'static)) -> NetworkFailure {
        let message = error.to_string();
        let mut current = Some(error);

        while let Some(err) = current {
            if let Some(status) = err.downcast_ref::<HttpStatusError>() {
                return NetworkFailure::new(ErrorKind::Http { status: status.status }, message);
            }
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if let Some(kind) = classify_io(io_err.kind()) {
                    return NetworkFailure::new(kind, message);
                }
            }
            current = err.source();
        }

        let lower = message.to_lowercase();
        let kind = if lower.contains("timed out") || lower.contains("timeout") {
            ErrorKind::Timeout
        } else if lower.contains("connection") || lower.contains("unreachable") {
            ErrorKind::Network
        } else {
            ErrorKind::Unknown
        };
        NetworkFailure::new(kind, message)
    }
}

fn classify_io(kind: io::ErrorKind) -> Option<ErrorKind> {
    match kind {
        io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::BrokenPipe => Some(ErrorKind::Network),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("request failed")]
    struct Wrapper(#[source] HttpStatusError);

    #[test]
    fn test_classify_io_errors() {
        let classifier = DefaultErrorClassifier;

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classifier.classify(&refused).kind, ErrorKind::Network);

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        let failure = classifier.classify(&timeout);
        assert_eq!(failure.kind, ErrorKind::Timeout);
        assert!(failure.is_connectivity());
    }

    #[test]
    fn test_classify_http_status_in_source_chain() {
        let err = Wrapper(HttpStatusError { status: 503 });
        let failure = DefaultErrorClassifier.classify(&err);
        assert_eq!(failure.kind, ErrorKind::Http { status: 503 });
        assert!(!failure.is_connectivity());
        assert_eq!(failure.message, "request failed");
    }

    #[test]
    fn test_classify_by_message() {
        let err = io::Error::new(io::ErrorKind::Other, "operation timed out");
        assert_eq!(DefaultErrorClassifier.classify(&err).kind, ErrorKind::Timeout);

        let err = io::Error::new(io::ErrorKind::Other, "bad json");
        assert_eq!(DefaultErrorClassifier.classify(&err).kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_error_display() {
        let err = CacheError::Network(NetworkFailure::new(ErrorKind::Http { status: 404 }, "missing"));
        assert_eq!(err.to_string(), "Network error: HTTP 404: missing");
        assert!(err.is_network());
    }
}
