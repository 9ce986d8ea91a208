use std::sync::Arc;

use tracing::debug;

use super::Operation;
use crate::request::PlainRequestMetadata;

/// Integrator hook deciding an operation from the request alone.
pub type CachePredicate = Arc<dyn Fn(&PlainRequestMetadata) -> Option<Operation> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationSource {
    Header,
    Annotation,
    Predicate,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOperation {
    pub operation: Operation,
    pub source: OperationSource,
}

/// Picks exactly one operation per call.
///
/// Precedence: a well-formed header, then the call-site annotation, then the
/// configured predicate, then a default `Cache`.
#[derive(Clone, Default)]
pub struct OperationResolver {
    predicate: Option<CachePredicate>,
}

impl OperationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_predicate(mut self, predicate: CachePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn resolve(
        &self,
        metadata: &PlainRequestMetadata,
        header: Option<&str>,
        annotation: Option<&Operation>,
    ) -> ResolvedOperation {
        let resolved = if let Some(operation) = header.and_then(Operation::from_header) {
            ResolvedOperation {
                operation,
                source: OperationSource::Header,
            }
        } else if let Some(operation) = annotation {
            ResolvedOperation {
                operation: operation.clone(),
                source: OperationSource::Annotation,
            }
        } else if let Some(operation) = self.predicate.as_ref().and_then(|p| p(metadata)) {
            ResolvedOperation {
                operation,
                source: OperationSource::Predicate,
            }
        } else {
            ResolvedOperation {
                operation: Operation::default(),
                source: OperationSource::Default,
            }
        };

        debug!(
            url = %metadata.url,
            source = ?resolved.source,
            "Resolved operation {}",
            resolved.operation
        );
        resolved
    }
}

impl std::fmt::Debug for OperationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationResolver")
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
