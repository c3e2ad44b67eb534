//! Operation shapes and their routing to backends.

use crate::analytical_store::{AggregateRow, AggregateSpec};
use crate::record_store::{Record, RecordKind};

/// Backend family an operation routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingTag {
    /// Row lookup/write against the record store, the source of truth.
    Transactional,
    /// Aggregate query against the analytical store, with a record store
    /// fallback when degraded.
    Analytical,
    /// Nearest-neighbor lookup against the similarity index; empty when the
    /// index is cold or degraded.
    Similarity,
}

/// A logical operation declaring its target data shape. The coordinator
/// selects the backend from the tag; callers never name a backend.
#[derive(Debug, Clone)]
pub enum Operation {
    RecordWrite {
        kind: RecordKind,
        id: String,
        payload: serde_json::Map<String, serde_json::Value>,
    },
    RecordRead {
        kind: RecordKind,
        id: String,
    },
    Aggregate {
        spec: AggregateSpec,
    },
    SimilaritySearch {
        vector: Vec<f32>,
        k: usize,
    },
}

impl Operation {
    pub fn tag(&self) -> RoutingTag {
        match self {
            Operation::RecordWrite { .. } | Operation::RecordRead { .. } => RoutingTag::Transactional,
            Operation::Aggregate { .. } => RoutingTag::Analytical,
            Operation::SimilaritySearch { .. } => RoutingTag::Similarity,
        }
    }
}

/// Result of a routed operation, matching the operation shape.
#[derive(Debug)]
pub enum OperationOutput {
    Version(i64),
    Record(Option<Record>),
    Rows(Vec<AggregateRow>),
    Matches(Vec<(String, f32)>),
}
