//! Error types for the offload partitioner

use thiserror::Error;

/// Result type for partitioning operations
pub type Result<T> = std::result::Result<T, PartitionError>;

/// Errors that can occur while preparing a graph for backend offload
///
/// Only fatal conditions are represented here. Structural absences the
/// passes expect (an unmatched node name, an implicit input that belongs
/// to a sibling subgraph, an auxiliary node already covered elsewhere)
/// are absorbed where they occur and never surface as errors.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("no subgraph context for graph '{0}'; SubgraphContextStore::build must run before scope resolution")]
    MissingContext(String),

    #[error("failed to inline constant '{name}': {reason}")]
    InlineMaterialization { name: String, reason: String },

    #[error("graph validation failed: {0}")]
    Validation(String),

    #[error("backend proposal failed: {0}")]
    Backend(String),

    #[error("invalid graph structure: {0}")]
    Structure(String),

    #[error("graph error: {0}")]
    AnyhowError(String),
}

impl From<anyhow::Error> for PartitionError {
    fn from(err: anyhow::Error) -> Self {
        PartitionError::AnyhowError(err.to_string())
    }
}
