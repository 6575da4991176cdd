//! Error types for `decp-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The source table carries no trace of a column the engine cannot work without.
    #[error("source {source_name} has no {column:?} column")]
    MissingColumn { source_name: String, column: String },
}

pub type Result<T, E = ResolveError> = std::result::Result<T, E>;
