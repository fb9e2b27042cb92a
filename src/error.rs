use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

/// Error type shared across the crate.
///
/// Variants map one-to-one onto the failure classes the pipeline can
/// hit: configuration, filesystem, document/header parsing, the
/// relational store, the inference engines, and the structural checks
/// (dimension and internal invariants).
#[derive(Debug, Error)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("pool is shut down")]
    PoolClosed,
}
