//! Errors of the learning core.
use thiserror::Error;

/// Errors raised by the learning core.
///
/// These all correspond to programmer or configuration mistakes: a training
/// step either runs to completion or fails with one of these, there is no
/// recoverable error class inside the core.
#[derive(Debug, Error)]
pub enum DreamerError {
    /// A required key is missing from a trajectory batch.
    #[error("Batch key {0} is required but missing")]
    MissingBatchKey(String),

    /// An unrecognized actor-gradient mode string in the configuration.
    #[error("Unknown gradient mode: {0}")]
    UnknownGradMode(String),

    /// Tried to read a record value with the wrong type.
    #[error("Record value type mismatch, expected {0}")]
    RecordValueTypeError(String),

    /// Tried to read a record value under a key that does not exist.
    #[error("Record key {0} does not exist")]
    RecordKeyError(String),
}
