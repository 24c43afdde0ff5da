//! Storage error types.

use plansync_proto::{ScenarioId, UndoNumber};
use thiserror::Error;

/// Errors from checkpoint storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No checkpoint for this undo set.
    #[error("no checkpoint for scenario {scenario} undo set {undo_number}")]
    NotFound {
        /// Scenario id
        scenario: ScenarioId,
        /// Undo set number
        undo_number: UndoNumber,
    },

    /// Underlying I/O failed. May be transient (disk full).
    #[error("i/o error: {0}")]
    Io(String),

    /// Checkpoint bytes could not be encoded or decoded.
    #[error("checkpoint codec error: {0}")]
    Codec(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<plansync_proto::CodecError> for StorageError {
    fn from(err: plansync_proto::CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}
