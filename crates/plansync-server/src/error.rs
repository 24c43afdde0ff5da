//! Server error types.
//!
//! Covers session bookkeeping, sequencing, scenario lifecycle and the stdio
//! runtime. Per-transmission refusals are not errors here: they become
//! `ServerMessage::Rejected` answers to the sender.

use std::fmt;

use plansync_core::{RegistryError, StorageError};

use crate::sequencer::SequencerError;

/// Errors that can occur in the server.
#[derive(Debug)]
pub enum ServerError {
    /// Session not found in registry.
    ///
    /// May be transient if the session was just closed.
    SessionNotFound(u64),

    /// Session already registered.
    ///
    /// Session ids come from the runtime and must be unique. Logic bug.
    SessionAlreadyExists(u64),

    /// Scenario registry operation failed.
    Registry(RegistryError),

    /// Checkpoint storage failed (opening the directory, startup purge).
    Storage(StorageError),

    /// Sequence space exhausted or invalid header.
    Sequencing(SequencerError),

    /// Configuration error (invalid checkpoint directory, bad limits).
    ///
    /// Fatal at startup. Fix configuration and restart.
    Config(String),

    /// Transport error on the event or outbound channel.
    Transport(String),

    /// Malformed event line or message.
    ///
    /// Fatal for that line only; the server keeps serving.
    Protocol(String),

    /// Internal error (runtime task failure, unexpected state).
    ///
    /// Indicates a bug.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::SessionAlreadyExists(id) => write!(f, "session already exists: {id}"),
            Self::Registry(err) => write!(f, "registry error: {err}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Sequencing(err) => write!(f, "sequencing error: {err}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Registry(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::Sequencing(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RegistryError> for ServerError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<SequencerError> for ServerError {
    fn from(err: SequencerError) -> Self {
        Self::Sequencing(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
