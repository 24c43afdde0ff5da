//! Error types for transmission processing and scenario lifecycle.
//!
//! Errors are split by class so callers can route them without string
//! matching: validation-class errors are answered to the sender and never
//! logged as faults, handleable errors are logged at warn, fatal errors are
//! logged at error and returned to the hosting dispatcher.

use plansync_proto::{CodecError, ScenarioId, UserId};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors returned by [`crate::ScenarioState::process`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// Scenario is read-only and the transmission is not on the allow-list.
    #[error("scenario {scenario} is read-only: {kind} not allowed")]
    ReadOnlyViolation {
        /// Target scenario
        scenario: ScenarioId,
        /// Description of the rejected kind
        kind: &'static str,
    },

    /// Applying the transmission would exceed the license.
    #[error("license would force scenario {scenario} read-only: {reason}")]
    LicenseExceeded {
        /// Target scenario
        scenario: ScenarioId,
        /// Reason reported by the license gate
        reason: String,
    },

    /// Sender may not modify this scenario.
    #[error("user {user} may not modify scenario {scenario}")]
    PermissionDenied {
        /// Sender
        user: UserId,
        /// Target scenario
        scenario: ScenarioId,
    },

    /// Business-rule violation reported by the scenario detail.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Expected-but-exceptional condition (missing checkpoint, unknown undo
    /// set). Logged, non-fatal.
    #[error("handleable: {0}")]
    Handleable(String),

    /// Unexpected failure. The transmission is recorded as failed.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ProcessError {
    /// Validation-class errors are answered to the sender and never logged
    /// as faults.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ReadOnlyViolation { .. }
                | Self::LicenseExceeded { .. }
                | Self::PermissionDenied { .. }
                | Self::Validation(_)
        )
    }

    /// Gate rejections leave no trace in the undo log.
    pub fn is_gate_rejection(&self) -> bool {
        matches!(
            self,
            Self::ReadOnlyViolation { .. } | Self::LicenseExceeded { .. } | Self::PermissionDenied { .. }
        )
    }

    /// Fatal errors are returned to the hosting dispatcher.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<StorageError> for ProcessError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::Handleable(err.to_string()),
            StorageError::Io(_) | StorageError::Codec(_) => Self::Fatal(err.to_string()),
        }
    }
}

impl From<CodecError> for ProcessError {
    fn from(err: CodecError) -> Self {
        Self::Fatal(err.to_string())
    }
}

/// Errors returned by [`crate::ScenarioRegistry`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No loaded scenario with this id.
    #[error("scenario {0} not loaded")]
    NotLoaded(ScenarioId),

    /// No production scenario to route a live transmission to.
    #[error("no production scenario")]
    NoProduction,

    /// Lifecycle invariant would be violated; nothing changed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Processing the routed transmission failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Checkpoint storage failed.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Snapshot bytes could not be decoded.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

impl RegistryError {
    /// Validation-class errors are reported to the caller, not logged.
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation(_) | Self::NotLoaded(_) | Self::NoProduction => true,
            Self::Process(e) => e.is_validation(),
            Self::Storage(_) | Self::Codec(_) => false,
        }
    }
}
