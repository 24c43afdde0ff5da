//! Plansync core: transmission processing, undo and scenario lifecycle.
//!
//! A [`ScenarioState`] holds one planning scenario: its detail (the schedule,
//! supplied by the embedding application through [`ScenarioDetail`]), its
//! summary, its [`UndoLog`] and its [`ChecksumCoordinator`].
//! [`ScenarioState::process`] applies one transmission at a time and returns
//! everything it caused as a [`ProcessingOutcome`]. The [`ScenarioRegistry`]
//! owns many scenarios, routes transmissions and executes lifecycle requests.
//!
//! Nothing here performs network I/O. Time and randomness come from an
//! [`Environment`]; checkpoints go through a [`CheckpointStore`].
//!
//! # Lock order
//!
//! Per scenario: dispatch, undo log, detail, summary. The serialization lock
//! is never taken while the undo log is held by processing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checksum;
pub mod detail;
pub mod env;
pub mod error;
pub mod event;
pub mod gate;
pub mod message;
mod processor;
pub mod registry;
pub mod scenario;
pub mod snapshot;
pub mod storage;
pub mod summary;
pub mod undo;

#[cfg(test)]
mod testing;

pub use checksum::{ChecksumConfig, ChecksumCoordinator, ChecksumValues, Diagnostics, Reconciliation, RetryDecision};
pub use detail::{DataChanges, DetailError, ReceiveContext, ReceiveOutcome, ScenarioDetail};
pub use env::Environment;
pub use error::{ProcessError, RegistryError};
pub use event::{LifecycleRequest, ProcessStatus, ProcessingOutcome, ScenarioAction, ScenarioEvent};
pub use gate::{AccessList, EntityLimitLicense, Gates, LicenseGate, PermissionGate, Unrestricted};
pub use message::{ClientMessage, ServerMessage};
pub use registry::{CopyOutcome, Delivery, RegistryConfig, RegistryEvent, ScenarioRegistry};
pub use scenario::{LastReceived, Role, ScenarioConfig, ScenarioInit, ScenarioState};
pub use snapshot::{Checkpoint, ScenarioSnapshot, encode_checkpoint};
pub use storage::{
    ChaoticCheckpointStore, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    StorageError,
};
pub use summary::{KpiSnapshot, ScenarioSummary};
pub use undo::{TransmissionJar, UndoConfig, UndoLog, UndoSet, UndoSetSummary};
