//! Processing outputs.
//!
//! Processing never calls back into observers. Every notification is an
//! ordered [`ScenarioEvent`] and every side effect the caller must carry out
//! is a [`ScenarioAction`], both returned in the [`ProcessingOutcome`].

use std::{collections::BTreeMap, time::Duration};

use plansync_proto::{ScenarioId, Transmission, TransmissionId, TransmissionInfo, UndoNumber, UserId};

use crate::{checksum::Diagnostics, detail::DataChanges};

/// Notifications, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioEvent {
    /// Entities or summary fields changed.
    DataChanged {
        /// Scenario
        scenario: ScenarioId,
        /// Transmission that caused it
        transmission_id: TransmissionId,
        /// What changed
        changes: DataChanges,
    },
    /// A non-replay transmission finished processing.
    TransmissionProcessed {
        /// Scenario
        scenario: ScenarioId,
        /// Audit metadata
        info: TransmissionInfo,
        /// Wall time spent
        duration: Duration,
        /// Processing failed
        failed: bool,
    },
    /// The undo log changed shape or content.
    UndoSetChanged {
        /// Scenario
        scenario: ScenarioId,
        /// Current set, if any
        current: Option<UndoNumber>,
        /// Number of sets
        sets: usize,
    },
    /// The license flipped the read-only flag.
    ReadOnlyChanged {
        /// Scenario
        scenario: ScenarioId,
        /// New flag
        read_only: bool,
    },
    /// A user started an undo.
    UndoStarted {
        /// Scenario
        scenario: ScenarioId,
        /// Who started it
        instigator: UserId,
    },
    /// Client and server fingerprints diverged.
    Desynchronized {
        /// Scenario
        scenario: ScenarioId,
        /// Transmission the fingerprints follow
        transmission_id: TransmissionId,
        /// Local diagnostics, in diagnostics mode
        diagnostics: Option<Diagnostics>,
    },
    /// The server never produced a checksum for this transmission.
    ChecksumLost {
        /// Scenario
        scenario: ScenarioId,
        /// Transmission
        transmission_id: TransmissionId,
        /// Polls made
        attempts: u32,
    },
    /// Audit record for a data-changing transmission.
    Audit {
        /// Scenario
        scenario: ScenarioId,
        /// Audit metadata
        info: TransmissionInfo,
        /// Entities touched
        touched: usize,
    },
}

/// Lifecycle work for the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRequest {
    /// Scenario the transmission was routed to.
    pub source: ScenarioId,
    /// The lifecycle transmission.
    pub transmission: Transmission,
}

/// Side effects for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioAction {
    /// Run a lifecycle operation on the registry.
    Lifecycle(LifecycleRequest),
    /// Ship a full scenario image to clients (server, after undo).
    BroadcastSnapshot {
        /// Scenario
        scenario: ScenarioId,
        /// Encoded [`crate::ScenarioSnapshot`]
        bytes: Vec<u8>,
    },
    /// Send a transmission to the server (client compensating undo).
    SendToServer(Transmission),
    /// Re-fetch the scenario from the server.
    RequestReload(ScenarioId),
    /// Result of a capable-to-promise query.
    CtpResult {
        /// Scenario queried
        scenario: ScenarioId,
        /// Query transmission
        transmission_id: TransmissionId,
        /// KPIs of the what-if state
        kpis: BTreeMap<String, i64>,
    },
}

/// How processing ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Applied.
    Applied,
    /// Cancelled on the server; state restored, nothing recorded.
    Discarded,
    /// Cancelled on the client; a compensating undo was queued.
    Compensated,
}

/// Everything processing one transmission produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingOutcome {
    /// How it ended.
    pub status: ProcessStatus,
    /// Notifications, in order.
    pub events: Vec<ScenarioEvent>,
    /// Side effects for the caller.
    pub actions: Vec<ScenarioAction>,
    /// Entities touched (empty unless applied).
    pub changes: DataChanges,
}

impl ProcessingOutcome {
    pub(crate) fn new(status: ProcessStatus) -> Self {
        Self { status, events: Vec::new(), actions: Vec::new(), changes: DataChanges::default() }
    }

    /// Whether the transmission took effect.
    pub fn is_applied(&self) -> bool {
        self.status == ProcessStatus::Applied
    }

    /// Whether any [`ScenarioEvent::DataChanged`] was emitted.
    pub fn data_changed(&self) -> bool {
        self.events.iter().any(|e| matches!(e, ScenarioEvent::DataChanged { .. }))
    }
}
