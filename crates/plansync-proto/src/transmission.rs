//! Transmission envelope and bodies.
//!
//! [`TransmissionBody`] is a closed sum type. Every consumer matches on it
//! exhaustively, so adding a kind is a compile error everywhere it needs
//! handling.
//!
//! Domain-specific payloads ([`DomainPayload`], [`MoveRequest`]) are opaque
//! bytes at this layer. The processing core routes them without decoding;
//! only the scenario detail implementation understands them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    codec::{PayloadKind, Versioned},
    ids::{ScenarioId, TransmissionId, UndoNumber, UserId},
};

/// Which scenario(s) a transmission is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// One scenario by id.
    Scenario(ScenarioId),
    /// Whatever scenario currently holds the production flag.
    Live,
    /// Every loaded scenario, each receiving an independent copy.
    Broadcast,
}

/// Planning scenario category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScenarioKind {
    /// The live plan.
    #[default]
    Live,
    /// A published, read-mostly plan.
    Published,
    /// Exploratory copy.
    WhatIf,
    /// Short-term horizon plan.
    ShortTerm,
    /// Rule-seek optimisation scratch.
    RuleSeek,
    /// Insert-jobs evaluation scratch.
    InsertJobs,
    /// Pruned copy.
    Pruned,
}

/// Routing and bookkeeping fields shared by every transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionHeader {
    /// Unique id, used to key checksums and undo toggles.
    pub id: TransmissionId,
    /// Sequence number assigned by the server.
    pub number: u64,
    /// Number at first issue; survives redirects and replays.
    pub original_number: u64,
    /// User that issued it.
    pub instigator: UserId,
    /// Wall-clock milliseconds when the server stamped it.
    pub timestamp_ms: u64,
    /// Delivery target.
    pub target: Target,
    /// Generated by the system rather than a user action.
    #[serde(default)]
    pub internal: bool,
    /// Re-applied during undo/redo. Suppresses logging and checksums.
    #[serde(default)]
    pub replay: bool,
    /// Seal the current undo set before applying.
    #[serde(default)]
    pub checkpoint_boundary: bool,
    /// Part of a recorded session; always checksummed.
    #[serde(default)]
    pub recording: bool,
}

impl TransmissionHeader {
    /// Header for a user transmission to `target`. Sequencing fields are zero
    /// until the server stamps them.
    pub fn new(id: TransmissionId, instigator: UserId, target: Target) -> Self {
        Self {
            id,
            number: 0,
            original_number: 0,
            instigator,
            timestamp_ms: 0,
            target,
            internal: false,
            replay: false,
            checkpoint_boundary: false,
            recording: false,
        }
    }
}

/// Opaque domain payload forwarded to the scenario detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPayload {
    /// Detail-defined discriminator.
    pub kind: u16,
    /// Detail-defined bytes.
    pub data: Vec<u8>,
}

/// Summary-level scenario edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioChange {
    /// New display name.
    pub name: Option<String>,
    /// New category.
    pub kind: Option<ScenarioKind>,
}

/// Undo or redo request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRequest {
    /// Undo set whose checkpoint is the replay starting point.
    pub undo_number: UndoNumber,
    /// Transmissions whose play flag is set to `redo`.
    pub toggle: Vec<TransmissionId>,
    /// `false` to undo the toggled transmissions, `true` to redo them.
    pub redo: bool,
}

/// Create an empty scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewScenario {
    /// Display name.
    pub name: String,
    /// Category.
    pub kind: ScenarioKind,
    /// Make it the production scenario.
    pub production: bool,
    /// Flag it for comparison views.
    pub compare: bool,
}

/// Copy the target scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyScenario {
    /// Name of the copy.
    pub name: String,
    /// Category of the copy.
    pub kind: ScenarioKind,
    /// Flag the copy for comparison views.
    pub compare: bool,
    /// Internal simulation copy: null id, no undo log, not registered.
    pub internal_simulation: bool,
    /// Keep checkpoint files after the copy is disposed.
    pub temporary: bool,
    /// Settings that override the source's values.
    pub settings: BTreeMap<String, String>,
}

/// Publish or unpublish the target scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishStatus {
    /// New published state.
    pub published: bool,
}

/// Show or hide one KPI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiVisibility {
    /// KPI name.
    pub kpi: String,
    /// Visible after the change.
    pub visible: bool,
}

/// Isolate the scenario from live updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Isolate {
    /// New isolation flag.
    pub isolated: bool,
}

/// Move the planning clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockAdvance {
    /// New clock in milliseconds since the epoch.
    pub clock_ms: u64,
}

/// Persist one scenario setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSave {
    /// Setting key.
    pub key: String,
    /// Setting value.
    pub value: String,
}

/// Freeze the plan up to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldSettings {
    /// Hold horizon in milliseconds, `None` to release.
    pub hold_until_ms: Option<u64>,
}

/// Move an activity in the schedule.
///
/// The detail may answer "re-receive me with adjusted parameters"; the
/// processor then retries with the adjusted request and `attempt + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    /// Detail-defined move description.
    pub payload: Vec<u8>,
    /// Alternate-path variant of the move.
    pub alternate_path: bool,
    /// Retry attempt, zero for the first application.
    pub attempt: u32,
}

/// Every kind of transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionBody {
    /// Rename or recategorise.
    ScenarioChange(ScenarioChange),
    /// Seal and reset the undo log.
    ClearUndoSets,
    /// Undo or redo.
    Undo(UndoRequest),
    /// A user started an undo; informational.
    StartUndo,
    /// Create a scenario.
    NewScenario(NewScenario),
    /// Copy the target scenario.
    CopyScenario(CopyScenario),
    /// Delete the target scenario.
    DeleteScenario,
    /// Make the target resident on the client.
    LoadScenario,
    /// Drop the target from client memory.
    UnloadScenario,
    /// Re-fetch the target from the server.
    ReloadScenario,
    /// Make the target the production scenario.
    PromoteToProduction,
    /// Publish status change.
    PublishStatus(PublishStatus),
    /// Recompute KPIs.
    KpiUpdate,
    /// Store a KPI snapshot.
    KpiSnapshot,
    /// Show or hide a KPI.
    KpiVisibility(KpiVisibility),
    /// Drop short-term activity before the clock.
    ClearPastShortTerm,
    /// Isolation flag change.
    Isolate(Isolate),
    /// Bulk import.
    Import(DomainPayload),
    /// Clock advance.
    ClockAdvance(ClockAdvance),
    /// Setting save.
    SettingsSave(SettingsSave),
    /// Hold horizon change.
    HoldSettings(HoldSettings),
    /// Move with retry semantics.
    Move(MoveRequest),
    /// Capable-to-promise what-if query.
    Ctp(DomainPayload),
    /// Anything else; forwarded verbatim to the detail.
    Domain(DomainPayload),
}

impl TransmissionBody {
    /// Stable numeric kind id (recorded in [`crate::TransmissionInfo`]).
    pub fn kind_id(&self) -> u16 {
        match self {
            Self::ScenarioChange(_) => 0x0001,
            Self::ClearUndoSets => 0x0002,
            Self::Undo(_) => 0x0003,
            Self::StartUndo => 0x0004,
            Self::NewScenario(_) => 0x0010,
            Self::CopyScenario(_) => 0x0011,
            Self::DeleteScenario => 0x0012,
            Self::LoadScenario => 0x0013,
            Self::UnloadScenario => 0x0014,
            Self::ReloadScenario => 0x0015,
            Self::PromoteToProduction => 0x0016,
            Self::PublishStatus(_) => 0x0020,
            Self::KpiUpdate => 0x0021,
            Self::KpiSnapshot => 0x0022,
            Self::KpiVisibility(_) => 0x0023,
            Self::ClearPastShortTerm => 0x0030,
            Self::Isolate(_) => 0x0031,
            Self::Import(_) => 0x0032,
            Self::ClockAdvance(_) => 0x0033,
            Self::SettingsSave(_) => 0x0034,
            Self::HoldSettings(_) => 0x0035,
            Self::Move(m) if m.alternate_path => 0x0041,
            Self::Move(_) => 0x0040,
            Self::Ctp(_) => 0x0050,
            Self::Domain(_) => 0x0100,
        }
    }

    /// Short human-readable description for audit listings.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ScenarioChange(_) => "scenario change",
            Self::ClearUndoSets => "clear undo sets",
            Self::Undo(u) if u.redo => "redo",
            Self::Undo(_) => "undo",
            Self::StartUndo => "start undo",
            Self::NewScenario(_) => "new scenario",
            Self::CopyScenario(_) => "copy scenario",
            Self::DeleteScenario => "delete scenario",
            Self::LoadScenario => "load scenario",
            Self::UnloadScenario => "unload scenario",
            Self::ReloadScenario => "reload scenario",
            Self::PromoteToProduction => "promote to production",
            Self::PublishStatus(_) => "publish status",
            Self::KpiUpdate => "kpi update",
            Self::KpiSnapshot => "kpi snapshot",
            Self::KpiVisibility(_) => "kpi visibility",
            Self::ClearPastShortTerm => "clear past short term",
            Self::Isolate(_) => "isolate",
            Self::Import(_) => "import",
            Self::ClockAdvance(_) => "clock advance",
            Self::SettingsSave(_) => "settings save",
            Self::HoldSettings(_) => "hold settings",
            Self::Move(m) if m.alternate_path => "move (alternate path)",
            Self::Move(_) => "move",
            Self::Ctp(_) => "capable to promise",
            Self::Domain(_) => "domain change",
        }
    }

    /// Undo-class transmissions rewrite the log instead of appending to it
    /// and are always checksummed.
    pub fn is_undo_class(&self) -> bool {
        matches!(self, Self::Undo(_) | Self::ClearUndoSets)
    }

    /// Lifecycle transmissions are executed by the scenario registry.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::NewScenario(_)
                | Self::CopyScenario(_)
                | Self::DeleteScenario
                | Self::LoadScenario
                | Self::UnloadScenario
                | Self::ReloadScenario
                | Self::PromoteToProduction
        )
    }

    /// Whether the transmission is appended to the scenario's undo log.
    ///
    /// Undo-class, lifecycle, informational and what-if kinds leave the
    /// scenario state untouched (or rewrite the log themselves).
    pub fn is_logged(&self) -> bool {
        !(self.is_undo_class()
            || self.is_lifecycle()
            || matches!(self, Self::StartUndo | Self::Ctp(_)))
    }

    /// Kinds that a read-only (license-restricted) scenario still accepts.
    pub fn allowed_when_read_only(&self) -> bool {
        matches!(
            self,
            Self::LoadScenario
                | Self::UnloadScenario
                | Self::ReloadScenario
                | Self::CopyScenario(_)
                | Self::DeleteScenario
                | Self::KpiUpdate
                | Self::KpiSnapshot
                | Self::KpiVisibility(_)
                | Self::Ctp(_)
        )
    }
}

/// A single ordered, typed mutation request.
///
/// `Clone` is a deep copy: broadcasting hands each scenario its own value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transmission {
    /// Routing and sequencing header.
    pub header: TransmissionHeader,
    /// What to do.
    pub body: TransmissionBody,
}

impl Transmission {
    /// Create a transmission.
    pub fn new(header: TransmissionHeader, body: TransmissionBody) -> Self {
        Self { header, body }
    }

    /// Shorthand for `self.header.id`.
    pub fn id(&self) -> TransmissionId {
        self.header.id
    }

    /// Copy marked as a replay for undo/redo.
    pub fn as_replay(&self) -> Self {
        let mut copy = self.clone();
        copy.header.replay = true;
        copy
    }
}

impl Versioned for Transmission {
    const KIND: PayloadKind = PayloadKind::Transmission;

    /// Versions 1 and 2 lack the boolean header flags; `#[serde(default)]`
    /// fills them, so the current decoder reads them unchanged.
    fn decode_legacy(_version: u16, body: &[u8]) -> crate::Result<Self> {
        crate::codec::decode_body(body)
    }
}
