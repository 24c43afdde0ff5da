//! Persisted scenario images.
//!
//! [`Checkpoint`] is what an undo set's checkpoint file holds. A
//! [`ScenarioSnapshot`] is the full image shipped to clients on load, reload
//! and after an undo.

use plansync_proto::{CodecError, PayloadKind, ScenarioId, Versioned, codec};
use serde::{Deserialize, Serialize};

use crate::{detail::ScenarioDetail, scenario::LastReceived, summary::ScenarioSummary};

/// Start state of an undo set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint<D> {
    /// Schedule.
    pub detail: D,
    /// Summary.
    pub summary: ScenarioSummary,
}

impl<D: ScenarioDetail> Versioned for Checkpoint<D> {
    const KIND: PayloadKind = PayloadKind::Checkpoint;

    fn decode_legacy(_version: u16, body: &[u8]) -> Result<Self, CodecError> {
        codec::decode_body(body)
    }
}

/// Borrowed view with the same encoding as [`Checkpoint`].
#[derive(Serialize)]
struct CheckpointRef<'a, D> {
    detail: &'a D,
    summary: &'a ScenarioSummary,
}

/// Encode a checkpoint from borrowed live state without cloning it.
pub fn encode_checkpoint<D: ScenarioDetail>(
    detail: &D,
    summary: &ScenarioSummary,
) -> Result<Vec<u8>, CodecError> {
    codec::encode_envelope(
        PayloadKind::Checkpoint,
        codec::FORMAT_VERSION,
        &CheckpointRef { detail, summary },
    )
}

/// Full scenario image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSnapshot<D> {
    /// Scenario id.
    pub id: ScenarioId,
    /// Schedule.
    pub detail: D,
    /// Summary.
    pub summary: ScenarioSummary,
    /// License-derived read-only flag.
    #[serde(default)]
    pub read_only: bool,
    /// Last transmission applied before the image was taken.
    #[serde(default)]
    pub last_received: Option<LastReceived>,
}

impl<D: ScenarioDetail> Versioned for ScenarioSnapshot<D> {
    const KIND: PayloadKind = PayloadKind::ScenarioSnapshot;

    fn decode_legacy(_version: u16, body: &[u8]) -> Result<Self, CodecError> {
        codec::decode_body(body)
    }
}
