//! Scenario detail collaborator.
//!
//! The detail is the schedule itself (jobs, resources, activities). This
//! crate never looks inside it: the processor hands it transmissions, reads
//! back a [`DataChanges`] record, and serializes it for checkpoints and
//! fingerprints.

use std::collections::{BTreeMap, BTreeSet};

use plansync_proto::{MoveRequest, Transmission};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::summary::ScenarioSummary;

/// Entity-level change record produced by one transmission.
///
/// A failed transmission always yields an empty record so no spurious change
/// events fire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataChanges {
    /// Entities created.
    pub added: BTreeSet<u64>,
    /// Entities modified.
    pub updated: BTreeSet<u64>,
    /// Entities removed.
    pub removed: BTreeSet<u64>,
    /// Summary-level fields changed.
    pub summary_changed: bool,
    /// A schedule simulation ran to completion.
    pub simulation_completed: bool,
}

impl DataChanges {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && !self.summary_changed
            && !self.simulation_completed
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: Self) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
        self.summary_changed |= other.summary_changed;
        self.simulation_completed |= other.simulation_completed;
    }

    /// Number of touched entities.
    pub fn touched(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// What the detail wants the processor to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Applied; nothing further.
    Applied,
    /// Restore from the last good state and re-apply the move with adjusted
    /// parameters.
    RetryMove(MoveRequest),
}

/// Errors a detail may raise while receiving.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetailError {
    /// Business rule violated; nothing was changed.
    #[error("{0}")]
    Validation(String),
    /// A dependent simulation was cancelled.
    #[error("simulation cancelled: {0}")]
    Cancelled(String),
    /// Unexpected failure.
    #[error("{0}")]
    Internal(String),
}

/// Context handed to [`ScenarioDetail::receive`].
pub struct ReceiveContext<'a> {
    /// Summary as of before this transmission (read-only).
    pub summary: &'a ScenarioSummary,
    /// Accumulates the entities touched.
    pub changes: &'a mut DataChanges,
}

/// The externally defined schedule held by a scenario.
///
/// Serialization must be deterministic (ordered maps only): fingerprints and
/// checkpoints are derived from the encoded bytes.
pub trait ScenarioDetail:
    Clone + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Apply a transmission.
    ///
    /// Must leave `self` unchanged when returning `Err(Validation)`.
    fn receive(
        &mut self,
        transmission: &Transmission,
        ctx: &mut ReceiveContext<'_>,
    ) -> Result<ReceiveOutcome, DetailError>;

    /// Number of entities, folded into the fingerprint and checked by the
    /// license gate.
    fn entity_count(&self) -> u64;

    /// Current KPI values.
    fn kpis(&self) -> BTreeMap<String, i64>;

    /// Rebuild non-serialized cross references after deserialization.
    fn restore_references(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_unions_entities_and_flags() {
        let mut a = DataChanges { added: [1].into(), ..DataChanges::default() };
        let b = DataChanges {
            added: [2].into(),
            removed: [3].into(),
            simulation_completed: true,
            ..DataChanges::default()
        };
        a.merge(b);
        assert_eq!(a.added, [1, 2].into());
        assert_eq!(a.touched(), 3);
        assert!(a.simulation_completed);
        assert!(!a.is_empty());
        assert!(DataChanges::default().is_empty());
    }
}
