//! Checkpoint storage.
//!
//! One checkpoint per undo set holds the set's start state. The trait is
//! synchronous: checkpoint writes happen on the scenario's processing thread
//! under its serialization lock, so at most one writer touches a path.

mod chaotic;
mod error;
mod file;
mod memory;

pub use chaotic::ChaoticCheckpointStore;
pub use error::StorageError;
pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;
use plansync_proto::{ScenarioId, UndoNumber};

/// Deterministic checkpoint file name for a scenario's undo set.
pub fn checkpoint_file_name(scenario: ScenarioId, undo_number: UndoNumber) -> String {
    format!("scenario-{:016x}-undo-{:08}.ckpt", scenario.0, undo_number.0)
}

/// Parse a name produced by [`checkpoint_file_name`].
pub fn parse_checkpoint_file_name(name: &str) -> Option<(ScenarioId, UndoNumber)> {
    let rest = name.strip_prefix("scenario-")?.strip_suffix(".ckpt")?;
    let (id, undo) = rest.split_once("-undo-")?;
    let id = u64::from_str_radix(id, 16).ok()?;
    let undo = undo.parse::<u64>().ok()?;
    Some((ScenarioId(id), UndoNumber(undo)))
}

/// Storage for undo checkpoints.
///
/// Must be Clone (every scenario holds a handle) and Send + Sync. Clones
/// share the same underlying storage.
pub trait CheckpointStore: Clone + Send + Sync + 'static {
    /// Persist checkpoint bytes, replacing any previous checkpoint for the
    /// same set.
    fn write(
        &self,
        scenario: ScenarioId,
        undo_number: UndoNumber,
        bytes: &[u8],
    ) -> Result<(), StorageError>;

    /// Load checkpoint bytes.
    ///
    /// Returns `StorageError::NotFound` when the set has no checkpoint.
    fn read(&self, scenario: ScenarioId, undo_number: UndoNumber)
    -> Result<Vec<u8>, StorageError>;

    /// Delete a checkpoint. Deleting a missing checkpoint is a no-op.
    fn delete(&self, scenario: ScenarioId, undo_number: UndoNumber) -> Result<(), StorageError>;

    /// Every checkpoint currently stored, ordered by scenario then undo
    /// number.
    fn list(&self) -> Result<Vec<(ScenarioId, UndoNumber)>, StorageError>;

    /// Whether a checkpoint exists.
    fn exists(&self, scenario: ScenarioId, undo_number: UndoNumber) -> Result<bool, StorageError> {
        Ok(self.list()?.contains(&(scenario, undo_number)))
    }

    /// Checkpoints belonging to one scenario.
    fn list_scenario(&self, scenario: ScenarioId) -> Result<Vec<UndoNumber>, StorageError> {
        Ok(self.list()?.into_iter().filter(|(s, _)| *s == scenario).map(|(_, n)| n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_deterministic_and_parses_back() {
        let name = checkpoint_file_name(ScenarioId(0xabc), UndoNumber(12));
        assert_eq!(name, "scenario-0000000000000abc-undo-00000012.ckpt");
        assert_eq!(parse_checkpoint_file_name(&name), Some((ScenarioId(0xabc), UndoNumber(12))));
    }

    #[test]
    fn foreign_names_are_ignored() {
        assert_eq!(parse_checkpoint_file_name("notes.txt"), None);
        assert_eq!(parse_checkpoint_file_name("scenario-zz-undo-1.ckpt"), None);
        assert_eq!(parse_checkpoint_file_name("scenario-01-undo-01.tmp"), None);
    }
}
