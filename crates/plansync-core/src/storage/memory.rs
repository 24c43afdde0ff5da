use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use plansync_proto::{ScenarioId, UndoNumber};

use super::{CheckpointStore, StorageError};

/// In-memory checkpoint store for testing and simulation.
///
/// Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<BTreeMap<(ScenarioId, UndoNumber), Vec<u8>>>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total bytes across all checkpoints.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn write(
        &self,
        scenario: ScenarioId,
        undo_number: UndoNumber,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.inner.lock().insert((scenario, undo_number), bytes.to_vec());
        Ok(())
    }

    fn read(
        &self,
        scenario: ScenarioId,
        undo_number: UndoNumber,
    ) -> Result<Vec<u8>, StorageError> {
        self.inner
            .lock()
            .get(&(scenario, undo_number))
            .cloned()
            .ok_or(StorageError::NotFound { scenario, undo_number })
    }

    fn delete(&self, scenario: ScenarioId, undo_number: UndoNumber) -> Result<(), StorageError> {
        self.inner.lock().remove(&(scenario, undo_number));
        Ok(())
    }

    fn list(&self) -> Result<Vec<(ScenarioId, UndoNumber)>, StorageError> {
        Ok(self.inner.lock().keys().copied().collect())
    }

    fn exists(&self, scenario: ScenarioId, undo_number: UndoNumber) -> Result<bool, StorageError> {
        Ok(self.inner.lock().contains_key(&(scenario, undo_number)))
    }
}
