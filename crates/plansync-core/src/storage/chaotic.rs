//! Chaotic checkpoint store for fault injection testing.
//!
//! Delegates to an inner store but randomly fails writes and reads, so tests
//! can check that a failed checkpoint write surfaces as a fatal processing
//! error instead of a silently corrupt undo log.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use plansync_proto::{ScenarioId, UndoNumber};

use super::{CheckpointStore, StorageError};

/// Checkpoint store wrapper that randomly injects I/O failures.
#[derive(Clone)]
pub struct ChaoticCheckpointStore<S: CheckpointStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
}

/// Linear congruential generator; reproducible with the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: CheckpointStore> ChaoticCheckpointStore<S> {
    /// Wrap `inner` with a fixed default seed.
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed. `failure_rate` is clamped to
    /// [0.0, 1.0].
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying store (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    fn roll(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        if self.rng.lock().next() < self.failure_rate {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: CheckpointStore> CheckpointStore for ChaoticCheckpointStore<S> {
    fn write(
        &self,
        scenario: ScenarioId,
        undo_number: UndoNumber,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.write(scenario, undo_number, bytes)
    }

    fn read(
        &self,
        scenario: ScenarioId,
        undo_number: UndoNumber,
    ) -> Result<Vec<u8>, StorageError> {
        self.roll()?;
        self.inner.read(scenario, undo_number)
    }

    // Deletes and listings never fail: cleanup paths must stay reliable so
    // tests can assert on leftovers.
    fn delete(&self, scenario: ScenarioId, undo_number: UndoNumber) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        self.inner.delete(scenario, undo_number)
    }

    fn list(&self) -> Result<Vec<(ScenarioId, UndoNumber)>, StorageError> {
        self.inner.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCheckpointStore;

    #[test]
    fn zero_rate_never_fails() {
        let store = ChaoticCheckpointStore::new(MemoryCheckpointStore::new(), 0.0);
        for n in 0..100 {
            store.write(ScenarioId(1), UndoNumber(n), b"x").unwrap();
        }
        assert_eq!(store.inner().len(), 100);
        assert_eq!(store.operation_count(), 100);
    }

    #[test]
    fn full_rate_always_fails_writes() {
        let store = ChaoticCheckpointStore::new(MemoryCheckpointStore::new(), 1.0);
        assert!(matches!(
            store.write(ScenarioId(1), UndoNumber(1), b"x"),
            Err(StorageError::Io(_))
        ));
        assert!(store.inner().is_empty());
    }

    #[test]
    fn same_seed_same_failures() {
        let pattern = |seed| {
            let store = ChaoticCheckpointStore::with_seed(MemoryCheckpointStore::new(), 0.5, seed);
            (0..32)
                .map(|n| store.write(ScenarioId(1), UndoNumber(n), b"").is_ok())
                .collect::<Vec<_>>()
        };
        assert_eq!(pattern(42), pattern(42));
    }
}
