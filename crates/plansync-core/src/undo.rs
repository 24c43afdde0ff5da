//! Checkpoint-anchored undo log.
//!
//! The log is an ordered list of [`UndoSet`]s. Each set starts from a full
//! checkpoint (held by the [`CheckpointStore`]) and records the transmissions
//! applied since then as compressed [`TransmissionJar`]s. Undo replays
//! from a set's checkpoint forward; the log itself never touches the detail.
//!
//! # Invariants
//!
//! - Undo numbers are strictly increasing and never reused.
//! - The current set is always the last one.
//! - Every set present has a checkpoint in the store.
//! - After an append, checkpoint bytes plus payload bytes stay within
//!   `memory_limit_bytes`, unless a single set's checkpoint alone exceeds it.

use std::{collections::VecDeque, time::Duration};

use plansync_proto::{
    CodecError, ScenarioId, Transmission, TransmissionId, TransmissionInfo, UndoNumber, UserId, codec,
};
use serde::Serialize;

use crate::storage::{CheckpointStore, StorageError};

/// Default per-set processing time before a new set is opened.
pub const DEFAULT_UNDO_THRESHOLD: Duration = Duration::from_secs(5);

/// Default memory ceiling across all sets.
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 256 * 1024 * 1024;

/// Undo log tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoConfig {
    /// Accumulated processing time that closes the current set.
    pub undo_threshold: Duration,
    /// Ceiling on checkpoint plus payload bytes.
    pub memory_limit_bytes: u64,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            undo_threshold: DEFAULT_UNDO_THRESHOLD,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
        }
    }
}

/// One applied transmission, compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmissionJar {
    compressed: Vec<u8>,
    /// Time spent processing it.
    pub processing: Duration,
    /// `false` marks an undone-but-redoable entry.
    pub play: bool,
    /// Processing failed; kept for diagnostics, never replayed.
    pub failed: bool,
    /// Audit metadata, readable without inflating.
    pub info: TransmissionInfo,
}

impl TransmissionJar {
    /// Compress a transmission into a jar.
    pub fn pack(
        transmission: &Transmission,
        processing: Duration,
        failed: bool,
    ) -> Result<Self, CodecError> {
        let compressed = codec::compress(&codec::encode(transmission)?)?;
        Ok(Self {
            compressed,
            processing,
            play: true,
            failed,
            info: TransmissionInfo::from(transmission),
        })
    }

    /// Decompress and decode the transmission.
    pub fn inflate(&self) -> Result<Transmission, CodecError> {
        codec::decode(&codec::decompress(&self.compressed)?)
    }

    /// Transmission id.
    pub fn transmission_id(&self) -> TransmissionId {
        self.info.transmission_id
    }

    /// Compressed payload size.
    pub fn size_bytes(&self) -> u64 {
        self.compressed.len() as u64
    }

    /// Replayed during undo/redo.
    pub fn replayable(&self) -> bool {
        self.play && !self.failed
    }
}

/// A checkpoint-anchored batch of transmissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoSet {
    /// Set number.
    pub undo_number: UndoNumber,
    /// Size of the set's start checkpoint.
    pub checkpoint_bytes: u64,
    /// Transmissions applied since the checkpoint.
    pub entries: Vec<TransmissionJar>,
    /// Accumulated processing time of `entries`.
    pub processing: Duration,
}

impl UndoSet {
    fn new(undo_number: UndoNumber, checkpoint_bytes: u64) -> Self {
        Self { undo_number, checkpoint_bytes, entries: Vec::new(), processing: Duration::ZERO }
    }

    /// Checkpoint plus payload bytes.
    pub fn size_bytes(&self) -> u64 {
        self.checkpoint_bytes + self.entries.iter().map(TransmissionJar::size_bytes).sum::<u64>()
    }
}

/// Audit listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JarSummary {
    /// Audit metadata.
    pub info: TransmissionInfo,
    /// Currently applied.
    pub play: bool,
    /// Failed when processed.
    pub failed: bool,
}

/// Audit listing of one set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndoSetSummary {
    /// Set number.
    pub undo_number: UndoNumber,
    /// Checkpoint size.
    pub checkpoint_bytes: u64,
    /// Entries in application order.
    pub entries: Vec<JarSummary>,
}

/// What an append did to the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendReport {
    /// Redo-suppressed jars dropped before appending.
    pub purged: usize,
    /// A new set was opened because the processing threshold was crossed.
    pub rotated: bool,
    /// Sets evicted to honor the memory ceiling, oldest first.
    pub evicted: Vec<UndoNumber>,
}

impl AppendReport {
    /// Whether the set structure changed (beyond the appended jar).
    pub fn changed_sets(&self) -> bool {
        self.purged > 0 || self.rotated || !self.evicted.is_empty()
    }
}

/// Undo log of one scenario.
pub struct UndoLog<S: CheckpointStore> {
    scenario: ScenarioId,
    store: Option<S>,
    config: UndoConfig,
    sets: VecDeque<UndoSet>,
    next_undo_number: UndoNumber,
    temporary: bool,
}

impl<S: CheckpointStore> UndoLog<S> {
    /// Open a log whose first set starts from `initial_checkpoint`.
    pub fn open(
        scenario: ScenarioId,
        store: S,
        config: UndoConfig,
        temporary: bool,
        initial_checkpoint: &[u8],
    ) -> Result<Self, StorageError> {
        let mut log = Self {
            scenario,
            store: Some(store),
            config,
            sets: VecDeque::new(),
            next_undo_number: UndoNumber(1),
            temporary,
        };
        log.open_set(initial_checkpoint)?;
        Ok(log)
    }

    /// Log that records nothing (null-id scratch scenarios).
    pub fn disabled() -> Self {
        Self {
            scenario: ScenarioId::NULL,
            store: None,
            config: UndoConfig::default(),
            sets: VecDeque::new(),
            next_undo_number: UndoNumber(1),
            temporary: true,
        }
    }

    /// Whether appends are recorded.
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Owning scenario.
    pub fn scenario(&self) -> ScenarioId {
        self.scenario
    }

    /// Current tuning.
    pub fn config(&self) -> UndoConfig {
        self.config
    }

    /// Apply new tuning. Takes effect on the next append.
    pub fn reconfigure(&mut self, config: UndoConfig) {
        self.config = config;
    }

    /// Sets, oldest first.
    pub fn sets(&self) -> impl Iterator<Item = &UndoSet> {
        self.sets.iter()
    }

    /// Number of sets.
    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    /// The set new jars go into.
    pub fn current(&self) -> Option<&UndoSet> {
        self.sets.back()
    }

    /// Number the next opened set will get.
    pub fn next_undo_number(&self) -> UndoNumber {
        self.next_undo_number
    }

    /// Checkpoint plus payload bytes across all sets.
    pub fn total_bytes(&self) -> u64 {
        self.sets.iter().map(UndoSet::size_bytes).sum()
    }

    /// Index of a set by number.
    pub fn position(&self, undo_number: UndoNumber) -> Option<usize> {
        self.sets.iter().position(|s| s.undo_number == undo_number)
    }

    /// Open a new set starting from `checkpoint`.
    ///
    /// Seals the current set: its jars stay replayable from its own
    /// checkpoint, new jars go into the new set.
    pub fn open_set(&mut self, checkpoint: &[u8]) -> Result<UndoNumber, StorageError> {
        let Some(store) = &self.store else {
            return Ok(self.next_undo_number);
        };

        let number = self.next_undo_number;
        store.write(self.scenario, number, checkpoint)?;
        self.sets.push_back(UndoSet::new(number, checkpoint.len() as u64));
        self.next_undo_number = number.next();

        tracing::debug!(
            scenario_id = %self.scenario,
            undo_number = %number,
            checkpoint_bytes = checkpoint.len(),
            "opened undo set"
        );
        Ok(number)
    }

    /// Append an applied transmission.
    ///
    /// `make_checkpoint` produces the current state's checkpoint bytes and is
    /// only called when a new set must be opened.
    ///
    /// Steps, in order: purge redo-suppressed jars (non-internal only), push,
    /// rotate on processing threshold, enforce the memory ceiling, and open a
    /// set if none remain.
    pub fn append<F>(
        &mut self,
        jar: TransmissionJar,
        mut make_checkpoint: F,
    ) -> Result<AppendReport, StorageError>
    where
        F: FnMut() -> Result<Vec<u8>, StorageError>,
    {
        let mut report = AppendReport::default();
        if self.store.is_none() {
            return Ok(report);
        }

        if !jar.info.internal {
            report.purged = self.purge_suppressed();
        }

        let threshold_crossed = match self.sets.back_mut() {
            Some(current) => {
                current.processing += jar.processing;
                current.entries.push(jar);
                current.processing > self.config.undo_threshold
            },
            None => {
                // No set to hold the jar: start one from the current state,
                // which already includes this transmission.
                let checkpoint = make_checkpoint()?;
                self.open_set(&checkpoint)?;
                false
            },
        };

        if threshold_crossed {
            let checkpoint = make_checkpoint()?;
            self.open_set(&checkpoint)?;
            report.rotated = true;
        }

        if self.total_bytes() > self.config.memory_limit_bytes {
            if self.sets.len() == 1 {
                let checkpoint = make_checkpoint()?;
                self.open_set(&checkpoint)?;
            }
            while self.total_bytes() > self.config.memory_limit_bytes && self.sets.len() > 1 {
                if let Some(evicted) = self.evict_oldest()? {
                    report.evicted.push(evicted);
                }
            }
        }

        if self.sets.is_empty() {
            let checkpoint = make_checkpoint()?;
            self.open_set(&checkpoint)?;
        }

        Ok(report)
    }

    /// Drop `instigator`'s redo-suppressed jars that a redo could never
    /// bring back: failed jars are not replayed whatever their play flag.
    pub fn purge_orphaned(&mut self, instigator: UserId) -> usize {
        let mut purged = 0;
        for set in &mut self.sets {
            let before = set.entries.len();
            set.entries.retain(|jar| jar.play || !jar.failed || jar.info.instigator != instigator);
            let dropped = before - set.entries.len();
            if dropped > 0 {
                set.processing = set.entries.iter().map(|j| j.processing).sum();
            }
            purged += dropped;
        }
        purged
    }

    /// Drop every redo-suppressed jar. Returns how many were dropped.
    pub fn purge_suppressed(&mut self) -> usize {
        let mut purged = 0;
        for set in &mut self.sets {
            let before = set.entries.len();
            set.entries.retain(|jar| jar.play);
            let dropped = before - set.entries.len();
            if dropped > 0 {
                set.processing = set.entries.iter().map(|j| j.processing).sum();
            }
            purged += dropped;
        }
        if purged > 0 {
            tracing::debug!(scenario_id = %self.scenario, purged, "purged redo history");
        }
        purged
    }

    fn evict_oldest(&mut self) -> Result<Option<UndoNumber>, StorageError> {
        let Some(oldest) = self.sets.pop_front() else {
            return Ok(None);
        };
        if let Some(store) = &self.store {
            store.delete(self.scenario, oldest.undo_number)?;
        }
        tracing::debug!(
            scenario_id = %self.scenario,
            undo_number = %oldest.undo_number,
            bytes = oldest.size_bytes(),
            "evicted undo set"
        );
        Ok(Some(oldest.undo_number))
    }

    /// Drop every set and start over from `checkpoint`.
    pub fn clear(&mut self, checkpoint: &[u8]) -> Result<UndoNumber, StorageError> {
        self.delete_all_checkpoints()?;
        self.sets.clear();
        self.open_set(checkpoint)
    }

    /// Set `play = redo` on every jar from set index `from` onward whose id
    /// is in `toggle`. Returns how many jars changed.
    pub fn toggle_from(&mut self, from: usize, toggle: &[TransmissionId], redo: bool) -> usize {
        let mut changed = 0;
        for set in self.sets.iter_mut().skip(from) {
            for jar in &mut set.entries {
                if jar.play != redo && toggle.contains(&jar.transmission_id()) {
                    jar.play = redo;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Replayable transmissions of the set at `index`, in application order.
    pub fn replayable(&self, index: usize) -> Result<Vec<Transmission>, CodecError> {
        self.sets
            .get(index)
            .map(|set| {
                set.entries
                    .iter()
                    .filter(|jar| jar.replayable())
                    .map(TransmissionJar::inflate)
                    .collect::<Result<Vec<_>, _>>()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Load the checkpoint a set starts from.
    pub fn read_checkpoint(&self, undo_number: UndoNumber) -> Result<Vec<u8>, StorageError> {
        match &self.store {
            Some(store) => store.read(self.scenario, undo_number),
            None => Err(StorageError::NotFound { scenario: self.scenario, undo_number }),
        }
    }

    /// Replace the checkpoint of the set at `index`.
    pub fn rewrite_checkpoint(&mut self, index: usize, bytes: &[u8]) -> Result<(), StorageError> {
        let (Some(store), Some(set)) = (&self.store, self.sets.get_mut(index)) else {
            return Ok(());
        };
        store.write(self.scenario, set.undo_number, bytes)?;
        set.checkpoint_bytes = bytes.len() as u64;
        Ok(())
    }

    /// Audit listing without inflating payloads.
    pub fn history(&self) -> Vec<UndoSetSummary> {
        self.sets
            .iter()
            .map(|set| UndoSetSummary {
                undo_number: set.undo_number,
                checkpoint_bytes: set.checkpoint_bytes,
                entries: set
                    .entries
                    .iter()
                    .map(|jar| JarSummary { info: jar.info.clone(), play: jar.play, failed: jar.failed })
                    .collect(),
            })
            .collect()
    }

    /// Release the log. Checkpoints are deleted unless the scenario is
    /// temporary.
    pub fn dispose(&mut self) -> Result<(), StorageError> {
        if !self.temporary {
            self.delete_all_checkpoints()?;
        }
        self.sets.clear();
        Ok(())
    }

    fn delete_all_checkpoints(&self) -> Result<(), StorageError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        for set in &self.sets {
            store.delete(self.scenario, set.undo_number)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use plansync_proto::{DomainPayload, Target, TransmissionBody, TransmissionHeader, UserId};

    use super::*;
    use crate::storage::MemoryCheckpointStore;

    fn transmission(id: u128, internal: bool) -> Transmission {
        let mut header = TransmissionHeader::new(TransmissionId(id), UserId(1), Target::Live);
        header.number = id as u64;
        header.internal = internal;
        Transmission::new(
            header,
            TransmissionBody::Domain(DomainPayload { kind: 1, data: vec![id as u8; 8] }),
        )
    }

    fn jar(id: u128, millis: u64) -> TransmissionJar {
        TransmissionJar::pack(&transmission(id, false), Duration::from_millis(millis), false)
            .unwrap()
    }

    fn log_with(config: UndoConfig) -> (UndoLog<MemoryCheckpointStore>, MemoryCheckpointStore) {
        let store = MemoryCheckpointStore::new();
        let log = UndoLog::open(ScenarioId(1), store.clone(), config, false, b"cp0").unwrap();
        (log, store)
    }

    fn no_checkpoint() -> Result<Vec<u8>, StorageError> {
        Ok(b"cp".to_vec())
    }

    #[test]
    fn jar_inflates_to_original() {
        let t = transmission(9, false);
        let jar = TransmissionJar::pack(&t, Duration::from_millis(3), false).unwrap();
        assert_eq!(jar.inflate().unwrap(), t);
        assert_eq!(jar.info.transmission_id, TransmissionId(9));
        assert!(jar.replayable());
    }

    #[test]
    fn open_writes_first_checkpoint() {
        let (log, store) = log_with(UndoConfig::default());
        assert_eq!(log.set_count(), 1);
        assert_eq!(log.current().unwrap().undo_number, UndoNumber(1));
        assert!(store.exists(ScenarioId(1), UndoNumber(1)).unwrap());
    }

    #[test]
    fn threshold_rotates_into_new_set() {
        let config =
            UndoConfig { undo_threshold: Duration::from_millis(10), ..UndoConfig::default() };
        let (mut log, store) = log_with(config);

        let report = log.append(jar(1, 6), no_checkpoint).unwrap();
        assert!(!report.rotated);
        let report = log.append(jar(2, 6), no_checkpoint).unwrap();
        assert!(report.rotated);

        assert_eq!(log.set_count(), 2);
        assert_eq!(log.sets().next().unwrap().entries.len(), 2);
        assert!(log.current().unwrap().entries.is_empty());
        assert_eq!(store.list_scenario(ScenarioId(1)).unwrap(), vec![UndoNumber(1), UndoNumber(2)]);
    }

    #[test]
    fn non_internal_append_purges_suppressed_jars() {
        let (mut log, _) = log_with(UndoConfig::default());
        log.append(jar(1, 1), no_checkpoint).unwrap();
        log.append(jar(2, 1), no_checkpoint).unwrap();
        assert_eq!(log.toggle_from(0, &[TransmissionId(2)], false), 1);

        let internal =
            TransmissionJar::pack(&transmission(3, true), Duration::ZERO, false).unwrap();
        let report = log.append(internal, no_checkpoint).unwrap();
        assert_eq!(report.purged, 0, "internal appends keep redo history");

        let report = log.append(jar(4, 1), no_checkpoint).unwrap();
        assert_eq!(report.purged, 1);
        assert!(log.sets().flat_map(|s| &s.entries).all(|j| j.play));
    }

    #[test]
    fn memory_ceiling_evicts_oldest_only() {
        let (mut log, store) = log_with(UndoConfig::default());
        for id in 0..3 {
            log.append(jar(id, 1), no_checkpoint).unwrap();
            log.open_set(b"cp").unwrap();
        }
        assert_eq!(log.set_count(), 4);

        let limit = log.total_bytes() + jar(10, 1).size_bytes() - 1;
        log.reconfigure(UndoConfig { memory_limit_bytes: limit, ..log.config() });
        let report = log.append(jar(10, 1), no_checkpoint).unwrap();

        assert_eq!(report.evicted, vec![UndoNumber(1)]);
        assert!(log.total_bytes() <= limit);
        assert!(!store.exists(ScenarioId(1), UndoNumber(1)).unwrap());
        assert_eq!(log.current().unwrap().undo_number, UndoNumber(4));
    }

    #[test]
    fn single_oversized_set_opens_new_set_before_evicting() {
        let config = UndoConfig { memory_limit_bytes: 64, ..UndoConfig::default() };
        let (mut log, _) = log_with(config);
        let report = log.append(jar(1, 1), no_checkpoint).unwrap();

        assert_eq!(report.evicted, vec![UndoNumber(1)]);
        assert_eq!(log.set_count(), 1);
        assert_eq!(log.current().unwrap().undo_number, UndoNumber(2));
        assert!(log.current().unwrap().entries.is_empty());
    }

    #[test]
    fn clear_restarts_numbering_forward() {
        let (mut log, store) = log_with(UndoConfig::default());
        log.append(jar(1, 1), no_checkpoint).unwrap();
        log.open_set(b"cp").unwrap();

        let number = log.clear(b"fresh").unwrap();
        assert_eq!(number, UndoNumber(3));
        assert_eq!(log.set_count(), 1);
        assert_eq!(store.list().unwrap(), vec![(ScenarioId(1), UndoNumber(3))]);
    }

    #[test]
    fn dispose_removes_checkpoints_unless_temporary() {
        let (mut log, store) = log_with(UndoConfig::default());
        log.open_set(b"cp").unwrap();
        log.dispose().unwrap();
        assert!(store.is_empty());

        let store = MemoryCheckpointStore::new();
        let mut temp =
            UndoLog::open(ScenarioId(2), store.clone(), UndoConfig::default(), true, b"cp")
                .unwrap();
        temp.dispose().unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn disabled_log_records_nothing() {
        let mut log = UndoLog::<MemoryCheckpointStore>::disabled();
        let report = log.append(jar(1, 1), no_checkpoint).unwrap();
        assert_eq!(report, AppendReport::default());
        assert_eq!(log.set_count(), 0);
        assert!(!log.is_enabled());
    }

    #[test]
    fn failed_jars_are_never_replayed() {
        let (mut log, _) = log_with(UndoConfig::default());
        log.append(jar(1, 1), no_checkpoint).unwrap();
        let failed =
            TransmissionJar::pack(&transmission(2, false), Duration::ZERO, true).unwrap();
        log.append(failed, no_checkpoint).unwrap();

        let replay = log.replayable(0).unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].id(), TransmissionId(1));
    }
}
