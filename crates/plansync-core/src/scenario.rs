//! One loaded scenario.
//!
//! Each protected aspect sits behind its own lock. Processing takes them in
//! a fixed order:
//!
//! ```text
//! dispatch -> undo -> detail -> summary
//! ```
//!
//! Readers may take any subset as long as they follow the same order. The
//! serialization lock wraps full snapshots so an image never interleaves with
//! an in-flight transmission.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use plansync_proto::{
    CodecError, ScenarioId, TransmissionId, TransmissionInfo, UndoNumber, codec,
};
use serde::{Deserialize, Serialize};

use crate::{
    checksum::{ChecksumConfig, ChecksumCoordinator, ChecksumValues},
    detail::ScenarioDetail,
    gate::Gates,
    snapshot::{ScenarioSnapshot, encode_checkpoint},
    storage::{CheckpointStore, StorageError},
    summary::ScenarioSummary,
    undo::{UndoConfig, UndoLog, UndoSetSummary},
};

/// Default cap on move re-application attempts.
pub const DEFAULT_MAX_MOVE_RETRIES: u32 = 8;

/// Which side of the wire a scenario lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Authoritative copy. Performs undo, answers checksum polls.
    Server,
    /// Replica. Requests undo, verifies checksums.
    Client,
}

/// Per-scenario tuning pushed down by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioConfig {
    /// Undo log tuning.
    pub undo: UndoConfig,
    /// Checksum tuning.
    pub checksum: ChecksumConfig,
    /// Cap on move re-application attempts.
    pub max_move_retries: u32,
    /// Timezone id reported in diagnostics.
    pub timezone: String,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            undo: UndoConfig::default(),
            checksum: ChecksumConfig::default(),
            max_move_retries: DEFAULT_MAX_MOVE_RETRIES,
            timezone: "UTC".to_string(),
        }
    }
}

/// Last transmission a scenario applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastReceived {
    /// Server sequence number.
    pub number: u64,
    /// Transmission id.
    pub transmission_id: TransmissionId,
    /// Server timestamp.
    pub timestamp_ms: u64,
}

/// Everything needed to construct a [`ScenarioState`].
#[derive(Debug, Clone)]
pub struct ScenarioInit<D> {
    /// Id; [`ScenarioId::NULL`] disables undo history.
    pub id: ScenarioId,
    /// Initial schedule.
    pub detail: D,
    /// Initial summary.
    pub summary: ScenarioSummary,
    /// Server or client.
    pub role: Role,
    /// Keep checkpoint files on disposal.
    pub temporary: bool,
}

/// One planning scenario.
pub struct ScenarioState<D: ScenarioDetail, S: CheckpointStore> {
    pub(crate) id: ScenarioId,
    pub(crate) role: Role,
    pub(crate) temporary: bool,
    pub(crate) detail: RwLock<D>,
    pub(crate) summary: RwLock<ScenarioSummary>,
    pub(crate) undo: RwLock<UndoLog<S>>,
    pub(crate) checksums: Mutex<ChecksumCoordinator>,
    pub(crate) last_good: Mutex<D>,
    pub(crate) last_received: Mutex<Option<LastReceived>>,
    pub(crate) recent: Mutex<VecDeque<TransmissionInfo>>,
    pub(crate) read_only: AtomicBool,
    pub(crate) max_move_retries: AtomicU32,
    pub(crate) config: RwLock<ScenarioConfig>,
    pub(crate) dispatch: Mutex<()>,
    pub(crate) serialization: Mutex<()>,
    pub(crate) gates: Gates,
}

impl<D: ScenarioDetail, S: CheckpointStore> ScenarioState<D, S> {
    /// Construct a scenario and write its first checkpoint.
    pub fn new(
        init: ScenarioInit<D>,
        store: S,
        config: &ScenarioConfig,
        gates: Gates,
    ) -> Result<Self, StorageError> {
        let ScenarioInit { id, mut detail, summary, role, temporary } = init;
        detail.restore_references();

        let undo = if id.is_null() {
            UndoLog::disabled()
        } else {
            let checkpoint = encode_checkpoint(&detail, &summary)?;
            UndoLog::open(id, store, config.undo, temporary, &checkpoint)?
        };

        let read_only = gates.license.validate_data(&summary, detail.entity_count());
        if read_only {
            tracing::info!(scenario_id = %id, "scenario starts read-only");
        }

        Ok(Self {
            id,
            role,
            temporary,
            last_good: Mutex::new(detail.clone()),
            detail: RwLock::new(detail),
            summary: RwLock::new(summary),
            undo: RwLock::new(undo),
            checksums: Mutex::new(ChecksumCoordinator::new(config.checksum.clone())),
            last_received: Mutex::new(None),
            recent: Mutex::new(VecDeque::new()),
            read_only: AtomicBool::new(read_only),
            max_move_retries: AtomicU32::new(config.max_move_retries),
            config: RwLock::new(config.clone()),
            dispatch: Mutex::new(()),
            serialization: Mutex::new(()),
            gates,
        })
    }

    /// Construct from a snapshot (load, reload, replace).
    pub fn from_snapshot(
        snapshot: ScenarioSnapshot<D>,
        role: Role,
        store: S,
        config: &ScenarioConfig,
        gates: Gates,
    ) -> Result<Self, StorageError> {
        let last_received = snapshot.last_received;
        let state = Self::new(
            ScenarioInit {
                id: snapshot.id,
                detail: snapshot.detail,
                summary: snapshot.summary,
                role,
                temporary: false,
            },
            store,
            config,
            gates,
        )?;
        *state.last_received.lock() = last_received;
        Ok(state)
    }

    /// Scenario id.
    pub fn id(&self) -> ScenarioId {
        self.id
    }

    /// Server or client.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Keeps checkpoint files on disposal.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// License-derived read-only flag.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Copy of the summary.
    pub fn summary(&self) -> ScenarioSummary {
        self.summary.read().clone()
    }

    /// Copy of the summary, or `None` if it stays write-locked for longer
    /// than `timeout`. For diagnostic dumps that must not block on live
    /// traffic.
    pub fn try_summary(&self, timeout: Duration) -> Option<ScenarioSummary> {
        self.summary.try_read_for(timeout).map(|s| s.clone())
    }

    /// Read the detail under its read lock.
    pub fn with_detail<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.detail.read())
    }

    /// Copy of the detail.
    pub fn detail(&self) -> D {
        self.detail.read().clone()
    }

    /// Holds the production flag.
    pub fn is_production(&self) -> bool {
        self.summary.read().production
    }

    /// Flagged for comparison views.
    pub fn is_compare(&self) -> bool {
        self.summary.read().compare
    }

    /// Set or clear the production flag. Returns whether it changed.
    pub fn set_production(&self, production: bool) -> bool {
        let summary = self.summary.upgradable_read();
        if summary.production == production {
            return false;
        }
        let mut summary = RwLockUpgradableReadGuard::upgrade(summary);
        summary.production = production;
        true
    }

    /// Last transmission applied.
    pub fn last_received(&self) -> Option<LastReceived> {
        *self.last_received.lock()
    }

    /// Current tuning.
    pub fn config(&self) -> ScenarioConfig {
        self.config.read().clone()
    }

    /// Push new tuning into the undo log and checksum coordinator.
    pub fn reconfigure(&self, config: &ScenarioConfig) {
        self.undo.write().reconfigure(config.undo);
        self.checksums.lock().reconfigure(config.checksum.clone());
        self.max_move_retries.store(config.max_move_retries, Ordering::Release);
        *self.config.write() = config.clone();
    }

    /// Audit listing of the undo log.
    pub fn undo_history(&self) -> Vec<UndoSetSummary> {
        self.undo.read().history()
    }

    /// Undo set numbers, oldest first.
    pub fn undo_numbers(&self) -> Vec<UndoNumber> {
        self.undo.read().sets().map(|s| s.undo_number).collect()
    }

    /// Set new transmissions are appended to.
    pub fn current_undo_number(&self) -> Option<UndoNumber> {
        self.undo.read().current().map(|s| s.undo_number)
    }

    /// Checkpoint plus payload bytes held by the undo log.
    pub fn undo_bytes(&self) -> u64 {
        self.undo.read().total_bytes()
    }

    /// Stored fingerprint for a transmission.
    pub fn checksum(&self, id: TransmissionId) -> Option<ChecksumValues> {
        self.checksums.lock().lookup(id).cloned()
    }

    /// Run `f` against the checksum coordinator.
    pub fn with_checksums<R>(&self, f: impl FnOnce(&mut ChecksumCoordinator) -> R) -> R {
        f(&mut self.checksums.lock())
    }

    /// Rebuild detail cross references.
    pub fn restore_references(&self) {
        self.detail.write().restore_references();
        self.refresh_last_good();
    }

    /// Full image under the serialization lock.
    pub fn snapshot(&self) -> ScenarioSnapshot<D> {
        let _serial = self.serialization.lock();
        let detail = self.detail.read();
        let summary = self.summary.read();
        ScenarioSnapshot {
            id: self.id,
            detail: detail.clone(),
            summary: summary.clone(),
            read_only: self.is_read_only(),
            last_received: self.last_received(),
        }
    }

    /// Encoded full image.
    pub fn encode_snapshot(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(&self.snapshot())
    }

    /// Release the undo log. Checkpoint files are deleted unless temporary.
    pub fn dispose(&self) -> Result<(), StorageError> {
        let _serial = self.serialization.lock();
        self.undo.write().dispose()?;
        self.checksums.lock().clear();
        tracing::debug!(scenario_id = %self.id, temporary = self.temporary, "scenario disposed");
        Ok(())
    }

    /// Checkpoint bytes of the current state.
    pub(crate) fn checkpoint_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let detail = self.detail.read();
        let summary = self.summary.read();
        encode_checkpoint(&*detail, &summary)
    }

    /// Replace detail and summary together, detail first.
    pub(crate) fn swap_state(&self, detail: D, summary: ScenarioSummary) {
        let mut live_detail = self.detail.write();
        let mut live_summary = self.summary.write();
        *live_detail = detail;
        *live_summary = summary;
    }

    pub(crate) fn refresh_last_good(&self) {
        let detail = self.detail.read().clone();
        *self.last_good.lock() = detail;
    }

    pub(crate) fn restore_last_good(&self) {
        let good = self.last_good.lock().clone();
        *self.detail.write() = good;
    }

    pub(crate) fn remember(&self, info: TransmissionInfo, depth: usize) {
        let mut recent = self.recent.lock();
        recent.push_back(info);
        while recent.len() > depth {
            recent.pop_front();
        }
    }

    pub(crate) fn recent_transmissions(&self) -> Vec<TransmissionInfo> {
        self.recent.lock().iter().cloned().collect()
    }
}

impl<D: ScenarioDetail, S: CheckpointStore> std::fmt::Debug for ScenarioState<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioState")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("read_only", &self.is_read_only())
            .finish_non_exhaustive()
    }
}
