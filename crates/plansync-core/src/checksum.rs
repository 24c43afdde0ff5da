//! State fingerprints and their reconciliation between client and server.
//!
//! Both sides decide after each transmission whether to fingerprint the
//! scenario, using the same deterministic rule, and keep the values in a
//! bounded FIFO keyed by transmission id. The client then polls the server
//! for the oldest pending id and compares.

use std::{collections::VecDeque, time::Duration};

use plansync_proto::{
    CodecError, PayloadKind, Transmission, TransmissionId, TransmissionInfo, Versioned, codec,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    detail::{DataChanges, ScenarioDetail},
    summary::ScenarioSummary,
};

/// Checksum scheduling and retry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumConfig {
    /// Fingerprint every Nth transmission number (0 disables cadence).
    pub every: u64,
    /// Fingerprint right after a simulation completes.
    pub after_simulation: bool,
    /// FIFO capacity on each side.
    pub capacity: usize,
    /// Client poll interval.
    pub retry_interval: Duration,
    /// Polls answered "not yet available" before the entry is abandoned.
    pub max_attempts: u32,
    /// Every Nth not-available answer moves the entry to the back.
    pub rotate_every: u32,
    /// Attach recent transmissions to every value.
    pub diagnostics: bool,
    /// Recent transmissions kept in diagnostics.
    pub diagnostics_depth: usize,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            every: 10,
            after_simulation: true,
            capacity: 128,
            retry_interval: Duration::from_secs(10),
            max_attempts: 30,
            rotate_every: 10,
            diagnostics: false,
            diagnostics_depth: 20,
        }
    }
}

/// Context attached to a fingerprint in diagnostics mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Most recent transmissions, oldest first.
    pub recent_transmissions: Vec<TransmissionInfo>,
    /// Position in a recorded session, if replaying one.
    pub recording_cursor: Option<u64>,
    /// Timezone id the scenario was computed in.
    pub timezone: String,
}

/// Fingerprint of a scenario after one transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumValues {
    /// Transmission the fingerprint follows.
    pub transmission_id: TransmissionId,
    /// SHA-256 of the encoded detail.
    pub state_hash: [u8; 32],
    /// SHA-256 of the encoded summary.
    pub summary_hash: [u8; 32],
    /// Entity count of the detail.
    pub entity_count: u64,
    /// Polls answered "not yet available" so far.
    #[serde(default)]
    pub validation_attempts: u32,
    /// Present in diagnostics mode.
    #[serde(default)]
    pub diagnostics: Option<Diagnostics>,
}

impl ChecksumValues {
    /// Fingerprint `detail` and `summary`.
    pub fn compute<D: ScenarioDetail>(
        transmission_id: TransmissionId,
        detail: &D,
        summary: &ScenarioSummary,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            transmission_id,
            state_hash: Sha256::digest(codec::encode_body(detail)?).into(),
            summary_hash: Sha256::digest(codec::encode_body(summary)?).into(),
            entity_count: detail.entity_count(),
            validation_attempts: 0,
            diagnostics: None,
        })
    }

    /// Same logical state. Attempt counters and diagnostics are ignored.
    pub fn matches(&self, other: &Self) -> bool {
        self.transmission_id == other.transmission_id
            && self.state_hash == other.state_hash
            && self.summary_hash == other.summary_hash
            && self.entity_count == other.entity_count
    }
}

impl Versioned for ChecksumValues {
    const KIND: PayloadKind = PayloadKind::ChecksumValues;
}

/// What to do after the server answered "not yet available".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Poll the same entry again next interval.
    Retry {
        /// Attempts so far
        attempts: u32,
    },
    /// Entry moved to the back of the queue.
    Rotated {
        /// Attempts so far
        attempts: u32,
    },
    /// Gave up; the server likely lost the checksum.
    Abandoned {
        /// Attempts made
        attempts: u32,
    },
    /// No pending entry with that id.
    Unknown,
}

/// Result of comparing a local value with the server's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Same state.
    Match,
    /// Diverged. Reported once until [`ChecksumCoordinator::clear`].
    Mismatch {
        /// Local fingerprint
        local: Box<ChecksumValues>,
        /// Server fingerprint
        remote: Box<ChecksumValues>,
    },
    /// Diverged, but a desync was already reported.
    Suppressed,
    /// No local value for that id.
    Unknown,
}

/// Bounded fingerprint store plus the client's verification queue.
#[derive(Debug, Clone)]
pub struct ChecksumCoordinator {
    config: ChecksumConfig,
    values: VecDeque<ChecksumValues>,
    pending: VecDeque<TransmissionId>,
    desynchronized: bool,
}

impl ChecksumCoordinator {
    /// Empty coordinator.
    pub fn new(config: ChecksumConfig) -> Self {
        Self { config, values: VecDeque::new(), pending: VecDeque::new(), desynchronized: false }
    }

    /// Current tuning.
    pub fn config(&self) -> &ChecksumConfig {
        &self.config
    }

    /// Apply new tuning. Shrinking capacity drops the oldest values.
    pub fn reconfigure(&mut self, config: ChecksumConfig) {
        self.config = config;
        self.trim();
    }

    /// Whether to fingerprint after `transmission` was applied.
    ///
    /// Replays never are. Recorded and undo-class transmissions always are.
    /// Otherwise every Nth transmission number, or right after a simulation
    /// when configured.
    pub fn should_checksum(&self, transmission: &Transmission, changes: &DataChanges) -> bool {
        let header = &transmission.header;
        if header.replay {
            return false;
        }
        if header.recording || transmission.body.is_undo_class() {
            return true;
        }
        if self.config.every > 0 && header.number > 0 && header.number % self.config.every == 0 {
            return true;
        }
        self.config.after_simulation && changes.simulation_completed
    }

    /// Store a value, evicting the oldest past capacity.
    pub fn record(&mut self, values: ChecksumValues) {
        self.values.retain(|v| v.transmission_id != values.transmission_id);
        self.values.push_back(values);
        self.trim();
    }

    /// Store a local value and queue it for verification against the server.
    pub fn track(&mut self, values: ChecksumValues) {
        let id = values.transmission_id;
        self.record(values);
        if !self.pending.contains(&id) {
            self.pending.push_back(id);
        }
        self.trim();
    }

    fn trim(&mut self) {
        while self.values.len() > self.config.capacity {
            if let Some(dropped) = self.values.pop_front() {
                self.pending.retain(|id| *id != dropped.transmission_id);
            }
        }
    }

    /// Value for a transmission (server answering a client poll).
    pub fn lookup(&self, id: TransmissionId) -> Option<&ChecksumValues> {
        self.values.iter().find(|v| v.transmission_id == id)
    }

    /// Oldest id awaiting verification.
    pub fn next_pending(&self) -> Option<TransmissionId> {
        self.pending.front().copied()
    }

    /// Ids awaiting verification.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no values are stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// A desync was reported and not yet cleared.
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// The server has no value for `id` yet.
    pub fn record_not_available(&mut self, id: TransmissionId) -> RetryDecision {
        let Some(values) = self.values.iter_mut().find(|v| v.transmission_id == id) else {
            self.pending.retain(|p| *p != id);
            return RetryDecision::Unknown;
        };
        values.validation_attempts += 1;
        let attempts = values.validation_attempts;

        if attempts > self.config.max_attempts {
            self.pending.retain(|p| *p != id);
            self.values.retain(|v| v.transmission_id != id);
            return RetryDecision::Abandoned { attempts };
        }

        if self.config.rotate_every > 0 && attempts % self.config.rotate_every == 0 {
            self.pending.retain(|p| *p != id);
            self.pending.push_back(id);
            return RetryDecision::Rotated { attempts };
        }

        RetryDecision::Retry { attempts }
    }

    /// Compare the server's value with the local one.
    ///
    /// The entry leaves the verification queue either way. A mismatch is
    /// reported once; later mismatches are suppressed until [`Self::clear`].
    pub fn reconcile(&mut self, remote: ChecksumValues) -> Reconciliation {
        let id = remote.transmission_id;
        self.pending.retain(|p| *p != id);

        let Some(local) = self.lookup(id).cloned() else {
            return Reconciliation::Unknown;
        };
        if local.matches(&remote) {
            return Reconciliation::Match;
        }
        if self.desynchronized {
            return Reconciliation::Suppressed;
        }
        self.desynchronized = true;
        self.pending.clear();
        Reconciliation::Mismatch { local: Box::new(local), remote: Box::new(remote) }
    }

    /// Forget everything. Called after any undo and after a reload.
    pub fn clear(&mut self) {
        self.values.clear();
        self.pending.clear();
        self.desynchronized = false;
    }
}
