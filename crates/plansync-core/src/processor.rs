//! Transmission processing.
//!
//! [`ScenarioState::process`] is the per-scenario state machine. At most one
//! transmission is in flight per scenario (the dispatch lock); different
//! scenarios process concurrently.
//!
//! Steps, always in this order:
//!
//! 1. Gates: read-only allow-list or license pre-check, then permission.
//!    A rejection returns before anything is touched.
//! 2. Checkpoint boundary: seal the current undo set if requested.
//! 3. Dispatch on the transmission body.
//! 4. Post-processing: record, append to the undo log, re-validate the
//!    license, refresh the last-known-good detail, schedule a checksum and
//!    emit change events. Runs for failures too, with empty changes.

use std::time::Duration;

use plansync_proto::{
    MoveRequest, Target, Transmission, TransmissionBody, TransmissionHeader, TransmissionId,
    TransmissionInfo, UndoNumber, UndoRequest, codec,
};

use crate::{
    checksum::{ChecksumValues, Diagnostics},
    detail::{DataChanges, DetailError, ReceiveContext, ReceiveOutcome, ScenarioDetail},
    env::Environment,
    error::ProcessError,
    event::{LifecycleRequest, ProcessStatus, ProcessingOutcome, ScenarioAction, ScenarioEvent},
    scenario::{LastReceived, Role, ScenarioState},
    snapshot::Checkpoint,
    storage::{CheckpointStore, StorageError},
    summary::KpiSnapshot,
    undo::TransmissionJar,
};

/// Why dispatch stopped early.
enum Interrupt {
    /// A dependent simulation was cancelled. Never escapes `process`.
    Cancelled(String),
    Error(ProcessError),
}

impl From<ProcessError> for Interrupt {
    fn from(err: ProcessError) -> Self {
        Self::Error(err)
    }
}

impl From<StorageError> for Interrupt {
    fn from(err: StorageError) -> Self {
        Self::Error(err.into())
    }
}

impl From<plansync_proto::CodecError> for Interrupt {
    fn from(err: plansync_proto::CodecError) -> Self {
        Self::Error(err.into())
    }
}

impl From<DetailError> for Interrupt {
    fn from(err: DetailError) -> Self {
        match err {
            DetailError::Validation(reason) => Self::Error(ProcessError::Validation(reason)),
            DetailError::Cancelled(reason) => Self::Cancelled(reason),
            DetailError::Internal(reason) => Self::Error(ProcessError::Fatal(reason)),
        }
    }
}

impl<D: ScenarioDetail, S: CheckpointStore> ScenarioState<D, S> {
    /// Process one transmission.
    ///
    /// # Errors
    ///
    /// - Gate rejections (`ReadOnlyViolation`, `LicenseExceeded`,
    ///   `PermissionDenied`): nothing recorded, no events.
    /// - `Validation`: state unchanged, recorded as a failed jar.
    /// - `Handleable`: e.g. undo to an evicted set; logged at warn.
    /// - `Fatal`: logged at error, recorded as a failed jar, detail
    ///   restored to the last known good state.
    pub fn process<E: Environment>(
        &self,
        transmission: &Transmission,
        env: &E,
    ) -> Result<ProcessingOutcome, ProcessError> {
        let _dispatch = self.dispatch.lock();
        self.check_gates(transmission)?;

        let started = env.now();
        let mut outcome = ProcessingOutcome::new(ProcessStatus::Applied);

        let result = self
            .checkpoint_boundary(transmission, &mut outcome)
            .and_then(|()| self.dispatch(transmission, env, &mut outcome));
        let duration = env.now() - started;

        match result {
            Ok(()) => {
                self.post_process(transmission, duration, false, &mut outcome)?;
                Ok(outcome)
            },
            Err(Interrupt::Cancelled(reason)) => {
                self.restore_last_good();
                outcome.changes = DataChanges::default();
                match self.role {
                    Role::Server => {
                        tracing::info!(
                            scenario_id = %self.id,
                            transmission_id = %transmission.id(),
                            reason,
                            "simulation cancelled, transmission discarded"
                        );
                        outcome.status = ProcessStatus::Discarded;
                    },
                    Role::Client => {
                        tracing::info!(
                            scenario_id = %self.id,
                            transmission_id = %transmission.id(),
                            reason,
                            "simulation cancelled, requesting compensating undo"
                        );
                        outcome.status = ProcessStatus::Compensated;
                        outcome
                            .actions
                            .push(ScenarioAction::SendToServer(self.compensating_undo(transmission, env)));
                    },
                }
                Ok(outcome)
            },
            Err(Interrupt::Error(err)) => {
                match &err {
                    ProcessError::Validation(reason) => {
                        tracing::debug!(scenario_id = %self.id, reason, "transmission refused");
                        self.restore_last_good();
                    },
                    ProcessError::Handleable(reason) => {
                        tracing::warn!(scenario_id = %self.id, reason, "transmission not applied");
                        self.restore_last_good();
                    },
                    _ => {
                        tracing::error!(
                            scenario_id = %self.id,
                            transmission_id = %transmission.id(),
                            kind = transmission.body.description(),
                            error = %err,
                            "transmission processing failed"
                        );
                        self.restore_last_good();
                    },
                }

                let mut failed = ProcessingOutcome::new(ProcessStatus::Applied);
                if let Err(post) = self.post_process(transmission, duration, true, &mut failed) {
                    tracing::error!(scenario_id = %self.id, error = %post, "failed to record failed transmission");
                }
                Err(err)
            },
        }
    }

    fn check_gates(&self, transmission: &Transmission) -> Result<(), ProcessError> {
        // Replays were gated when first applied.
        if transmission.header.replay {
            return Ok(());
        }

        if self.is_read_only() {
            if !self.gates.license.verify_readonly_transmission(transmission) {
                return Err(ProcessError::ReadOnlyViolation {
                    scenario: self.id,
                    kind: transmission.body.description(),
                });
            }
        } else {
            let entity_count = self.detail.read().entity_count();
            let summary = self.summary.read();
            if let Some(reason) =
                self.gates.license.would_force_read_only(transmission, &summary, entity_count)
            {
                return Err(ProcessError::LicenseExceeded { scenario: self.id, reason });
            }
        }

        if !self.gates.permissions.verify_transmission(self.id, transmission) {
            return Err(ProcessError::PermissionDenied {
                user: transmission.header.instigator,
                scenario: self.id,
            });
        }
        Ok(())
    }

    fn checkpoint_boundary(
        &self,
        transmission: &Transmission,
        outcome: &mut ProcessingOutcome,
    ) -> Result<(), Interrupt> {
        if transmission.header.replay || !transmission.header.checkpoint_boundary {
            return Ok(());
        }
        let mut undo = self.undo.write();
        if !undo.is_enabled() {
            return Ok(());
        }
        let checkpoint = self.checkpoint_bytes()?;
        let number = undo.open_set(&checkpoint)?;
        outcome.events.push(ScenarioEvent::UndoSetChanged {
            scenario: self.id,
            current: Some(number),
            sets: undo.set_count(),
        });
        Ok(())
    }

    fn dispatch<E: Environment>(
        &self,
        transmission: &Transmission,
        env: &E,
        outcome: &mut ProcessingOutcome,
    ) -> Result<(), Interrupt> {
        let header = &transmission.header;
        match &transmission.body {
            TransmissionBody::ClearUndoSets => self.clear_undo_sets(outcome)?,
            TransmissionBody::ScenarioChange(change) => {
                let mut summary = self.summary.write();
                if let Some(name) = &change.name {
                    summary.name.clone_from(name);
                }
                if let Some(kind) = change.kind {
                    summary.kind = kind;
                }
                outcome.changes.summary_changed = true;
            },
            TransmissionBody::Undo(request) => self.undo(transmission, request, env, outcome)?,
            TransmissionBody::StartUndo => {
                outcome
                    .events
                    .push(ScenarioEvent::UndoStarted { scenario: self.id, instigator: header.instigator });
            },
            TransmissionBody::NewScenario(_)
            | TransmissionBody::CopyScenario(_)
            | TransmissionBody::DeleteScenario
            | TransmissionBody::LoadScenario
            | TransmissionBody::UnloadScenario
            | TransmissionBody::ReloadScenario
            | TransmissionBody::PromoteToProduction => {
                outcome.actions.push(ScenarioAction::Lifecycle(LifecycleRequest {
                    source: self.id,
                    transmission: transmission.clone(),
                }));
            },
            TransmissionBody::PublishStatus(status) => {
                self.summary.write().published = status.published;
                outcome.changes.summary_changed = true;
            },
            TransmissionBody::KpiUpdate => {
                let kpis = self.detail.read().kpis();
                self.summary.write().kpi_values = kpis;
                outcome.changes.summary_changed = true;
            },
            TransmissionBody::KpiSnapshot => {
                let mut summary = self.summary.write();
                let values = summary.kpi_values.clone();
                summary.kpi_snapshots.push(KpiSnapshot { taken_at_ms: header.timestamp_ms, values });
                outcome.changes.summary_changed = true;
            },
            TransmissionBody::KpiVisibility(visibility) => {
                let mut summary = self.summary.write();
                if visibility.visible {
                    summary.hidden_kpis.remove(&visibility.kpi);
                } else {
                    summary.hidden_kpis.insert(visibility.kpi.clone());
                }
                outcome.changes.summary_changed = true;
            },
            TransmissionBody::Isolate(isolate) => {
                self.summary.write().isolated = isolate.isolated;
                outcome.changes.summary_changed = true;
            },
            TransmissionBody::SettingsSave(setting) => {
                self.summary.write().settings.insert(setting.key.clone(), setting.value.clone());
                outcome.changes.summary_changed = true;
            },
            // The detail sees the change first; the summary follows only if
            // the detail accepted it, so a refusal leaves both untouched.
            TransmissionBody::HoldSettings(hold) => {
                self.forward(transmission, outcome)?;
                self.summary.write().hold_until_ms = hold.hold_until_ms;
                outcome.changes.summary_changed = true;
            },
            TransmissionBody::ClockAdvance(clock) => {
                self.forward(transmission, outcome)?;
                self.summary.write().clock_ms = clock.clock_ms;
                outcome.changes.summary_changed = true;
            },
            TransmissionBody::Move(request) => self.apply_move(transmission, request, outcome)?,
            TransmissionBody::Ctp(_) => self.capable_to_promise(transmission, outcome)?,
            TransmissionBody::ClearPastShortTerm
            | TransmissionBody::Import(_)
            | TransmissionBody::Domain(_) => self.forward(transmission, outcome)?,
        }
        Ok(())
    }

    /// Hand a transmission to the detail. Retry requests are only honored
    /// for moves.
    fn forward(
        &self,
        transmission: &Transmission,
        outcome: &mut ProcessingOutcome,
    ) -> Result<(), Interrupt> {
        let mut changes = DataChanges::default();
        match self.receive(transmission, &mut changes)? {
            ReceiveOutcome::Applied => {},
            ReceiveOutcome::RetryMove(_) => {
                tracing::warn!(
                    scenario_id = %self.id,
                    kind = transmission.body.description(),
                    "retry requested for a non-move transmission, ignored"
                );
            },
        }
        outcome.changes.merge(changes);
        Ok(())
    }

    fn receive(
        &self,
        transmission: &Transmission,
        changes: &mut DataChanges,
    ) -> Result<ReceiveOutcome, DetailError> {
        let mut detail = self.detail.write();
        let summary = self.summary.read();
        let mut ctx = ReceiveContext { summary: &summary, changes };
        detail.receive(transmission, &mut ctx)
    }

    /// Bounded move retry. Each retry restarts from the last-known-good
    /// detail with the adjusted request; only the original is logged.
    fn apply_move(
        &self,
        transmission: &Transmission,
        request: &MoveRequest,
        outcome: &mut ProcessingOutcome,
    ) -> Result<(), Interrupt> {
        let max_retries = self.max_move_retries.load(std::sync::atomic::Ordering::Acquire);
        let mut attempt = transmission.clone();
        let mut retries = request.attempt;

        loop {
            let mut changes = DataChanges::default();
            match self.receive(&attempt, &mut changes)? {
                ReceiveOutcome::Applied => {
                    outcome.changes.merge(changes);
                    return Ok(());
                },
                ReceiveOutcome::RetryMove(adjusted) => {
                    retries += 1;
                    if retries > max_retries {
                        return Err(ProcessError::Validation(format!(
                            "move not placed after {max_retries} retries"
                        ))
                        .into());
                    }
                    tracing::debug!(scenario_id = %self.id, attempt = retries, "retrying move");
                    self.restore_last_good();
                    attempt.body = TransmissionBody::Move(MoveRequest { attempt: retries, ..adjusted });
                },
            }
        }
    }

    /// Run a what-if query on a scratch copy of the detail.
    fn capable_to_promise(
        &self,
        transmission: &Transmission,
        outcome: &mut ProcessingOutcome,
    ) -> Result<(), Interrupt> {
        let mut scratch = self.detail.read().clone();
        let summary = self.summary.read().clone();
        let mut changes = DataChanges::default();
        let mut ctx = ReceiveContext { summary: &summary, changes: &mut changes };
        scratch.receive(transmission, &mut ctx)?;

        outcome.actions.push(ScenarioAction::CtpResult {
            scenario: self.id,
            transmission_id: transmission.id(),
            kpis: scratch.kpis(),
        });
        Ok(())
    }

    fn clear_undo_sets(&self, outcome: &mut ProcessingOutcome) -> Result<(), Interrupt> {
        let mut undo = self.undo.write();
        if !undo.is_enabled() {
            return Ok(());
        }
        let checkpoint = self.checkpoint_bytes()?;
        let number = undo.clear(&checkpoint)?;
        self.checksums.lock().clear();
        tracing::info!(scenario_id = %self.id, undo_number = %number, "undo sets cleared");
        outcome.events.push(ScenarioEvent::UndoSetChanged {
            scenario: self.id,
            current: Some(number),
            sets: undo.set_count(),
        });
        Ok(())
    }

    /// Undo or redo.
    ///
    /// Loads the checkpoint of the starting set, toggles play flags from
    /// there on, and replays every playable jar in original order,
    /// rewriting each following set's checkpoint on the way. Clients only
    /// request; the server's snapshot replaces their copy.
    fn undo<E: Environment>(
        &self,
        transmission: &Transmission,
        request: &UndoRequest,
        env: &E,
        outcome: &mut ProcessingOutcome,
    ) -> Result<(), Interrupt> {
        if self.role == Role::Client {
            return Ok(());
        }

        let mut undo = self.undo.write();
        if !undo.is_enabled() {
            return Err(ProcessError::Handleable(format!("scenario {} keeps no undo history", self.id)).into());
        }

        // Start no later than the earliest set holding a toggled jar.
        let requested = undo.position(request.undo_number);
        let earliest_toggled = undo
            .sets()
            .position(|set| set.entries.iter().any(|jar| request.toggle.contains(&jar.transmission_id())));
        let start = match (requested, earliest_toggled) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => {
                return Err(ProcessError::Handleable(format!(
                    "undo set {} no longer available",
                    request.undo_number
                ))
                .into());
            },
        };
        let Some(start_number) = undo.sets().nth(start).map(|s| s.undo_number) else {
            return Err(ProcessError::Fatal("undo start vanished".into()).into());
        };

        let checkpoint: Checkpoint<D> = codec::decode(&undo.read_checkpoint(start_number)?)?;
        let Checkpoint { mut detail, summary } = checkpoint;
        detail.restore_references();
        self.swap_state(detail, summary);

        let toggled = undo.toggle_from(start, &request.toggle, request.redo);
        let set_count = undo.set_count();
        let mut replayed = 0usize;
        for index in start..set_count {
            for logged in undo.replayable(index)? {
                self.replay(&logged.as_replay(), env)?;
                replayed += 1;
            }
            if index + 1 < set_count {
                let checkpoint = self.checkpoint_bytes()?;
                undo.rewrite_checkpoint(index + 1, &checkpoint)?;
            }
        }
        let current = undo.current().map(|s| s.undo_number);
        drop(undo);

        self.checksums.lock().clear();
        self.refresh_last_good();
        tracing::info!(
            scenario_id = %self.id,
            transmission_id = %transmission.id(),
            from = %start_number,
            toggled,
            replayed,
            redo = request.redo,
            "undo applied"
        );

        outcome.changes.summary_changed = true;
        outcome.events.push(ScenarioEvent::UndoSetChanged { scenario: self.id, current, sets: set_count });
        outcome.actions.push(ScenarioAction::BroadcastSnapshot {
            scenario: self.id,
            bytes: self.encode_snapshot()?,
        });
        Ok(())
    }

    /// Re-apply a logged transmission during undo. No gates, no logging, no
    /// checksums, no events.
    fn replay<E: Environment>(&self, transmission: &Transmission, env: &E) -> Result<(), Interrupt> {
        if transmission.body.is_undo_class() {
            return Ok(());
        }
        if matches!(transmission.body, TransmissionBody::Move(_)) {
            self.refresh_last_good();
        }

        let mut scratch = ProcessingOutcome::new(ProcessStatus::Applied);
        match self.dispatch(transmission, env, &mut scratch) {
            Ok(()) => Ok(()),
            Err(Interrupt::Cancelled(reason) | Interrupt::Error(ProcessError::Validation(reason))) => {
                tracing::warn!(
                    scenario_id = %self.id,
                    transmission_id = %transmission.id(),
                    reason,
                    "replayed transmission no longer applies, skipped"
                );
                Ok(())
            },
            Err(err) => Err(err),
        }
    }

    /// Undo request that reverses `transmission` on the server.
    fn compensating_undo<E: Environment>(&self, transmission: &Transmission, env: &E) -> Transmission {
        let undo_number = self.current_undo_number().unwrap_or(UndoNumber(0));
        let header =
            TransmissionHeader::new(TransmissionId(env.random_u128()), transmission.header.instigator, Target::Scenario(self.id));
        Transmission::new(
            header,
            TransmissionBody::Undo(UndoRequest { undo_number, toggle: vec![transmission.id()], redo: false }),
        )
    }

    fn post_process(
        &self,
        transmission: &Transmission,
        duration: Duration,
        failed: bool,
        outcome: &mut ProcessingOutcome,
    ) -> Result<(), ProcessError> {
        let header = &transmission.header;
        if failed {
            outcome.changes = DataChanges::default();
        }
        let info = TransmissionInfo::from(transmission);
        let config = self.config.read().clone();

        if !header.replay {
            outcome.events.push(ScenarioEvent::TransmissionProcessed {
                scenario: self.id,
                info: info.clone(),
                duration,
                failed,
            });
            self.remember(info.clone(), config.checksum.diagnostics_depth);
            *self.last_received.lock() = Some(LastReceived {
                number: header.number,
                transmission_id: header.id,
                timestamp_ms: header.timestamp_ms,
            });
        }

        if transmission.body.is_logged() && !header.replay {
            let mut undo = self.undo.write();
            if undo.is_enabled() {
                let jar = TransmissionJar::pack(transmission, duration, failed)?;
                let report = undo.append(jar, || self.checkpoint_bytes().map_err(StorageError::from))?;
                if !report.evicted.is_empty() {
                    tracing::debug!(
                        scenario_id = %self.id,
                        evicted = report.evicted.len(),
                        total_bytes = undo.total_bytes(),
                        "undo memory ceiling reached"
                    );
                }
                outcome.events.push(ScenarioEvent::UndoSetChanged {
                    scenario: self.id,
                    current: undo.current().map(|s| s.undo_number),
                    sets: undo.set_count(),
                });
            }
        }

        if transmission.body.is_undo_class() && !header.replay {
            let purged = self.undo.write().purge_orphaned(header.instigator);
            if purged > 0 {
                tracing::debug!(scenario_id = %self.id, purged, instigator = %header.instigator, "purged orphaned redo entries");
            }
        }

        self.revalidate_license(outcome);

        if failed {
            return Ok(());
        }
        self.refresh_last_good();
        self.schedule_checksum(transmission, &config, outcome)?;

        if !outcome.changes.is_empty() {
            outcome.events.push(ScenarioEvent::DataChanged {
                scenario: self.id,
                transmission_id: header.id,
                changes: outcome.changes.clone(),
            });
            if !header.replay {
                outcome.events.push(ScenarioEvent::Audit {
                    scenario: self.id,
                    info,
                    touched: outcome.changes.touched(),
                });
            }
        }
        Ok(())
    }

    fn revalidate_license(&self, outcome: &mut ProcessingOutcome) {
        let entity_count = self.detail.read().entity_count();
        let read_only = self.gates.license.validate_data(&self.summary.read(), entity_count);
        let previous = self.read_only.swap(read_only, std::sync::atomic::Ordering::AcqRel);
        if previous != read_only {
            tracing::info!(scenario_id = %self.id, read_only, "license changed read-only flag");
            outcome.events.push(ScenarioEvent::ReadOnlyChanged { scenario: self.id, read_only });
        }
    }

    /// Fingerprint when the cadence says so. The server stores the value for
    /// client polls; a client queues it for verification. Clients never
    /// fingerprint undo-class transmissions because they do not apply them.
    fn schedule_checksum(
        &self,
        transmission: &Transmission,
        config: &crate::scenario::ScenarioConfig,
        outcome: &ProcessingOutcome,
    ) -> Result<(), ProcessError> {
        if self.id.is_null() {
            return Ok(());
        }
        if self.role == Role::Client && transmission.body.is_undo_class() {
            return Ok(());
        }
        if !self.checksums.lock().should_checksum(transmission, &outcome.changes) {
            return Ok(());
        }

        let mut values = {
            let detail = self.detail.read();
            let summary = self.summary.read();
            ChecksumValues::compute(transmission.id(), &*detail, &summary)?
        };
        if config.checksum.diagnostics {
            values.diagnostics = Some(Diagnostics {
                recent_transmissions: self.recent_transmissions(),
                recording_cursor: transmission.header.recording.then_some(transmission.header.number),
                timezone: config.timezone.clone(),
            });
        }

        let mut checksums = self.checksums.lock();
        match self.role {
            Role::Server => checksums.record(values),
            Role::Client => checksums.track(values),
        }
        Ok(())
    }
}
