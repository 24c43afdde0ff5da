//! Client state machine.
//!
//! The `Client` keeps local replicas of the scenarios its user opened. It
//! applies transmissions in the order the server forwards them, verifies its
//! replicas against the server's fingerprints and re-fetches a replica once
//! it has diverged.

use std::collections::{BTreeMap, BTreeSet};

use plansync_core::{
    CheckpointStore, ClientMessage, Environment, Gates, ProcessingOutcome, Reconciliation,
    RegistryConfig, RegistryEvent, RetryDecision, Role, ScenarioAction, ScenarioDetail,
    ScenarioEvent, ScenarioRegistry, ServerMessage,
};
use plansync_proto::{
    ScenarioId, Target, Transmission, TransmissionBody, TransmissionHeader, TransmissionId, UserId,
};

use crate::{
    error::ClientError,
    event::{ClientAction, ClientEvent},
};

/// Client tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    /// Applied to the local registry. The checksum retry interval doubles
    /// as the verification poll interval.
    pub registry: RegistryConfig,
}

/// Where a scenario stands on this client.
#[derive(Debug)]
enum Residency {
    /// Image requested; forwarded transmissions queue until it arrives.
    Fetching { queued: Vec<Transmission> },
    /// Replica installed and current.
    Resident,
    /// Replica diverged; a fresh image is on its way.
    Reloading { queued: Vec<Transmission> },
}

/// Client for a plansync server.
///
/// Owns a [`Role::Client`] registry. Every server message and user intent
/// goes through [`Client::handle`], which returns the actions the caller
/// must execute.
pub struct Client<D, S, E>
where
    D: ScenarioDetail,
    S: CheckpointStore,
    E: Environment,
{
    env: E,
    user: UserId,
    registry: ScenarioRegistry<D, S, E>,
    residency: BTreeMap<ScenarioId, Residency>,
    /// Scenarios the server reported as loaded.
    known: BTreeSet<ScenarioId>,
    production: Option<ScenarioId>,
    /// Next verification poll. Single-shot, re-armed while work is pending.
    poll_deadline: Option<E::Instant>,
}

impl<D, S, E> Client<D, S, E>
where
    D: ScenarioDetail,
    S: CheckpointStore,
    E: Environment,
{
    /// Client for `user` with an empty local registry.
    pub fn new(user: UserId, store: S, env: E, config: ClientConfig) -> Self {
        let registry =
            ScenarioRegistry::new(Role::Client, store, env.clone(), Gates::default(), config.registry);
        Self {
            env,
            user,
            registry,
            residency: BTreeMap::new(),
            known: BTreeSet::new(),
            production: None,
            poll_deadline: None,
        }
    }

    /// User this client acts for.
    pub fn user(&self) -> UserId {
        self.user
    }

    /// Local replicas.
    pub fn registry(&self) -> &ScenarioRegistry<D, S, E> {
        &self.registry
    }

    /// Scenarios the server has announced.
    pub fn known_scenarios(&self) -> Vec<ScenarioId> {
        self.known.iter().copied().collect()
    }

    /// Production scenario as last announced by the server.
    pub fn production(&self) -> Option<ScenarioId> {
        self.production
    }

    /// Whether a current replica of `scenario` is installed.
    pub fn is_resident(&self, scenario: ScenarioId) -> bool {
        matches!(self.residency.get(&scenario), Some(Residency::Resident))
    }

    /// Whether `scenario` is waiting for a fresh image after diverging.
    pub fn is_reloading(&self, scenario: ScenarioId) -> bool {
        matches!(self.residency.get(&scenario), Some(Residency::Reloading { .. }))
    }

    /// Clone of a resident replica's detail.
    pub fn detail(&self, scenario: ScenarioId) -> Option<D> {
        if !self.is_resident(scenario) {
            return None;
        }
        self.registry.get(scenario).map(|state| state.detail())
    }

    /// When the next verification poll is due.
    pub fn poll_deadline(&self) -> Option<E::Instant> {
        self.poll_deadline
    }

    /// Process an event and return the resulting actions.
    ///
    /// # Errors
    ///
    /// Only for conditions the caller must know about: an image that could
    /// not be installed, a transmission without a resolved target, or an
    /// unload of a scenario that is not open.
    pub fn handle(
        &mut self,
        event: ClientEvent<E::Instant>,
    ) -> Result<Vec<ClientAction>, ClientError> {
        match event {
            ClientEvent::MessageReceived(message) => self.handle_message(message),
            ClientEvent::Tick { now } => Ok(self.handle_tick(now)),
            ClientEvent::Submit { target, body } => Ok(self.handle_submit(target, body)),
            ClientEvent::Load { scenario } => Ok(self.handle_load(scenario)),
            ClientEvent::Unload { scenario } => self.handle_unload(scenario),
        }
    }

    fn handle_submit(&mut self, target: Target, body: TransmissionBody) -> Vec<ClientAction> {
        let id = TransmissionId(self.env.random_u128());
        let header = TransmissionHeader::new(id, self.user, target);
        tracing::debug!(transmission_id = %id, kind = body.description(), "submitting transmission");
        vec![ClientAction::Send(ClientMessage::Submit(Transmission::new(header, body)))]
    }

    fn handle_load(&mut self, scenario: ScenarioId) -> Vec<ClientAction> {
        if self.residency.contains_key(&scenario) {
            return Vec::new();
        }
        self.residency.insert(scenario, Residency::Fetching { queued: Vec::new() });
        vec![ClientAction::Send(ClientMessage::View(scenario))]
    }

    /// Unloading is local: the server keeps the scenario.
    fn handle_unload(&mut self, scenario: ScenarioId) -> Result<Vec<ClientAction>, ClientError> {
        if self.residency.remove(&scenario).is_none() {
            return Err(ClientError::NotResident(scenario));
        }
        if self.registry.get(scenario).is_some() {
            self.registry.unload(scenario)?;
        }
        Ok(vec![
            ClientAction::Send(ClientMessage::Unview(scenario)),
            ClientAction::Lifecycle(RegistryEvent::Unloaded(scenario)),
        ])
    }

    fn handle_message(&mut self, message: ServerMessage) -> Result<Vec<ClientAction>, ClientError> {
        match message {
            ServerMessage::Welcome { scenarios, production } => {
                self.known = scenarios.into_iter().collect();
                self.production = production;
                Ok(vec![ClientAction::Log {
                    message: format!("connected: {} scenarios on server", self.known.len()),
                }])
            },
            ServerMessage::Transmission(transmission) => self.handle_transmission(transmission),
            ServerMessage::Snapshot { scenario, bytes } => self.handle_snapshot(scenario, &bytes),
            ServerMessage::ScenarioAdded { scenario, bytes } => {
                self.known.insert(scenario);
                self.registry.load(&bytes)?;
                self.residency.insert(scenario, Residency::Resident);
                Ok(vec![ClientAction::ScenarioLoaded { scenario }])
            },
            ServerMessage::Checksum { scenario, transmission_id, values } => {
                let actions = self.handle_checksum(scenario, transmission_id, values);
                self.arm_poll();
                Ok(actions)
            },
            ServerMessage::Rejected { transmission_id, reason } => {
                Ok(vec![ClientAction::Rejected { transmission_id, reason }])
            },
            ServerMessage::ScenarioRemoved(scenario) => {
                self.known.remove(&scenario);
                Ok(self.drop_scenario(scenario, "deleted on server"))
            },
            ServerMessage::ProductionChanged(production) => {
                self.production = Some(production);
                for id in self.registry.ids() {
                    if let Some(state) = self.registry.get(id) {
                        state.set_production(id == production);
                    }
                }
                Ok(Vec::new())
            },
            ServerMessage::ScenarioUnavailable(scenario) => {
                self.known.remove(&scenario);
                Ok(self.drop_scenario(scenario, "not loaded on server"))
            },
            ServerMessage::CtpResult { scenario, transmission_id, kpis } => {
                Ok(vec![ClientAction::CtpResult { scenario, transmission_id, kpis }])
            },
        }
    }

    fn handle_transmission(
        &mut self,
        transmission: Transmission,
    ) -> Result<Vec<ClientAction>, ClientError> {
        let Target::Scenario(scenario) = transmission.header.target else {
            return Err(ClientError::UnresolvedTarget(transmission.id()));
        };

        match self.residency.get_mut(&scenario) {
            None => Ok(vec![ClientAction::Log {
                message: format!(
                    "ignoring transmission {} for scenario {scenario}, not open",
                    transmission.id()
                ),
            }]),
            Some(Residency::Fetching { queued } | Residency::Reloading { queued }) => {
                queued.push(transmission);
                Ok(Vec::new())
            },
            Some(Residency::Resident) => {
                let actions = self.apply(scenario, &transmission);
                self.arm_poll();
                Ok(actions)
            },
        }
    }

    /// Apply a forwarded transmission to a resident replica.
    ///
    /// The server already applied it, so a local refusal means the replica
    /// diverged.
    fn apply(&mut self, scenario: ScenarioId, transmission: &Transmission) -> Vec<ClientAction> {
        let deliveries = match self.registry.receive(transmission, |_| 0) {
            Ok(deliveries) => deliveries,
            Err(err) => {
                return self.start_reload(
                    scenario,
                    &format!("cannot route {}: {err}", transmission.id()),
                );
            },
        };

        let mut actions = Vec::new();
        for delivery in deliveries {
            match delivery.result {
                Ok(outcome) => actions.extend(self.absorb(outcome)),
                Err(err) => {
                    tracing::warn!(
                        scenario_id = %delivery.scenario,
                        transmission_id = %transmission.id(),
                        error = %err,
                        "server-accepted transmission refused locally"
                    );
                    actions.extend(self.start_reload(
                        delivery.scenario,
                        &format!("transmission {} refused locally: {err}", transmission.id()),
                    ));
                },
            }
            for event in delivery.lifecycle {
                actions.extend(self.lifecycle(event));
            }
        }
        actions
    }

    /// Turn a processing outcome into caller actions. Lifecycle requests
    /// were already executed by the registry.
    fn absorb(&mut self, outcome: ProcessingOutcome) -> Vec<ClientAction> {
        let mut actions: Vec<ClientAction> =
            outcome.events.into_iter().map(ClientAction::Event).collect();
        for action in outcome.actions {
            match action {
                ScenarioAction::SendToServer(transmission) => {
                    actions.push(ClientAction::Send(ClientMessage::Submit(transmission)));
                },
                ScenarioAction::RequestReload(scenario) => {
                    actions.extend(self.start_reload(scenario, "requested while processing"));
                },
                ScenarioAction::CtpResult { scenario, transmission_id, kpis } => {
                    actions.push(ClientAction::CtpResult { scenario, transmission_id, kpis });
                },
                ScenarioAction::Lifecycle(_) | ScenarioAction::BroadcastSnapshot { .. } => {},
            }
        }
        actions
    }

    fn lifecycle(&mut self, event: RegistryEvent) -> Vec<ClientAction> {
        let mut actions = Vec::new();
        match &event {
            RegistryEvent::Deleted(scenario) => {
                self.residency.remove(scenario);
                self.known.remove(scenario);
            },
            RegistryEvent::Unloaded(scenario) => {
                self.residency.remove(scenario);
                actions.push(ClientAction::Send(ClientMessage::Unview(*scenario)));
            },
            RegistryEvent::ReloadRequested(scenario) => {
                actions.extend(self.start_reload(*scenario, "reload requested"));
            },
            RegistryEvent::Promoted(scenario) => self.production = Some(*scenario),
            RegistryEvent::Created(_)
            | RegistryEvent::Copied { .. }
            | RegistryEvent::LoadRequested(_) => {},
        }
        actions.push(ClientAction::Lifecycle(event));
        actions
    }

    /// Discard a resident replica's queue position and re-fetch it.
    fn start_reload(&mut self, scenario: ScenarioId, reason: &str) -> Vec<ClientAction> {
        if !self.is_resident(scenario) {
            return Vec::new();
        }
        self.residency.insert(scenario, Residency::Reloading { queued: Vec::new() });
        tracing::info!(scenario_id = %scenario, reason, "reloading scenario");
        vec![
            ClientAction::Log { message: format!("reloading scenario {scenario}: {reason}") },
            ClientAction::Send(ClientMessage::FetchScenario(scenario)),
        ]
    }

    fn handle_snapshot(
        &mut self,
        scenario: ScenarioId,
        bytes: &[u8],
    ) -> Result<Vec<ClientAction>, ClientError> {
        let queued = match self.residency.remove(&scenario) {
            Some(Residency::Fetching { queued } | Residency::Reloading { queued }) => queued,
            // Pushed by the server after an undo.
            Some(Residency::Resident) => Vec::new(),
            None => {
                return Ok(vec![ClientAction::Log {
                    message: format!("ignoring image of scenario {scenario}, not open"),
                }]);
            },
        };

        let outcomes = match self.registry.replace(bytes, queued) {
            Ok(outcomes) => outcomes,
            Err(err) => {
                if self.registry.get(scenario).is_some() {
                    self.residency.insert(scenario, Residency::Resident);
                }
                return Err(err.into());
            },
        };
        self.residency.insert(scenario, Residency::Resident);
        self.known.insert(scenario);

        let mut actions = vec![ClientAction::ScenarioLoaded { scenario }];
        for outcome in outcomes {
            actions.extend(self.absorb(outcome));
        }
        self.arm_poll();
        Ok(actions)
    }

    fn handle_checksum(
        &mut self,
        scenario: ScenarioId,
        transmission_id: TransmissionId,
        values: Option<plansync_core::ChecksumValues>,
    ) -> Vec<ClientAction> {
        if !self.is_resident(scenario) {
            return Vec::new();
        }
        let Some(state) = self.registry.get(scenario) else {
            return Vec::new();
        };

        let Some(remote) = values else {
            return match state.with_checksums(|c| c.record_not_available(transmission_id)) {
                RetryDecision::Abandoned { attempts } => {
                    tracing::warn!(scenario_id = %scenario, transmission_id = %transmission_id, attempts, "server checksum lost");
                    vec![ClientAction::Event(ScenarioEvent::ChecksumLost {
                        scenario,
                        transmission_id,
                        attempts,
                    })]
                },
                RetryDecision::Retry { .. }
                | RetryDecision::Rotated { .. }
                | RetryDecision::Unknown => Vec::new(),
            };
        };

        match state.with_checksums(|c| c.reconcile(remote)) {
            Reconciliation::Mismatch { local, .. } => {
                tracing::error!(scenario_id = %scenario, transmission_id = %transmission_id, "scenario desynchronized");
                let mut actions = vec![ClientAction::Event(ScenarioEvent::Desynchronized {
                    scenario,
                    transmission_id,
                    diagnostics: local.diagnostics,
                })];
                actions.extend(self.start_reload(scenario, "checksum mismatch"));
                actions
            },
            Reconciliation::Match | Reconciliation::Suppressed | Reconciliation::Unknown => {
                Vec::new()
            },
        }
    }

    /// Poll the server for the oldest pending fingerprint of every resident
    /// replica, then re-arm if anything is still pending.
    fn handle_tick(&mut self, now: E::Instant) -> Vec<ClientAction> {
        match self.poll_deadline {
            Some(deadline) if now >= deadline => self.poll_deadline = None,
            _ => return Vec::new(),
        }

        let mut actions = Vec::new();
        for (scenario, residency) in &self.residency {
            if !matches!(residency, Residency::Resident) {
                continue;
            }
            let Some(state) = self.registry.get(*scenario) else {
                continue;
            };
            if let Some(transmission_id) = state.with_checksums(|c| c.next_pending()) {
                actions.push(ClientAction::Send(ClientMessage::ChecksumRequest {
                    scenario: *scenario,
                    transmission_id,
                }));
            }
        }

        if self.has_pending() {
            self.poll_deadline = Some(now + self.poll_interval());
        }
        actions
    }

    fn poll_interval(&self) -> std::time::Duration {
        self.registry.config().scenario.checksum.retry_interval
    }

    fn has_pending(&self) -> bool {
        self.residency.iter().any(|(scenario, residency)| {
            matches!(residency, Residency::Resident)
                && self
                    .registry
                    .get(*scenario)
                    .is_some_and(|state| state.with_checksums(|c| c.pending_len() > 0))
        })
    }

    fn arm_poll(&mut self) {
        if self.poll_deadline.is_none() && self.has_pending() {
            self.poll_deadline = Some(self.env.now() + self.poll_interval());
        }
    }

    /// Forget a scenario the server no longer has.
    fn drop_scenario(&mut self, scenario: ScenarioId, reason: &str) -> Vec<ClientAction> {
        let was_open = self.residency.remove(&scenario).is_some();
        if self.registry.get(scenario).is_some() {
            if let Err(err) = self.registry.unload(scenario) {
                tracing::warn!(scenario_id = %scenario, error = %err, "failed to dispose dropped scenario");
            }
        }
        if !was_open {
            return Vec::new();
        }
        vec![ClientAction::ScenarioDropped { scenario, reason: reason.to_string() }]
    }
}

impl<D, S, E> std::fmt::Debug for Client<D, S, E>
where
    D: ScenarioDetail,
    S: CheckpointStore,
    E: Environment,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("user", &self.user)
            .field("residency", &self.residency)
            .field("production", &self.production)
            .finish_non_exhaustive()
    }
}
