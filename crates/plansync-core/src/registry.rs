//! Scenario registry.
//!
//! Owns every loaded scenario, routes transmissions to them and executes the
//! lifecycle operations the processor hands back as
//! [`ScenarioAction::Lifecycle`]. The map lock is only held to look up,
//! insert or remove; processing runs on cloned `Arc`s so scenarios proceed
//! concurrently.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use plansync_proto::{
    CopyScenario, NewScenario, ScenarioId, Target, Transmission, TransmissionBody, codec,
};
use rayon::prelude::*;

use crate::{
    detail::ScenarioDetail,
    env::Environment,
    error::{ProcessError, RegistryError},
    event::{LifecycleRequest, ProcessingOutcome, ScenarioAction},
    gate::Gates,
    scenario::{Role, ScenarioConfig, ScenarioInit, ScenarioState},
    snapshot::ScenarioSnapshot,
    storage::CheckpointStore,
    summary::ScenarioSummary,
};

/// Default cap on loaded scenarios.
pub const DEFAULT_MAX_LOADED_SCENARIOS: usize = 64;

/// Default cap on scenarios flagged for comparison.
pub const DEFAULT_MAX_COMPARE_SCENARIOS: usize = 4;

/// Registry-wide tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Pushed down to every scenario.
    pub scenario: ScenarioConfig,
    /// Loaded scenarios allowed at once.
    pub max_loaded_scenarios: usize,
    /// Scenarios flagged for comparison allowed at once.
    pub max_compare_scenarios: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            scenario: ScenarioConfig::default(),
            max_loaded_scenarios: DEFAULT_MAX_LOADED_SCENARIOS,
            max_compare_scenarios: DEFAULT_MAX_COMPARE_SCENARIOS,
        }
    }
}

/// Lifecycle change carried out by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A scenario was created.
    Created(ScenarioId),
    /// A scenario was copied.
    Copied {
        /// Copied from
        source: ScenarioId,
        /// The new scenario
        copy: ScenarioId,
    },
    /// A scenario was deleted and disposed.
    Deleted(ScenarioId),
    /// The production flag moved.
    Promoted(ScenarioId),
    /// A scenario was dropped from memory.
    Unloaded(ScenarioId),
    /// The caller should fetch this scenario's image.
    LoadRequested(ScenarioId),
    /// The caller should re-fetch this scenario's image.
    ReloadRequested(ScenarioId),
}

/// Result of one copy.
pub enum CopyOutcome<D: ScenarioDetail, S: CheckpointStore> {
    /// Registered under a fresh id.
    Registered(ScenarioId),
    /// Internal simulation copy: null id, no undo log, never registered.
    Detached(Arc<ScenarioState<D, S>>),
}

impl<D: ScenarioDetail, S: CheckpointStore> std::fmt::Debug for CopyOutcome<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered(id) => f.debug_tuple("Registered").field(id).finish(),
            Self::Detached(state) => f.debug_tuple("Detached").field(state).finish(),
        }
    }
}

/// One scenario's share of a routed transmission.
#[derive(Debug)]
pub struct Delivery {
    /// Recipient.
    pub scenario: ScenarioId,
    /// Processing result. Lifecycle failures surface here too.
    pub result: Result<ProcessingOutcome, RegistryError>,
    /// Lifecycle changes the transmission caused.
    pub lifecycle: Vec<RegistryEvent>,
}

/// Every loaded scenario of one process.
pub struct ScenarioRegistry<D: ScenarioDetail, S: CheckpointStore, E: Environment> {
    role: Role,
    store: S,
    env: E,
    gates: Gates,
    config: RwLock<RegistryConfig>,
    scenarios: RwLock<BTreeMap<ScenarioId, Arc<ScenarioState<D, S>>>>,
    unloaded: Mutex<BTreeSet<ScenarioId>>,
    next_id: AtomicU64,
}

impl<D: ScenarioDetail, S: CheckpointStore, E: Environment> ScenarioRegistry<D, S, E> {
    /// Empty registry.
    pub fn new(role: Role, store: S, env: E, gates: Gates, config: RegistryConfig) -> Self {
        Self {
            role,
            store,
            env,
            gates,
            config: RwLock::new(config),
            scenarios: RwLock::new(BTreeMap::new()),
            unloaded: Mutex::new(BTreeSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Server or client.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Environment handed to every processing call.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Current tuning.
    pub fn config(&self) -> RegistryConfig {
        self.config.read().clone()
    }

    /// Loaded scenario by id.
    pub fn get(&self, id: ScenarioId) -> Option<Arc<ScenarioState<D, S>>> {
        self.scenarios.read().get(&id).cloned()
    }

    fn require(&self, id: ScenarioId) -> Result<Arc<ScenarioState<D, S>>, RegistryError> {
        self.get(id).ok_or(RegistryError::NotLoaded(id))
    }

    /// Loaded ids, ascending.
    pub fn ids(&self) -> Vec<ScenarioId> {
        self.scenarios.read().keys().copied().collect()
    }

    /// Number of loaded scenarios.
    pub fn len(&self) -> usize {
        self.scenarios.read().len()
    }

    /// True when nothing is loaded.
    pub fn is_empty(&self) -> bool {
        self.scenarios.read().is_empty()
    }

    /// Ids dropped from memory by [`Self::unload`].
    pub fn unloaded(&self) -> Vec<ScenarioId> {
        self.unloaded.lock().iter().copied().collect()
    }

    /// The scenario holding the production flag.
    pub fn production(&self) -> Option<ScenarioId> {
        self.scenarios.read().iter().find(|(_, s)| s.is_production()).map(|(id, _)| *id)
    }

    fn allocate_id(&self) -> ScenarioId {
        ScenarioId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn check_caps(&self, compare: bool) -> Result<(), RegistryError> {
        let config = self.config();
        within_caps(&config, &self.scenarios.read(), compare)
    }

    fn build(
        &self,
        id: ScenarioId,
        detail: D,
        summary: ScenarioSummary,
        temporary: bool,
    ) -> Result<ScenarioState<D, S>, RegistryError> {
        let config = self.config.read().scenario.clone();
        let init = ScenarioInit { id, detail, summary, role: self.role, temporary };
        Ok(ScenarioState::new(init, self.store.clone(), &config, self.gates.clone())?)
    }

    fn install(&self, state: ScenarioState<D, S>) -> ScenarioId {
        let id = state.id();
        self.next_id.fetch_max(id.0 + 1, Ordering::Relaxed);
        self.unloaded.lock().remove(&id);
        self.scenarios.write().insert(id, Arc::new(state));
        id
    }

    /// Insert `state` unless a cap is reached. Check and insert share one
    /// write guard; a refused state is disposed.
    fn install_within_caps(&self, state: ScenarioState<D, S>, compare: bool) -> Result<ScenarioId, RegistryError> {
        let config = self.config();
        let id = state.id();
        let mut scenarios = self.scenarios.write();
        if let Err(err) = within_caps(&config, &scenarios, compare) {
            drop(scenarios);
            dispose_logged(&state);
            return Err(err);
        }
        self.next_id.fetch_max(id.0 + 1, Ordering::Relaxed);
        self.unloaded.lock().remove(&id);
        scenarios.insert(id, Arc::new(state));
        Ok(id)
    }

    /// Create an empty scenario.
    ///
    /// # Errors
    ///
    /// `Validation` when a cap would be exceeded.
    pub fn create(&self, request: &NewScenario) -> Result<ScenarioId, RegistryError> {
        self.check_caps(request.compare)?;

        let id = self.allocate_id();
        let mut summary = ScenarioSummary::new(request.name.clone(), request.kind);
        summary.compare = request.compare;
        let state = self.build(id, D::default(), summary, false)?;
        self.install_within_caps(state, request.compare)?;

        if request.production {
            self.promote(id)?;
        }
        tracing::info!(scenario_id = %id, name = %request.name, "scenario created");
        Ok(id)
    }

    /// Copy `source`.
    ///
    /// The copy never holds the production flag. Internal simulation copies
    /// get the null id and are returned without being registered.
    ///
    /// # Errors
    ///
    /// `NotLoaded` for an unknown source, `Validation` when a cap would be
    /// exceeded.
    pub fn copy(
        &self,
        source: ScenarioId,
        request: &CopyScenario,
    ) -> Result<CopyOutcome<D, S>, RegistryError> {
        let source_state = self.require(source)?;
        if !request.internal_simulation {
            self.check_caps(request.compare)?;
        }

        let ScenarioSnapshot { detail, mut summary, .. } = source_state.snapshot();
        summary.name.clone_from(&request.name);
        summary.kind = request.kind;
        summary.compare = request.compare;
        summary.production = false;
        summary.settings.extend(request.settings.clone());

        if request.internal_simulation {
            let state = self.build(ScenarioId::NULL, detail, summary, true)?;
            tracing::debug!(source = %source, "internal simulation copy created");
            return Ok(CopyOutcome::Detached(Arc::new(state)));
        }

        let id = self.allocate_id();
        let state = self.build(id, detail, summary, request.temporary)?;
        self.install_within_caps(state, request.compare)?;
        tracing::info!(source = %source, scenario_id = %id, "scenario copied");
        Ok(CopyOutcome::Registered(id))
    }

    /// Delete and dispose a scenario.
    ///
    /// # Errors
    ///
    /// `Validation` for the last scenario, the production scenario, or one
    /// that still has viewers.
    pub fn delete(&self, id: ScenarioId, active_viewers: usize) -> Result<(), RegistryError> {
        let removed = {
            let mut scenarios = self.scenarios.write();
            let Some(state) = scenarios.get(&id) else {
                return Err(RegistryError::NotLoaded(id));
            };
            if scenarios.len() == 1 {
                return Err(RegistryError::Validation("cannot delete the last scenario".into()));
            }
            if state.is_production() {
                return Err(RegistryError::Validation(
                    "cannot delete the production scenario".into(),
                ));
            }
            if active_viewers > 0 {
                return Err(RegistryError::Validation(format!(
                    "scenario {id} still has {active_viewers} viewer(s)"
                )));
            }
            scenarios.remove(&id)
        };

        if let Some(state) = removed {
            state.dispose()?;
        }
        tracing::info!(scenario_id = %id, "scenario deleted");
        Ok(())
    }

    /// Make `id` the production scenario and clear the flag everywhere else.
    ///
    /// Runs under the map's write guard so concurrent promotions serialize.
    pub fn promote(&self, id: ScenarioId) -> Result<(), RegistryError> {
        let scenarios = self.scenarios.write();
        if !scenarios.contains_key(&id) {
            return Err(RegistryError::NotLoaded(id));
        }
        for (other, state) in scenarios.iter() {
            state.set_production(*other == id);
        }
        tracing::info!(scenario_id = %id, "promoted to production");
        Ok(())
    }

    /// Drop a scenario from memory and remember its id.
    pub fn unload(&self, id: ScenarioId) -> Result<(), RegistryError> {
        let Some(state) = self.scenarios.write().remove(&id) else {
            return Err(RegistryError::NotLoaded(id));
        };
        self.unloaded.lock().insert(id);
        state.dispose()?;
        tracing::debug!(scenario_id = %id, "scenario unloaded");
        Ok(())
    }

    /// Install a scenario from an encoded [`ScenarioSnapshot`]. An already
    /// loaded instance with the same id is replaced.
    pub fn load(&self, bytes: &[u8]) -> Result<ScenarioId, RegistryError> {
        let snapshot: ScenarioSnapshot<D> = codec::decode(bytes)?;
        // The old instance shares checkpoint names with the new one.
        if let Some(previous) = self.scenarios.write().remove(&snapshot.id) {
            dispose_logged(&previous);
        }
        let config = self.config.read().scenario.clone();
        let state =
            ScenarioState::from_snapshot(snapshot, self.role, self.store.clone(), &config, self.gates.clone())?;
        let id = self.install(state);
        tracing::info!(scenario_id = %id, "scenario loaded");
        Ok(id)
    }

    /// Swap a stale instance for a fresh image and replay what arrived while
    /// the image was in flight.
    ///
    /// Queued transmissions the image already contains (by sequence number)
    /// are skipped. Rejected ones are logged and dropped.
    pub fn replace(
        &self,
        bytes: &[u8],
        queued: Vec<Transmission>,
    ) -> Result<Vec<ProcessingOutcome>, RegistryError> {
        let id = self.load(bytes)?;
        let state = self.require(id)?;
        let applied_through = state.last_received().map_or(0, |l| l.number);

        let mut outcomes = Vec::new();
        for transmission in queued.into_iter().filter(|t| t.header.number > applied_through) {
            match state.process(&transmission, &self.env) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) if !err.is_fatal() => {
                    tracing::warn!(scenario_id = %id, error = %err, "queued transmission rejected after reload");
                },
                Err(err) => return Err(err.into()),
            }
        }
        tracing::info!(scenario_id = %id, replayed = outcomes.len(), "scenario replaced");
        Ok(outcomes)
    }

    /// Encoded full image of a scenario.
    pub fn snapshot(&self, id: ScenarioId) -> Result<Vec<u8>, RegistryError> {
        Ok(self.require(id)?.encode_snapshot()?)
    }

    /// Recipients of a target.
    pub fn resolve(&self, target: Target) -> Result<Vec<Arc<ScenarioState<D, S>>>, RegistryError> {
        match target {
            Target::Scenario(id) => Ok(vec![self.require(id)?]),
            Target::Live => {
                let id = self.production().ok_or(RegistryError::NoProduction)?;
                Ok(vec![self.require(id)?])
            },
            Target::Broadcast => Ok(self.scenarios.read().values().cloned().collect()),
        }
    }

    /// Route a transmission and carry out the lifecycle work it causes.
    ///
    /// Each recipient processes its own copy. `viewers` reports how many
    /// sessions are viewing a scenario, for the delete guard.
    ///
    /// # Errors
    ///
    /// Only routing failures. Per-scenario results are in the deliveries.
    pub fn receive(
        &self,
        transmission: &Transmission,
        viewers: impl Fn(ScenarioId) -> usize,
    ) -> Result<Vec<Delivery>, RegistryError> {
        let recipients = self.resolve(transmission.header.target)?;

        let mut deliveries = Vec::with_capacity(recipients.len());
        for state in recipients {
            let copy = transmission.clone();
            let mut lifecycle = Vec::new();
            let result = match state.process(&copy, &self.env) {
                Ok(outcome) => {
                    let mut refused = None;
                    for action in &outcome.actions {
                        let ScenarioAction::Lifecycle(request) = action else {
                            continue;
                        };
                        match self.execute(request, &viewers) {
                            Ok(Some(event)) => lifecycle.push(event),
                            Ok(None) => {},
                            Err(err) => {
                                tracing::debug!(scenario_id = %state.id(), error = %err, "lifecycle request refused");
                                refused = Some(err);
                            },
                        }
                    }
                    refused.map_or(Ok(outcome), Err)
                },
                Err(err) => Err(err.into()),
            };
            deliveries.push(Delivery { scenario: state.id(), result, lifecycle });
        }
        Ok(deliveries)
    }

    fn execute(
        &self,
        request: &LifecycleRequest,
        viewers: &impl Fn(ScenarioId) -> usize,
    ) -> Result<Option<RegistryEvent>, RegistryError> {
        let source = request.source;
        let event = match &request.transmission.body {
            // Clients receive new scenarios as images from the server, which
            // owns id allocation.
            TransmissionBody::NewScenario(_) | TransmissionBody::CopyScenario(_)
                if self.role == Role::Client =>
            {
                None
            },
            TransmissionBody::NewScenario(new) => Some(RegistryEvent::Created(self.create(new)?)),
            TransmissionBody::CopyScenario(copy) => match self.copy(source, copy)? {
                CopyOutcome::Registered(id) => Some(RegistryEvent::Copied { source, copy: id }),
                CopyOutcome::Detached(_) => {
                    return Err(RegistryError::Validation(
                        "internal simulation copies cannot be requested remotely".into(),
                    ));
                },
            },
            // The server already enforced the delete guards; a replica
            // just lets go of its copy.
            TransmissionBody::DeleteScenario => {
                match self.role {
                    Role::Server => self.delete(source, viewers(source))?,
                    Role::Client => {
                        self.unload(source)?;
                        self.unloaded.lock().remove(&source);
                    },
                }
                Some(RegistryEvent::Deleted(source))
            },
            TransmissionBody::PromoteToProduction => {
                self.promote(source)?;
                Some(RegistryEvent::Promoted(source))
            },
            TransmissionBody::UnloadScenario => match self.role {
                Role::Client => {
                    self.unload(source)?;
                    Some(RegistryEvent::Unloaded(source))
                },
                Role::Server => None,
            },
            TransmissionBody::LoadScenario => match self.role {
                Role::Client => Some(RegistryEvent::LoadRequested(source)),
                Role::Server => None,
            },
            TransmissionBody::ReloadScenario => Some(RegistryEvent::ReloadRequested(source)),
            other => {
                return Err(ProcessError::Fatal(format!(
                    "{} is not a lifecycle transmission",
                    other.description()
                ))
                .into());
            },
        };
        Ok(event)
    }

    /// Apply new tuning to the registry and every loaded scenario.
    pub fn reconfigure(&self, config: RegistryConfig) {
        for state in self.scenarios.read().values() {
            state.reconfigure(&config.scenario);
        }
        *self.config.write() = config;
        tracing::info!("registry reconfigured");
    }

    /// Rebuild detail cross references of every scenario, in parallel.
    pub fn restore_all_references(&self) {
        let states: Vec<_> = self.scenarios.read().values().cloned().collect();
        states.par_iter().for_each(|state| state.restore_references());
        tracing::debug!(scenarios = states.len(), "references restored");
    }

    /// Delete checkpoints of scenarios that are not loaded. Run at startup
    /// to drop files left by a crash.
    pub fn purge_abandoned_checkpoints(&self) -> Result<usize, RegistryError> {
        let loaded: BTreeSet<ScenarioId> = self.scenarios.read().keys().copied().collect();
        let mut purged = 0;
        for (scenario, undo_number) in self.store.list()? {
            if !loaded.contains(&scenario) {
                self.store.delete(scenario, undo_number)?;
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, "purged abandoned checkpoints");
        }
        Ok(purged)
    }

    /// Dispose every scenario.
    pub fn shutdown(&self) {
        let states: Vec<_> = std::mem::take(&mut *self.scenarios.write()).into_values().collect();
        for state in &states {
            dispose_logged(state);
        }
    }
}

fn within_caps<D: ScenarioDetail, S: CheckpointStore>(
    config: &RegistryConfig,
    scenarios: &BTreeMap<ScenarioId, Arc<ScenarioState<D, S>>>,
    compare: bool,
) -> Result<(), RegistryError> {
    if scenarios.len() >= config.max_loaded_scenarios {
        return Err(RegistryError::Validation(format!(
            "at most {} scenarios may be loaded",
            config.max_loaded_scenarios
        )));
    }
    if compare && scenarios.values().filter(|s| s.is_compare()).count() >= config.max_compare_scenarios {
        return Err(RegistryError::Validation(format!(
            "at most {} scenarios may be compared",
            config.max_compare_scenarios
        )));
    }
    Ok(())
}

fn dispose_logged<D: ScenarioDetail, S: CheckpointStore>(state: &ScenarioState<D, S>) {
    if let Err(err) = state.dispose() {
        tracing::warn!(scenario_id = %state.id(), error = %err, "failed to dispose scenario");
    }
}

impl<D: ScenarioDetail, S: CheckpointStore, E: Environment> std::fmt::Debug for ScenarioRegistry<D, S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioRegistry")
            .field("role", &self.role)
            .field("scenarios", &self.ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use plansync_proto::{ScenarioKind, TransmissionHeader, TransmissionId, UserId};

    use super::*;
    use crate::{
        storage::MemoryCheckpointStore,
        testing::{CounterDetail, TestEnv, add},
    };

    type Registry = ScenarioRegistry<CounterDetail, MemoryCheckpointStore, TestEnv>;

    fn registry(role: Role) -> (Registry, MemoryCheckpointStore) {
        let store = MemoryCheckpointStore::new();
        let registry =
            ScenarioRegistry::new(role, store.clone(), TestEnv::default(), Gates::default(), RegistryConfig::default());
        (registry, store)
    }

    fn new_scenario(name: &str, production: bool) -> NewScenario {
        NewScenario { name: name.into(), kind: ScenarioKind::Live, production, compare: false }
    }

    fn lifecycle(id: u128, target: ScenarioId, body: TransmissionBody) -> Transmission {
        Transmission::new(TransmissionHeader::new(TransmissionId(id), UserId(1), Target::Scenario(target)), body)
    }

    #[test]
    fn create_assigns_fresh_ids_and_single_production() {
        let (registry, _) = registry(Role::Server);
        let a = registry.create(&new_scenario("a", true)).unwrap();
        let b = registry.create(&new_scenario("b", true)).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.production(), Some(b));
        assert!(!registry.get(a).unwrap().is_production());
    }

    #[test]
    fn copy_respects_caps_and_never_copies_production() {
        let (registry, _) = registry(Role::Server);
        registry.reconfigure(RegistryConfig { max_loaded_scenarios: 2, ..RegistryConfig::default() });
        let live = registry.create(&new_scenario("live", true)).unwrap();
        registry.get(live).unwrap().process(&add(1, 4), registry.env()).unwrap();

        let request = CopyScenario { name: "what-if".into(), kind: ScenarioKind::WhatIf, ..CopyScenario::default() };
        let CopyOutcome::Registered(copy) = registry.copy(live, &request).unwrap() else {
            panic!("expected a registered copy");
        };
        let copied = registry.get(copy).unwrap();
        assert_eq!(copied.detail().value, 4);
        assert!(!copied.is_production());
        assert_eq!(copied.summary().kind, ScenarioKind::WhatIf);

        let err = registry.copy(live, &request).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn concurrent_creates_and_promotions_keep_caps_and_one_production() {
        for _ in 0..50 {
            let (registry, store) = registry(Role::Server);
            registry.reconfigure(RegistryConfig { max_loaded_scenarios: 3, ..RegistryConfig::default() });
            let a = registry.create(&new_scenario("a", true)).unwrap();
            let b = registry.create(&new_scenario("b", false)).unwrap();
            let barrier = std::sync::Barrier::new(4);

            std::thread::scope(|scope| {
                for target in [a, b] {
                    let (registry, barrier) = (&registry, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        registry.promote(target).unwrap();
                    });
                }
                for name in ["c", "d"] {
                    let (registry, barrier) = (&registry, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        let _ = registry.create(&new_scenario(name, false));
                    });
                }
            });

            assert_eq!(registry.len(), 3);
            let production = registry.ids().into_iter().filter(|id| registry.get(*id).unwrap().is_production());
            assert_eq!(production.count(), 1);
            let kept: BTreeSet<ScenarioId> = store.list().unwrap().into_iter().map(|(s, _)| s).collect();
            assert_eq!(kept, registry.ids().into_iter().collect(), "refused scenarios leave no checkpoint");
        }
    }

    #[test]
    fn internal_simulation_copy_is_detached() {
        let (registry, store) = registry(Role::Server);
        let live = registry.create(&new_scenario("live", true)).unwrap();
        let files = store.len();

        let request = CopyScenario { internal_simulation: true, ..CopyScenario::default() };
        let CopyOutcome::Detached(scratch) = registry.copy(live, &request).unwrap() else {
            panic!("expected a detached copy");
        };
        assert!(scratch.id().is_null());
        assert_eq!(registry.len(), 1);
        assert_eq!(store.len(), files);
    }

    #[test]
    fn delete_guards() {
        let (registry, store) = registry(Role::Server);
        let live = registry.create(&new_scenario("live", true)).unwrap();
        assert!(registry.delete(live, 0).unwrap_err().is_validation());

        let other = registry.create(&new_scenario("other", false)).unwrap();
        assert!(registry.delete(live, 0).unwrap_err().is_validation());
        assert!(registry.delete(other, 1).unwrap_err().is_validation());

        registry.delete(other, 0).unwrap();
        assert!(registry.get(other).is_none());
        assert!(store.list_scenario(other).unwrap().is_empty());
    }

    #[test]
    fn live_target_requires_production() {
        let (registry, _) = registry(Role::Server);
        registry.create(&new_scenario("draft", false)).unwrap();
        let err = registry.receive(&add(1, 1), |_| 0).unwrap_err();
        assert!(matches!(err, RegistryError::NoProduction));
    }

    #[test]
    fn broadcast_delivers_independent_copies() {
        let (registry, _) = registry(Role::Server);
        registry.create(&new_scenario("a", true)).unwrap();
        registry.create(&new_scenario("b", false)).unwrap();

        let mut t = add(1, 3);
        t.header.target = Target::Broadcast;
        let deliveries = registry.receive(&t, |_| 0).unwrap();
        assert_eq!(deliveries.len(), 2);
        for id in registry.ids() {
            assert_eq!(registry.get(id).unwrap().detail().value, 3);
        }
    }

    #[test]
    fn lifecycle_transmissions_run_on_registry() {
        let (registry, _) = registry(Role::Server);
        let live = registry.create(&new_scenario("live", true)).unwrap();

        let copy = CopyScenario { name: "copy".into(), ..CopyScenario::default() };
        let deliveries = registry.receive(&lifecycle(5, live, TransmissionBody::CopyScenario(copy)), |_| 0).unwrap();
        let [RegistryEvent::Copied { copy, .. }] = deliveries[0].lifecycle.as_slice() else {
            panic!("expected a copy event, got {deliveries:?}");
        };

        let promoted = registry.receive(&lifecycle(6, *copy, TransmissionBody::PromoteToProduction), |_| 0).unwrap();
        assert_eq!(promoted[0].lifecycle, vec![RegistryEvent::Promoted(*copy)]);
        assert_eq!(registry.production(), Some(*copy));

        let refused = registry.receive(&lifecycle(7, live, TransmissionBody::DeleteScenario), |_| 2).unwrap();
        assert!(refused[0].result.as_ref().unwrap_err().is_validation());
    }

    #[test]
    fn client_delete_only_drops_local_copy() {
        let (registry, _) = registry(Role::Client);
        let live = registry.create(&new_scenario("live", true)).unwrap();

        let deliveries = registry.receive(&lifecycle(8, live, TransmissionBody::DeleteScenario), |_| 1).unwrap();
        assert_eq!(deliveries[0].lifecycle, vec![RegistryEvent::Deleted(live)]);
        assert!(registry.is_empty());
        assert!(registry.unloaded().is_empty());
    }

    #[test]
    fn unload_then_load_restores_scenario() {
        let (registry, _) = registry(Role::Client);
        let id = registry.create(&new_scenario("live", true)).unwrap();
        registry.get(id).unwrap().process(&add(1, 9), registry.env()).unwrap();
        let bytes = registry.snapshot(id).unwrap();

        registry.unload(id).unwrap();
        assert_eq!(registry.unloaded(), vec![id]);
        assert!(registry.get(id).is_none());

        assert_eq!(registry.load(&bytes).unwrap(), id);
        assert!(registry.unloaded().is_empty());
        assert_eq!(registry.get(id).unwrap().detail().value, 9);
    }

    #[test]
    fn replace_replays_only_newer_queued_transmissions() {
        let (registry, _) = registry(Role::Client);
        let id = registry.create(&new_scenario("live", true)).unwrap();
        let mut first = add(1, 5);
        first.header.number = 1;
        registry.get(id).unwrap().process(&first, registry.env()).unwrap();
        let bytes = registry.snapshot(id).unwrap();

        let mut second = add(2, 7);
        second.header.number = 2;
        let outcomes = registry.replace(&bytes, vec![first, second]).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(registry.get(id).unwrap().detail().value, 12);
    }

    #[test]
    fn purge_removes_checkpoints_of_unknown_scenarios() {
        let (registry, store) = registry(Role::Server);
        registry.create(&new_scenario("live", true)).unwrap();
        store.write(ScenarioId(99), plansync_proto::UndoNumber(1), b"stale").unwrap();

        assert_eq!(registry.purge_abandoned_checkpoints().unwrap(), 1);
        assert!(store.list_scenario(ScenarioId(99)).unwrap().is_empty());
    }
}
