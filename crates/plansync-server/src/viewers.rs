//! Viewer registry for session and scenario view tracking.
//!
//! The registry maintains bidirectional mappings: scenario → sessions (for
//! broadcast) and session → scenarios (for cleanup on disconnect). Ordered
//! maps keep broadcast order deterministic under simulation.
//!
//! Sessions must explicitly view a scenario to receive its transmissions.
//! Unregistering a session removes all its views.

use std::collections::{BTreeMap, BTreeSet};

use plansync_proto::{ScenarioId, UserId};

/// Information about a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// User the session belongs to
    pub user: UserId,
}

/// Registry for tracking sessions and the scenarios they view.
#[derive(Debug, Default)]
pub struct ViewerRegistry {
    /// Session ID → session info
    sessions: BTreeMap<u64, SessionInfo>,
    /// Scenario → viewing sessions
    scenario_viewers: BTreeMap<ScenarioId, BTreeSet<u64>>,
    /// Session → viewed scenarios
    session_scenarios: BTreeMap<u64, BTreeSet<ScenarioId>>,
}

impl ViewerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session.
    ///
    /// Returns `false` if the session already exists.
    pub fn register_session(&mut self, session_id: u64, info: SessionInfo) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }
        self.sessions.insert(session_id, info);
        self.session_scenarios.insert(session_id, BTreeSet::new());
        true
    }

    /// Unregister a session and remove all its views.
    ///
    /// Returns the session info if it existed, along with the scenarios it
    /// was viewing.
    pub fn unregister_session(
        &mut self,
        session_id: u64,
    ) -> Option<(SessionInfo, BTreeSet<ScenarioId>)> {
        let info = self.sessions.remove(&session_id)?;
        let scenarios = self.session_scenarios.remove(&session_id).unwrap_or_default();

        for scenario in &scenarios {
            if let Some(viewers) = self.scenario_viewers.get_mut(scenario) {
                viewers.remove(&session_id);
                if viewers.is_empty() {
                    self.scenario_viewers.remove(scenario);
                }
            }
        }

        Some((info, scenarios))
    }

    /// Session metadata. `None` if the session doesn't exist.
    pub fn session(&self, session_id: u64) -> Option<&SessionInfo> {
        self.sessions.get(&session_id)
    }

    /// Check if a session is registered.
    pub fn has_session(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Start viewing a scenario.
    ///
    /// Returns `false` if the session is not registered.
    pub fn view(&mut self, session_id: u64, scenario: ScenarioId) -> bool {
        let Some(scenarios) = self.session_scenarios.get_mut(&session_id) else {
            return false;
        };
        scenarios.insert(scenario);
        self.scenario_viewers.entry(scenario).or_default().insert(session_id);
        true
    }

    /// Stop viewing a scenario.
    ///
    /// Returns `true` if the session was viewing it.
    pub fn unview(&mut self, session_id: u64, scenario: ScenarioId) -> bool {
        let removed_from_scenario =
            self.scenario_viewers.get_mut(&scenario).is_some_and(|s| s.remove(&session_id));

        let removed_from_session =
            self.session_scenarios.get_mut(&session_id).is_some_and(|s| s.remove(&scenario));

        if self.scenario_viewers.get(&scenario).is_some_and(BTreeSet::is_empty) {
            self.scenario_viewers.remove(&scenario);
        }

        removed_from_scenario && removed_from_session
    }

    /// Drop every view of a scenario (it was deleted or unloaded).
    ///
    /// Returns the sessions that were viewing it.
    pub fn forget_scenario(&mut self, scenario: ScenarioId) -> BTreeSet<u64> {
        let viewers = self.scenario_viewers.remove(&scenario).unwrap_or_default();
        for session_id in &viewers {
            if let Some(scenarios) = self.session_scenarios.get_mut(session_id) {
                scenarios.remove(&scenario);
            }
        }
        viewers
    }

    /// Check if a session views a scenario.
    pub fn is_viewing(&self, session_id: u64, scenario: ScenarioId) -> bool {
        self.scenario_viewers.get(&scenario).is_some_and(|s| s.contains(&session_id))
    }

    /// All sessions viewing a scenario.
    pub fn viewers_of(&self, scenario: ScenarioId) -> impl Iterator<Item = u64> + '_ {
        self.scenario_viewers.get(&scenario).into_iter().flat_map(|s| s.iter().copied())
    }

    /// All scenarios a session views.
    pub fn scenarios_for_session(&self, session_id: u64) -> impl Iterator<Item = ScenarioId> + '_ {
        self.session_scenarios.get(&session_id).into_iter().flat_map(|s| s.iter().copied())
    }

    /// Every registered session, ascending.
    pub fn session_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.sessions.keys().copied()
    }

    /// Total number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions viewing a scenario.
    pub fn viewer_count(&self, scenario: ScenarioId) -> usize {
        self.scenario_viewers.get(&scenario).map_or(0, BTreeSet::len)
    }
}
