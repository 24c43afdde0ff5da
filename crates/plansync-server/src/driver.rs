//! Server driver.
//!
//! Ties together the sequencer (total order), the scenario registry
//! (processing and lifecycle) and the viewer registry (who receives what).
//! Events in, actions out; the runtime owns every socket and timer.

use std::time::Duration;

use plansync_core::{
    CheckpointStore, ClientMessage, Environment, ProcessStatus, RegistryConfig, RegistryEvent,
    ScenarioAction, ScenarioDetail, ScenarioEvent, ScenarioRegistry, ServerMessage,
};
use plansync_proto::{
    NewScenario, ScenarioId, ScenarioKind, Target, Transmission, TransmissionBody, UserId,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::ServerError,
    sequencer::Sequencer,
    viewers::{SessionInfo, ViewerRegistry},
};

/// How long diagnostics wait for a busy scenario before skipping it.
const DIAGNOSTICS_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Scenario registry tuning (caps, undo, checksums)
    pub registry: RegistryConfig,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// Interval between scenario diagnostics lines; zero disables them
    pub diagnostics_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            max_sessions: 1_000,
            diagnostics_interval: Duration::from_secs(60),
        }
    }
}

/// Events that the server driver processes.
///
/// These are produced by the external runtime (simulation or production).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// A client session was opened
    SessionOpened {
        /// Unique session ID assigned by the runtime
        session_id: u64,
        /// Authenticated user behind the session
        user: UserId,
    },

    /// A message arrived from a session
    MessageReceived {
        /// Session that sent it
        session_id: u64,
        /// The message
        message: ClientMessage,
    },

    /// A session was closed (by peer or error)
    SessionClosed {
        /// Session that was closed
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for diagnostics
    Tick,
}

/// Actions that the server driver produces.
///
/// These are executed by runtime-specific code (production or simulation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Send a message to a specific session
    SendToSession {
        /// Target session ID
        session_id: u64,
        /// Message to send
        message: ServerMessage,
    },

    /// Close a session
    CloseSession {
        /// Session to close
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Log a message (for debugging/monitoring)
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
        /// Wall-clock milliseconds when the event occurred
        timestamp: u64,
    },
}

/// Log levels for server actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Action-based server driver.
///
/// Orchestrates session management, sequencing, scenario processing and
/// routing of results to viewers.
pub struct ServerDriver<D, S, E>
where
    D: ScenarioDetail,
    S: CheckpointStore,
    E: Environment,
{
    /// Every loaded scenario
    registry: ScenarioRegistry<D, S, E>,
    /// Session/scenario views
    viewers: ViewerRegistry,
    /// Total order over accepted transmissions
    sequencer: Sequencer,
    /// Server configuration
    config: ServerConfig,
    /// When diagnostics last ran
    last_diagnostics: Option<E::Instant>,
}

impl<D, S, E> ServerDriver<D, S, E>
where
    D: ScenarioDetail,
    S: CheckpointStore,
    E: Environment,
{
    /// Create a new server driver around a server-role registry.
    pub fn new(registry: ScenarioRegistry<D, S, E>, config: ServerConfig) -> Self {
        registry.reconfigure(config.registry.clone());
        Self {
            registry,
            viewers: ViewerRegistry::new(),
            sequencer: Sequencer::new(),
            config,
            last_diagnostics: None,
        }
    }

    /// Startup recovery: drop checkpoints left by a crash, rebuild detail
    /// references and make sure a production scenario exists.
    ///
    /// Returns the production scenario.
    pub fn bootstrap(&mut self, production_name: &str) -> Result<ScenarioId, ServerError> {
        self.registry.purge_abandoned_checkpoints()?;
        self.registry.restore_all_references();

        if let Some(id) = self.registry.production() {
            return Ok(id);
        }
        let id = self.registry.create(&NewScenario {
            name: production_name.to_string(),
            kind: ScenarioKind::Live,
            production: true,
            compare: false,
        })?;
        tracing::info!(scenario_id = %id, "production scenario created");
        Ok(id)
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the server driver.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, ServerError> {
        match event {
            ServerEvent::SessionOpened { session_id, user } => {
                self.handle_session_opened(session_id, user)
            },
            ServerEvent::MessageReceived { session_id, message } => {
                self.handle_message(session_id, message)
            },
            ServerEvent::SessionClosed { session_id, reason } => {
                Ok(self.handle_session_closed(session_id, &reason))
            },
            ServerEvent::Tick => Ok(self.handle_tick()),
        }
    }

    fn handle_session_opened(
        &mut self,
        session_id: u64,
        user: UserId,
    ) -> Result<Vec<ServerAction>, ServerError> {
        if self.viewers.session_count() >= self.config.max_sessions {
            return Ok(vec![
                self.log(LogLevel::Warn, format!("session {session_id} refused: server full")),
                ServerAction::CloseSession { session_id, reason: "server full".to_string() },
            ]);
        }

        if !self.viewers.register_session(session_id, SessionInfo { user }) {
            return Err(ServerError::SessionAlreadyExists(session_id));
        }

        Ok(vec![
            self.log(LogLevel::Debug, format!("session {session_id} opened for {user}")),
            ServerAction::SendToSession {
                session_id,
                message: ServerMessage::Welcome {
                    scenarios: self.registry.ids(),
                    production: self.registry.production(),
                },
            },
        ])
    }

    fn handle_session_closed(&mut self, session_id: u64, reason: &str) -> Vec<ServerAction> {
        match self.viewers.unregister_session(session_id) {
            Some((info, scenarios)) => vec![self.log(
                LogLevel::Debug,
                format!(
                    "session {session_id} ({}) closed: {reason}; was viewing {} scenario(s)",
                    info.user,
                    scenarios.len()
                ),
            )],
            None => vec![],
        }
    }

    fn handle_message(
        &mut self,
        session_id: u64,
        message: ClientMessage,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let info = *self.viewers.session(session_id).ok_or(ServerError::SessionNotFound(session_id))?;

        let actions = match message {
            ClientMessage::Submit(transmission) => {
                self.handle_submit(session_id, info.user, transmission)
            },
            ClientMessage::View(scenario) => match self.registry.snapshot(scenario) {
                Ok(bytes) => {
                    self.viewers.view(session_id, scenario);
                    vec![ServerAction::SendToSession {
                        session_id,
                        message: ServerMessage::Snapshot { scenario, bytes },
                    }]
                },
                Err(err) => self.unavailable(session_id, scenario, &err.to_string()),
            },
            ClientMessage::Unview(scenario) => {
                self.viewers.unview(session_id, scenario);
                vec![]
            },
            ClientMessage::FetchScenario(scenario) => match self.registry.snapshot(scenario) {
                Ok(bytes) => vec![ServerAction::SendToSession {
                    session_id,
                    message: ServerMessage::Snapshot { scenario, bytes },
                }],
                Err(err) => self.unavailable(session_id, scenario, &err.to_string()),
            },
            ClientMessage::ChecksumRequest { scenario, transmission_id } => {
                let values =
                    self.registry.get(scenario).and_then(|state| state.checksum(transmission_id));
                vec![ServerAction::SendToSession {
                    session_id,
                    message: ServerMessage::Checksum { scenario, transmission_id, values },
                }]
            },
        };
        Ok(actions)
    }

    fn unavailable(&self, session_id: u64, scenario: ScenarioId, reason: &str) -> Vec<ServerAction> {
        vec![
            self.log(LogLevel::Debug, format!("scenario {scenario} unavailable: {reason}")),
            ServerAction::SendToSession {
                session_id,
                message: ServerMessage::ScenarioUnavailable(scenario),
            },
        ]
    }

    fn reject(&self, session_id: u64, transmission: &Transmission, reason: String) -> ServerAction {
        ServerAction::SendToSession {
            session_id,
            message: ServerMessage::Rejected { transmission_id: transmission.id(), reason },
        }
    }

    /// Sequence, process and fan out one submitted transmission.
    ///
    /// Forwarded copies are retargeted at the scenario that applied them, so
    /// clients never resolve live or broadcast targets themselves.
    fn handle_submit(
        &mut self,
        session_id: u64,
        user: UserId,
        mut transmission: Transmission,
    ) -> Vec<ServerAction> {
        let now_ms = self.registry.env().wall_clock_ms();
        if let Err(err) = self.sequencer.stamp(&mut transmission, user, now_ms) {
            return vec![
                self.log(LogLevel::Warn, format!("transmission {} refused: {err}", transmission.id())),
                self.reject(session_id, &transmission, err.to_string()),
            ];
        }

        // The sender's own view does not block a delete.
        let viewers = &self.viewers;
        let others = |id: ScenarioId| viewers.viewers_of(id).filter(|viewer| *viewer != session_id).count();
        let deliveries = match self.registry.receive(&transmission, others) {
            Ok(deliveries) => deliveries,
            Err(err) => {
                return vec![
                    self.log(LogLevel::Debug, format!("transmission {} not routed: {err}", transmission.id())),
                    self.reject(session_id, &transmission, err.to_string()),
                ];
            },
        };

        let mut actions = Vec::new();
        let mut lifecycle = Vec::new();
        for delivery in deliveries {
            let outcome = match delivery.result {
                Ok(outcome) => outcome,
                Err(err) => {
                    let level = if err.is_validation() { LogLevel::Debug } else { LogLevel::Warn };
                    actions.push(self.log(
                        level,
                        format!(
                            "transmission {} refused by scenario {}: {err}",
                            transmission.id(),
                            delivery.scenario
                        ),
                    ));
                    actions.push(self.reject(session_id, &transmission, err.to_string()));
                    continue;
                },
            };

            for action in outcome.actions {
                match action {
                    ScenarioAction::BroadcastSnapshot { scenario, bytes } => {
                        for viewer in self.viewers.viewers_of(scenario) {
                            actions.push(ServerAction::SendToSession {
                                session_id: viewer,
                                message: ServerMessage::Snapshot { scenario, bytes: bytes.clone() },
                            });
                        }
                    },
                    ScenarioAction::CtpResult { scenario, transmission_id, kpis } => {
                        actions.push(ServerAction::SendToSession {
                            session_id,
                            message: ServerMessage::CtpResult { scenario, transmission_id, kpis },
                        });
                    },
                    // Carried out by the registry already.
                    ScenarioAction::Lifecycle(_) => {},
                    ScenarioAction::SendToServer(_) | ScenarioAction::RequestReload(_) => {
                        actions.push(self.log(
                            LogLevel::Error,
                            format!("client-side action from server scenario {}", delivery.scenario),
                        ));
                    },
                }
            }

            for event in &outcome.events {
                if let ScenarioEvent::ReadOnlyChanged { scenario, read_only } = event {
                    actions.push(self.log(
                        LogLevel::Info,
                        format!("scenario {scenario} read-only: {read_only}"),
                    ));
                }
            }

            if outcome.status == ProcessStatus::Applied && forwarded(&transmission.body) {
                let mut copy = transmission.clone();
                copy.header.target = Target::Scenario(delivery.scenario);
                for viewer in self.viewers.viewers_of(delivery.scenario) {
                    actions.push(ServerAction::SendToSession {
                        session_id: viewer,
                        message: ServerMessage::Transmission(copy.clone()),
                    });
                }
            }

            lifecycle.extend(delivery.lifecycle);
        }

        for event in lifecycle {
            actions.extend(self.announce(event));
        }
        actions
    }

    /// Tell sessions about a lifecycle change. New scenarios are pushed to
    /// every session, which views them from then on.
    fn announce(&mut self, event: RegistryEvent) -> Vec<ServerAction> {
        match event {
            RegistryEvent::Created(id) | RegistryEvent::Copied { copy: id, .. } => {
                let bytes = match self.registry.snapshot(id) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        return vec![self.log(
                            LogLevel::Error,
                            format!("cannot encode new scenario {id}: {err}"),
                        )];
                    },
                };
                let sessions: Vec<u64> = self.viewers.session_ids().collect();
                let mut actions = vec![self.log(LogLevel::Info, format!("scenario {id} added"))];
                for session_id in sessions {
                    self.viewers.view(session_id, id);
                    actions.push(ServerAction::SendToSession {
                        session_id,
                        message: ServerMessage::ScenarioAdded { scenario: id, bytes: bytes.clone() },
                    });
                }
                if self.registry.production() == Some(id) {
                    actions.extend(self.production_changed(id));
                }
                actions
            },
            RegistryEvent::Deleted(id) => {
                self.viewers.forget_scenario(id);
                let mut actions = vec![self.log(LogLevel::Info, format!("scenario {id} deleted"))];
                actions.extend(self.viewers.session_ids().map(|session_id| {
                    ServerAction::SendToSession {
                        session_id,
                        message: ServerMessage::ScenarioRemoved(id),
                    }
                }));
                actions
            },
            RegistryEvent::Promoted(id) => {
                let mut actions =
                    vec![self.log(LogLevel::Info, format!("scenario {id} promoted to production"))];
                actions.extend(self.production_changed(id));
                actions
            },
            RegistryEvent::Unloaded(id)
            | RegistryEvent::LoadRequested(id)
            | RegistryEvent::ReloadRequested(id) => {
                vec![self.log(LogLevel::Debug, format!("scenario {id}: {event:?} ignored on server"))]
            },
        }
    }

    /// The flag lives in every scenario's summary, so sessions must clear it
    /// on scenarios they hold but did not see promoted.
    fn production_changed(&self, id: ScenarioId) -> Vec<ServerAction> {
        self.viewers
            .session_ids()
            .map(|session_id| ServerAction::SendToSession {
                session_id,
                message: ServerMessage::ProductionChanged(id),
            })
            .collect()
    }

    fn handle_tick(&mut self) -> Vec<ServerAction> {
        if self.config.diagnostics_interval.is_zero() {
            return vec![];
        }
        let now = self.registry.env().now();
        if let Some(last) = self.last_diagnostics
            && now - last < self.config.diagnostics_interval
        {
            return vec![];
        }
        self.last_diagnostics = Some(now);

        let mut actions = Vec::new();
        for id in self.registry.ids() {
            let Some(state) = self.registry.get(id) else {
                continue;
            };
            let line = match state.try_summary(DIAGNOSTICS_LOCK_TIMEOUT) {
                Some(summary) => format!(
                    "scenario {id} '{}': production={} read_only={} undo_bytes={}",
                    summary.name,
                    summary.production,
                    state.is_read_only(),
                    state.undo_bytes()
                ),
                None => format!("scenario {id}: busy"),
            };
            actions.push(self.log(LogLevel::Info, line));
        }
        actions
    }

    fn log(&self, level: LogLevel, message: String) -> ServerAction {
        ServerAction::Log { level, message, timestamp: self.registry.env().wall_clock_ms() }
    }

    /// Sessions viewing a scenario.
    pub fn viewers_of(&self, scenario: ScenarioId) -> impl Iterator<Item = u64> + '_ {
        self.viewers.viewers_of(scenario)
    }

    /// Scenario registry.
    pub fn registry(&self) -> &ScenarioRegistry<D, S, E> {
        &self.registry
    }

    /// Viewer registry.
    pub fn viewers(&self) -> &ViewerRegistry {
        &self.viewers
    }

    /// Next sequence number.
    pub fn next_number(&self) -> u64 {
        self.sequencer.next_number()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.viewers.session_count()
    }

    /// Dispose every scenario. Checkpoint files of non-temporary scenarios
    /// are removed.
    pub fn shutdown(&mut self) {
        self.registry.shutdown();
        tracing::info!("server driver shut down");
    }
}

/// Kinds clients apply themselves. Undo arrives as a fresh image instead;
/// what-if queries are answered to the sender only.
fn forwarded(body: &TransmissionBody) -> bool {
    !matches!(body, TransmissionBody::Undo(_) | TransmissionBody::Ctp(_))
}
