//! Simulated deployment: one server driver, several clients, message queues.
//!
//! Messages are delivered in FIFO order per direction, so the world replays
//! exactly for a given seed. Tests drive it step by step: submit, deliver,
//! tick, then inspect the replicas.

use std::{collections::VecDeque, time::Duration};

use plansync_client::{Client, ClientAction, ClientConfig, ClientEvent};
use plansync_core::{
    ClientMessage, Environment, Gates, MemoryCheckpointStore, Role, ScenarioRegistry,
    ServerMessage,
};
use plansync_proto::{ScenarioId, Target, Transmission, TransmissionBody, TransmissionId, UserId};
use plansync_server::{DriverConfig, LogLevel, ServerAction, ServerDriver, ServerEvent};

use crate::{plan::PlanDetail, sim_env::SimEnv};

/// Server driver hosting the reference model.
pub type SimServerDriver = ServerDriver<PlanDetail, MemoryCheckpointStore, SimEnv>;

/// Client replicating the reference model.
pub type SimClient = Client<PlanDetail, MemoryCheckpointStore, SimEnv>;

/// Upper bound on messages moved by one [`SimWorld::deliver_all`].
const MAX_DELIVERIES: usize = 100_000;

/// Error type for the simulated world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldError(pub String);

impl std::fmt::Display for WorldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorldError: {}", self.0)
    }
}

impl std::error::Error for WorldError {}

fn world_error(context: &str, err: impl std::fmt::Display) -> WorldError {
    WorldError(format!("{context}: {err}"))
}

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// RNG seed shared by every participant.
    pub seed: u64,
    /// Number of clients, each with its own session and user.
    pub clients: usize,
    /// Server tuning.
    pub driver: DriverConfig,
    /// Client tuning.
    pub client: ClientConfig,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self { seed: 0, clients: 2, driver: DriverConfig::default(), client: ClientConfig::default() }
    }
}

/// One server and its clients.
pub struct SimWorld {
    env: SimEnv,
    server: SimServerDriver,
    production: ScenarioId,
    clients: Vec<SimClient>,
    /// `(session, message)` on the way to the server.
    to_server: VecDeque<(u64, ClientMessage)>,
    /// Messages on the way to each client.
    inboxes: Vec<VecDeque<ServerMessage>>,
    /// Non-send actions each client produced, in order.
    observed: Vec<Vec<ClientAction>>,
    /// Server log lines at warn level or above.
    server_warnings: Vec<String>,
}

impl SimWorld {
    /// Start a server with a production scenario and connect every client.
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        let env = SimEnv::with_seed(config.seed);
        let registry = ScenarioRegistry::new(
            Role::Server,
            MemoryCheckpointStore::new(),
            env.clone(),
            Gates::default(),
            config.driver.registry.clone(),
        );
        let mut server = ServerDriver::new(registry, config.driver);
        let production = server.bootstrap("Live").map_err(|e| world_error("bootstrap", e))?;

        let clients = (0..config.clients)
            .map(|i| {
                Client::new(
                    UserId(i as u64 + 1),
                    MemoryCheckpointStore::new(),
                    env.clone(),
                    config.client.clone(),
                )
            })
            .collect();

        let mut world = Self {
            env,
            server,
            production,
            clients,
            to_server: VecDeque::new(),
            inboxes: vec![VecDeque::new(); config.clients],
            observed: vec![Vec::new(); config.clients],
            server_warnings: Vec::new(),
        };
        for index in 0..config.clients {
            world.server_event(ServerEvent::SessionOpened {
                session_id: session_of(index),
                user: UserId(index as u64 + 1),
            })?;
        }
        world.deliver_all()?;
        Ok(world)
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// The server driver.
    pub fn server(&self) -> &SimServerDriver {
        &self.server
    }

    /// Production scenario created at bootstrap.
    pub fn production(&self) -> ScenarioId {
        self.production
    }

    /// Client by index.
    pub fn client(&self, index: usize) -> &SimClient {
        &self.clients[index]
    }

    /// Number of clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Non-send actions a client produced so far.
    pub fn observed(&self, index: usize) -> &[ClientAction] {
        &self.observed[index]
    }

    /// Drain a client's observed actions.
    pub fn take_observed(&mut self, index: usize) -> Vec<ClientAction> {
        std::mem::take(&mut self.observed[index])
    }

    /// Server warnings and errors logged so far.
    pub fn server_warnings(&self) -> &[String] {
        &self.server_warnings
    }

    /// Feed an event to a client and queue what it sends.
    pub fn client_event(
        &mut self,
        index: usize,
        event: ClientEvent<<SimEnv as Environment>::Instant>,
    ) -> Result<(), WorldError> {
        let actions = self.clients[index]
            .handle(event)
            .map_err(|e| world_error(&format!("client {index}"), e))?;
        self.route(index, actions);
        Ok(())
    }

    fn route(&mut self, index: usize, actions: Vec<ClientAction>) {
        for action in actions {
            match action {
                ClientAction::Send(message) => self.to_server.push_back((session_of(index), message)),
                other => self.observed[index].push(other),
            }
        }
    }

    /// Feed an event to the server and queue what it sends.
    pub fn server_event(&mut self, event: ServerEvent) -> Result<(), WorldError> {
        let actions = self.server.process_event(event).map_err(|e| world_error("server", e))?;
        for action in actions {
            match action {
                ServerAction::SendToSession { session_id, message } => {
                    if let Some(inbox) = index_of(session_id).and_then(|i| self.inboxes.get_mut(i)) {
                        inbox.push_back(message);
                    }
                },
                ServerAction::CloseSession { session_id, reason } => {
                    tracing::debug!(session_id, reason, "simulated session closed");
                },
                ServerAction::Log { level, message, .. } => {
                    if matches!(level, LogLevel::Warn | LogLevel::Error) {
                        self.server_warnings.push(message);
                    }
                },
            }
        }
        Ok(())
    }

    /// Make `scenario` resident on a client.
    pub fn open(&mut self, index: usize, scenario: ScenarioId) -> Result<(), WorldError> {
        self.client_event(index, ClientEvent::Load { scenario })?;
        self.deliver_all()
    }

    /// Submit a transmission from a client and deliver everything it causes.
    pub fn submit(
        &mut self,
        index: usize,
        target: Target,
        body: TransmissionBody,
    ) -> Result<TransmissionId, WorldError> {
        let id = self.submit_only(index, target, body)?;
        self.deliver_all()?;
        Ok(id)
    }

    /// Submit without delivering, to interleave several clients.
    pub fn submit_only(
        &mut self,
        index: usize,
        target: Target,
        body: TransmissionBody,
    ) -> Result<TransmissionId, WorldError> {
        let actions = self.clients[index]
            .handle(ClientEvent::Submit { target, body })
            .map_err(|e| world_error(&format!("client {index}"), e))?;
        let id = actions
            .iter()
            .find_map(|action| match action {
                ClientAction::Send(ClientMessage::Submit(t)) => Some(t.id()),
                _ => None,
            })
            .ok_or_else(|| WorldError(format!("client {index} sent nothing")))?;
        self.route(index, actions);
        Ok(id)
    }

    /// Move messages until every queue is empty.
    pub fn deliver_all(&mut self) -> Result<(), WorldError> {
        let mut moved = 0usize;
        loop {
            let mut progressed = false;

            while let Some((session_id, message)) = self.to_server.pop_front() {
                self.server_event(ServerEvent::MessageReceived { session_id, message })?;
                moved += 1;
                progressed = true;
            }

            for index in 0..self.clients.len() {
                while let Some(message) = self.inboxes[index].pop_front() {
                    self.client_event(index, ClientEvent::MessageReceived(message))?;
                    moved += 1;
                    progressed = true;
                }
            }

            if !progressed {
                return Ok(());
            }
            if moved > MAX_DELIVERIES {
                return Err(WorldError(format!("no quiescence after {moved} deliveries")));
            }
        }
    }

    /// Advance the clock, tick everyone and deliver.
    pub fn tick(&mut self, by: Duration) -> Result<(), WorldError> {
        self.env.advance(by);
        self.server_event(ServerEvent::Tick)?;
        let now = self.env.now();
        for index in 0..self.clients.len() {
            self.client_event(index, ClientEvent::Tick { now })?;
        }
        self.deliver_all()
    }

    /// Tick until no client has a verification poll scheduled.
    pub fn settle_checksums(&mut self, max_rounds: usize) -> Result<(), WorldError> {
        for _ in 0..max_rounds {
            if self.clients.iter().all(|c| c.poll_deadline().is_none()) {
                return Ok(());
            }
            let interval = self.server.registry().config().scenario.checksum.retry_interval;
            self.tick(interval)?;
        }
        Err(WorldError(format!("checksums still pending after {max_rounds} rounds")))
    }

    /// Close a client's session.
    pub fn disconnect(&mut self, index: usize) -> Result<(), WorldError> {
        self.server_event(ServerEvent::SessionClosed {
            session_id: session_of(index),
            reason: "disconnected".to_string(),
        })
    }

    /// Apply a transmission to one client's replica only, bypassing the
    /// server. The replica diverges silently.
    pub fn diverge(&mut self, index: usize, scenario: ScenarioId, body: TransmissionBody) -> Result<(), WorldError> {
        let state = self.clients[index]
            .registry()
            .get(scenario)
            .ok_or_else(|| WorldError(format!("client {index} does not hold {scenario}")))?;
        let header = plansync_proto::TransmissionHeader::new(
            TransmissionId(self.env.random_u128()),
            UserId::SYSTEM,
            Target::Scenario(scenario),
        );
        state
            .process(&Transmission::new(header, body), &self.env)
            .map_err(|e| world_error("diverge", e))?;
        Ok(())
    }

    /// Server copy of a scenario's detail.
    pub fn server_detail(&self, scenario: ScenarioId) -> Option<PlanDetail> {
        self.server.registry().get(scenario).map(|state| state.detail())
    }

    /// Client copy of a scenario's detail.
    pub fn client_detail(&self, index: usize, scenario: ScenarioId) -> Option<PlanDetail> {
        self.clients[index].detail(scenario)
    }

    /// Every client holding `scenario` resident has the server's detail.
    pub fn check_converged(&self, scenario: ScenarioId) -> Result<(), WorldError> {
        let server = self
            .server_detail(scenario)
            .ok_or_else(|| WorldError(format!("server does not hold {scenario}")))?;
        for (index, client) in self.clients.iter().enumerate() {
            if let Some(replica) = client.detail(scenario)
                && replica != server
            {
                return Err(WorldError(format!(
                    "client {index} diverged on {scenario}: {} jobs vs {} on server",
                    replica.jobs().len(),
                    server.jobs().len()
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SimWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimWorld")
            .field("production", &self.production)
            .field("clients", &self.clients.len())
            .field("to_server", &self.to_server.len())
            .finish_non_exhaustive()
    }
}

/// Sessions are numbered from 1.
fn session_of(index: usize) -> u64 {
    index as u64 + 1
}

fn index_of(session_id: u64) -> Option<usize> {
    usize::try_from(session_id.checked_sub(1)?).ok()
}
