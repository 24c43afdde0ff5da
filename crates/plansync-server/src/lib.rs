//! Plansync production server.
//!
//! Hosts the authoritative copy of every scenario. Sessions submit
//! transmissions; the server sequences them, applies them and forwards the
//! results to every session viewing the affected scenario.
//!
//! # Architecture
//!
//! [`ServerDriver`] is Sans-IO: [`ServerEvent`]s in, [`ServerAction`]s out.
//! [`Server`] executes those actions on a Tokio runtime and posts periodic
//! ticks. Transport is left to the embedding application; the bundled binary
//! speaks line-delimited JSON on stdin/stdout through [`run_stdio`].
//!
//! # Components
//!
//! - [`ServerDriver`]: Action-based orchestrator (pure logic, no I/O)
//! - [`Sequencer`]: Total order over accepted transmissions
//! - [`ViewerRegistry`]: Which sessions view which scenarios
//! - [`Server`]: Production runtime that executes driver actions
//! - [`SystemEnv`]: Production environment (real time, OS RNG)
//! - [`JournalDetail`]: Detail hosted by the binary

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
pub mod journal;
pub mod sequencer;
mod system_env;
mod viewers;

use std::{path::PathBuf, time::Duration};

pub use driver::{LogLevel, ServerAction, ServerConfig as DriverConfig, ServerDriver, ServerEvent};
pub use error::ServerError;
pub use journal::JournalDetail;
use plansync_core::{FileCheckpointStore, Gates, Role, ScenarioRegistry, ServerMessage};
pub use sequencer::{Sequencer, SequencerError};
use serde::{Deserialize, Serialize};
pub use system_env::SystemEnv;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
    time::MissedTickBehavior,
};
pub use viewers::{SessionInfo, ViewerRegistry};

/// Driver type hosted by the binary.
pub type HostDriver = ServerDriver<JournalDetail, FileCheckpointStore, SystemEnv>;

/// Capacity of the event and outbound channels.
const CHANNEL_CAPACITY: usize = 1024;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Directory holding undo checkpoints
    pub checkpoint_dir: PathBuf,
    /// Name of the production scenario created on first start
    pub production_name: String,
    /// Interval between `Tick` events
    pub tick_interval: Duration,
    /// Driver configuration (limits, undo and checksum tuning)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("./checkpoints"),
            production_name: "Live".to_string(),
            tick_interval: Duration::from_secs(1),
            driver: DriverConfig::default(),
        }
    }
}

/// Output of the runtime, one per line on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outbound {
    /// Deliver a message to a session.
    Message {
        /// Target session
        session_id: u64,
        /// Message
        message: ServerMessage,
    },
    /// Close a session.
    Close {
        /// Target session
        session_id: u64,
        /// Reason for closure
        reason: String,
    },
}

/// Production plansync server.
///
/// Wraps [`ServerDriver`] with on-disk checkpoints and the system
/// environment.
pub struct Server {
    /// The action-based server driver
    driver: HostDriver,
    /// Tick period
    tick_interval: Duration,
}

impl Server {
    /// Open the checkpoint directory and run startup recovery.
    pub fn open(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        if config.tick_interval.is_zero() {
            return Err(ServerError::Config("tick interval must be positive".to_string()));
        }

        let store = FileCheckpointStore::open(&config.checkpoint_dir)?;
        let registry = ScenarioRegistry::new(
            Role::Server,
            store,
            SystemEnv::new(),
            Gates::default(),
            config.driver.registry.clone(),
        );
        let mut driver = ServerDriver::new(registry, config.driver);
        let production = driver.bootstrap(&config.production_name)?;

        tracing::info!(
            checkpoint_dir = %config.checkpoint_dir.display(),
            production = %production,
            "server ready"
        );
        Ok(Self { driver, tick_interval: config.tick_interval })
    }

    /// The driver, for inspection.
    pub fn driver(&self) -> &HostDriver {
        &self.driver
    }

    /// Run until the event channel closes, then dispose every scenario.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ServerEvent>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<(), ServerError> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => event,
                    None => break,
                },
                _ = ticker.tick() => ServerEvent::Tick,
            };

            let actions = match self.driver.process_event(event) {
                Ok(actions) => actions,
                Err(e) => {
                    tracing::warn!("Event processing error: {}", e);
                    continue;
                },
            };

            if let Err(e) = execute_actions(actions, &outbound).await {
                tracing::warn!("Outbound channel closed: {}", e);
                break;
            }
        }

        self.driver.shutdown();
        Ok(())
    }
}

/// Execute server actions.
async fn execute_actions(
    actions: Vec<ServerAction>,
    outbound: &mpsc::Sender<Outbound>,
) -> Result<(), ServerError> {
    for action in actions {
        match action {
            ServerAction::SendToSession { session_id, message } => {
                outbound
                    .send(Outbound::Message { session_id, message })
                    .await
                    .map_err(|e| ServerError::Transport(e.to_string()))?;
            },

            ServerAction::CloseSession { session_id, reason } => {
                tracing::info!("Closing session {}: {}", session_id, reason);
                outbound
                    .send(Outbound::Close { session_id, reason })
                    .await
                    .map_err(|e| ServerError::Transport(e.to_string()))?;
            },

            ServerAction::Log { level, message, .. } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }

    Ok(())
}

/// Serve line-delimited JSON: [`ServerEvent`]s on stdin, [`Outbound`] on
/// stdout. Returns when stdin closes.
pub async fn run_stdio(server: Server) -> Result<(), ServerError> {
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {},
                Ok(Some(line)) => match serde_json::from_str::<ServerEvent>(&line) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    },
                    Err(e) => tracing::warn!("Ignoring malformed event line: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("stdin read error: {}", e);
                    break;
                },
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(out) = out_rx.recv().await {
            let mut line =
                serde_json::to_vec(&out).map_err(|e| ServerError::Protocol(e.to_string()))?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        Ok::<(), ServerError>(())
    });

    server.run(event_rx, out_tx).await?;
    reader.abort();
    writer.await.map_err(|e| ServerError::Internal(e.to_string()))?
}
