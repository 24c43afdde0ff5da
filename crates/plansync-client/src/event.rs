//! Client events and actions.

use std::collections::BTreeMap;

use plansync_core::{ClientMessage, RegistryEvent, ScenarioEvent, ServerMessage};
use plansync_proto::{ScenarioId, Target, TransmissionBody, TransmissionId};

/// Events the caller feeds into the client.
///
/// The caller is responsible for:
/// - Receiving messages from the server
/// - Driving time forward via ticks
/// - Forwarding user intents (edits, undo, loading scenarios)
///
/// Generic over `I` (Instant type) to support both production and
/// simulation environments.
#[derive(Debug, Clone)]
pub enum ClientEvent<I = std::time::Instant> {
    /// Message received from the server.
    MessageReceived(ServerMessage),

    /// Time tick for the checksum verification timer.
    Tick {
        /// Current time from the environment.
        now: I,
    },

    /// User wants to submit a transmission.
    ///
    /// The client assigns the id and instigator; the server sequences it.
    Submit {
        /// Delivery target.
        target: Target,
        /// What to do.
        body: TransmissionBody,
    },

    /// User opened a scenario: fetch it and receive its transmissions.
    Load {
        /// Scenario to make resident.
        scenario: ScenarioId,
    },

    /// User closed a scenario: drop it from memory.
    Unload {
        /// Scenario to drop.
        scenario: ScenarioId,
    },
}

/// Actions produced by the client for the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Send a message to the server.
    Send(ClientMessage),

    /// Scenario notification, in processing order.
    Event(ScenarioEvent),

    /// A lifecycle change carried out on this client.
    Lifecycle(RegistryEvent),

    /// A scenario image was installed (first load, new scenario, reload).
    ScenarioLoaded {
        /// Scenario now resident.
        scenario: ScenarioId,
    },

    /// A scenario left this client.
    ScenarioDropped {
        /// Scenario dropped.
        scenario: ScenarioId,
        /// Why.
        reason: String,
    },

    /// The server refused one of our transmissions.
    Rejected {
        /// Refused transmission.
        transmission_id: TransmissionId,
        /// Readable reason.
        reason: String,
    },

    /// Answer to a capable-to-promise query.
    CtpResult {
        /// Scenario queried.
        scenario: ScenarioId,
        /// Query transmission.
        transmission_id: TransmissionId,
        /// KPIs of the what-if state.
        kpis: BTreeMap<String, i64>,
    },

    /// Log message for debugging.
    Log {
        /// Log message.
        message: String,
    },
}
