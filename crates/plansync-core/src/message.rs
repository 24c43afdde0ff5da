//! Messages exchanged between clients and the server.
//!
//! Transport is up to the embedding application; these are the values it
//! carries. Scenario images travel as encoded [`crate::ScenarioSnapshot`]
//! bytes so the detail type stays out of the message types.

use std::collections::BTreeMap;

use plansync_proto::{ScenarioId, Transmission, TransmissionId};
use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumValues;

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// A user transmission, to be sequenced and applied.
    Submit(Transmission),
    /// Start viewing a scenario (receive its transmissions).
    View(ScenarioId),
    /// Stop viewing a scenario.
    Unview(ScenarioId),
    /// Request the full image of a scenario.
    FetchScenario(ScenarioId),
    /// Request the server's fingerprint after a transmission.
    ChecksumRequest {
        /// Scenario
        scenario: ScenarioId,
        /// Transmission the fingerprint follows
        transmission_id: TransmissionId,
    },
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Sent once when a session opens.
    Welcome {
        /// Every scenario loaded on the server
        scenarios: Vec<ScenarioId>,
        /// The production scenario, if any
        production: Option<ScenarioId>,
    },
    /// A sequenced transmission to apply. The server resolves live and
    /// broadcast targets, so the target is always one scenario.
    Transmission(Transmission),
    /// Full image of a scenario, replacing the local copy.
    Snapshot {
        /// Scenario
        scenario: ScenarioId,
        /// Encoded image
        bytes: Vec<u8>,
    },
    /// A scenario was created or copied on the server. The receiving
    /// session already views it.
    ScenarioAdded {
        /// Scenario
        scenario: ScenarioId,
        /// Encoded image
        bytes: Vec<u8>,
    },
    /// Answer to a checksum request. `None` means not yet available.
    Checksum {
        /// Scenario
        scenario: ScenarioId,
        /// Transmission asked about
        transmission_id: TransmissionId,
        /// Server fingerprint
        values: Option<ChecksumValues>,
    },
    /// A submitted transmission was refused.
    Rejected {
        /// Refused transmission
        transmission_id: TransmissionId,
        /// Readable reason
        reason: String,
    },
    /// A scenario was deleted on the server.
    ScenarioRemoved(ScenarioId),
    /// The production flag moved to this scenario.
    ProductionChanged(ScenarioId),
    /// The requested scenario is not loaded on the server.
    ScenarioUnavailable(ScenarioId),
    /// Result of a capable-to-promise query.
    CtpResult {
        /// Scenario queried
        scenario: ScenarioId,
        /// Query transmission
        transmission_id: TransmissionId,
        /// KPIs of the what-if state
        kpis: BTreeMap<String, i64>,
    },
}
