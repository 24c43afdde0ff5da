//! Client error types.

use plansync_core::RegistryError;
use plansync_proto::{ScenarioId, TransmissionId};
use thiserror::Error;

/// Errors returned by [`crate::Client::handle`].
///
/// Per-transmission refusals are not errors: they surface as
/// [`crate::ClientAction::Rejected`] or trigger a reload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Installing or replacing a scenario image failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The server forwarded a transmission without resolving its target.
    #[error("transmission {0} is not addressed to a single scenario")]
    UnresolvedTarget(TransmissionId),

    /// The scenario is not resident on this client.
    #[error("scenario {0} is not resident")]
    NotResident(ScenarioId),
}
