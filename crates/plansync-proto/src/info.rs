//! Denormalized transmission metadata.

use serde::{Deserialize, Serialize};

use crate::{
    ids::{TransmissionId, UserId},
    transmission::Transmission,
};

/// Audit view of a transmission.
///
/// Kept next to each compressed payload in the undo log so history listings
/// never have to inflate payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionInfo {
    /// Server sequence number.
    pub number: u64,
    /// Sequence number at first issue.
    pub original_number: u64,
    /// Issuing user.
    pub instigator: UserId,
    /// Server timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// System-generated.
    pub internal: bool,
    /// Human-readable kind.
    pub description: String,
    /// Numeric kind (see [`crate::TransmissionBody::kind_id`]).
    pub kind_id: u16,
    /// Unique id.
    pub transmission_id: TransmissionId,
}

impl From<&Transmission> for TransmissionInfo {
    fn from(t: &Transmission) -> Self {
        Self {
            number: t.header.number,
            original_number: t.header.original_number,
            instigator: t.header.instigator,
            timestamp_ms: t.header.timestamp_ms,
            internal: t.header.internal,
            description: t.body.description().to_string(),
            kind_id: t.body.kind_id(),
            transmission_id: t.header.id,
        }
    }
}
