//! License and permission gates.
//!
//! Both run before a transmission touches any state. A rejection leaves no
//! undo-log entry and fires no change events.

use std::{collections::BTreeSet, sync::Arc};

use plansync_proto::{ScenarioId, Transmission, TransmissionBody, UserId};

use crate::summary::ScenarioSummary;

/// License validation.
pub trait LicenseGate: Send + Sync {
    /// Whether a read-only scenario may still accept `transmission`.
    fn verify_readonly_transmission(&self, transmission: &Transmission) -> bool {
        transmission.body.allowed_when_read_only()
    }

    /// Reason applying `transmission` would newly force the scenario
    /// read-only, if it would.
    fn would_force_read_only(
        &self,
        transmission: &Transmission,
        summary: &ScenarioSummary,
        entity_count: u64,
    ) -> Option<String>;

    /// Re-validate the scenario after a transmission. Returns the read-only
    /// flag.
    fn validate_data(&self, summary: &ScenarioSummary, entity_count: u64) -> bool;
}

/// Sender authorization.
pub trait PermissionGate: Send + Sync {
    /// Whether the instigator may apply `transmission` to `scenario`.
    fn verify_transmission(&self, scenario: ScenarioId, transmission: &Transmission) -> bool;
}

/// The pair of gates a scenario checks.
#[derive(Clone)]
pub struct Gates {
    /// License validation.
    pub license: Arc<dyn LicenseGate>,
    /// Sender authorization.
    pub permissions: Arc<dyn PermissionGate>,
}

impl Default for Gates {
    fn default() -> Self {
        Self { license: Arc::new(Unrestricted), permissions: Arc::new(Unrestricted) }
    }
}

impl std::fmt::Debug for Gates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gates").finish_non_exhaustive()
    }
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl LicenseGate for Unrestricted {
    fn would_force_read_only(&self, _: &Transmission, _: &ScenarioSummary, _: u64) -> Option<String> {
        None
    }

    fn validate_data(&self, _: &ScenarioSummary, _: u64) -> bool {
        false
    }
}

impl PermissionGate for Unrestricted {
    fn verify_transmission(&self, _: ScenarioId, _: &Transmission) -> bool {
        true
    }
}

/// License capping the number of scheduled entities.
///
/// A scenario over the cap turns read-only. Imports into a scenario already
/// at the cap are refused up front.
#[derive(Debug, Clone, Copy)]
pub struct EntityLimitLicense {
    /// Entities allowed before the scenario turns read-only.
    pub max_entities: u64,
}

impl LicenseGate for EntityLimitLicense {
    fn would_force_read_only(
        &self,
        transmission: &Transmission,
        _summary: &ScenarioSummary,
        entity_count: u64,
    ) -> Option<String> {
        match transmission.body {
            TransmissionBody::Import(_) if entity_count >= self.max_entities => {
                Some(format!("entity limit {} reached", self.max_entities))
            },
            _ => None,
        }
    }

    fn validate_data(&self, _summary: &ScenarioSummary, entity_count: u64) -> bool {
        entity_count > self.max_entities
    }
}

/// Users restricted to viewing.
///
/// Viewers may only send kinds a read-only scenario would accept. Internal
/// transmissions are always allowed.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    viewers: BTreeSet<UserId>,
}

impl AccessList {
    /// List restricting `viewers`.
    pub fn new(viewers: impl IntoIterator<Item = UserId>) -> Self {
        Self { viewers: viewers.into_iter().collect() }
    }
}

impl PermissionGate for AccessList {
    fn verify_transmission(&self, _scenario: ScenarioId, transmission: &Transmission) -> bool {
        let header = &transmission.header;
        header.internal
            || !self.viewers.contains(&header.instigator)
            || transmission.body.allowed_when_read_only()
    }
}

#[cfg(test)]
mod tests {
    use plansync_proto::{DomainPayload, Target, TransmissionHeader, TransmissionId};

    use super::*;

    fn from(user: u64, body: TransmissionBody) -> Transmission {
        Transmission::new(TransmissionHeader::new(TransmissionId(1), UserId(user), Target::Live), body)
    }

    fn import() -> TransmissionBody {
        TransmissionBody::Import(DomainPayload { kind: 0, data: vec![] })
    }

    #[test]
    fn entity_limit_forces_read_only_past_cap() {
        let license = EntityLimitLicense { max_entities: 10 };
        let summary = ScenarioSummary::default();
        assert!(!license.validate_data(&summary, 10));
        assert!(license.validate_data(&summary, 11));
        assert!(license.would_force_read_only(&from(1, import()), &summary, 10).is_some());
        assert!(license.would_force_read_only(&from(1, import()), &summary, 9).is_none());
        assert!(license.would_force_read_only(&from(1, TransmissionBody::KpiUpdate), &summary, 50).is_none());
    }

    #[test]
    fn viewers_may_only_send_read_only_kinds() {
        let access = AccessList::new([UserId(7)]);
        assert!(!access.verify_transmission(ScenarioId(1), &from(7, import())));
        assert!(access.verify_transmission(ScenarioId(1), &from(7, TransmissionBody::KpiSnapshot)));
        assert!(access.verify_transmission(ScenarioId(1), &from(8, import())));

        let mut internal = from(7, import());
        internal.header.internal = true;
        assert!(access.verify_transmission(ScenarioId(1), &internal));
    }
}
