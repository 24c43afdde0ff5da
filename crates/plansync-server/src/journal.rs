//! Scenario detail hosted by the standalone server binary.
//!
//! The binary carries no scheduling model. It keeps applied domain payloads
//! as opaque journal entries so sequencing, undo, checksums and lifecycle
//! can run end to end against real clients.

use std::collections::BTreeMap;

use plansync_core::{DetailError, ReceiveContext, ReceiveOutcome, ScenarioDetail};
use plansync_proto::{DomainPayload, Transmission, TransmissionBody};
use serde::{Deserialize, Serialize};

/// Payload kinds with this bit set are short-term activity, dropped by
/// `ClearPastShortTerm` once the planning clock passes them.
pub const SHORT_TERM_FLAG: u16 = 0x8000;

/// One recorded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Payload kind as submitted.
    pub kind: u16,
    /// Payload bytes as submitted.
    pub data: Vec<u8>,
    /// Server timestamp of the recording transmission, moved by `Move`.
    pub at_ms: u64,
}

impl JournalEntry {
    fn is_short_term(&self) -> bool {
        self.kind & SHORT_TERM_FLAG != 0
    }
}

/// Append-only journal of domain payloads, keyed by entry number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalDetail {
    entries: BTreeMap<u64, JournalEntry>,
    next_entry: u64,
}

impl JournalDetail {
    /// Entries in recording order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &JournalEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    fn record(&mut self, payload: &DomainPayload, at_ms: u64, ctx: &mut ReceiveContext<'_>) {
        let entry = self.next_entry;
        self.next_entry += 1;
        self.entries.insert(entry, JournalEntry { kind: payload.kind, data: payload.data.clone(), at_ms });
        ctx.changes.added.insert(entry);
    }
}

/// `Move` payload: `[entry: u64 BE][new timestamp: u64 BE]`.
fn decode_move(payload: &[u8]) -> Result<(u64, u64), DetailError> {
    let word = |range: std::ops::Range<usize>| {
        payload
            .get(range)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| DetailError::Validation("move payload must be 16 bytes".into()))
    };
    Ok((word(0..8)?, word(8..16)?))
}

impl ScenarioDetail for JournalDetail {
    fn receive(
        &mut self,
        transmission: &Transmission,
        ctx: &mut ReceiveContext<'_>,
    ) -> Result<ReceiveOutcome, DetailError> {
        let at_ms = transmission.header.timestamp_ms;
        match &transmission.body {
            TransmissionBody::Domain(payload) | TransmissionBody::Import(payload) => {
                self.record(payload, at_ms, ctx);
            },
            TransmissionBody::Move(request) => {
                let (entry, to_ms) = decode_move(&request.payload)?;
                let target = self
                    .entries
                    .get_mut(&entry)
                    .ok_or_else(|| DetailError::Validation(format!("no journal entry {entry}")))?;
                target.at_ms = to_ms;
                ctx.changes.updated.insert(entry);
            },
            TransmissionBody::ClearPastShortTerm => {
                let clock = ctx.summary.clock_ms;
                let stale: Vec<u64> = self
                    .entries
                    .iter()
                    .filter(|(_, e)| e.is_short_term() && e.at_ms < clock)
                    .map(|(k, _)| *k)
                    .collect();
                for entry in stale {
                    self.entries.remove(&entry);
                    ctx.changes.removed.insert(entry);
                }
            },
            // Summary-level and lifecycle kinds are handled by the processor;
            // what-if queries leave the journal alone.
            _ => {},
        }
        Ok(ReceiveOutcome::Applied)
    }

    fn entity_count(&self) -> u64 {
        self.entries.len() as u64
    }

    fn kpis(&self) -> BTreeMap<String, i64> {
        let bytes: usize = self.entries.values().map(|e| e.data.len()).sum();
        BTreeMap::from([
            ("entries".to_string(), self.entries.len() as i64),
            ("payload_bytes".to_string(), bytes as i64),
        ])
    }
}

#[cfg(test)]
mod tests {
    use plansync_core::{DataChanges, ScenarioSummary};
    use plansync_proto::{MoveRequest, Target, TransmissionHeader, TransmissionId, UserId};

    use super::*;

    fn transmission(at_ms: u64, body: TransmissionBody) -> Transmission {
        let mut header = TransmissionHeader::new(TransmissionId(u128::from(at_ms)), UserId(1), Target::Live);
        header.timestamp_ms = at_ms;
        Transmission::new(header, body)
    }

    fn domain(kind: u16, at_ms: u64) -> Transmission {
        transmission(at_ms, TransmissionBody::Domain(DomainPayload { kind, data: vec![1, 2, 3] }))
    }

    fn apply(detail: &mut JournalDetail, summary: &ScenarioSummary, t: &Transmission) -> Result<DataChanges, DetailError> {
        let mut changes = DataChanges::default();
        let mut ctx = ReceiveContext { summary, changes: &mut changes };
        detail.receive(t, &mut ctx)?;
        Ok(changes)
    }

    #[test]
    fn domain_payloads_are_recorded_in_order() {
        let mut detail = JournalDetail::default();
        let summary = ScenarioSummary::default();

        apply(&mut detail, &summary, &domain(1, 10)).unwrap();
        let changes = apply(&mut detail, &summary, &domain(2, 20)).unwrap();

        assert_eq!(changes.added.iter().copied().collect::<Vec<_>>(), vec![1]);
        let kinds: Vec<u16> = detail.entries().map(|(_, e)| e.kind).collect();
        assert_eq!(kinds, vec![1, 2]);
        assert_eq!(detail.kpis()["payload_bytes"], 6);
    }

    #[test]
    fn move_of_unknown_entry_is_refused_without_change() {
        let mut detail = JournalDetail::default();
        let summary = ScenarioSummary::default();
        apply(&mut detail, &summary, &domain(1, 10)).unwrap();
        let before = detail.clone();

        let mut payload = 7u64.to_be_bytes().to_vec();
        payload.extend(99u64.to_be_bytes());
        let t = transmission(11, TransmissionBody::Move(MoveRequest { payload, alternate_path: false, attempt: 0 }));

        assert!(matches!(apply(&mut detail, &summary, &t), Err(DetailError::Validation(_))));
        assert_eq!(detail, before);
    }

    #[test]
    fn clear_past_short_term_keeps_long_term_entries() {
        let mut detail = JournalDetail::default();
        let mut summary = ScenarioSummary::default();
        apply(&mut detail, &summary, &domain(SHORT_TERM_FLAG | 1, 10)).unwrap();
        apply(&mut detail, &summary, &domain(1, 10)).unwrap();
        apply(&mut detail, &summary, &domain(SHORT_TERM_FLAG | 1, 500)).unwrap();

        summary.clock_ms = 100;
        let changes = apply(&mut detail, &summary, &transmission(600, TransmissionBody::ClearPastShortTerm)).unwrap();

        assert_eq!(changes.removed.len(), 1);
        assert_eq!(detail.entity_count(), 2);
    }
}
