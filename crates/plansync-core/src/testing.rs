//! Minimal detail and environment for unit tests.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use plansync_proto::{
    DomainPayload, MoveRequest, Target, Transmission, TransmissionBody, TransmissionHeader,
    TransmissionId, UserId,
};
use serde::{Deserialize, Serialize};

use crate::{
    detail::{DetailError, ReceiveContext, ReceiveOutcome, ScenarioDetail},
    env::Environment,
};

pub const ADD: u16 = 1;
pub const REFUSE: u16 = 2;
pub const CANCEL: u16 = 3;
/// Adds its delta, then fails unexpectedly.
pub const BREAK: u16 = 4;

/// A single counter. Domain payloads of kind [`ADD`] carry a big-endian
/// `i64` delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDetail {
    pub value: i64,
    pub applied: u64,
}

fn delta(data: &[u8]) -> Result<i64, DetailError> {
    data.get(..8)
        .and_then(|b| b.try_into().ok())
        .map(i64::from_be_bytes)
        .ok_or_else(|| DetailError::Validation("short payload".into()))
}

impl ScenarioDetail for CounterDetail {
    fn receive(
        &mut self,
        transmission: &Transmission,
        ctx: &mut ReceiveContext<'_>,
    ) -> Result<ReceiveOutcome, DetailError> {
        match &transmission.body {
            TransmissionBody::Domain(payload)
            | TransmissionBody::Import(payload)
            | TransmissionBody::Ctp(payload) => match payload.kind {
                ADD => {
                    self.value += delta(&payload.data)?;
                    self.applied += 1;
                    ctx.changes.updated.insert(0);
                },
                REFUSE => return Err(DetailError::Validation("refused".into())),
                CANCEL => return Err(DetailError::Cancelled("cancelled".into())),
                BREAK => {
                    self.value += delta(&payload.data)?;
                    return Err(DetailError::Internal("index corrupted".into()));
                },
                _ => {},
            },
            // [delta: i64][attempts before success: u8]
            TransmissionBody::Move(request) => {
                self.value += delta(&request.payload)?;
                let needed = request.payload.get(8).copied().unwrap_or(0);
                if request.attempt < u32::from(needed) {
                    return Ok(ReceiveOutcome::RetryMove(request.clone()));
                }
                self.applied += 1;
                ctx.changes.updated.insert(0);
            },
            _ => {},
        }
        Ok(ReceiveOutcome::Applied)
    }

    fn entity_count(&self) -> u64 {
        self.applied
    }

    fn kpis(&self) -> BTreeMap<String, i64> {
        BTreeMap::from([("value".to_string(), self.value)])
    }
}

/// Virtual clock and counter-based randomness.
///
/// With a non-zero `step` every clock read moves time forward, so each
/// processed transmission takes exactly `step`.
#[derive(Debug, Clone, Default)]
pub struct TestEnv {
    clock: Arc<Mutex<Duration>>,
    counter: Arc<AtomicU64>,
    step: Duration,
}

impl TestEnv {
    pub fn stepping(step: Duration) -> Self {
        Self { step, ..Self::default() }
    }

    pub fn advance(&self, by: Duration) {
        *self.clock.lock() += by;
    }
}

impl Environment for TestEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        let mut clock = self.clock.lock();
        let now = *clock;
        *clock += self.step;
        now
    }

    fn wall_clock_ms(&self) -> u64 {
        u64::try_from(self.clock.lock().as_millis()).unwrap_or(u64::MAX)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let next = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1).to_be_bytes();
            chunk.copy_from_slice(&next[..chunk.len()]);
        }
    }
}

fn domain(id: u128, kind: u16, data: Vec<u8>) -> Transmission {
    let header = TransmissionHeader::new(TransmissionId(id), UserId(1), Target::Live);
    Transmission::new(header, TransmissionBody::Domain(DomainPayload { kind, data }))
}

pub fn add(id: u128, delta: i64) -> Transmission {
    domain(id, ADD, delta.to_be_bytes().to_vec())
}

pub fn refuse(id: u128) -> Transmission {
    domain(id, REFUSE, vec![])
}

pub fn break_after(id: u128, delta: i64) -> Transmission {
    domain(id, BREAK, delta.to_be_bytes().to_vec())
}

pub fn cancel(id: u128) -> Transmission {
    domain(id, CANCEL, vec![])
}

/// A move that asks to be retried `retries` times before it sticks.
pub fn shift(id: u128, delta: i64, retries: u8) -> Transmission {
    let mut payload = delta.to_be_bytes().to_vec();
    payload.push(retries);
    let header = TransmissionHeader::new(TransmissionId(id), UserId(1), Target::Live);
    Transmission::new(
        header,
        TransmissionBody::Move(MoveRequest { payload, alternate_path: false, attempt: 0 }),
    )
}
