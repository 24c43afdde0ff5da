//! Reference scheduling model.
//!
//! A small but real [`ScenarioDetail`]: jobs on resources that may not
//! overlap. Commands travel CBOR-encoded in [`DomainPayload`]s; moves ask to
//! be retried at the end of whatever job they collide with, which drives the
//! processor's bounded move retry.

use std::collections::{BTreeMap, BTreeSet};

use plansync_core::{DetailError, ReceiveContext, ReceiveOutcome, ScenarioDetail};
use plansync_proto::{
    CodecError, DomainPayload, MoveRequest, Transmission, TransmissionBody, codec,
};
use serde::{Deserialize, Serialize};

/// Payload kind of an encoded [`PlanCommand`].
pub const PLAN_COMMAND: u16 = 0x0100;

/// One scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Resource the job runs on.
    pub resource: u32,
    /// Start, milliseconds.
    pub start_ms: u64,
    /// Run time, milliseconds.
    pub duration_ms: u64,
    /// Short-term activity, dropped by `ClearPastShortTerm` once finished.
    #[serde(default)]
    pub short_term: bool,
}

impl Job {
    /// Long-term job.
    pub fn new(resource: u32, start_ms: u64, duration_ms: u64) -> Self {
        Self { resource, start_ms, duration_ms, short_term: false }
    }

    /// End, milliseconds.
    pub fn end_ms(&self) -> u64 {
        self.start_ms.saturating_add(self.duration_ms)
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.resource == other.resource
            && self.start_ms < other.end_ms()
            && other.start_ms < self.end_ms()
    }
}

/// Edits understood by [`PlanDetail`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanCommand {
    /// Schedule a job under a new id.
    AddJob {
        /// Job id
        id: u64,
        /// The job
        job: Job,
    },
    /// Drop a job.
    RemoveJob {
        /// Job id
        id: u64,
    },
    /// Run a schedule simulation.
    Simulate,
    /// Always refused.
    Fail {
        /// Refusal text
        reason: String,
    },
    /// Cancels the simulation it triggers.
    Cancel,
}

impl PlanCommand {
    /// Encode as a domain payload.
    pub fn payload(&self) -> Result<DomainPayload, CodecError> {
        Ok(DomainPayload { kind: PLAN_COMMAND, data: codec::encode_body(self)? })
    }

    /// Encode as a domain transmission body.
    pub fn body(&self) -> Result<TransmissionBody, CodecError> {
        Ok(TransmissionBody::Domain(self.payload()?))
    }
}

/// Move payload: place job `id` at `start_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reschedule {
    /// Job id
    pub id: u64,
    /// Requested start
    pub start_ms: u64,
}

impl Reschedule {
    /// Encode as a move body.
    pub fn body(&self) -> Result<TransmissionBody, CodecError> {
        Ok(TransmissionBody::Move(MoveRequest {
            payload: codec::encode_body(self)?,
            alternate_path: false,
            attempt: 0,
        }))
    }
}

/// Capable-to-promise query: earliest slot for `job` at or after its start.
pub fn ctp_query(job: Job) -> Result<TransmissionBody, CodecError> {
    Ok(TransmissionBody::Ctp(DomainPayload { kind: PLAN_COMMAND, data: codec::encode_body(&job)? }))
}

/// Bulk import: every job in the list, replacing ids already present.
pub fn import(jobs: &[(u64, Job)]) -> Result<TransmissionBody, CodecError> {
    Ok(TransmissionBody::Import(DomainPayload { kind: PLAN_COMMAND, data: codec::encode_body(&jobs)? }))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, DetailError> {
    codec::decode_body(bytes).map_err(|e| DetailError::Validation(format!("malformed plan payload: {e}")))
}

/// Jobs on resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanDetail {
    jobs: BTreeMap<u64, Job>,
    simulations: u64,
    /// Resource → jobs on it. Rebuilt after deserialization.
    #[serde(skip)]
    by_resource: BTreeMap<u32, BTreeSet<u64>>,
}

impl PartialEq for PlanDetail {
    fn eq(&self, other: &Self) -> bool {
        self.jobs == other.jobs && self.simulations == other.simulations
    }
}

impl Eq for PlanDetail {}

impl PlanDetail {
    /// Job by id.
    pub fn job(&self, id: u64) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// Every job, by id.
    pub fn jobs(&self) -> &BTreeMap<u64, Job> {
        &self.jobs
    }

    /// Completed simulations.
    pub fn simulations(&self) -> u64 {
        self.simulations
    }

    /// Jobs scheduled on `resource`, from the cross reference.
    pub fn jobs_on(&self, resource: u32) -> Vec<u64> {
        self.by_resource.get(&resource).map(|ids| ids.iter().copied().collect()).unwrap_or_default()
    }

    /// First job other than `except` that `job` collides with.
    fn collision(&self, job: &Job, except: Option<u64>) -> Option<(u64, Job)> {
        self.by_resource
            .get(&job.resource)?
            .iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| self.jobs.get(id).map(|other| (*id, *other)))
            .find(|(_, other)| other.overlaps(job))
    }

    fn insert(&mut self, id: u64, job: Job) {
        if let Some(previous) = self.jobs.insert(id, job)
            && let Some(ids) = self.by_resource.get_mut(&previous.resource)
        {
            ids.remove(&id);
        }
        self.by_resource.entry(job.resource).or_default().insert(id);
    }

    fn remove(&mut self, id: u64) -> Option<Job> {
        let job = self.jobs.remove(&id)?;
        if let Some(ids) = self.by_resource.get_mut(&job.resource) {
            ids.remove(&id);
        }
        Some(job)
    }

    /// Earliest start at or after `job.start_ms` without a collision.
    fn earliest_slot(&self, mut job: Job) -> Job {
        while let Some((_, other)) = self.collision(&job, None) {
            job.start_ms = other.end_ms();
        }
        job
    }

    fn command(&mut self, command: PlanCommand, ctx: &mut ReceiveContext<'_>) -> Result<(), DetailError> {
        match command {
            PlanCommand::AddJob { id, job } => {
                if self.jobs.contains_key(&id) {
                    return Err(DetailError::Validation(format!("job {id} already exists")));
                }
                if let Some((other, _)) = self.collision(&job, None) {
                    return Err(DetailError::Validation(format!(
                        "job {id} overlaps job {other} on resource {}",
                        job.resource
                    )));
                }
                self.insert(id, job);
                ctx.changes.added.insert(id);
            },
            PlanCommand::RemoveJob { id } => {
                self.remove(id).ok_or_else(|| DetailError::Validation(format!("no job {id}")))?;
                ctx.changes.removed.insert(id);
            },
            PlanCommand::Simulate => {
                self.simulations += 1;
                ctx.changes.simulation_completed = true;
            },
            PlanCommand::Fail { reason } => return Err(DetailError::Validation(reason)),
            PlanCommand::Cancel => {
                return Err(DetailError::Cancelled("simulation cancelled by request".into()));
            },
        }
        Ok(())
    }

    fn reschedule(
        &mut self,
        request: &MoveRequest,
        ctx: &mut ReceiveContext<'_>,
    ) -> Result<ReceiveOutcome, DetailError> {
        let Reschedule { id, start_ms } = decode(&request.payload)?;
        let mut job = *self.jobs.get(&id).ok_or_else(|| DetailError::Validation(format!("no job {id}")))?;
        job.start_ms = start_ms;

        if let Some((_, other)) = self.collision(&job, Some(id)) {
            let adjusted = Reschedule { id, start_ms: other.end_ms() };
            let payload = codec::encode_body(&adjusted).map_err(|e| DetailError::Internal(e.to_string()))?;
            return Ok(ReceiveOutcome::RetryMove(MoveRequest { payload, ..request.clone() }));
        }

        self.insert(id, job);
        ctx.changes.updated.insert(id);
        Ok(ReceiveOutcome::Applied)
    }
}

impl ScenarioDetail for PlanDetail {
    fn receive(
        &mut self,
        transmission: &Transmission,
        ctx: &mut ReceiveContext<'_>,
    ) -> Result<ReceiveOutcome, DetailError> {
        match &transmission.body {
            TransmissionBody::Domain(payload) if payload.kind == PLAN_COMMAND => {
                self.command(decode(&payload.data)?, ctx)?;
            },
            TransmissionBody::Import(payload) if payload.kind == PLAN_COMMAND => {
                let jobs: Vec<(u64, Job)> = decode(&payload.data)?;
                for (id, job) in jobs {
                    self.insert(id, job);
                    ctx.changes.added.insert(id);
                }
            },
            TransmissionBody::Ctp(payload) if payload.kind == PLAN_COMMAND => {
                let job: Job = decode(&payload.data)?;
                let placed = self.earliest_slot(job);
                let id = self.jobs.keys().next_back().map_or(1, |last| last + 1);
                self.insert(id, placed);
                ctx.changes.added.insert(id);
            },
            TransmissionBody::Move(request) => return self.reschedule(request, ctx),
            TransmissionBody::ClearPastShortTerm => {
                let clock = ctx.summary.clock_ms;
                let stale: Vec<u64> = self
                    .jobs
                    .iter()
                    .filter(|(_, job)| job.short_term && job.end_ms() <= clock)
                    .map(|(id, _)| *id)
                    .collect();
                for id in stale {
                    self.remove(id);
                    ctx.changes.removed.insert(id);
                }
            },
            _ => {},
        }
        Ok(ReceiveOutcome::Applied)
    }

    fn entity_count(&self) -> u64 {
        self.jobs.len() as u64
    }

    fn kpis(&self) -> BTreeMap<String, i64> {
        let makespan = self.jobs.values().map(Job::end_ms).max().unwrap_or(0);
        let busy: u64 = self.jobs.values().map(|job| job.duration_ms).sum();
        BTreeMap::from([
            ("jobs".to_string(), self.jobs.len() as i64),
            ("makespan_ms".to_string(), makespan as i64),
            ("busy_ms".to_string(), busy as i64),
            ("simulations".to_string(), self.simulations as i64),
        ])
    }

    fn restore_references(&mut self) {
        self.by_resource.clear();
        for (id, job) in &self.jobs {
            self.by_resource.entry(job.resource).or_default().insert(*id);
        }
    }
}
