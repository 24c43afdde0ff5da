//! Fuzz target for transmission processing under checkpoint failures
//!
//! Drives a server-side registry through edits, undo, redo and lifecycle
//! transmissions while `ChaoticCheckpointStore` fails writes and reads.
//!
//! # Strategy
//!
//! - Variable failure rates (0% to 90%)
//! - Edits that collide, moves, simulations and cancellations
//! - Undo and redo of arbitrary transmission ids
//! - Copies and deletes
//!
//! # Invariants
//!
//! - Processing NEVER panics on storage errors
//! - Storage failures surface as fatal errors, never as validation errors
//! - Every registered scenario keeps at least one checkpoint
//! - Shutdown leaves no checkpoint behind

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use plansync_core::{
    ChaoticCheckpointStore, CheckpointStore, Gates, MemoryCheckpointStore, RegistryConfig, Role,
    ScenarioRegistry,
};
use plansync_harness::{Job, PlanCommand, PlanDetail, Reschedule, SimEnv};
use plansync_proto::{
    CopyScenario, NewScenario, ScenarioKind, Target, Transmission, TransmissionBody,
    TransmissionHeader, TransmissionId, UndoRequest, UserId,
};

#[derive(Debug, Clone, Arbitrary)]
struct ChaosRun {
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    operations: Vec<Operation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Operation {
    Add { id: u8, resource: u8, start: u16, duration: u8 },
    Remove { id: u8 },
    Move { id: u8, start: u16 },
    Simulate,
    Cancel,
    Undo { toggle: Vec<u8>, redo: bool },
    Copy,
    Delete { scenario: u8 },
}

fuzz_target!(|run: ChaosRun| {
    let failure_rate = f64::from(run.failure_rate_tenth % 10) / 10.0;
    let store = ChaoticCheckpointStore::with_seed(MemoryCheckpointStore::new(), failure_rate, run.chaos_seed);
    let registry: ScenarioRegistry<PlanDetail, _, SimEnv> = ScenarioRegistry::new(
        Role::Server,
        store.clone(),
        SimEnv::with_seed(run.chaos_seed),
        Gates::default(),
        RegistryConfig::default(),
    );
    let request = NewScenario {
        name: "Live".to_string(),
        kind: ScenarioKind::Live,
        production: true,
        compare: false,
    };
    if registry.create(&request).is_err() {
        return;
    }

    let mut number = 0u64;
    for operation in run.operations.into_iter().take(64) {
        let Some(live) = registry.production() else {
            break;
        };
        let (target, body) = match operation {
            Operation::Add { id, resource, start, duration } => {
                let job = Job::new(u32::from(resource % 4), u64::from(start), u64::from(duration) + 1);
                (live, PlanCommand::AddJob { id: u64::from(id), job }.body())
            },
            Operation::Remove { id } => (live, PlanCommand::RemoveJob { id: u64::from(id) }.body()),
            Operation::Move { id, start } => {
                (live, Reschedule { id: u64::from(id), start_ms: u64::from(start) }.body())
            },
            Operation::Simulate => (live, PlanCommand::Simulate.body()),
            Operation::Cancel => (live, PlanCommand::Cancel.body()),
            Operation::Undo { toggle, redo } => {
                let Some(state) = registry.get(live) else {
                    continue;
                };
                let Some(undo_number) = state.undo_numbers().first().copied() else {
                    continue;
                };
                let toggle = toggle.into_iter().map(|t| TransmissionId(u128::from(t))).collect();
                (live, Ok(TransmissionBody::Undo(UndoRequest { undo_number, toggle, redo })))
            },
            Operation::Copy => (
                live,
                Ok(TransmissionBody::CopyScenario(CopyScenario {
                    name: "Copy".to_string(),
                    ..CopyScenario::default()
                })),
            ),
            Operation::Delete { scenario } => {
                let ids = registry.ids();
                let Some(id) = ids.get(usize::from(scenario) % ids.len().max(1)).copied() else {
                    continue;
                };
                (id, Ok(TransmissionBody::DeleteScenario))
            },
        };
        let body = body.expect("plan command encodes");

        number += 1;
        let mut header = TransmissionHeader::new(TransmissionId(u128::from(number)), UserId(1), Target::Scenario(target));
        header.number = number;
        header.original_number = number;

        let Ok(deliveries) = registry.receive(&Transmission::new(header, body), |_| 0) else {
            continue;
        };
        for delivery in deliveries {
            if let Err(err) = delivery.result {
                let text = err.to_string();
                assert!(
                    !text.contains("chaotic") || text.contains("fatal") || text.contains("storage"),
                    "storage failure misclassified: {text}"
                );
            }
        }
    }

    for id in registry.ids() {
        let kept = store.inner().list_scenario(id).expect("list");
        assert!(!kept.is_empty(), "scenario {id} lost every checkpoint");
    }
    registry.shutdown();
    assert!(store.inner().is_empty(), "checkpoints leaked: {:?}", store.inner().list());
});
