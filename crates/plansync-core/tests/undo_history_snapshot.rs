//! Audit listing of a scenario's undo log after edits, a refusal and an undo.

use std::fmt::Write;

use plansync_core::{Gates, MemoryCheckpointStore, RegistryConfig, Role, ScenarioRegistry, UndoSetSummary};
use plansync_harness::{Job, PlanCommand, PlanDetail, SimEnv};
use plansync_proto::{
    NewScenario, ScenarioId, ScenarioKind, Target, Transmission, TransmissionBody, TransmissionHeader,
    TransmissionId, UndoRequest, UserId,
};

fn send(
    registry: &ScenarioRegistry<PlanDetail, MemoryCheckpointStore, SimEnv>,
    scenario: ScenarioId,
    number: u64,
    body: TransmissionBody,
) {
    let mut header = TransmissionHeader::new(TransmissionId(u128::from(number)), UserId(4), Target::Scenario(scenario));
    header.number = number;
    header.original_number = number;
    registry.receive(&Transmission::new(header, body), |_| 0).expect("route");
}

fn listing(history: &[UndoSetSummary]) -> String {
    let mut out = String::new();
    for set in history {
        writeln!(out, "set {}", set.undo_number.0).expect("write");
        for jar in &set.entries {
            let state = if jar.failed {
                "failed"
            } else if jar.play {
                "played"
            } else {
                "undone"
            };
            writeln!(
                out,
                "  #{} by user {} kind {:#06x} {} [{state}]",
                jar.info.number, jar.info.instigator.0, jar.info.kind_id, jar.info.description
            )
            .expect("write");
        }
    }
    out
}

#[test]
fn undo_history_listing() {
    let registry = ScenarioRegistry::new(
        Role::Server,
        MemoryCheckpointStore::new(),
        SimEnv::with_seed(11),
        Gates::default(),
        RegistryConfig::default(),
    );
    let live = registry
        .create(&NewScenario { name: "Live".to_string(), kind: ScenarioKind::Live, production: true, compare: false })
        .expect("create");

    let add = |id: u64, start: u64| PlanCommand::AddJob { id, job: Job::new(0, start, 50) }.body().expect("encode");
    send(&registry, live, 1, add(1, 0));
    send(&registry, live, 2, add(2, 200));
    // Overlaps job 1 on resource 0.
    send(&registry, live, 3, add(3, 20));

    let set = registry.get(live).expect("loaded").undo_numbers()[0];
    let undo = TransmissionBody::Undo(UndoRequest { undo_number: set, toggle: vec![TransmissionId(2)], redo: false });
    send(&registry, live, 4, undo);

    let history = registry.get(live).expect("loaded").undo_history();
    insta::assert_snapshot!(listing(&history));
}
