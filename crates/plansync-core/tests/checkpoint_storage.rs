//! Checkpoint storage under the registry: on-disk cleanup, crash leftovers
//! and injected I/O failures.

use plansync_core::{
    ChaoticCheckpointStore, CheckpointStore, CopyOutcome, FileCheckpointStore, Gates,
    MemoryCheckpointStore, RegistryConfig, Role, ScenarioRegistry,
};
use plansync_harness::{Job, PlanCommand, PlanDetail, SimEnv};
use plansync_proto::{
    CopyScenario, NewScenario, ScenarioId, ScenarioKind, Target, Transmission, TransmissionBody,
    TransmissionHeader, TransmissionId, UndoRequest, UserId,
};
use proptest::prelude::*;
use tempfile::tempdir;

fn registry<S: CheckpointStore>(store: S) -> ScenarioRegistry<PlanDetail, S, SimEnv> {
    ScenarioRegistry::new(Role::Server, store, SimEnv::default(), Gates::default(), RegistryConfig::default())
}

fn new_scenario(name: &str, production: bool) -> NewScenario {
    NewScenario { name: name.to_string(), kind: ScenarioKind::WhatIf, production, compare: false }
}

fn stamped(id: u128, number: u64, scenario: ScenarioId, body: TransmissionBody) -> Transmission {
    let mut header = TransmissionHeader::new(TransmissionId(id), UserId(1), Target::Scenario(scenario));
    header.number = number;
    header.original_number = number;
    Transmission::new(header, body)
}

fn add(id: u64) -> TransmissionBody {
    PlanCommand::AddJob { id, job: Job::new(0, id * 100, 50) }.body().expect("encode")
}

#[test]
fn shutdown_removes_checkpoint_files() {
    let dir = tempdir().expect("tempdir");
    let store = FileCheckpointStore::open(dir.path()).expect("open");
    let registry = registry(store.clone());
    let a = registry.create(&new_scenario("A", true)).expect("create");
    let b = registry.create(&new_scenario("B", false)).expect("create");
    for (n, scenario) in [a, b, a].into_iter().enumerate() {
        let n = n as u64 + 1;
        registry.receive(&stamped(u128::from(n), n, scenario, add(n)), |_| 0).expect("route");
    }
    assert!(!store.list().expect("list").is_empty());

    registry.shutdown();

    assert!(store.list().expect("list").is_empty());
    assert!(registry.is_empty());
}

#[test]
fn temporary_copy_keeps_its_checkpoints() {
    let dir = tempdir().expect("tempdir");
    let store = FileCheckpointStore::open(dir.path()).expect("open");
    let registry = registry(store.clone());
    let live = registry.create(&new_scenario("Live", true)).expect("create");

    let outcome = registry
        .copy(live, &CopyScenario { name: "Scratch".to_string(), temporary: true, ..CopyScenario::default() })
        .expect("copy");
    let CopyOutcome::Registered(copy) = outcome else {
        panic!("expected a registered copy");
    };
    registry.shutdown();

    let left: Vec<ScenarioId> = store.list().expect("list").into_iter().map(|(s, _)| s).collect();
    assert!(!left.is_empty());
    assert!(left.iter().all(|s| *s == copy), "only the temporary copy remains: {left:?}");
}

#[test]
fn restart_purges_checkpoints_left_by_a_crash() {
    let dir = tempdir().expect("tempdir");
    {
        let crashed = registry(FileCheckpointStore::open(dir.path()).expect("open"));
        crashed.create(&new_scenario("Live", true)).expect("create");
        // Dropped without shutdown: files stay behind.
    }

    let store = FileCheckpointStore::open(dir.path()).expect("reopen");
    assert!(!store.list().expect("list").is_empty());
    let restarted = registry(store.clone());

    let purged = restarted.purge_abandoned_checkpoints().expect("purge");

    assert!(purged >= 1);
    assert!(store.list().expect("list").is_empty());
}

#[test]
fn undo_with_a_missing_checkpoint_is_handleable() {
    let store = MemoryCheckpointStore::new();
    let registry = registry(store.clone());
    let live = registry.create(&new_scenario("Live", true)).expect("create");
    registry.receive(&stamped(1, 1, live, add(1)), |_| 0).expect("route");
    let set = registry.get(live).expect("loaded").undo_numbers()[0];
    store.delete(live, set).expect("delete");

    let undo = TransmissionBody::Undo(UndoRequest { undo_number: set, toggle: vec![TransmissionId(1)], redo: false });
    let deliveries = registry.receive(&stamped(2, 2, live, undo), |_| 0).expect("route");

    let err = deliveries.into_iter().next().expect("delivery").result.expect_err("refused");
    assert!(err.to_string().contains("handleable"), "{err}");
    assert!(registry.get(live).expect("loaded").detail().job(1).is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Failing writes and reads never leave a registered scenario without a
    /// checkpoint, and shutdown leaves nothing behind.
    #[test]
    fn prop_chaotic_store_never_leaks(seed in any::<u64>(), rate in 0.0f64..0.6, edits in 1u64..12) {
        let store = ChaoticCheckpointStore::with_seed(MemoryCheckpointStore::new(), rate, seed);
        let registry = registry(store.clone());

        let mut created = Vec::new();
        for n in 0..4 {
            if let Ok(id) = registry.create(&new_scenario(&format!("S{n}"), created.is_empty())) {
                created.push(id);
            }
        }

        let mut number = 0;
        for &scenario in &created {
            for e in 1..=edits {
                number += 1;
                registry.receive(&stamped(u128::from(number), number, scenario, add(e)), |_| 0).expect("route");
            }
            let set = registry.get(scenario).expect("loaded").undo_numbers()[0];
            number += 1;
            let undo = TransmissionBody::Undo(UndoRequest {
                undo_number: set,
                toggle: vec![TransmissionId(u128::from(number - 1))],
                redo: false,
            });
            let deliveries = registry.receive(&stamped(u128::from(number), number, scenario, undo), |_| 0).expect("route");
            for delivery in deliveries {
                if let Err(err) = delivery.result {
                    prop_assert!(err.to_string().contains("fatal"), "only I/O failures: {}", err);
                }
            }
        }

        for &scenario in &created {
            prop_assert!(!store.inner().list_scenario(scenario).expect("list").is_empty());
        }
        registry.shutdown();
        prop_assert!(store.inner().is_empty());
    }
}
