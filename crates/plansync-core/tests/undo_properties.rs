//! Property-based tests for undo and redo.
//!
//! A scenario that undoes a set of transmissions must end up exactly where a
//! scenario that never received them ends up. Redo must restore the state
//! before the undo.

use plansync_core::{
    Gates, MemoryCheckpointStore, ProcessStatus, RegistryConfig, Role, ScenarioRegistry,
};
use plansync_harness::{Job, PlanCommand, PlanDetail, SimEnv};
use plansync_proto::{
    NewScenario, ScenarioId, ScenarioKind, Target, Transmission, TransmissionBody,
    TransmissionHeader, TransmissionId, UndoNumber, UndoRequest, UserId,
};
use proptest::prelude::*;

/// One server-side scenario fed stamped transmissions in order.
struct Feed {
    registry: ScenarioRegistry<PlanDetail, MemoryCheckpointStore, SimEnv>,
    scenario: ScenarioId,
    number: u64,
}

impl Feed {
    fn new(seed: u64) -> Self {
        let registry = ScenarioRegistry::new(
            Role::Server,
            MemoryCheckpointStore::new(),
            SimEnv::with_seed(seed),
            Gates::default(),
            RegistryConfig::default(),
        );
        let scenario = registry
            .create(&NewScenario {
                name: "Plan".to_string(),
                kind: ScenarioKind::Live,
                production: true,
                compare: false,
            })
            .expect("create");
        Self { registry, scenario, number: 0 }
    }

    /// Apply and report whether the transmission took effect.
    fn apply(&mut self, id: u128, body: TransmissionBody) -> bool {
        self.apply_with(id, body, false)
    }

    /// Apply, opening a new undo set first when `boundary` is set.
    fn apply_with(&mut self, id: u128, body: TransmissionBody, boundary: bool) -> bool {
        self.number += 1;
        let mut header = TransmissionHeader::new(TransmissionId(id), UserId(1), Target::Scenario(self.scenario));
        header.checkpoint_boundary = boundary;
        header.number = self.number;
        header.original_number = self.number;
        let deliveries = self.registry.receive(&Transmission::new(header, body), |_| 0).expect("route");
        deliveries
            .into_iter()
            .all(|d| matches!(d.result, Ok(outcome) if outcome.status == ProcessStatus::Applied))
    }

    fn undo(&mut self, id: u128, toggle: Vec<TransmissionId>, redo: bool) -> bool {
        let state = self.registry.get(self.scenario).expect("loaded");
        let undo_number = *state.undo_numbers().first().expect("undo set");
        self.undo_from(id, undo_number, toggle, redo)
    }

    fn undo_from(&mut self, id: u128, undo_number: UndoNumber, toggle: Vec<TransmissionId>, redo: bool) -> bool {
        self.apply(id, TransmissionBody::Undo(UndoRequest { undo_number, toggle, redo }))
    }

    fn sets(&self) -> Vec<(UndoNumber, Vec<TransmissionId>)> {
        self.registry
            .get(self.scenario)
            .expect("loaded")
            .undo_history()
            .into_iter()
            .map(|set| (set.undo_number, set.entries.iter().map(|jar| jar.info.transmission_id).collect()))
            .collect()
    }

    fn job_ids(&self) -> Vec<u64> {
        self.detail().jobs().keys().copied().collect()
    }

    fn detail(&self) -> PlanDetail {
        self.registry.get(self.scenario).expect("loaded").detail()
    }
}

fn add(id: u64, job: Job) -> TransmissionBody {
    PlanCommand::AddJob { id, job }.body().expect("encode")
}

fn jobs() -> impl Strategy<Value = Vec<(Job, bool)>> {
    prop::collection::vec(
        ((0u32..3, 0u64..500, 1u64..100).prop_map(|(r, s, d)| Job::new(r, s, d)), any::<bool>()),
        1..25,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_undo_matches_never_applying(seed in any::<u64>(), ops in jobs()) {
        let mut undone = Feed::new(seed);
        let mut reference = Feed::new(seed);

        let mut toggle = Vec::new();
        let mut kept = Vec::new();
        for (index, (job, toggled)) in ops.iter().enumerate() {
            let id = index as u128 + 1;
            let applied = undone.apply(id, add(index as u64, *job));
            if *toggled {
                toggle.push(TransmissionId(id));
            } else if applied {
                kept.push((id, index as u64, *job));
            }
        }
        prop_assert!(undone.undo(10_000, toggle, false));

        for (id, job_id, job) in kept {
            prop_assert!(reference.apply(id, add(job_id, job)), "kept edit replays cleanly");
        }
        prop_assert_eq!(undone.detail(), reference.detail());
    }

    #[test]
    fn prop_redo_restores_the_state_before_undo(seed in any::<u64>(), ops in jobs()) {
        let mut feed = Feed::new(seed);
        let mut toggle = Vec::new();
        for (index, (job, toggled)) in ops.iter().enumerate() {
            let id = index as u128 + 1;
            feed.apply(id, add(index as u64, *job));
            if *toggled {
                toggle.push(TransmissionId(id));
            }
        }
        let before = feed.detail();

        prop_assert!(feed.undo(10_000, toggle.clone(), false));
        prop_assert!(feed.undo(10_001, toggle, true));

        prop_assert_eq!(feed.detail(), before);
    }
}

#[test]
fn undo_history_records_every_edit_once() {
    let mut feed = Feed::new(7);
    for id in 1..=3u64 {
        assert!(feed.apply(u128::from(id), add(id, Job::new(0, id * 100, 50))));
    }

    let state = feed.registry.get(feed.scenario).expect("loaded");
    let history = state.undo_history();
    let entries: usize = history.iter().map(|set| set.entries.len()).sum();
    assert_eq!(entries, 3);
    assert!(history.iter().flat_map(|set| &set.entries).all(|jar| jar.play && !jar.failed));
}

#[test]
fn undo_across_sets_rebuilds_later_checkpoints() {
    let mut feed = Feed::new(3);
    let job = |id: u64| add(id, Job::new(0, id * 100, 50));

    assert!(feed.apply(1, job(1)));
    assert!(feed.apply_with(2, job(2), true));
    assert!(feed.apply_with(3, job(3), true));
    let sets = feed.sets();
    assert_eq!(sets.len(), 3);
    assert_eq!(sets.iter().map(|(_, ids)| ids.len()).collect::<Vec<_>>(), vec![1, 1, 1]);
    let (second, third) = (sets[1].0, sets[2].0);

    // Undo the edit in the middle set: the third set's checkpoint must be
    // rewritten without job 2.
    assert!(feed.undo_from(10, second, vec![TransmissionId(2)], false));
    assert_eq!(feed.job_ids(), vec![1, 3]);

    // New work purges the undone edit and lands in the last set.
    assert!(feed.apply(5, job(5)));
    assert_eq!(feed.sets()[1].1, Vec::<TransmissionId>::new());
    assert_eq!(feed.sets()[2].1, vec![TransmissionId(3), TransmissionId(5)]);

    // Undoing from the last set starts at its rewritten checkpoint.
    assert!(feed.undo_from(11, third, vec![TransmissionId(3)], false));
    assert_eq!(feed.job_ids(), vec![1, 5]);

    assert!(feed.undo_from(12, third, vec![TransmissionId(3)], true));
    assert_eq!(feed.job_ids(), vec![1, 3, 5]);
}
