//! Scenario lifecycle across server and clients: create, promote, unload,
//! delete.

use plansync_client::{ClientAction, ClientEvent};
use plansync_core::RegistryEvent;
use plansync_harness::{Job, PlanCommand, SimWorld, WorldConfig};
use plansync_proto::{
    CopyScenario, NewScenario, ScenarioId, ScenarioKind, Target, TransmissionBody,
};

fn add(id: u64, resource: u32, start_ms: u64) -> TransmissionBody {
    PlanCommand::AddJob { id, job: Job::new(resource, start_ms, 10) }.body().expect("encode")
}

fn opened_world() -> SimWorld {
    let mut world = SimWorld::new(WorldConfig::default()).expect("world");
    let live = world.production();
    world.open(0, live).expect("open");
    world.open(1, live).expect("open");
    world
}

/// Scenario a client was handed that is not `except`.
fn added_scenario(world: &SimWorld, index: usize, except: ScenarioId) -> ScenarioId {
    world
        .observed(index)
        .iter()
        .find_map(|action| match action {
            ClientAction::ScenarioLoaded { scenario } if *scenario != except => Some(*scenario),
            _ => None,
        })
        .expect("a new scenario was loaded")
}

fn what_if(world: &mut SimWorld) -> ScenarioId {
    let live = world.production();
    world
        .submit(
            0,
            Target::Live,
            TransmissionBody::NewScenario(NewScenario {
                name: "What-if".to_string(),
                kind: ScenarioKind::WhatIf,
                production: false,
                compare: false,
            }),
        )
        .expect("submit");
    added_scenario(world, 0, live)
}

#[test]
fn created_scenario_is_pushed_to_every_session() {
    let mut world = opened_world();
    let live = world.production();

    let created = what_if(&mut world);

    assert_ne!(created, live);
    assert!(world.server().registry().get(created).is_some());
    for index in 0..world.client_count() {
        assert!(world.client(index).is_resident(created), "client {index}");
        assert!(world.client(index).known_scenarios().contains(&created));
    }
    assert_eq!(world.server().viewers().viewer_count(created), 2);

    world.submit(1, Target::Scenario(created), add(1, 1, 0)).expect("submit");
    world.check_converged(created).expect("converged");
    assert!(world.server_detail(live).expect("live").jobs().is_empty());
}

#[test]
fn copy_carries_source_jobs() {
    let mut world = opened_world();
    let live = world.production();
    world.submit(0, Target::Live, add(1, 1, 0)).expect("submit");

    world
        .submit(
            1,
            Target::Live,
            TransmissionBody::CopyScenario(CopyScenario {
                name: "Copy".to_string(),
                kind: ScenarioKind::WhatIf,
                ..CopyScenario::default()
            }),
        )
        .expect("submit");

    let copy = added_scenario(&world, 1, live);
    let replica = world.client_detail(0, copy).expect("resident copy");
    assert!(replica.job(1).is_some());
    assert!(!world.server().registry().get(copy).expect("copy").is_production());
    world.check_converged(copy).expect("converged");
}

#[test]
fn promotion_moves_the_flag_on_every_replica() {
    let mut world = opened_world();
    let live = world.production();
    let created = what_if(&mut world);

    world.submit(1, Target::Scenario(created), TransmissionBody::PromoteToProduction).expect("submit");

    assert_eq!(world.server().registry().production(), Some(created));
    for index in 0..world.client_count() {
        let client = world.client(index);
        assert_eq!(client.production(), Some(created), "client {index}");
        let old = client.registry().get(live).expect("live still resident");
        assert!(!old.is_production(), "client {index} cleared the old flag");
        assert!(client.registry().get(created).expect("resident").is_production());
    }
}

#[test]
fn delete_is_refused_while_another_session_views() {
    let mut world = opened_world();
    let created = what_if(&mut world);

    world.submit(0, Target::Scenario(created), TransmissionBody::DeleteScenario).expect("submit");

    assert!(
        world.observed(0).iter().any(|a| matches!(a, ClientAction::Rejected { .. })),
        "client 1 still views it"
    );
    assert!(world.server().registry().get(created).is_some());
}

#[test]
fn delete_after_others_unload_removes_it_everywhere() {
    let mut world = opened_world();
    let created = what_if(&mut world);

    world.client_event(1, ClientEvent::Unload { scenario: created }).expect("unload");
    world.deliver_all().expect("deliver");
    assert!(!world.client(1).is_resident(created));
    assert!(world.server().registry().get(created).is_some(), "unload is local");
    assert_eq!(world.server().viewers().viewer_count(created), 1);

    world.submit(0, Target::Scenario(created), TransmissionBody::DeleteScenario).expect("submit");

    assert!(world.server().registry().get(created).is_none());
    assert!(
        world
            .observed(0)
            .iter()
            .any(|a| *a == ClientAction::Lifecycle(RegistryEvent::Deleted(created)))
    );
    for index in 0..world.client_count() {
        let client = world.client(index);
        assert!(!client.is_resident(created));
        assert!(!client.known_scenarios().contains(&created), "client {index}");
        assert!(client.registry().get(created).is_none());
    }
}

#[test]
fn production_cannot_be_deleted() {
    let mut world = SimWorld::new(WorldConfig::default()).expect("world");
    let live = world.production();
    world.open(0, live).expect("open");

    world.submit(0, Target::Live, TransmissionBody::DeleteScenario).expect("submit");

    assert!(world.observed(0).iter().any(|a| matches!(a, ClientAction::Rejected { .. })));
    assert_eq!(world.server().registry().production(), Some(live));
}

#[test]
fn closed_session_stops_receiving() {
    let mut world = opened_world();
    let live = world.production();
    world.disconnect(1).expect("disconnect");

    world.submit(0, Target::Live, add(1, 1, 0)).expect("submit");

    assert_eq!(world.server().session_count(), 1);
    assert!(world.client_detail(1, live).expect("stale replica").jobs().is_empty());
    assert_eq!(world.client_detail(0, live).expect("replica").jobs().len(), 1);
}

#[test]
fn copy_mutate_delete_leaves_production_and_counts_as_before() {
    let mut world = opened_world();
    let live = world.production();
    world.submit(0, Target::Live, add(1, 1, 0)).expect("submit");
    let loaded_before = world.server().registry().len();
    let replicas_before: Vec<usize> =
        (0..world.client_count()).map(|index| world.client(index).registry().len()).collect();

    world
        .submit(
            0,
            Target::Live,
            TransmissionBody::CopyScenario(CopyScenario {
                name: "Trial".to_string(),
                kind: ScenarioKind::WhatIf,
                ..CopyScenario::default()
            }),
        )
        .expect("submit");
    let copy = added_scenario(&world, 0, live);
    assert_eq!(world.server().registry().len(), loaded_before + 1);

    world.submit(0, Target::Scenario(copy), add(2, 1, 100)).expect("submit");
    world.check_converged(copy).expect("converged");
    assert!(world.server_detail(copy).expect("copy").job(2).is_some());
    assert!(world.server_detail(live).expect("live").job(2).is_none());

    world.client_event(1, ClientEvent::Unload { scenario: copy }).expect("unload");
    world.deliver_all().expect("deliver");
    world.submit(0, Target::Scenario(copy), TransmissionBody::DeleteScenario).expect("submit");

    assert!(world.server().registry().get(copy).is_none());
    assert_eq!(world.server().registry().production(), Some(live));
    assert_eq!(world.server().registry().len(), loaded_before);
    for (index, before) in replicas_before.into_iter().enumerate() {
        let client = world.client(index);
        assert_eq!(client.production(), Some(live), "client {index}");
        assert_eq!(client.registry().len(), before, "client {index}");
    }
    world.check_converged(live).expect("converged");
}
