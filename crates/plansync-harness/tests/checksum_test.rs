//! Replica verification: clients poll the server's fingerprints, report a
//! divergence once and recover by re-fetching the scenario.

use std::time::Duration;

use plansync_client::{ClientAction, ClientEvent};
use plansync_core::{Environment, ScenarioEvent};
use plansync_harness::{Job, PlanCommand, SimWorld, WorldConfig};
use plansync_proto::{Target, TransmissionBody};

const POLL: Duration = Duration::from_secs(10);

fn add(id: u64, resource: u32, start_ms: u64) -> TransmissionBody {
    PlanCommand::AddJob { id, job: Job::new(resource, start_ms, 10) }.body().expect("encode")
}

/// Every transmission is fingerprinted on both sides.
fn checked_config() -> WorldConfig {
    let mut config = WorldConfig::default();
    config.driver.registry.scenario.checksum.every = 1;
    config.client.registry.scenario.checksum.every = 1;
    config
}

fn opened(config: WorldConfig) -> SimWorld {
    let mut world = SimWorld::new(config).expect("world");
    let live = world.production();
    world.open(0, live).expect("open");
    world.open(1, live).expect("open");
    world
}

fn desyncs(actions: &[ClientAction]) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, ClientAction::Event(ScenarioEvent::Desynchronized { .. })))
        .count()
}

#[test]
fn matching_replicas_poll_quietly() {
    let mut world = opened(checked_config());
    let live = world.production();
    world.submit(0, Target::Live, add(1, 1, 0)).expect("submit");
    assert!(world.client(1).poll_deadline().is_some(), "applied transmission awaits verification");

    world.settle_checksums(10).expect("settle");

    assert_eq!(desyncs(world.observed(0)), 0);
    assert_eq!(desyncs(world.observed(1)), 0);
    world.check_converged(live).expect("converged");
}

#[test]
fn poll_waits_for_the_interval() {
    let mut world = opened(checked_config());
    world.submit(0, Target::Live, add(1, 1, 0)).expect("submit");
    let deadline = world.client(1).poll_deadline().expect("armed");

    world.tick(POLL / 2).expect("tick");
    assert_eq!(world.client(1).poll_deadline(), Some(deadline), "not yet due");

    world.tick(POLL / 2).expect("tick");
    assert_ne!(world.client(1).poll_deadline(), Some(deadline));
}

#[test]
fn diverged_replica_reports_once_and_reloads() {
    let mut world = opened(checked_config());
    let live = world.production();
    world.diverge(1, live, add(99, 5, 0)).expect("diverge");

    world.submit(0, Target::Live, add(1, 1, 0)).expect("submit");
    world.settle_checksums(10).expect("settle");

    assert_eq!(desyncs(world.observed(0)), 0);
    assert_eq!(desyncs(world.observed(1)), 1);
    assert!(world.client(1).is_resident(live));
    assert!(world.client_detail(1, live).expect("replica").job(99).is_none());
    world.check_converged(live).expect("converged");
}

#[test]
fn transmissions_in_flight_during_reload_are_not_applied_twice() {
    let mut world = opened(checked_config());
    let live = world.production();
    world.diverge(1, live, add(99, 5, 0)).expect("diverge");
    world.submit(0, Target::Live, add(1, 1, 0)).expect("submit");

    // Client 1 polls; client 0 submits before the answer is processed. The
    // edit reaches client 1 while its image is being fetched and is already
    // contained in that image.
    world.env().advance(POLL);
    let now = world.env().now();
    world.client_event(1, ClientEvent::Tick { now }).expect("tick");
    world.submit_only(0, Target::Live, add(2, 2, 0)).expect("submit");
    world.deliver_all().expect("deliver");

    assert_eq!(desyncs(world.observed(1)), 1);
    assert!(
        !world.observed(1).iter().any(|a| matches!(a, ClientAction::Rejected { .. })),
        "queued edit skipped, not re-applied"
    );
    let replica = world.client_detail(1, live).expect("replica");
    assert!(replica.job(2).is_some());
    world.check_converged(live).expect("converged");
}

#[test]
fn checksum_the_server_never_has_is_abandoned() {
    let mut config = WorldConfig::default();
    config.driver.registry.scenario.checksum.every = 0;
    config.driver.registry.scenario.checksum.after_simulation = false;
    config.client.registry.scenario.checksum.every = 1;
    config.client.registry.scenario.checksum.max_attempts = 2;
    config.client.registry.scenario.checksum.rotate_every = 0;
    let mut world = opened(config);
    world.submit(0, Target::Live, add(1, 1, 0)).expect("submit");

    world.settle_checksums(10).expect("settle");

    let lost: Vec<u32> = world
        .observed(1)
        .iter()
        .filter_map(|a| match a {
            ClientAction::Event(ScenarioEvent::ChecksumLost { attempts, .. }) => Some(*attempts),
            _ => None,
        })
        .collect();
    assert_eq!(lost, vec![3]);
    assert_eq!(desyncs(world.observed(1)), 0);
}
