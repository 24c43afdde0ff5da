//! Production runtime over channels: startup recovery, action execution and
//! shutdown.

use std::time::Duration;

use plansync_core::{ClientMessage, ServerMessage};
use plansync_proto::{Target, Transmission, TransmissionBody, TransmissionHeader, TransmissionId, UserId};
use plansync_server::{DriverConfig, Outbound, Server, ServerError, ServerEvent, ServerRuntimeConfig};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn config(dir: &TempDir) -> ServerRuntimeConfig {
    ServerRuntimeConfig {
        checkpoint_dir: dir.path().join("checkpoints"),
        production_name: "Plant".to_string(),
        tick_interval: Duration::from_secs(3_600),
        driver: DriverConfig::default(),
    }
}

#[test]
fn zero_tick_interval_is_refused() {
    let dir = TempDir::new().expect("tempdir");
    let config = ServerRuntimeConfig { tick_interval: Duration::ZERO, ..config(&dir) };

    assert!(matches!(Server::open(config), Err(ServerError::Config(_))));
}

#[test]
fn open_creates_the_production_scenario() {
    let dir = TempDir::new().expect("tempdir");

    let server = Server::open(config(&dir)).expect("open");

    let registry = server.driver().registry();
    let production = registry.production().expect("production scenario");
    assert_eq!(registry.get(production).expect("loaded").summary().name, "Plant");
    assert!(dir.path().join("checkpoints").is_dir());
}

#[tokio::test]
async fn runtime_executes_driver_actions_until_input_closes() {
    let dir = TempDir::new().expect("tempdir");
    let server = Server::open(config(&dir)).expect("open");
    let live = server.driver().registry().production().expect("production");

    let (event_tx, event_rx) = mpsc::channel(16);
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let runtime = tokio::spawn(server.run(event_rx, out_tx));

    event_tx.send(ServerEvent::SessionOpened { session_id: 1, user: UserId(5) }).await.expect("send");
    event_tx
        .send(ServerEvent::MessageReceived { session_id: 1, message: ClientMessage::View(live) })
        .await
        .expect("send");
    let header = TransmissionHeader::new(TransmissionId(1), UserId(5), Target::Live);
    event_tx
        .send(ServerEvent::MessageReceived {
            session_id: 1,
            message: ClientMessage::Submit(Transmission::new(header, TransmissionBody::KpiUpdate)),
        })
        .await
        .expect("send");
    drop(event_tx);

    let mut received = Vec::new();
    while let Some(out) = out_rx.recv().await {
        received.push(out);
    }
    runtime.await.expect("join").expect("run");

    assert!(matches!(
        received.first(),
        Some(Outbound::Message { session_id: 1, message: ServerMessage::Welcome { production: Some(p), .. } }) if *p == live
    ));
    assert!(matches!(received.get(1), Some(Outbound::Message { message: ServerMessage::Snapshot { .. }, .. })));
    assert!(matches!(
        received.get(2),
        Some(Outbound::Message { message: ServerMessage::Transmission(t), .. })
            if t.header.number == 1 && t.header.target == Target::Scenario(live)
    ));
}

#[test]
fn outbound_lines_are_tagged_json() {
    let line = serde_json::to_string(&Outbound::Close { session_id: 3, reason: "full".to_string() })
        .expect("encode");
    assert_eq!(line, r#"{"Close":{"session_id":3,"reason":"full"}}"#);

    let event: ServerEvent =
        serde_json::from_str(r#"{"SessionOpened":{"session_id":2,"user":9}}"#).expect("decode");
    assert_eq!(event, ServerEvent::SessionOpened { session_id: 2, user: UserId(9) });
}
