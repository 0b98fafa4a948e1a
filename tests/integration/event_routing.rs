//! Event routing through a live connection: channel-table precedence,
//! wildcard delivery, DTMF handlers.

use esl_mock::MockFreeswitch;
use std::time::Duration;
use switchboard::{EventHandler, Inbound};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn connected_client(server: &MockFreeswitch) -> Inbound {
    // Opt-in tracing for debugging: RUST_LOG=switchboard=trace cargo test
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Inbound::connect(&server.host(), server.port(), "ClueCon", TIMEOUT)
        .await
        .unwrap()
}

fn recorder(
    tx: mpsc::UnboundedSender<&'static str>,
    tag: &'static str,
) -> EventHandler {
    EventHandler::task(move |_| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(tag);
        }
    })
}

/// A channel-scoped handler is authoritative: the global handler for the
/// same event name must not run for that channel's events.
#[tokio::test]
async fn channel_routing_beats_global_routing() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;
    let conn = client.connection();

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.on("CHANNEL_ANSWER", recorder(tx.clone(), "global"));
    conn.on_channel("leg-1", "CHANNEL_ANSWER", recorder(tx.clone(), "channel"));

    server.send_event("Event-Name: CHANNEL_ANSWER\nUnique-ID: leg-1\n");

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(first, Some("channel"));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "global handler must not fire"
    );

    // A different leg's event falls through to the global table.
    server.send_event("Event-Name: CHANNEL_ANSWER\nUnique-ID: leg-2\n");
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(second, Some("global"));
}

/// CUSTOM events route under their subclass.
#[tokio::test]
async fn custom_events_route_by_subclass() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("sofia::register", recorder(tx, "registered"));

    server.send_event(
        "Event-Name: CUSTOM\nEvent-Subclass: sofia::register\nCore-UUID: abc\n",
    );
    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(got, Some("registered"));
}

/// Wildcard handlers see every event.
#[tokio::test]
async fn wildcard_sees_every_event() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("*", recorder(tx, "any"));

    server.send_event("Event-Name: HEARTBEAT\n");
    server.send_event("Event-Name: RELOADXML\n");

    for _ in 0..2 {
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some("any"));
    }
}

/// Removal is idempotent and actually stops delivery.
#[tokio::test]
async fn removed_handlers_stop_firing() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = client.on("HEARTBEAT", recorder(tx, "beat"));
    client.remove("HEARTBEAT", id);
    client.remove("HEARTBEAT", id);

    server.send_event("Event-Name: HEARTBEAT\n");
    assert!(
        tokio::time::timeout(Duration::from_millis(150), rx.recv())
            .await
            .is_err()
    );
}
