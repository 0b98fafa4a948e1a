//! Consumer sugar: subscription, per-key server-side filters, handler
//! delivery, stop.

use esl_mock::MockFreeswitch;
use std::sync::Arc;
use std::time::Duration;
use switchboard::{Consumer, EventHandler, InboundConfig};
use tokio::sync::mpsc;

fn config_for(server: &MockFreeswitch) -> InboundConfig {
    InboundConfig {
        host: server.host(),
        port: server.port(),
        password: "ClueCon".to_owned(),
        connect_timeout_ms: 2000,
    }
}

#[tokio::test]
async fn consumer_subscribes_and_filters_per_key() {
    let server = MockFreeswitch::start().await.unwrap();
    let consumer = Arc::new(Consumer::new(config_for(&server)));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let heartbeat_tx = tx.clone();
    consumer.handle(
        "HEARTBEAT",
        EventHandler::task(move |_| {
            let tx = heartbeat_tx.clone();
            async move {
                let _ = tx.send("heartbeat");
            }
        }),
    );
    let register_tx = tx.clone();
    consumer.handle(
        "sofia::register",
        EventHandler::task(move |_| {
            let tx = register_tx.clone();
            async move {
                let _ = tx.send("register");
            }
        }),
    );

    let runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.start().await })
    };

    // Subscription plus one filter per registered key.
    server
        .wait_for_command("events plain ALL", Duration::from_secs(2))
        .await
        .expect("events subscription");
    server
        .wait_for_command("filter Event-Name HEARTBEAT", Duration::from_secs(2))
        .await
        .expect("event-name filter for upper-case key");
    server
        .wait_for_command("filter Event-Subclass sofia::register", Duration::from_secs(2))
        .await
        .expect("subclass filter for CUSTOM key");

    server.send_event("Event-Name: HEARTBEAT\n");
    server.send_event(
        "Event-Name: CUSTOM\nEvent-Subclass: sofia::register\nCore-UUID: abc\n",
    );

    let mut got = Vec::new();
    for _ in 0..2 {
        got.push(
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    got.sort_unstable();
    assert_eq!(got, ["heartbeat", "register"]);

    consumer.stop().await;
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("start() must return after stop")
        .unwrap()
        .unwrap();
}
