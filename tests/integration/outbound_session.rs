//! Outbound session lifecycle: handshake commands, lazy A-leg
//! materialization from the connect reply, destroy garbage collection,
//! DTMF handlers, and the accept server.

use esl_mock::{MockOutboundLeg, OutboundLegConfig};
use esl_wire::ChannelState;
use std::time::Duration;
use switchboard::{Outbound, OutboundOptions, Session};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn session_with_leg(options: OutboundOptions) -> (Session, MockOutboundLeg) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (leg, accepted) = tokio::join!(
        async {
            MockOutboundLeg::dial(&addr, OutboundLegConfig::default())
                .await
                .unwrap()
        },
        async { listener.accept().await.unwrap().0 },
    );
    let session = Session::start(accepted, options).await.unwrap();
    (session, leg)
}

/// The handshake runs connect → linger → event plain ALL → filter.
#[tokio::test]
async fn handshake_command_sequence() {
    let (session, leg) = session_with_leg(OutboundOptions::default()).await;
    let uuid = session.uuid().unwrap();

    let commands = leg.commands();
    assert_eq!(commands[0], "connect");
    assert_eq!(commands[1], "linger");
    assert_eq!(commands[2], "event plain ALL");
    assert_eq!(commands[3], format!("filter Unique-ID {uuid}"));

    session.stop().await;
}

/// `myevents` replaces the ALL subscription and the explicit filter.
#[tokio::test]
async fn myevents_handshake() {
    let options = OutboundOptions {
        myevents: true,
        ..OutboundOptions::default()
    };
    let (session, leg) = session_with_leg(options).await;

    let commands = leg.commands();
    assert!(commands.contains(&"myevents".to_owned()));
    assert!(!commands.iter().any(|c| c.starts_with("event plain")));
    assert!(!commands.iter().any(|c| c.starts_with("filter ")));

    session.stop().await;
}

/// The A-leg materializes from the connect reply: it is not named
/// CHANNEL_CREATE, but it carries the channel context.
#[tokio::test]
async fn a_leg_materializes_from_connect_reply() {
    let (session, leg) = session_with_leg(OutboundOptions::default()).await;

    assert_eq!(session.uuid().as_deref(), Some(leg.uuid()));
    let channel = session.channel_a().expect("A-leg exists");
    assert_eq!(channel.uuid(), Some(leg.uuid()));
    assert_eq!(channel.state(), ChannelState::Execute);
    assert_eq!(
        channel.variable("Caller-Caller-ID-Number").as_deref(),
        Some("1000")
    );

    session.stop().await;
}

/// New UUIDs seen in CHANNEL_CREATE become B-leg channels; destroy
/// removes them again.
#[tokio::test]
async fn b_leg_lifecycle() {
    let (session, leg) = session_with_leg(OutboundOptions::default()).await;
    let b_uuid = "b1b1b1b1-0000-0000-0000-000000000001";

    leg.send_event(&format!(
        "Event-Name: CHANNEL_CREATE\nUnique-ID: {b_uuid}\nChannel-State: CS_INIT\n\
         Channel-State-Number: 1\n"
    ))
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if session.channel(b_uuid).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("B-leg must be created");
    assert_eq!(session.channel_count(), 2);

    leg.send_event(&format!(
        "Event-Name: CHANNEL_DESTROY\nUnique-ID: {b_uuid}\nChannel-State: CS_DESTROY\n\
         Channel-State-Number: 12\n"
    ))
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if session.channel(b_uuid).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("B-leg must be garbage-collected");
    // The A-leg is untouched.
    assert!(session.channel_a().is_some());

    session.stop().await;
}

/// Destroying the A-leg clears the session's A-leg reference.
#[tokio::test]
async fn a_leg_destroy_clears_reference() {
    let (session, leg) = session_with_leg(OutboundOptions::default()).await;
    let uuid = leg.uuid().to_owned();

    leg.send_event(&format!(
        "Event-Name: CHANNEL_DESTROY\nUnique-ID: {uuid}\nChannel-State: CS_DESTROY\n\
         Channel-State-Number: 12\n"
    ))
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if session.channel_a().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("A-leg reference must clear on destroy");

    session.stop().await;
}

/// DTMF handlers fire per digit; unfiltered handlers see every digit.
#[tokio::test]
async fn dtmf_handlers() {
    let (session, leg) = session_with_leg(OutboundOptions::default()).await;
    let channel = session.channel_a().unwrap();
    let uuid = channel.uuid().unwrap().to_owned();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let any_tx = tx.clone();
    channel.on_dtmf(None, move |digit| {
        let tx = any_tx.clone();
        async move {
            let _ = tx.send(format!("any:{digit}"));
        }
    });
    let one_tx = tx.clone();
    channel.on_dtmf(Some('1'), move |digit| {
        let tx = one_tx.clone();
        async move {
            let _ = tx.send(format!("one:{digit}"));
        }
    });

    leg.send_event(&format!(
        "Event-Name: DTMF\nDTMF-Digit: 1\nUnique-ID: {uuid}\n"
    ))
    .await
    .unwrap();

    let mut got = Vec::new();
    for _ in 0..2 {
        got.push(
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    got.sort();
    assert_eq!(got, ["any:1", "one:1"]);

    leg.send_event("Event-Name: DTMF\nDTMF-Digit: 5\n").await.unwrap();
    let only_any = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(only_any, "any:5");

    session.stop().await;
}

/// The accept server hands each call to the handler as a ready session.
#[tokio::test]
async fn outbound_server_invokes_handler() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Outbound::bind("127.0.0.1:0", OutboundOptions::default(), move |session| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(session.uuid());
            session.channel_a().expect("A-leg ready before handler runs");
        }
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(server.run());

    let leg = MockOutboundLeg::dial(&addr, OutboundLegConfig::default())
        .await
        .unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.as_deref(), Some(leg.uuid()));
}
