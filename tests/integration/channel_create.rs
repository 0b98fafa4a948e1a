//! Channel creation over an inbound connection: create_uuid + originate
//! wire shape, state tracking from events, terminal-channel rules.

use esl_mock::MockFreeswitch;
use esl_wire::ChannelState;
use std::time::Duration;
use switchboard::{BridgeTarget, Channel, EslError, Inbound};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn connected_client(server: &MockFreeswitch) -> Inbound {
    Inbound::connect(&server.host(), server.port(), "ClueCon", TIMEOUT)
        .await
        .unwrap()
}

/// The exact originate command appears on the wire:
/// `api originate {origination_uuid=<uuid>,return_ring_ready=true}user/1000 &park()`.
#[tokio::test]
async fn create_issues_create_uuid_then_originate() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let channel = Channel::create(client.connection(), "user/1000", None)
        .await
        .unwrap();
    let uuid = channel.uuid().expect("channel has the server-assigned uuid");

    let commands = server.commands();
    assert!(commands.iter().any(|c| c == "api create_uuid"));
    assert!(commands.iter().any(|c| c == &format!("filter Unique-ID {uuid}")));
    let expected = format!(
        "api originate {{origination_uuid={uuid},return_ring_ready=true}}user/1000 &park()"
    );
    assert!(
        commands.iter().any(|c| c == &expected),
        "missing originate; trace: {commands:#?}"
    );
}

/// Custom variables ride along in the originate option list, after the
/// defaults, without overriding them.
#[tokio::test]
async fn create_keeps_default_variables_first() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let mut vars = esl_wire::VarMap::new();
    vars.set("ignore_early_media", true);
    let channel = Channel::create(client.connection(), "user/1001", Some(&vars))
        .await
        .unwrap();
    let uuid = channel.uuid().unwrap();

    let originate = server
        .commands()
        .into_iter()
        .find(|c| c.starts_with("api originate "))
        .unwrap();
    assert_eq!(
        originate,
        format!(
            "api originate {{origination_uuid={uuid},return_ring_ready=true,\
             ignore_early_media=true}}user/1001 &park()"
        )
    );
}

/// CHANNEL_STATE events drive the channel's state machine.
#[tokio::test]
async fn state_updates_from_events() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let channel = Channel::create(client.connection(), "user/1000", None)
        .await
        .unwrap();
    let uuid = channel.uuid().unwrap().to_owned();
    assert_eq!(channel.state(), ChannelState::New);

    server.send_event(&format!(
        "Event-Name: CHANNEL_STATE\nUnique-ID: {uuid}\nChannel-State: CS_ROUTING\n\
         Channel-State-Number: 2\nChannel-Call-State: RINGING\nvariable_test_key: hello\n"
    ));

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if channel.state() == ChannelState::Routing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state must reach ROUTING");
    assert_eq!(channel.variable("test_key").as_deref(), Some("hello"));
}

/// Waiting for EXECUTE needs both the state and a CHANNEL_ANSWER,
/// in either order.
#[tokio::test]
async fn wait_for_execute_requires_answer() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let channel = Channel::create(client.connection(), "user/1000", None)
        .await
        .unwrap();
    let uuid = channel.uuid().unwrap().to_owned();

    let waiter = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .wait_for_state(ChannelState::Execute, Duration::from_secs(3))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // EXECUTE alone must not resolve the wait.
    server.send_event(&format!(
        "Event-Name: CHANNEL_STATE\nUnique-ID: {uuid}\nChannel-State: CS_EXECUTE\n\
         Channel-State-Number: 4\n"
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished(), "EXECUTE without answer must keep waiting");

    server.send_event(&format!("Event-Name: CHANNEL_ANSWER\nUnique-ID: {uuid}\n"));
    let event = waiter.await.unwrap().unwrap();
    assert!(event.is_some(), "wait resolves once answered");
}

/// Terminal channel: hangup is a synthetic `+OK` no-op, bridge refuses.
#[tokio::test]
async fn terminal_channel_rules() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let channel = Channel::create(client.connection(), "user/1000", None)
        .await
        .unwrap();
    let other = Channel::create(client.connection(), "user/1001", None)
        .await
        .unwrap();
    let uuid = channel.uuid().unwrap().to_owned();

    server.send_event(&format!(
        "Event-Name: CHANNEL_STATE\nUnique-ID: {uuid}\nChannel-State: CS_HANGUP\n\
         Channel-State-Number: 10\nChannel-Call-State: HANGUP\n"
    ));
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if channel.is_gone() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("channel must go terminal");

    let commands_before = server.commands().len();
    let mut result = channel.hangup("NORMAL_CLEARING").await.unwrap();
    assert!(result.reply_ok());
    let reply = result.complete().await.unwrap();
    assert!(reply.reply_text().unwrap().starts_with("+OK"));
    // No wire command was emitted for the synthetic hangup.
    assert_eq!(server.commands().len(), commands_before);

    let err = channel
        .bridge(BridgeTarget::Leg(&other), None)
        .await
        .expect_err("bridge on a terminal channel must fail");
    assert!(matches!(err, EslError::Channel(_)), "got: {err:?}");
}

/// DTMF waits are intentionally unscoped: the event resolves the wait
/// even without a `Unique-ID`.
#[tokio::test]
async fn wait_for_dtmf_is_not_uuid_filtered() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let channel = Channel::create(client.connection(), "user/1000", None)
        .await
        .unwrap();

    let waiter = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.wait_for_event("DTMF", Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.send_event("Event-Name: DTMF\nDTMF-Digit: 7\n");
    let event = waiter.await.unwrap().unwrap();
    assert_eq!(event.get("DTMF-Digit"), Some("7"));
}

/// CHANNEL_HANGUP_COMPLETE waits are scoped: a different leg's event must
/// not resolve them.
#[tokio::test]
async fn wait_for_hangup_complete_is_uuid_filtered() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let channel = Channel::create(client.connection(), "user/1000", None)
        .await
        .unwrap();
    let uuid = channel.uuid().unwrap().to_owned();

    let waiter = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .wait_for_event("CHANNEL_HANGUP_COMPLETE", Duration::from_secs(3))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A foreign leg's hangup is ignored.
    server.send_event(
        "Event-Name: CHANNEL_HANGUP_COMPLETE\nUnique-ID: somebody-else\n\
         Hangup-Cause: NORMAL_CLEARING\n",
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    server.send_event(&format!(
        "Event-Name: CHANNEL_HANGUP_COMPLETE\nUnique-ID: {uuid}\n\
         Hangup-Cause: NORMAL_CLEARING\n"
    ));
    let event = waiter.await.unwrap().unwrap();
    assert_eq!(event.get("Hangup-Cause"), Some("NORMAL_CLEARING"));
}

/// `uuid_kill` is the inbound hangup translation.
#[tokio::test]
async fn live_channel_hangup_uses_uuid_kill() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let channel = Channel::create(client.connection(), "user/1000", None)
        .await
        .unwrap();
    let uuid = channel.uuid().unwrap().to_owned();

    channel.hangup("USER_BUSY").await.unwrap();
    assert!(
        server
            .commands()
            .iter()
            .any(|c| c == &format!("api uuid_kill {uuid} USER_BUSY"))
    );
}
