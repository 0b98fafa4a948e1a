//! Execute correlation on an outbound session: completion by
//! Application-UUID, interruption by channel hangup.

use esl_mock::{MockOutboundLeg, OutboundLegConfig};
use std::time::Duration;
use switchboard::{EslError, OutboundOptions, Session};
use tokio::net::TcpListener;

/// Accept one mock FreeSWITCH leg and build a session over it.
async fn session_with_leg(auto_complete: bool) -> (Session, MockOutboundLeg) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let leg_config = OutboundLegConfig {
        auto_complete_executes: auto_complete,
        ..OutboundLegConfig::default()
    };
    let (leg, accepted) = tokio::join!(
        async { MockOutboundLeg::dial(&addr, leg_config).await.unwrap() },
        async { listener.accept().await.unwrap().0 },
    );
    let session = Session::start(accepted, OutboundOptions::default())
        .await
        .unwrap();
    (session, leg)
}

/// Happy path: the execute resolves when CHANNEL_EXECUTE_COMPLETE with
/// the matching Application-UUID arrives.
#[tokio::test]
async fn execute_resolves_on_completion_event() {
    let (session, leg) = session_with_leg(true).await;

    let mut result = session.playback("/tmp/welcome.wav").await.unwrap();
    assert!(result.reply_ok());
    let completion = result.complete().await.unwrap();
    assert_eq!(completion.event_name(), Some("CHANNEL_EXECUTE_COMPLETE"));

    let sendmsg = leg
        .wait_for_command("sendmsg", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(sendmsg.contains("call-command: execute"));
    assert!(sendmsg.contains("execute-app-name: playback"));
    assert!(sendmsg.contains("execute-app-arg: /tmp/welcome.wav"));
    assert!(sendmsg.contains("Event-UUID: "));

    session.stop().await;
}

/// S5: a CHANNEL_HANGUP on the channel before the completion aborts the
/// execute with OperationInterrupted carrying both UUIDs.
#[tokio::test]
async fn hangup_interrupts_pending_execute() {
    let (session, leg) = session_with_leg(false).await;
    let channel = session.channel_a().expect("A-leg materialized");
    let uuid = channel.uuid().unwrap().to_owned();

    let execute = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.playback("/tmp/endless.wav").await })
    };

    // Wait until the execute hit the wire, then hang the channel up.
    leg.wait_for_command("sendmsg", Duration::from_secs(2))
        .await
        .expect("execute must reach freeswitch");
    leg.send_event(&format!(
        "Event-Name: CHANNEL_HANGUP\nUnique-ID: {uuid}\nChannel-Call-State: HANGUP\n\
         Hangup-Cause: NORMAL_CLEARING\n"
    ))
    .await
    .unwrap();

    let err = execute
        .await
        .unwrap()
        .expect_err("execute must be interrupted");
    match err {
        EslError::OperationInterrupted {
            app_uuid,
            channel_uuid,
        } => {
            assert!(!app_uuid.is_empty());
            assert_eq!(channel_uuid, uuid);
        }
        other => panic!("expected OperationInterrupted, got {other:?}"),
    }

    session.stop().await;
}

/// A completion for a different Application-UUID must not resolve the
/// pending execute.
#[tokio::test]
async fn foreign_completion_is_ignored() {
    let (session, leg) = session_with_leg(false).await;
    let channel = session.channel_a().unwrap();
    let uuid = channel.uuid().unwrap().to_owned();

    let execute = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .execute_within("playback", Some("/tmp/a.wav"), Duration::from_millis(400))
                .await
        })
    };

    leg.wait_for_command("sendmsg", Duration::from_secs(2))
        .await
        .unwrap();
    leg.send_event(&format!(
        "Event-Name: CHANNEL_EXECUTE_COMPLETE\nUnique-ID: {uuid}\n\
         Application: playback\nApplication-UUID: some-other-apps-uuid\n"
    ))
    .await
    .unwrap();

    let err = execute.await.unwrap().expect_err("must time out instead");
    assert!(matches!(err, EslError::Timeout(_)), "got: {err:?}");

    session.stop().await;
}
