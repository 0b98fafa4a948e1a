//! Originate over an outbound session: wire shape, success registration,
//! `-ERR` failure surfaced as `OriginateError` with context.

use esl_mock::{MockOutboundLeg, OutboundLegConfig};
use std::time::Duration;
use switchboard::{EslError, OutboundOptions, Session};
use tokio::net::TcpListener;

async fn session_with_leg() -> (Session, MockOutboundLeg) {
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
    let session = Session::start(accepted, OutboundOptions::default())
        .await
        .unwrap();
    (session, leg)
}

/// Extract the Job-UUID of the first originate bgapi on the wire.
async fn originate_job_uuid(leg: &MockOutboundLeg) -> String {
    let bgapi = leg
        .wait_for_command("bgapi originate", Duration::from_secs(2))
        .await
        .expect("originate must hit the wire");
    bgapi
        .lines()
        .find_map(|l| l.strip_prefix("Job-UUID: "))
        .expect("bgapi carries a Job-UUID header")
        .to_owned()
}

#[tokio::test]
async fn originate_registers_the_new_leg() {
    let (session, leg) = session_with_leg().await;
    let new_uuid = "cafe0000-0000-0000-0000-000000000003".to_owned();

    let originate = {
        let session = session.clone();
        let new_uuid = new_uuid.clone();
        tokio::spawn(async move {
            session
                .originate("user/3000", Some(new_uuid), None, None, "park")
                .await
        })
    };

    let job_uuid = originate_job_uuid(&leg).await;
    let bgapi = leg
        .wait_for_command("bgapi originate", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(bgapi.starts_with(&format!(
        "bgapi originate {{origination_uuid='{new_uuid}'}}user/3000 &park"
    )));
    // The leg's events were filtered in before the dial.
    assert!(
        leg.commands()
            .iter()
            .any(|c| c == &format!("filter Unique-ID {new_uuid}"))
    );

    let body = format!(
        "Job-UUID: {job_uuid}\nEvent-Name: BACKGROUND_JOB\nContent-Length: 41\n\n+OK {new_uuid}\n"
    );
    leg.send_event(&body).await.unwrap();

    let channel = originate.await.unwrap().expect("originate succeeds");
    assert_eq!(channel.uuid(), Some(new_uuid.as_str()));
    assert!(session.channel(&new_uuid).is_some());

    session.stop().await;
}

/// `Channel::originate` is the primitive; the session method is only a
/// convenience wrapper over it.
#[tokio::test]
async fn channel_originate_is_callable_directly() {
    let (session, leg) = session_with_leg().await;

    let originate = {
        let session = session.clone();
        tokio::spawn(async move {
            switchboard::Channel::originate(&session, "user/3002", None, None, None, "park").await
        })
    };

    let job_uuid = originate_job_uuid(&leg).await;
    let body = format!(
        "Job-UUID: {job_uuid}\nEvent-Name: BACKGROUND_JOB\nContent-Length: 4\n\n+OK\n"
    );
    leg.send_event(&body).await.unwrap();

    let channel = originate.await.unwrap().expect("originate succeeds");
    assert!(session.channel(channel.uuid().unwrap()).is_some());

    session.stop().await;
}

#[tokio::test]
async fn originate_failure_carries_destination_and_vars() {
    let (session, leg) = session_with_leg().await;

    let originate = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut vars = esl_wire::VarMap::new();
            vars.set("ignore_early_media", true);
            session
                .originate("user/9999", None, Some(&vars), None, "park")
                .await
        })
    };

    let job_uuid = originate_job_uuid(&leg).await;
    let body = format!(
        "Job-UUID: {job_uuid}\nEvent-Name: BACKGROUND_JOB\nContent-Length: 26\n\n-ERR NO_ROUTE_DESTINATION\n"
    );
    leg.send_event(&body).await.unwrap();

    let err = originate
        .await
        .unwrap()
        .expect_err("-ERR job must fail the originate");
    match err {
        EslError::Originate {
            message,
            destination,
            variables,
        } => {
            assert!(message.starts_with("-ERR"));
            assert_eq!(destination, "user/9999");
            assert!(variables.contains_key("ignore_early_media"));
            assert!(variables.contains_key("origination_uuid"));
        }
        other => panic!("expected OriginateError, got {other:?}"),
    }
    // The failed leg is not left registered.
    assert_eq!(session.channel_count(), 1);

    session.stop().await;
}

/// Custom timeout rides at the end of the originate command.
#[tokio::test]
async fn originate_timeout_is_forwarded() {
    let (session, leg) = session_with_leg().await;

    let originate = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .originate(
                    "user/3001",
                    None,
                    None,
                    Some(Duration::from_secs(45)),
                    "park",
                )
                .await
        })
    };

    let job_uuid = originate_job_uuid(&leg).await;
    let bgapi = leg
        .wait_for_command("bgapi originate", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(bgapi.lines().next().unwrap().ends_with("&park timeout=45"));

    let body = format!(
        "Job-UUID: {job_uuid}\nEvent-Name: BACKGROUND_JOB\nContent-Length: 4\n\n+OK\n"
    );
    leg.send_event(&body).await.unwrap();
    originate.await.unwrap().unwrap();

    session.stop().await;
}
