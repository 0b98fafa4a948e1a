//! Background-job correlation: Job-UUID tracking, filter lifecycle,
//! mismatch adoption, shutdown cancellation.

use esl_mock::MockFreeswitch;
use std::time::Duration;
use switchboard::{EslError, Inbound};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn connected_client(server: &MockFreeswitch) -> Inbound {
    Inbound::connect(&server.host(), server.port(), "ClueCon", TIMEOUT)
        .await
        .unwrap()
}

fn background_job_body(job_uuid: &str, result: &str) -> String {
    format!(
        "Job-UUID: {job_uuid}\nJob-Command: status\nEvent-Name: BACKGROUND_JOB\n\
         Content-Length: {}\n\n{result}",
        result.len()
    )
}

/// A bgapi resolves with the body of its BACKGROUND_JOB event.
#[tokio::test]
async fn bgapi_resolves_with_job_body() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let mut job = client.bgapi("status").await.unwrap();
    let job_uuid = job.job_uuid().to_owned();

    // The filter precedes the command on the wire.
    let commands = server.commands();
    let filter_pos = commands
        .iter()
        .position(|c| c == &format!("filter Job-UUID {job_uuid}"))
        .expect("filter must be installed");
    let bgapi_pos = commands
        .iter()
        .position(|c| c.starts_with("bgapi status"))
        .expect("bgapi must be sent");
    assert!(filter_pos < bgapi_pos);
    assert!(commands[bgapi_pos].contains(&format!("Job-UUID: {job_uuid}")));

    server.send_event(&background_job_body(&job_uuid, "+OK all good\n"));
    let event = job.complete_within(Duration::from_secs(2)).await.unwrap();
    assert_eq!(event.body(), Some("+OK all good\n"));
    assert_eq!(job.is_successful(), Some(true));

    // The per-job filter is removed after completion.
    server
        .wait_for_command(
            &format!("filter delete Job-UUID {job_uuid}"),
            Duration::from_secs(2),
        )
        .await
        .expect("filter delete must follow completion");
}

/// Property 6: concurrent jobs resolve with exactly their own bodies,
/// regardless of event arrival order.
#[tokio::test]
async fn concurrent_jobs_resolve_independently() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let mut first = client.bgapi("status one").await.unwrap();
    let mut second = client.bgapi("status two").await.unwrap();
    let mut third = client.bgapi("status three").await.unwrap();

    // Deliver completions in reverse order.
    server.send_event(&background_job_body(third.job_uuid(), "+OK three\n"));
    server.send_event(&background_job_body(first.job_uuid(), "+OK one\n"));
    server.send_event(&background_job_body(second.job_uuid(), "+OK two\n"));

    assert_eq!(
        first
            .complete_within(Duration::from_secs(2))
            .await
            .unwrap()
            .body(),
        Some("+OK one\n")
    );
    assert_eq!(
        second
            .complete_within(Duration::from_secs(2))
            .await
            .unwrap()
            .body(),
        Some("+OK two\n")
    );
    assert_eq!(
        third
            .complete_within(Duration::from_secs(2))
            .await
            .unwrap()
            .body(),
        Some("+OK three\n")
    );
}

/// S6: the server replies with a different Job-UUID; the client adopts
/// it, re-filters, and resolves on the adopted UUID.
#[tokio::test]
async fn job_uuid_mismatch_is_adopted() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;
    server.override_next_bgapi_uuid("adopted-job-uuid");

    let mut job = client.bgapi("originate user/1002 &park()").await.unwrap();
    assert_eq!(job.job_uuid(), "adopted-job-uuid");

    let commands = server.commands();
    let sent_uuid = commands
        .iter()
        .find_map(|c| c.strip_prefix("filter Job-UUID "))
        .expect("original filter present")
        .to_owned();
    assert_ne!(sent_uuid, "adopted-job-uuid");
    assert!(
        commands
            .iter()
            .any(|c| c == &format!("filter delete Job-UUID {sent_uuid}"))
    );
    assert!(
        commands
            .iter()
            .any(|c| c == "filter Job-UUID adopted-job-uuid")
    );

    server.send_event(&background_job_body("adopted-job-uuid", "+OK adopted\n"));
    let event = job.complete_within(Duration::from_secs(2)).await.unwrap();
    assert_eq!(event.body(), Some("+OK adopted\n"));
}

/// A `-ERR` job body is a normal resolution the caller classifies.
#[tokio::test]
async fn err_job_body_is_reported_not_raised() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let mut job = client.bgapi("originate user/9999 &park()").await.unwrap();
    server.send_event(&background_job_body(job.job_uuid(), "-ERR NO_ROUTE_DESTINATION\n"));

    let event = job.complete_within(Duration::from_secs(2)).await.unwrap();
    assert!(event.body().unwrap().starts_with("-ERR"));
    assert_eq!(job.is_successful(), Some(false));
}

/// Shutdown fails every outstanding job with a cancellation error.
#[tokio::test]
async fn shutdown_cancels_outstanding_jobs() {
    let server = MockFreeswitch::start().await.unwrap();
    let client = connected_client(&server).await;

    let mut job = client.bgapi("status").await.unwrap();
    client.stop().await;

    let err = job
        .complete_within(Duration::from_secs(2))
        .await
        .expect_err("job must be cancelled");
    assert!(matches!(err, EslError::ConnectionClosed), "got: {err:?}");
}
