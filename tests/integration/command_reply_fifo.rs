//! Command/reply FIFO: replies match commands in issue order, even when
//! callers interleave sends from multiple tasks.

use esl_mock::{MockFreeswitch, MockReply};
use std::time::Duration;
use switchboard::Inbound;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn sequential_replies_match_commands() {
    let server = MockFreeswitch::start().await.unwrap();
    server.set_reply_for("api alpha", MockReply::ApiResponse("alpha-result".to_owned()));
    server.set_reply_for("api beta", MockReply::ApiResponse("beta-result".to_owned()));
    server.set_reply_for("api gamma", MockReply::ApiResponse("gamma-result".to_owned()));

    let client = Inbound::connect(&server.host(), server.port(), "ClueCon", TIMEOUT)
        .await
        .unwrap();

    for (cmd, expected) in [
        ("alpha", "alpha-result"),
        ("beta", "beta-result"),
        ("gamma", "gamma-result"),
    ] {
        let reply = client.api(cmd).await.unwrap();
        assert_eq!(reply.body(), Some(expected));
    }
}

/// Concurrent senders each receive exactly the reply to their own
/// command: the command slot serializes the write + reply pop.
#[tokio::test]
async fn concurrent_senders_get_their_own_replies() {
    let server = MockFreeswitch::start().await.unwrap();
    for name in ["one", "two", "three", "four", "five"] {
        server.set_reply_for(
            &format!("api {name}"),
            MockReply::ApiResponse(format!("{name}-result")),
        );
    }

    let client = std::sync::Arc::new(
        Inbound::connect(&server.host(), server.port(), "ClueCon", TIMEOUT)
            .await
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for name in ["one", "two", "three", "four", "five"] {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let reply = client.api(name).await.unwrap();
            (name, reply.body().unwrap_or_default().to_owned())
        }));
    }

    for task in tasks {
        let (name, body) = task.await.unwrap();
        assert_eq!(body, format!("{name}-result"));
    }
}

/// `-ERR` replies are returned to the caller intact, not raised.
#[tokio::test]
async fn err_replies_are_data_not_errors() {
    let server = MockFreeswitch::start().await.unwrap();
    server.set_reply_for(
        "api nonsense",
        MockReply::CommandReply("-ERR nonsense Command not found!".to_owned()),
    );

    let client = Inbound::connect(&server.host(), server.port(), "ClueCon", TIMEOUT)
        .await
        .unwrap();

    let reply = client.api("nonsense").await.expect("no transport error");
    assert!(reply.reply_text().unwrap().starts_with("-ERR"));
}
